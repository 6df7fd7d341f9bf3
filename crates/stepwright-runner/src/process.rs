//! Process groups and subtree termination
//!
//! Each child a step spawns becomes the leader of a fresh process group
//! (`setpgid(0, 0)`), or on Windows is assigned to the step's Job Object. The
//! step's [`ProcessGroupSet`] remembers every group so cancellation can take
//! down the whole subtree rather than only the immediate child. Once a kill has
//! begun the set is closed: no new group can join it, so a payload still
//! running during the grace period cannot start a process that outlives it.

use std::collections::HashSet;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, warn};

use crate::command_spec::CommandSpec;
use crate::error::RunnerError;

/// Exit code reported when a command could not be started at all
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Interval at which group liveness is re-checked during the kill grace period
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Map an [`ExitStatus`] to a single outcome code.
///
/// Normal exits keep their code; death by signal becomes `128 + signo`
/// like a POSIX shell reports it.
#[must_use]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// RAII wrapper for a Windows Job Object handle.
///
/// Closing the handle kills every process still in the job because the job is
/// created with `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE`.
#[cfg(windows)]
#[derive(Debug)]
struct JobObjectHandle {
    handle: windows::Win32::Foundation::HANDLE,
}

// SAFETY: a job HANDLE is an opaque kernel reference usable from any thread.
#[cfg(windows)]
unsafe impl Send for JobObjectHandle {}

#[cfg(windows)]
impl Drop for JobObjectHandle {
    fn drop(&mut self) {
        use windows::Win32::Foundation::CloseHandle;
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

#[derive(Debug, Default)]
struct GroupState {
    leaders: Vec<u32>,
    closed: bool,
    #[cfg(windows)]
    job: Option<JobObjectHandle>,
}

/// The set of process groups owned by one running step.
///
/// Cloning yields another handle to the same set; the Task Runner keeps one
/// and the payload's context keeps another.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroupSet {
    inner: Arc<Mutex<GroupState>>,
}

impl ProcessGroupSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a group leader pid. Returns `false`, recording nothing, once the
    /// set is closed.
    pub fn register(&self, pid: u32) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.leaders.push(pid);
        true
    }

    /// Refuse further registrations and return the leaders known at that point.
    pub fn close(&self) -> Vec<u32> {
        let mut state = self.state();
        state.closed = true;
        state.leaders.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Pids of every group leader registered so far
    #[must_use]
    pub fn leaders(&self) -> Vec<u32> {
        self.state().leaders.clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state().leaders.is_empty()
    }

    /// Close the set, then terminate every registered group and any escaped
    /// descendants.
    ///
    /// Sends SIGTERM to each group, waits up to `grace` for the groups to
    /// vanish, then SIGKILLs what is left. Descendants that moved to another
    /// session are found through a process-table snapshot taken before the
    /// first signal and killed directly. Returns the number of groups signalled.
    #[cfg(unix)]
    pub async fn kill_all(&self, grace: Duration) -> usize {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        let leaders = self.close();
        if leaders.is_empty() {
            return 0;
        }
        let descendants = descendants_of(&leaders);

        for &leader in &leaders {
            if let Err(err) = killpg(Pid::from_raw(leader as i32), Signal::SIGTERM) {
                debug!(pgid = leader, error = %err, "SIGTERM to process group failed");
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        while leaders.iter().any(|&pgid| group_alive(pgid)) {
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }

        for &leader in &leaders {
            if group_alive(leader) {
                warn!(pgid = leader, "process group ignored SIGTERM, sending SIGKILL");
                let _ = killpg(Pid::from_raw(leader as i32), Signal::SIGKILL);
            }
        }

        for pid in descendants {
            let pid = Pid::from_raw(pid as i32);
            if kill(pid, None).is_ok() {
                debug!(pid = pid.as_raw(), "killing descendant outside its process group");
                let _ = kill(pid, Signal::SIGKILL);
            }
        }

        leaders.len()
    }

    /// Terminate every process in the step's Job Object.
    #[cfg(windows)]
    pub async fn kill_all(&self, _grace: Duration) -> usize {
        use windows::Win32::System::JobObjects::TerminateJobObject;

        let mut state = self.state();
        state.closed = true;
        let count = state.leaders.len();
        if let Some(job) = state.job.take() {
            unsafe {
                let _ = TerminateJobObject(job.handle, 1);
            }
        }
        count
    }

    #[cfg(not(any(unix, windows)))]
    pub async fn kill_all(&self, _grace: Duration) -> usize {
        self.close().len()
    }

    #[cfg(windows)]
    fn assign(&self, child: &Child, program: &str) -> Result<(), RunnerError> {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::JobObjects::AssignProcessToJobObject;
        use windows::Win32::System::Threading::{OpenProcess, PROCESS_ALL_ACCESS};

        let mut state = self.state();
        if state.closed {
            return Err(RunnerError::GroupClosed {
                program: program.to_string(),
            });
        }
        if state.job.is_none() {
            state.job = Some(create_job_object()?);
        }
        let Some(job) = state.job.as_ref() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            unsafe {
                let process = OpenProcess(PROCESS_ALL_ACCESS, false, pid).map_err(|e| {
                    RunnerError::GroupSetupFailed {
                        reason: format!("Failed to open process for job assignment: {e}"),
                    }
                })?;
                let assigned = AssignProcessToJobObject(job.handle, process);
                let _ = CloseHandle(process);
                assigned.map_err(|e| RunnerError::GroupSetupFailed {
                    reason: format!("Failed to assign process to Job Object: {e}"),
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
fn create_job_object() -> Result<JobObjectHandle, RunnerError> {
    use windows::Win32::System::JobObjects::{
        CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JobObjectExtendedLimitInformation, SetInformationJobObject,
    };

    unsafe {
        let job = CreateJobObjectW(None, None).map_err(|e| RunnerError::GroupSetupFailed {
            reason: format!("Failed to create Job Object: {e}"),
        })?;
        let handle = JobObjectHandle { handle: job };

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        SetInformationJobObject(
            handle.handle,
            JobObjectExtendedLimitInformation,
            (&raw const info).cast(),
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
        .map_err(|e| RunnerError::GroupSetupFailed {
            reason: format!("Failed to configure Job Object: {e}"),
        })?;

        Ok(handle)
    }
}

/// A group still has members while signal 0 to it succeeds.
#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

#[cfg_attr(not(unix), allow(dead_code))]
/// Transitive children of `roots` according to a fresh process-table snapshot.
fn descendants_of(roots: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut known: HashSet<u32> = roots.iter().copied().collect();
    let mut found = Vec::new();
    loop {
        let fresh: Vec<u32> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let parent = process.parent().map(SysPid::as_u32)?;
                let pid = pid.as_u32();
                (known.contains(&parent) && !known.contains(&pid)).then_some(pid)
            })
            .collect();
        if fresh.is_empty() {
            break;
        }
        known.extend(fresh.iter().copied());
        found.extend(fresh);
    }
    found
}

/// A child process running as the leader of its own group.
#[derive(Debug)]
pub struct GroupedChild {
    child: Child,
    pid: u32,
    program: String,
}

impl GroupedChild {
    /// Operating-system pid (also the process-group id on Unix)
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the leader to exit and return its outcome code.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::WaitFailed`] if the status could not be collected.
    pub async fn wait(&mut self) -> Result<i32, RunnerError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| RunnerError::WaitFailed {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;
        Ok(exit_code_of(status))
    }
}

/// Spawn `cmd` as a new process-group leader and register it in `groups`.
///
/// stdin is closed; stdout and stderr are piped for the caller to drain.
///
/// # Errors
///
/// Returns [`RunnerError::SpawnFailed`] if the program cannot be started,
/// [`RunnerError::GroupSetupFailed`] if Job Object assignment fails and
/// [`RunnerError::GroupClosed`] if `groups` is being killed. A child that was
/// already started when the set closed is killed before returning.
pub fn spawn_grouped(cmd: &CommandSpec, groups: &ProcessGroupSet) -> Result<GroupedChild, RunnerError> {
    if cmd.program.is_empty() {
        return Err(RunnerError::EmptyProgram);
    }
    let program = cmd.program_name();
    if groups.is_closed() {
        return Err(RunnerError::GroupClosed { program });
    }

    let mut command = cmd.to_tokio_command();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    {
        #[allow(unused_imports)]
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
    }

    let mut child = command.spawn().map_err(|e| RunnerError::SpawnFailed {
        program: program.clone(),
        reason: e.to_string(),
    })?;

    #[cfg(windows)]
    if let Err(e) = groups.assign(&child, &program) {
        let _ = child.start_kill();
        return Err(e);
    }

    let pid = child.id().ok_or_else(|| RunnerError::SpawnFailed {
        program: program.clone(),
        reason: "process exited before its pid could be read".to_string(),
    })?;
    if !groups.register(pid) {
        discard(&mut child, pid);
        return Err(RunnerError::GroupClosed { program });
    }
    debug!(pid, program = %program, "spawned process group leader");

    Ok(GroupedChild {
        child,
        pid,
        program,
    })
}

/// Kill a child that started after its set was closed, with its group.
fn discard(child: &mut Child, pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    if let Err(e) = child.start_kill() {
        debug!(pid, error = %e, "late child already gone");
    }
    warn!(pid, "killed a process started after its step was cancelled");
}

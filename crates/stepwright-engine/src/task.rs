//! Task Runner: runs one step's payload as its own tokio task.
//!
//! The payload gets a [`StepContext`] for running external commands. Their
//! combined stdout/stderr goes to the step's transient [`OutputBuffer`], never
//! straight to the terminal or the durable log. The payload's returned code is
//! written into the Result Slot as the task's last action. Failures are never
//! raised to the caller of [`TaskRunner::spawn`]; they are only visible
//! through the slot.

use std::future::Future;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stepwright_runner::{
    CommandSpec, OutputBuffer, ProcessGroupSet, RunnerError, SPAWN_FAILURE_CODE, spawn_grouped,
};
use stepwright_utils::{AuditLog, ExitCode};

use crate::retry::{RetryPolicy, with_retries};
use crate::slot::SlotWriter;
use crate::trap::{ErrorRecord, Secrets, with_step_scope};

/// The work executed inside a step.
///
/// Return `0` for success and any other code for failure. Returning is the
/// only way to report an outcome; a payload that panics reports nothing and
/// the step is classified as a missing result.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use stepwright_engine::{Payload, StepContext};
/// use stepwright_runner::CommandSpec;
///
/// struct SyncDisks;
///
/// #[async_trait]
/// impl Payload for SyncDisks {
///     async fn run(&mut self, ctx: StepContext) -> i32 {
///         ctx.exec(&CommandSpec::new("sync")).await
///     }
/// }
/// ```
#[async_trait]
pub trait Payload: Send + 'static {
    async fn run(&mut self, ctx: StepContext) -> i32;
}

/// Closure-backed [`Payload`].
///
/// ```rust
/// use stepwright_engine::PayloadFn;
///
/// let payload = PayloadFn::new(|ctx| async move {
///     ctx.emit("nothing to do");
///     0
/// });
/// ```
pub struct PayloadFn<F> {
    f: F,
}

impl<F, Fut> PayloadFn<F>
where
    F: FnMut(StepContext) -> Fut + Send + 'static,
    Fut: Future<Output = i32> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Payload for PayloadFn<F>
where
    F: FnMut(StepContext) -> Fut + Send + 'static,
    Fut: Future<Output = i32> + Send + 'static,
{
    async fn run(&mut self, ctx: StepContext) -> i32 {
        (self.f)(ctx).await
    }
}

/// Everything a running payload may touch.
///
/// Cheap to clone; all clones refer to the same step.
#[derive(Debug, Clone)]
pub struct StepContext {
    step: Arc<str>,
    log: AuditLog,
    output: OutputBuffer,
    processes: ProcessGroupSet,
    cancel: CancellationToken,
    secrets: Secrets,
    scratch_dir: PathBuf,
    retry: RetryPolicy,
    last_failure: Arc<Mutex<Option<ErrorRecord>>>,
}

impl StepContext {
    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    /// Run an external command in its own process group and wait for it.
    ///
    /// Output is captured line by line into the step's buffer. Returns the
    /// exit code; death by signal is `128 + signo` and a command that cannot be
    /// started is `127`. A non-zero result is remembered, with the caller's
    /// source location, for the failure report. Once the run is cancelled no
    /// command is started and the result is `130`.
    #[track_caller]
    pub fn exec<'a>(&'a self, cmd: &'a CommandSpec) -> impl Future<Output = i32> + Send + 'a {
        let location = Location::caller();
        self.exec_at(cmd, location)
    }

    /// [`exec`](Self::exec) under the Retry Wrapper.
    ///
    /// Resolves to `0` on success, or to the last attempt's code once the
    /// policy is exhausted. Cancellation ends the loop without another attempt.
    #[track_caller]
    pub fn exec_with_retries<'a>(
        &'a self,
        cmd: &'a CommandSpec,
        policy: RetryPolicy,
    ) -> impl Future<Output = i32> + Send + 'a {
        let location = Location::caller();
        async move {
            let label = cmd.to_string();
            if with_retries(&self.log, &label, policy, &self.cancel, |_| self.exec_at(cmd, location)).await {
                0
            } else if self.cancel.is_cancelled() {
                ExitCode::CANCELLED.as_i32()
            } else {
                self.last_failure().and_then(|r| r.code).unwrap_or(1)
            }
        }
    }

    async fn exec_at(&self, cmd: &CommandSpec, location: &'static Location<'static>) -> i32 {
        debug!(step = %self.step, command = %cmd, "running command");
        if self.cancel.is_cancelled() {
            self.output.write_line(&format!("skipped (cancelled): {cmd}"));
            return ExitCode::CANCELLED.as_i32();
        }
        self.output.write_line(&format!("$ {cmd}"));

        let mut child = match spawn_grouped(cmd, &self.processes) {
            Ok(child) => child,
            Err(e @ RunnerError::GroupClosed { .. }) => {
                debug!(step = %self.step, error = %e, "command refused after cancellation");
                self.output.write_line(&e.to_string());
                return ExitCode::CANCELLED.as_i32();
            }
            Err(e) => {
                warn!(step = %self.step, error = %e, "command could not be started");
                self.output.write_line(&e.to_string());
                self.note_failure(cmd, location, SPAWN_FAILURE_CODE);
                return SPAWN_FAILURE_CODE;
            }
        };

        let stdout = child.take_stdout();
        let stderr = child.take_stderr();
        let (status, (), ()) = tokio::join!(
            child.wait(),
            pump(stdout, &self.output),
            pump(stderr, &self.output),
        );

        let code = status.unwrap_or_else(|e| {
            warn!(step = %self.step, error = %e, "could not collect command status");
            self.output.write_line(&e.to_string());
            1
        });
        if code != 0 {
            self.note_failure(cmd, location, code);
        }
        code
    }

    fn note_failure(&self, cmd: &CommandSpec, location: &Location<'_>, code: i32) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(ErrorRecord {
            step: Some(self.step.to_string()),
            command: Some(cmd.to_string()),
            location: Some(location.to_string()),
            code: Some(code),
            message: None,
        });
    }

    /// Most recent failed command of this step
    #[must_use]
    pub fn last_failure(&self) -> Option<ErrorRecord> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add payload-authored text to the captured output
    pub fn emit(&self, text: &str) {
        for line in text.lines() {
            self.output.write_line(line);
        }
    }

    /// Write a warning straight to the durable log
    pub fn warn(&self, message: &str) {
        if let Err(e) = self.log.warn(message) {
            warn!(error = %e, "could not record payload warning");
        }
    }

    #[must_use]
    pub fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name)
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Cancelled when the operator interrupts the run
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Retry policy from the run configuration
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

async fn pump<R>(stream: Option<R>, output: &OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else { return };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => output.write_line(&line),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "output stream closed");
                break;
            }
        }
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Run-wide settings every spawned task inherits.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    log: AuditLog,
    cancel: CancellationToken,
    secrets: Secrets,
    scratch_dir: PathBuf,
    retry: RetryPolicy,
    output_cap: usize,
}

impl TaskRunner {
    #[must_use]
    pub fn new(
        log: AuditLog,
        cancel: CancellationToken,
        secrets: Secrets,
        scratch_dir: PathBuf,
        retry: RetryPolicy,
        output_cap: usize,
    ) -> Self {
        Self {
            log,
            cancel,
            secrets,
            scratch_dir,
            retry,
            output_cap,
        }
    }

    /// Start `payload` for `step` and return immediately.
    pub fn spawn<P: Payload>(&self, step: &str, mut payload: P, slot: SlotWriter) -> TaskHandle {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let step: Arc<str> = Arc::from(step);
        let processes = ProcessGroupSet::new();
        let output = OutputBuffer::new(self.output_cap);
        let last_failure = Arc::new(Mutex::new(None));

        let ctx = StepContext {
            step: Arc::clone(&step),
            log: self.log.clone(),
            output: output.clone(),
            processes: processes.clone(),
            cancel: self.cancel.clone(),
            secrets: self.secrets.clone(),
            scratch_dir: self.scratch_dir.clone(),
            retry: self.retry,
            last_failure: Arc::clone(&last_failure),
        };

        let join = tokio::spawn(with_step_scope(Arc::clone(&step), async move {
            let code = payload.run(ctx).await;
            slot.write(code);
        }));
        debug!(task = id, step = %step, "task spawned");

        TaskHandle {
            id,
            step,
            join,
            processes,
            output,
            last_failure,
        }
    }
}

/// Owned by the supervisor for the duration of one step.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    step: Arc<str>,
    join: JoinHandle<()>,
    processes: ProcessGroupSet,
    output: OutputBuffer,
    last_failure: Arc<Mutex<Option<ErrorRecord>>>,
}

impl TaskHandle {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn step(&self) -> &str {
        &self.step
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Leaders of the process groups the payload has started
    #[must_use]
    pub fn process_groups(&self) -> Vec<u32> {
        self.processes.leaders()
    }

    /// Terminate every process the payload started (and their descendants),
    /// then stop the task itself. Returns the number of groups signalled.
    pub async fn kill_tree(&self, grace: Duration) -> usize {
        let killed = self.processes.kill_all(grace).await;
        self.join.abort();
        killed
    }

    /// Wait for the task to be fully torn down.
    ///
    /// # Errors
    ///
    /// The task's [`JoinError`] when it panicked or was aborted.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.join).await
    }

    /// Drain the captured output
    #[must_use]
    pub fn take_output(&self) -> String {
        self.output.take()
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<ErrorRecord> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use crate::slot::{ResultSlot, SlotState};
    use tempfile::TempDir;

    fn runner_in(dir: &TempDir) -> TaskRunner {
        let log = AuditLog::open(dir.path().join("task.log"), "stepwright").unwrap();
        TaskRunner::new(
            log,
            CancellationToken::new(),
            Secrets::default(),
            dir.path().to_path_buf(),
            RetryPolicy::new(3, Duration::ZERO),
            64 * 1024,
        )
    }

    #[tokio::test]
    async fn test_returned_code_lands_in_slot() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("A").unwrap();

        let mut handle = runner.spawn("A", PayloadFn::new(|_ctx| async { 4 }), writer);
        handle.join().await.unwrap();
        assert!(!handle.is_alive());
        assert_eq!(slot.peek(), Some(SlotState::Written(4)));
    }

    #[tokio::test]
    #[serial]
    async fn test_panicking_payload_leaves_slot_unwritten() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("A").unwrap();

        let mut handle = runner.spawn(
            "A",
            PayloadFn::new(|_ctx| async {
                if std::env::var_os("STEPWRIGHT_NEVER_SET_THIS").is_none() {
                    panic!("payload bug");
                }
                0
            }),
            writer,
        );
        assert!(handle.join().await.unwrap_err().is_panic());
        assert_eq!(slot.peek(), Some(SlotState::InProgress));
    }

    #[tokio::test]
    async fn test_emit_is_captured() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("A").unwrap();

        let mut handle = runner.spawn(
            "A",
            PayloadFn::new(|ctx| async move {
                ctx.emit("partitioning\nformatting");
                0
            }),
            writer,
        );
        handle.join().await.unwrap();
        assert_eq!(handle.take_output(), "partitioning\nformatting\n");
    }

    #[tokio::test]
    async fn test_context_exposes_run_resources() {
        let dir = TempDir::new().unwrap();
        let secrets = Secrets::default();
        secrets.insert("root_password", "hunter2");
        let log = AuditLog::open(dir.path().join("task.log"), "stepwright").unwrap();
        let runner = TaskRunner::new(
            log,
            CancellationToken::new(),
            secrets,
            dir.path().to_path_buf(),
            RetryPolicy::default(),
            1024,
        );
        let mut slot = ResultSlot::new();
        let writer = slot.create("Users").unwrap();
        let expected_dir = dir.path().to_path_buf();

        let mut handle = runner.spawn(
            "Users",
            PayloadFn::new(move |ctx| {
                let expected_dir = expected_dir.clone();
                async move {
                    let ok = ctx.step() == "Users"
                        && ctx.secret("root_password").as_deref() == Some("hunter2")
                        && ctx.secret("missing").is_none()
                        && ctx.scratch_dir() == expected_dir
                        && !ctx.cancellation().is_cancelled()
                        && ctx.retry_policy().max_attempts == 5;
                    i32::from(!ok)
                }
            }),
            writer,
        );
        handle.join().await.unwrap();
        assert_eq!(slot.read("Users").unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_captures_output_and_failure_location() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("B").unwrap();

        let mut handle = runner.spawn(
            "B",
            PayloadFn::new(|ctx| async move {
                let ok = CommandSpec::new("sh").arg("-c").arg("echo formatted");
                let bad = CommandSpec::new("sh").arg("-c").arg("echo oops >&2; exit 3");
                if ctx.exec(&ok).await != 0 {
                    return 1;
                }
                ctx.exec(&bad).await
            }),
            writer,
        );
        handle.join().await.unwrap();

        assert_eq!(slot.read("B").unwrap(), 3);
        let output = handle.take_output();
        assert!(output.contains("formatted"));
        assert!(output.contains("oops"));

        let failure = handle.last_failure().unwrap();
        assert_eq!(failure.code, Some(3));
        assert!(failure.command.unwrap().contains("exit 3"));
        assert!(failure.location.unwrap().contains("task.rs"));
    }

    #[tokio::test]
    async fn test_exec_missing_program_is_127() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("C").unwrap();

        let mut handle = runner.spawn(
            "C",
            PayloadFn::new(|ctx| async move {
                ctx.exec(&CommandSpec::new("stepwright-no-such-program-xyz")).await
            }),
            writer,
        );
        handle.join().await.unwrap();
        assert_eq!(slot.read("C").unwrap(), SPAWN_FAILURE_CODE);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_with_retries_returns_last_code() {
        let dir = TempDir::new().unwrap();
        let runner = runner_in(&dir);
        let mut slot = ResultSlot::new();
        let writer = slot.create("D").unwrap();

        let mut handle = runner.spawn(
            "D",
            PayloadFn::new(|ctx| async move {
                let cmd = CommandSpec::new("sh").arg("-c").arg("exit 5");
                ctx.exec_with_retries(&cmd, ctx.retry_policy()).await
            }),
            writer,
        );
        handle.join().await.unwrap();
        assert_eq!(slot.read("D").unwrap(), 5);
        assert_eq!(handle.take_output().matches("$ sh").count(), 3);
    }

    #[tokio::test]
    async fn test_exec_after_cancellation_starts_nothing() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::open(dir.path().join("task.log"), "stepwright").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = TaskRunner::new(
            log,
            cancel,
            Secrets::default(),
            dir.path().to_path_buf(),
            RetryPolicy::new(3, Duration::ZERO),
            1024,
        );
        let mut slot = ResultSlot::new();
        let writer = slot.create("E").unwrap();

        let mut handle = runner.spawn(
            "E",
            PayloadFn::new(|ctx| async move {
                let cmd = CommandSpec::new("sleep").arg("30");
                let first = ctx.exec(&cmd).await;
                let second = ctx.exec_with_retries(&cmd, ctx.retry_policy()).await;
                if first == second { first } else { 1 }
            }),
            writer,
        );
        handle.join().await.unwrap();

        assert_eq!(slot.read("E").unwrap(), 130);
        assert!(handle.last_failure().is_none());
        assert!(!handle.take_output().contains("$ sleep"));
    }
}

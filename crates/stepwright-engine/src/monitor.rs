//! Progress Monitor: the engine's only suspension point.
//!
//! [`ProgressMonitor::watch`] polls the task's liveness at a fixed interval
//! while a spinner turns on stderr. If the run's cancellation token fires
//! first, the task's whole process subtree is killed and
//! [`WatchOutcome::Cancelled`] is returned instead.

use std::io::{self, IsTerminal, Stderr, Write};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::TaskHandle;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SPINNER_FRAME_INTERVAL: Duration = Duration::from_millis(80);

/// How a watched task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The task is no longer alive
    Completed,
    /// The operator cancelled; the task and its subtree were killed
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    poll_interval: Duration,
    kill_grace: Duration,
    spinner: bool,
    cancel: CancellationToken,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new(poll_interval: Duration, kill_grace: Duration, spinner: bool, cancel: CancellationToken) -> Self {
        Self {
            poll_interval,
            kill_grace,
            spinner,
            cancel,
        }
    }

    /// Block until `handle`'s task ends or the run is cancelled.
    pub async fn watch(&self, handle: &TaskHandle, label: &str) -> WatchOutcome {
        let mut spinner = Spinner::new(label, self.spinner && io::stderr().is_terminal());
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames = tokio::time::interval(SPINNER_FRAME_INTERVAL);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    spinner.clear();
                    let groups = handle.kill_tree(self.kill_grace).await;
                    info!(step = %handle.step(), task = handle.id(), groups, "step cancelled; process tree killed");
                    return WatchOutcome::Cancelled;
                }
                _ = poll.tick() => {
                    if !handle.is_alive() {
                        spinner.clear();
                        debug!(step = %handle.step(), task = handle.id(), "task ended");
                        return WatchOutcome::Completed;
                    }
                }
                _ = frames.tick(), if spinner.enabled => spinner.tick(),
            }
        }
    }
}

/// Label plus turning frame, redrawn in place on stderr.
struct Spinner {
    label: String,
    enabled: bool,
    frame: usize,
    drawn: bool,
}

impl Spinner {
    fn new(label: &str, enabled: bool) -> Self {
        Self {
            label: label.to_string(),
            enabled,
            frame: 0,
            drawn: false,
        }
    }

    fn tick(&mut self) {
        let mut err = io::stderr();
        if !self.drawn {
            let _ = crossterm::execute!(err, crossterm::cursor::Hide);
            self.drawn = true;
        }
        let _ = write!(err, "\r{} {}", SPINNER_FRAMES[self.frame], self.label);
        let _ = err.flush();
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
    }

    fn clear(&mut self) {
        if !self.drawn {
            return;
        }
        let mut err: Stderr = io::stderr();
        let _ = crossterm::execute!(
            err,
            crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
            crossterm::cursor::Show
        );
        let _ = write!(err, "\r");
        let _ = err.flush();
        self.drawn = false;
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::slot::ResultSlot;
    use crate::task::{PayloadFn, TaskRunner};
    use crate::trap::Secrets;
    use stepwright_utils::AuditLog;
    use tempfile::TempDir;

    fn runner(dir: &TempDir, cancel: &CancellationToken) -> TaskRunner {
        let log = AuditLog::open(dir.path().join("monitor.log"), "stepwright").unwrap();
        TaskRunner::new(
            log,
            cancel.clone(),
            Secrets::default(),
            dir.path().to_path_buf(),
            RetryPolicy::default(),
            4096,
        )
    }

    fn monitor(cancel: &CancellationToken) -> ProgressMonitor {
        ProgressMonitor::new(
            Duration::from_millis(10),
            Duration::from_millis(200),
            false,
            cancel.clone(),
        )
    }

    #[tokio::test]
    async fn test_watch_returns_when_task_ends() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut slot = ResultSlot::new();
        let handle = runner(&dir, &cancel).spawn(
            "A",
            PayloadFn::new(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                0
            }),
            slot.create("A").unwrap(),
        );

        let outcome = monitor(&cancel).watch(&handle, "A").await;
        assert_eq!(outcome, WatchOutcome::Completed);
        assert!(!handle.is_alive());
        assert_eq!(slot.read("A").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_aborts_task_and_leaves_slot_unwritten() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut slot = ResultSlot::new();
        let handle = runner(&dir, &cancel).spawn(
            "Prepare Disk",
            PayloadFn::new(|_ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                0
            }),
            slot.create("Prepare Disk").unwrap(),
        );

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = monitor(&cancel).watch(&handle, "Prepare Disk").await;
        assert_eq!(outcome, WatchOutcome::Cancelled);
        assert!(slot.read("Prepare Disk").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_running_command() {
        use stepwright_runner::CommandSpec;

        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let mut slot = ResultSlot::new();
        let handle = runner(&dir, &cancel).spawn(
            "Prepare Disk",
            PayloadFn::new(|ctx| async move {
                ctx.exec(&CommandSpec::new("sleep").arg("30")).await
            }),
            slot.create("Prepare Disk").unwrap(),
        );

        // Let the child start and register its group.
        while handle.process_groups().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let leader = handle.process_groups()[0];
        cancel.cancel();

        let outcome = monitor(&cancel).watch(&handle, "Prepare Disk").await;
        assert_eq!(outcome, WatchOutcome::Cancelled);

        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(i32::try_from(leader).unwrap()), None).is_ok();
        assert!(!alive, "group leader {leader} still running");
    }
}

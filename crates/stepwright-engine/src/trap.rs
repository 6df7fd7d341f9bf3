//! Global Error Trap: the single place a run ends.
//!
//! Every run finishes through [`ErrorTrap::finish`] (or
//! [`ErrorTrap::finish_unexpected`] for faults outside the step flow). The trap
//! moves the run from `Running` to its terminal [`RunState`] exactly once,
//! consumes the one-shot [`ErrorRecord`] captured where the failure happened,
//! releases the scratch directory and in-memory secrets, and reports.
//!
//! | Terminal state | Report | Exit code |
//! |----------------|--------|-----------|
//! | `Success` | none | 0 |
//! | `Cancelled` | none | 130 |
//! | `Failed` | `error:` line, captured command and location, log pointer | the failing code |
//!
//! An interrupt while the failure report waits at the "view the log" prompt
//! leaves the run `Failed` but exits with 130.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};

use crossterm::style::{Attribute, Color, Stylize};
use once_cell::sync::Lazy;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, error, warn};

use stepwright_config::ReportConfig;
use stepwright_runner::CommandSpec;
use stepwright_utils::{AuditLog, ExitCode, StepError, logging::SECRET_MASK};

use crate::signals::wait_for_shutdown_signal;

tokio::task_local! {
    static CURRENT_STEP: Arc<str>;
}

/// Run `fut` with `step` visible to [`current_step`] (and the panic hook).
pub(crate) fn with_step_scope<F: Future>(step: Arc<str>, fut: F) -> impl Future<Output = F::Output> {
    CURRENT_STEP.scope(step, fut)
}

/// Name of the step whose task is executing on this thread, if any
#[must_use]
pub fn current_step() -> Option<String> {
    CURRENT_STEP.try_with(ToString::to_string).ok()
}

/// Run-level state machine: `Running -> {Success, Cancelled, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Cancelled,
    Failed,
}

impl RunState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        })
    }
}

/// Context of a failure, captured where it happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub step: Option<String>,
    /// Command line of the failing external command
    pub command: Option<String>,
    /// Source location of the call that failed (`file:line:col`)
    pub location: Option<String>,
    pub code: Option<i32>,
    /// Free-form detail, e.g. a panic message
    pub message: Option<String>,
}

/// Single-producer, single-consumer handoff of one [`ErrorRecord`].
///
/// The first [`offer`](Self::offer) wins; [`take`](Self::take) consumes the
/// record and resets the cell.
#[derive(Debug, Clone, Default)]
pub struct ErrorRecordCell {
    inner: Arc<Mutex<Option<ErrorRecord>>>,
}

impl ErrorRecordCell {
    fn lock(&self) -> MutexGuard<'_, Option<ErrorRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `record` unless one is already held. Returns whether it was stored.
    pub fn offer(&self, record: ErrorRecord) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(record);
        true
    }

    pub fn take(&self) -> Option<ErrorRecord> {
        self.lock().take()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }
}

/// In-memory secrets shared with payloads, wiped when the run ends.
#[derive(Clone, Default)]
pub struct Secrets {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets").field("len", &self.lock().len()).finish()
    }
}

impl Secrets {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.lock().insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Replace every known secret value in `text` with the mask
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        self.lock()
            .values()
            .filter(|v| !v.is_empty())
            .fold(text.to_string(), |acc, v| acc.replace(v.as_str(), SECRET_MASK))
    }

    pub fn wipe(&self) {
        let mut map = self.lock();
        for value in map.values_mut() {
            value.clear();
        }
        map.clear();
    }
}

/// How a failure is presented to the operator
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub offer_pager: bool,
    pub pager: String,
    pub color: bool,
}

impl ReportOptions {
    /// Options for the current terminal; colour only on a TTY without `NO_COLOR`.
    #[must_use]
    pub fn from_config(config: &ReportConfig) -> Self {
        Self {
            offer_pager: config.offer_pager,
            pager: config.pager.clone(),
            color: io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none(),
        }
    }

    /// Plain text, no pager prompt
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            offer_pager: false,
            pager: String::new(),
            color: false,
        }
    }
}

#[derive(Debug)]
struct TrapState {
    run: RunState,
    exit: Option<ExitCode>,
}

/// Process-wide failure handler for one run.
#[derive(Debug)]
pub struct ErrorTrap {
    log: AuditLog,
    record: ErrorRecordCell,
    secrets: Secrets,
    scratch: Mutex<Option<TempDir>>,
    scratch_path: PathBuf,
    state: Mutex<TrapState>,
    report: ReportOptions,
}

static PANIC_SINK: Lazy<Mutex<Option<ErrorRecordCell>>> = Lazy::new(|| Mutex::new(None));
static PANIC_HOOK: Once = Once::new();

impl ErrorTrap {
    /// Create the trap and the run's scratch directory.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the scratch directory cannot be created.
    pub fn new(log: AuditLog, report: ReportOptions) -> io::Result<Self> {
        let scratch = tempfile::Builder::new().prefix("stepwright-").tempdir()?;
        let scratch_path = scratch.path().to_path_buf();
        debug!(path = %scratch_path.display(), "scratch directory created");
        Ok(Self {
            log,
            record: ErrorRecordCell::default(),
            secrets: Secrets::default(),
            scratch: Mutex::new(Some(scratch)),
            scratch_path,
            state: Mutex::new(TrapState {
                run: RunState::Running,
                exit: None,
            }),
            report,
        })
    }

    #[must_use]
    pub const fn log(&self) -> &AuditLog {
        &self.log
    }

    /// Handle through which lower layers deposit the error record
    #[must_use]
    pub fn record_cell(&self) -> ErrorRecordCell {
        self.record.clone()
    }

    #[must_use]
    pub fn secrets(&self) -> Secrets {
        self.secrets.clone()
    }

    /// Register a secret for payloads; its value is masked in the log.
    pub fn add_secret(&self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        self.log.mask(value.clone());
        self.secrets.insert(name, value);
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_path
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.lock_state().run
    }

    /// Consume the pending error record, if any
    pub fn take_record(&self) -> Option<ErrorRecord> {
        self.record.take()
    }

    fn lock_state(&self) -> MutexGuard<'_, TrapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route panics to `tracing` and into this trap's error record.
    ///
    /// The hook is installed once per process; later calls only retarget it.
    pub fn install_panic_hook(&self) {
        *PANIC_SINK.lock().unwrap_or_else(PoisonError::into_inner) = Some(self.record.clone());
        PANIC_HOOK.call_once(|| {
            std::panic::set_hook(Box::new(|info| {
                let payload = info.payload();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                let location = info.location().map(ToString::to_string);
                let step = current_step();

                error!(
                    target: "stepwright::panic",
                    step = step.as_deref().unwrap_or("-"),
                    location = location.as_deref().unwrap_or("unknown"),
                    "panic: {message}"
                );

                let sink = PANIC_SINK.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(cell) = sink.as_ref() {
                    cell.offer(ErrorRecord {
                        step,
                        command: None,
                        location,
                        code: None,
                        message: Some(format!("panicked: {message}")),
                    });
                }
            }));
        });
    }

    /// End the run with the orchestration outcome and return the exit code.
    ///
    /// Only the first call has effect; later calls return the same code.
    pub fn finish(&self, outcome: &Result<(), StepError>) -> ExitCode {
        let (run, code) = match outcome {
            Ok(()) => (RunState::Success, ExitCode::SUCCESS),
            Err(e) if e.is_cancellation() => (RunState::Cancelled, ExitCode::CANCELLED),
            Err(e) => (RunState::Failed, e.to_exit_code()),
        };
        let headline = match outcome {
            Err(e) => e.to_string(),
            Ok(()) => String::new(),
        };
        let suggestions = outcome.as_ref().err().map(StepError::suggestions).unwrap_or_default();
        self.conclude(run, code, &headline, &suggestions)
    }

    /// End the run after a fault outside the step flow (e.g. an orchestrator panic).
    pub fn finish_unexpected(&self, message: &str) -> ExitCode {
        self.conclude(RunState::Failed, ExitCode::STEP_FAILED, message, &[])
    }

    fn conclude(&self, run: RunState, code: ExitCode, headline: &str, suggestions: &[String]) -> ExitCode {
        {
            let mut state = self.lock_state();
            if let Some(exit) = state.exit {
                return exit;
            }
            state.run = run;
            state.exit = Some(code);
        }

        let record = self.take_record().map(|r| self.redact_record(r));
        self.release();

        let mut code = code;
        if run == RunState::Failed {
            let headline = if headline.is_empty() {
                "the run failed"
            } else {
                headline
            };
            let mut stderr = io::stderr().lock();
            if let Err(e) = render_report(
                &mut stderr,
                headline,
                record.as_ref(),
                suggestions,
                &self.log.path(),
                self.report.color,
            ) {
                debug!(error = %e, "could not write failure report");
            }
            drop(stderr);
            if self.report.offer_pager && self.offer_pager() == Some(PromptAnswer::Interrupted) {
                code = self.interrupted_at_prompt();
            }
        }

        let summary = format!("Run finished: {run} (exit code {})", code.as_i32());
        if let Err(e) = self.log.info(&summary) {
            warn!(error = %e, "could not record run summary");
        }
        code
    }

    /// The operator interrupted the failure prompt; later calls see 130 too.
    fn interrupted_at_prompt(&self) -> ExitCode {
        self.lock_state().exit = Some(ExitCode::CANCELLED);
        if let Err(e) = self.log.warn("Interrupted at the log prompt") {
            warn!(error = %e, "could not record prompt interrupt");
        }
        ExitCode::CANCELLED
    }

    fn redact_record(&self, record: ErrorRecord) -> ErrorRecord {
        let redact = |s: Option<String>| s.map(|s| self.secrets.redact(&s));
        ErrorRecord {
            command: redact(record.command),
            message: redact(record.message),
            ..record
        }
    }

    /// Drop the scratch directory and wipe secrets and their log masks
    fn release(&self) {
        if let Some(dir) = self.scratch.lock().unwrap_or_else(PoisonError::into_inner).take()
            && let Err(e) = dir.close()
        {
            warn!(error = %e, "could not remove scratch directory");
        }
        self.secrets.wipe();
        self.log.clear_masks();
    }

    /// Ask whether to open the log, and open it on "yes".
    ///
    /// Skipped without a terminal on both ends, and when called from inside an
    /// async runtime (the prompt drives its own).
    fn offer_pager(&self) -> Option<PromptAnswer> {
        if !(io::stdin().is_terminal() && io::stderr().is_terminal()) {
            return None;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            debug!("log prompt skipped inside an async runtime");
            return None;
        }
        eprint!("View the full log now? [y/N] ");
        let _ = io::stderr().flush();
        let read = || -> io::Result<String> {
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        };
        let answer = match ask(read, wait_for_shutdown_signal()) {
            Ok(answer) => answer,
            Err(e) => {
                debug!(error = %e, "log prompt failed");
                return None;
            }
        };
        match answer {
            PromptAnswer::Yes => {
                let pager = std::env::var("PAGER").unwrap_or_else(|_| self.report.pager.clone());
                if let Err(e) = run_pager(&pager, &self.log.path()) {
                    warn!(pager = %pager, error = %e, "could not open the log in a pager");
                }
            }
            PromptAnswer::Interrupted => eprintln!(),
            PromptAnswer::No => {}
        }
        Some(answer)
    }
}

/// Operator's reply to the log prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptAnswer {
    Yes,
    No,
    Interrupted,
}

/// Wait for `read` to produce an answer line unless `interrupt` completes first.
///
/// The blocking read runs on its own thread; an interrupted read is abandoned.
fn ask<R, I>(read: R, interrupt: I) -> io::Result<PromptAnswer>
where
    R: FnOnce() -> io::Result<String> + Send + 'static,
    I: Future<Output = io::Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let answer: io::Result<PromptAnswer> = runtime.block_on(async {
        tokio::select! {
            line = tokio::task::spawn_blocking(read) => {
                let line = line.map_err(io::Error::other)??;
                if matches!(line.trim(), "y" | "Y" | "yes") {
                    Ok(PromptAnswer::Yes)
                } else {
                    Ok(PromptAnswer::No)
                }
            }
            res = interrupt => res.map(|()| PromptAnswer::Interrupted),
        }
    });
    runtime.shutdown_background();
    answer
}

fn run_pager(pager: &str, log_path: &Path) -> io::Result<()> {
    let mut parts = pager.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty pager command"))?;
    let resolved = which::which(program).map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;
    CommandSpec::new(resolved)
        .args(parts)
        .arg(log_path)
        .to_command()
        .status()?;
    Ok(())
}

/// Write the failure report: one `error:` line, the captured context, then the
/// log pointer. Raw command output is never printed here.
pub fn render_report(
    out: &mut impl Write,
    headline: &str,
    record: Option<&ErrorRecord>,
    suggestions: &[String],
    log_path: &Path,
    color: bool,
) -> io::Result<()> {
    let style = |text: &str, color_of: Color| -> String {
        if color {
            format!("{}", text.with(color_of).attribute(Attribute::Bold))
        } else {
            text.to_string()
        }
    };

    writeln!(out, "{} {headline}", style("error:", Color::Red))?;
    match record {
        Some(record) => {
            if let Some(command) = &record.command {
                writeln!(out, "  command:  {command}")?;
            }
            if let Some(location) = &record.location {
                writeln!(out, "  location: {location}")?;
            }
            if let Some(message) = &record.message {
                writeln!(out, "  detail:   {message}")?;
            }
        }
        None => writeln!(out, "  no further diagnostic was captured")?,
    }
    for hint in suggestions {
        writeln!(out, "  {} {hint}", style("hint:", Color::Cyan))?;
    }
    writeln!(out, "  Full log: {}", log_path.display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use stepwright_utils::{LogCategory, read_records};

    fn trap_in(dir: &TempDir) -> ErrorTrap {
        let log = AuditLog::open(dir.path().join("run.log"), "stepwright").unwrap();
        ErrorTrap::new(log, ReportOptions::quiet()).unwrap()
    }

    #[test]
    fn test_first_record_wins_and_take_consumes() {
        let cell = ErrorRecordCell::default();
        assert!(cell.offer(ErrorRecord {
            command: Some("first".to_string()),
            ..ErrorRecord::default()
        }));
        assert!(!cell.offer(ErrorRecord {
            command: Some("second".to_string()),
            ..ErrorRecord::default()
        }));
        assert_eq!(cell.take().unwrap().command.as_deref(), Some("first"));
        assert!(cell.take().is_none());
        assert!(!cell.is_set());
    }

    #[test]
    fn test_finish_success_releases_scratch() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        let scratch = trap.scratch_dir().to_path_buf();
        assert!(scratch.is_dir());

        assert_eq!(trap.finish(&Ok(())), ExitCode::SUCCESS);
        assert_eq!(trap.state(), RunState::Success);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_finish_is_one_shot() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        let failed = Err(StepError::Failed {
            step: "B".to_string(),
            code: 3,
        });
        assert_eq!(trap.finish(&failed).as_i32(), 3);
        assert_eq!(trap.finish(&Ok(())).as_i32(), 3);
        assert_eq!(trap.state(), RunState::Failed);

        let summaries = read_records(&trap.log().path())
            .unwrap()
            .into_iter()
            .filter(|r| r.category == LogCategory::Info)
            .count();
        assert_eq!(summaries, 1);
    }

    #[test]
    fn test_cancelled_maps_to_cancel_code_and_consumes_record() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        trap.record_cell().offer(ErrorRecord::default());
        let code = trap.finish(&Err(StepError::Cancelled {
            step: "Prepare Disk".to_string(),
        }));
        assert_eq!(code, ExitCode::CANCELLED);
        assert_eq!(trap.state(), RunState::Cancelled);
        assert!(trap.take_record().is_none());
    }

    #[test]
    fn test_secrets_wiped_and_masked() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        trap.add_secret("root_password", "hunter2");
        assert_eq!(trap.secrets().get("root_password").as_deref(), Some("hunter2"));
        trap.log().info("chpasswd root:hunter2").unwrap();

        trap.finish(&Ok(()));
        assert!(trap.secrets().is_empty());

        let text = std::fs::read_to_string(trap.log().path()).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains(SECRET_MASK));
    }

    #[test]
    fn test_render_report_with_record() {
        let record = ErrorRecord {
            step: Some("Install Packages".to_string()),
            command: Some("pacstrap /mnt base".to_string()),
            location: Some("src/install.rs:10:5".to_string()),
            code: Some(1),
            message: None,
        };
        let mut out = Vec::new();
        render_report(
            &mut out,
            "Step 'Install Packages' failed with code 1",
            Some(&record),
            &["The full command output for this step is in the log".to_string()],
            Path::new("/var/log/stepwright.log"),
            false,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "error: Step 'Install Packages' failed with code 1");
        assert_eq!(lines[1], "  command:  pacstrap /mnt base");
        assert_eq!(lines[2], "  location: src/install.rs:10:5");
        assert!(lines[3].starts_with("  hint: "));
        assert_eq!(lines[4], "  Full log: /var/log/stepwright.log");
    }

    #[test]
    fn test_render_report_without_record_is_generic() {
        let mut out = Vec::new();
        render_report(&mut out, "the run failed", None, &[], Path::new("x.log"), false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("no further diagnostic was captured"));
        assert!(text.ends_with("Full log: x.log\n"));
    }

    #[test]
    #[serial]
    fn test_panic_hook_captures_location() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        trap.install_panic_hook();

        fn explode() {
            panic!("disk vanished");
        }
        assert!(std::panic::catch_unwind(explode).is_err());

        let record = trap.take_record().unwrap();
        assert_eq!(record.message.as_deref(), Some("panicked: disk vanished"));
        assert!(record.location.unwrap().contains("trap.rs"));
    }

    #[test]
    fn test_interrupt_beats_a_pending_answer() {
        let read = || {
            std::thread::sleep(std::time::Duration::from_secs(5));
            Ok("y\n".to_string())
        };
        let started = std::time::Instant::now();
        let answer = ask(read, async { Ok(()) }).unwrap();
        assert_eq!(answer, PromptAnswer::Interrupted);
        assert!(started.elapsed() < std::time::Duration::from_secs(4));
    }

    #[test]
    fn test_answer_without_interrupt() {
        let yes = ask(|| Ok("y\n".to_string()), std::future::pending()).unwrap();
        assert_eq!(yes, PromptAnswer::Yes);
        let no = ask(|| Ok("\n".to_string()), std::future::pending()).unwrap();
        assert_eq!(no, PromptAnswer::No);
    }

    #[test]
    fn test_prompt_interrupt_exits_cancelled() {
        let dir = TempDir::new().unwrap();
        let trap = trap_in(&dir);
        let outcome = Err(StepError::Failed {
            step: "Install Packages".to_string(),
            code: 3,
        });
        assert_eq!(trap.finish(&outcome).as_i32(), 3);

        assert_eq!(trap.interrupted_at_prompt(), ExitCode::CANCELLED);
        assert_eq!(trap.finish(&outcome), ExitCode::CANCELLED);
        assert_eq!(trap.state(), RunState::Failed);
        let records = read_records(&trap.log().path()).unwrap();
        assert!(records
            .iter()
            .any(|r| r.category == LogCategory::Warn && r.message == "Interrupted at the log prompt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_pager_opens_the_log() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("run.log");
        std::fs::write(&log_path, "line\n").unwrap();
        run_pager("cat -u", &log_path).unwrap();

        let empty = run_pager("  ", &log_path).unwrap_err();
        assert_eq!(empty.kind(), io::ErrorKind::InvalidInput);
        let missing = run_pager("stepwright-no-such-pager", &log_path).unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_run_state_terminality() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert_eq!(RunState::Failed.to_string(), "failed");
    }
}

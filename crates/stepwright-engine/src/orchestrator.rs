//! Top-level loop: runs steps in program order and stops at the first step
//! that does not succeed.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stepwright_config::{EngineConfig, StepScript};
use stepwright_utils::{AuditLog, ErrorKind, ExitCode, LogError, StepError};

use crate::monitor::ProgressMonitor;
use crate::payload::CommandPayload;
use crate::retry::RetryPolicy;
use crate::supervisor::StepSupervisor;
use crate::task::{Payload, TaskRunner};
use crate::trap::{ErrorTrap, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// Never started because an earlier step ended the run
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub step: String,
    pub message: String,
}

/// Machine-readable account of one run (`--json`)
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub state: RunState,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

#[derive(Debug)]
pub struct Orchestrator {
    log: AuditLog,
    config: EngineConfig,
    supervisor: StepSupervisor,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    steps: Vec<StepReport>,
}

impl Orchestrator {
    /// Wire the engine for one run from `config`, sharing `trap`'s log,
    /// error record, secrets and scratch directory.
    #[must_use]
    pub fn new(config: EngineConfig, trap: &ErrorTrap, cancel: CancellationToken) -> Self {
        let log = trap.log().clone();
        let runner = TaskRunner::new(
            log.clone(),
            cancel.clone(),
            trap.secrets(),
            trap.scratch_dir().to_path_buf(),
            RetryPolicy::from(&config.retry),
            config.process.output_cap_bytes,
        );
        let monitor = ProgressMonitor::new(
            config.poll_interval(),
            config.kill_grace(),
            config.monitor.spinner,
            cancel.clone(),
        );
        let supervisor = StepSupervisor::new(log.clone(), runner, monitor, trap.record_cell(), cancel.clone());

        Self {
            log,
            config,
            supervisor,
            cancel,
            started_at: Utc::now(),
            steps: Vec::new(),
        }
    }

    /// Write the run banner and the resolved configuration as `PROP` records.
    ///
    /// # Errors
    ///
    /// Returns the [`LogError`] if the durable log cannot be written.
    pub fn begin(&self, title: &str) -> Result<(), LogError> {
        self.log.head(&format!("Run started: {title}"))?;
        for (key, value) in self.config.properties() {
            self.log.prop(key, value)?;
        }
        Ok(())
    }

    /// Run one step. Steps run in call order; the caller stops on the first error.
    ///
    /// # Errors
    ///
    /// The step's classification from [`StepSupervisor::run`].
    pub async fn step<P: Payload>(&mut self, name: &str, payload: P) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            self.record(name, StepStatus::NotRun, 0);
            return Err(StepError::Cancelled {
                step: name.to_string(),
            });
        }

        let started = Instant::now();
        let result = self.supervisor.run(name, payload).await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let status = match &result {
            Ok(()) => StepStatus::Succeeded,
            Err(e) if e.is_cancellation() => StepStatus::Cancelled,
            Err(_) => StepStatus::Failed,
        };
        self.record(name, status, elapsed);
        result
    }

    /// Run every step of `script` in order.
    ///
    /// # Errors
    ///
    /// The first step error; later steps are reported as not run.
    pub async fn run_script(&mut self, script: &StepScript) -> Result<(), StepError> {
        for (index, step) in script.steps.iter().enumerate() {
            if let Err(e) = self.step(&step.name, CommandPayload::from_step(step)).await {
                for rest in &script.steps[index + 1..] {
                    self.record(&rest.name, StepStatus::NotRun, 0);
                }
                warn!(step = %step.name, error = %e, "run stopped");
                return Err(e);
            }
        }
        info!(steps = script.steps.len(), "all steps succeeded");
        Ok(())
    }

    fn record(&mut self, name: &str, status: StepStatus, duration_ms: u64) {
        self.steps.push(StepReport {
            name: name.to_string(),
            status,
            duration_ms,
        });
    }

    #[must_use]
    pub fn reports(&self) -> &[StepReport] {
        &self.steps
    }

    /// Summarise the run once the trap has assigned the exit code.
    #[must_use]
    pub fn summary(&self, outcome: &Result<(), StepError>, exit: ExitCode) -> RunSummary {
        let state = match outcome {
            Ok(()) => RunState::Success,
            Err(e) if e.is_cancellation() => RunState::Cancelled,
            Err(_) => RunState::Failed,
        };
        RunSummary {
            state,
            exit_code: exit.as_i32(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            log_path: self.log.path(),
            steps: self.steps.clone(),
            error: outcome.as_ref().err().map(|e| ErrorSummary {
                kind: e.kind(),
                step: e.step().to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::PayloadFn;
    use crate::trap::ReportOptions;
    use stepwright_utils::{LogCategory, read_records};
    use tempfile::TempDir;

    fn setup() -> (TempDir, ErrorTrap, EngineConfig) {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.log.path = dir.path().join("run.log");
        config.monitor.poll_interval_ms = 5;
        config.monitor.spinner = false;
        config.retry.backoff_ms = 0;
        let log = AuditLog::open(&config.log.path, &config.log.product_tag).unwrap();
        let trap = ErrorTrap::new(log, ReportOptions::quiet()).unwrap();
        (dir, trap, config)
    }

    #[tokio::test]
    async fn test_begin_writes_banner_and_properties() {
        let (_dir, trap, config) = setup();
        let orchestrator = Orchestrator::new(config, &trap, CancellationToken::new());
        orchestrator.begin("install.toml").unwrap();

        let recs = read_records(&trap.log().path()).unwrap();
        assert_eq!(recs[0].category, LogCategory::Head);
        assert_eq!(recs[0].message, "Run started: install.toml");
        assert!(recs[1..].iter().all(|r| r.category == LogCategory::Prop));
        assert!(recs.iter().any(|r| r.message == "retry.max_attempts = 5"));
    }

    #[tokio::test]
    async fn test_failure_stops_later_steps() {
        let (_dir, trap, config) = setup();
        let mut orchestrator = Orchestrator::new(config, &trap, CancellationToken::new());

        let outcome = async {
            orchestrator.step("A", PayloadFn::new(|_ctx| async { 0 })).await?;
            orchestrator.step("B", PayloadFn::new(|_ctx| async { 2 })).await?;
            orchestrator.step("C", PayloadFn::new(|_ctx| async { 0 })).await
        }
        .await;

        assert!(matches!(outcome, Err(StepError::Failed { code: 2, .. })));
        let statuses: Vec<_> = orchestrator.reports().iter().map(|r| r.status).collect();
        assert_eq!(statuses, [StepStatus::Succeeded, StepStatus::Failed]);

        let exit = trap.finish(&outcome);
        let summary = orchestrator.summary(&outcome, exit);
        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.exit_code, 2);
        assert_eq!(summary.error.as_ref().unwrap().kind, ErrorKind::PayloadFailure);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["steps"][1]["status"], "failed");
    }

    #[tokio::test]
    async fn test_cancelled_run_marks_step_not_run() {
        let (_dir, trap, config) = setup();
        let cancel = CancellationToken::new();
        let mut orchestrator = Orchestrator::new(config, &trap, cancel.clone());
        cancel.cancel();

        let err = orchestrator
            .step("A", PayloadFn::new(|_ctx| async { 0 }))
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(orchestrator.reports()[0].status, StepStatus::NotRun);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_script_reports_not_run_steps() {
        let (_dir, trap, config) = setup();
        let mut orchestrator = Orchestrator::new(config, &trap, CancellationToken::new());
        let script = StepScript::parse(
            r#"
            [[steps]]
            name = "A"
            commands = [["true"]]
            [[steps]]
            name = "B"
            commands = [["sh", "-c", "exit 4"]]
            [[steps]]
            name = "C"
            commands = [["true"]]
            "#,
            std::path::Path::new("script.toml"),
        )
        .unwrap();

        let err = orchestrator.run_script(&script).await.unwrap_err();
        assert!(matches!(err, StepError::Failed { code: 4, .. }));
        let statuses: Vec<_> = orchestrator.reports().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            [StepStatus::Succeeded, StepStatus::Failed, StepStatus::NotRun]
        );

        let starts: Vec<String> = read_records(&trap.log().path())
            .unwrap()
            .into_iter()
            .filter(|r| r.category == LogCategory::Head)
            .map(|r| r.message)
            .collect();
        assert_eq!(starts, ["Step started: A", "Step started: B"]);
    }
}

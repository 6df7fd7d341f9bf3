//! Step Supervisor: announce, run, monitor and classify one step.
//!
//! Steps go through [`StepSupervisor::run`] strictly one at a time (it takes
//! `&mut self`). For every step that starts, the durable log receives exactly
//! one `HEAD` start record and then exactly one terminal record: `INFO` on
//! success, `FAIL` on failure, `WARN` on cancellation. The step's captured
//! output is appended as `PROC` records in between.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwright_utils::{AuditLog, LogError, StepError};

use crate::monitor::{ProgressMonitor, WatchOutcome};
use crate::slot::ResultSlot;
use crate::task::{Payload, TaskHandle, TaskRunner};
use crate::trap::{ErrorRecord, ErrorRecordCell};

#[derive(Debug)]
pub struct StepSupervisor {
    log: AuditLog,
    runner: TaskRunner,
    monitor: ProgressMonitor,
    slot: ResultSlot,
    errors: ErrorRecordCell,
    cancel: CancellationToken,
}

impl StepSupervisor {
    #[must_use]
    pub fn new(
        log: AuditLog,
        runner: TaskRunner,
        monitor: ProgressMonitor,
        errors: ErrorRecordCell,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            log,
            runner,
            monitor,
            slot: ResultSlot::new(),
            errors,
            cancel,
        }
    }

    /// Whether a step's result slot is still open
    #[must_use]
    pub const fn slot_open(&self) -> bool {
        self.slot.is_open()
    }

    /// Run `payload` as step `name` and classify its outcome.
    ///
    /// # Errors
    ///
    /// - [`StepError::AlreadyInProgress`] if a previous step's slot was never
    ///   released; nothing is logged or started.
    /// - [`StepError::Cancelled`] if the run was cancelled before or during the step.
    /// - [`StepError::MissingSlot`] if the payload ended without an outcome.
    /// - [`StepError::Failed`] for a non-zero outcome.
    /// - [`StepError::Log`] if the durable log cannot be written.
    pub async fn run<P: Payload>(&mut self, name: &str, payload: P) -> Result<(), StepError> {
        if self.slot.is_open() {
            return Err(StepError::AlreadyInProgress {
                step: name.to_string(),
            });
        }
        if self.cancel.is_cancelled() {
            debug!(step = name, "run cancelled before step started");
            return Err(StepError::Cancelled {
                step: name.to_string(),
            });
        }

        self.log
            .head(&format!("Step started: {name}"))
            .map_err(|e| log_error(name, e))?;
        info!(step = name, "step started");

        let writer = self.slot.create(name)?;
        let mut handle = self.runner.spawn(name, payload, writer);

        match self.monitor.watch(&handle, name).await {
            WatchOutcome::Cancelled => {
                self.append_output(&handle, name)?;
                self.log
                    .warn(&format!("Step cancelled: {name}"))
                    .map_err(|e| log_error(name, e))?;
                Err(StepError::Cancelled {
                    step: name.to_string(),
                })
            }
            WatchOutcome::Completed => {
                if let Err(e) = handle.join().await {
                    debug!(step = name, error = %e, "task did not finish normally");
                }
                self.append_output(&handle, name)?;
                self.classify(&handle, name)
            }
        }
    }

    fn classify(&mut self, handle: &TaskHandle, name: &str) -> Result<(), StepError> {
        match self.slot.read(name) {
            Ok(0) => {
                self.slot.release();
                self.log
                    .info(&format!("Step succeeded: {name}"))
                    .map_err(|e| log_error(name, e))?;
                info!(step = name, "step succeeded");
                Ok(())
            }
            Ok(code) => {
                self.log
                    .fail(&format!("Step failed: {name} (code {code})"))
                    .map_err(|e| log_error(name, e))?;
                warn!(step = name, code, "step failed");
                self.errors.offer(failure_record(handle, name, Some(code)));
                Err(StepError::Failed {
                    step: name.to_string(),
                    code,
                })
            }
            Err(missing) => {
                self.log
                    .fail(&format!("Step failed: {name} (no outcome reported)"))
                    .map_err(|e| log_error(name, e))?;
                warn!(step = name, "step ended without an outcome");
                self.errors.offer(failure_record(handle, name, None));
                Err(missing)
            }
        }
    }

    fn append_output(&self, handle: &TaskHandle, name: &str) -> Result<(), StepError> {
        let output = handle.take_output();
        self.log.output(&output).map_err(|e| log_error(name, e))
    }
}

fn failure_record(handle: &TaskHandle, name: &str, code: Option<i32>) -> ErrorRecord {
    let mut record = handle.last_failure().unwrap_or_default();
    record.step = Some(name.to_string());
    if code.is_some() {
        record.code = code;
    }
    record
}

fn log_error(step: &str, source: LogError) -> StepError {
    StepError::Log {
        step: step.to_string(),
        source,
    }
}

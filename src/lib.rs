//! stepwright: supervised, strictly ordered step execution for OS installers
//!
//! An installer declares named steps; each one runs as an isolated background
//! task under the [`StepSupervisor`], with a spinner while it is active, its
//! output captured into a durable [`AuditLog`], and operator cancellation that
//! tears down the step's whole process subtree. The first step that does not
//! succeed ends the run through the [`ErrorTrap`].
//!
//! # Example
//!
//! ```rust,no_run
//! use stepwright::{
//!     AuditLog, CommandSpec, EngineConfig, ErrorTrap, Orchestrator, PayloadFn, ReportOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn install() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let log = AuditLog::open(&config.log.path, &config.log.product_tag)?;
//! let trap = ErrorTrap::new(log, ReportOptions::from_config(&config.report))?;
//! let mut run = Orchestrator::new(config, &trap, CancellationToken::new());
//!
//! let outcome = run
//!     .step("Prepare Disk", PayloadFn::new(|ctx| async move {
//!         ctx.exec(&CommandSpec::new("sgdisk").arg("--zap-all").arg("/dev/sda")).await
//!     }))
//!     .await;
//! let exit = trap.finish(&outcome);
//! # let _ = exit;
//! # Ok(())
//! # }
//! ```
//!
//! # Stable API
//!
//! The re-exports below are the supported surface. The member crates
//! (`stepwright-engine`, `stepwright-config`, `stepwright-runner`,
//! `stepwright-utils`) may change between minor versions.

pub mod cli;

pub use stepwright_config::{
    CONFIG_ENV_VAR, CliArgs, ConfigSource, DEFAULT_CONFIG_FILE, EngineConfig, ScriptStep, StepScript,
};
pub use stepwright_engine::{
    CommandPayload, ErrorRecord, ErrorTrap, Orchestrator, Payload, PayloadFn, ProgressMonitor,
    ReportOptions, ResultSlot, RetryPolicy, RunState, RunSummary, StepContext, StepReport,
    StepStatus, StepSupervisor, TaskHandle, TaskRunner, WatchOutcome, spawn_signal_listener,
    with_retries,
};
pub use stepwright_runner::{CommandSpec, OutputBuffer, ProcessGroupSet};
pub use stepwright_utils::{
    AuditLog, ConfigError, ErrorKind, ExitCode, LogCategory, LogRecord, StepError, init_tracing,
    read_records,
};

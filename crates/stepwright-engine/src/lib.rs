//! Step execution engine for stepwright
//!
//! Turns a declared unit of work into a supervised background task:
//!
//! - [`slot`]: the Result Slot handing a step's outcome code to the supervisor
//! - [`task`]: the Task Runner, [`Payload`] and its [`StepContext`]
//! - [`monitor`]: the Progress Monitor and operator cancellation
//! - [`supervisor`]: the Step Supervisor composing the above for one step
//! - [`retry`]: the Retry Wrapper used inside payloads
//! - [`trap`]: the Global Error Trap every run ends through
//! - [`orchestrator`]: the ordered top-level loop and run summary
//!
//! Steps never run concurrently. The first step that does not succeed ends
//! the run.

pub mod monitor;
pub mod orchestrator;
pub mod payload;
pub mod retry;
pub mod signals;
pub mod slot;
pub mod supervisor;
pub mod task;
pub mod trap;

pub use monitor::{ProgressMonitor, WatchOutcome};
pub use orchestrator::{ErrorSummary, Orchestrator, RunSummary, StepReport, StepStatus};
pub use payload::CommandPayload;
pub use retry::{RetryPolicy, with_retries};
pub use signals::{spawn_signal_listener, wait_for_shutdown_signal};
pub use slot::{ResultSlot, SlotState, SlotWriter};
pub use supervisor::StepSupervisor;
pub use task::{Payload, PayloadFn, StepContext, TaskHandle, TaskRunner};
pub use trap::{ErrorRecord, ErrorRecordCell, ErrorTrap, ReportOptions, RunState, Secrets, current_step};

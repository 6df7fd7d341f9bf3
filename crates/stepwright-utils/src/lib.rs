//! Foundation types shared by every stepwright crate
//!
//! - [`exit_codes`]: the process exit-code table
//! - [`error`]: step classification and configuration errors
//! - [`logging`]: the durable audit log and `tracing` setup

pub mod error;
pub mod exit_codes;
pub mod logging;

pub use error::{ConfigError, ErrorKind, StepError};
pub use exit_codes::ExitCode;
pub use logging::{AuditLog, LogCategory, LogError, LogRecord, init_tracing, read_records};

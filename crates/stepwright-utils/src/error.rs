use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::exit_codes::ExitCode;
use crate::logging::LogError;

/// Broad class of a step outcome, used for reporting and JSON summaries.
///
/// | Kind | Meaning |
/// |------|---------|
/// | `ProgrammingError` | a payload broke the result contract; never retried |
/// | `Cancellation` | the operator interrupted the run; not an error |
/// | `PayloadFailure` | the payload reported a non-zero outcome |
/// | `Infrastructure` | the engine itself could not do its job (log unwritable) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProgrammingError,
    Cancellation,
    PayloadFailure,
    Infrastructure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProgrammingError => write!(f, "programming error"),
            Self::Cancellation => write!(f, "cancellation"),
            Self::PayloadFailure => write!(f, "payload failure"),
            Self::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

/// Classification of a step that did not succeed.
///
/// The Step Supervisor returns exactly one of these for the first step that
/// does not resolve to success; the run stops there.
///
/// # Exit Code Mapping
///
/// | Variant | Exit code |
/// |---------|-----------|
/// | `Cancelled` | 130 |
/// | `Failed { code }` | `code` when in `1..=255` and not 2 or 130, else 1 |
/// | everything else | 1 |
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Step '{step}' started while a result slot is still open")]
    AlreadyInProgress { step: String },

    #[error("Step '{step}' ended without reporting an outcome")]
    MissingSlot { step: String },

    #[error("Step '{step}' failed with code {code}")]
    Failed { step: String, code: i32 },

    #[error("Step '{step}' was cancelled by the operator")]
    Cancelled { step: String },

    #[error("Step '{step}' could not write the durable log: {source}")]
    Log {
        step: String,
        #[source]
        source: LogError,
    },
}

impl StepError {
    /// Name of the step this outcome belongs to
    #[must_use]
    pub fn step(&self) -> &str {
        match self {
            Self::AlreadyInProgress { step }
            | Self::MissingSlot { step }
            | Self::Failed { step, .. }
            | Self::Cancelled { step }
            | Self::Log { step, .. } => step,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInProgress { .. } | Self::MissingSlot { .. } => {
                ErrorKind::ProgrammingError
            }
            Self::Cancelled { .. } => ErrorKind::Cancellation,
            Self::Failed { .. } => ErrorKind::PayloadFailure,
            Self::Log { .. } => ErrorKind::Infrastructure,
        }
    }

    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Map this outcome to the process exit code
    #[must_use]
    pub const fn to_exit_code(&self) -> ExitCode {
        match self {
            Self::Cancelled { .. } => ExitCode::CANCELLED,
            Self::Failed { code, .. } => ExitCode::for_step_code(*code),
            _ => ExitCode::STEP_FAILED,
        }
    }

    /// Actionable hints shown under the failure line
    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::AlreadyInProgress { .. } => vec![
                "A previous step did not release its result slot; this is a bug in the step sequence".to_string(),
            ],
            Self::MissingSlot { .. } => vec![
                "The step's payload ended without producing an outcome (it may have panicked)".to_string(),
                "Check the log for the last command the step ran".to_string(),
            ],
            Self::Failed { .. } => vec![
                "The full command output for this step is in the log".to_string(),
            ],
            Self::Cancelled { .. } => Vec::new(),
            Self::Log { .. } => vec![
                "Check free space and permissions for the log location".to_string(),
            ],
        }
    }
}

/// Configuration and step-script errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    #[must_use]
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::CLI_ARGS
    }

    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::MissingFile(_) => vec![
                "Pass an existing file with --config or unset STEPWRIGHT_CONFIG".to_string(),
            ],
            Self::Io { .. } => vec!["Check that the file is readable".to_string()],
            Self::Parse { .. } => vec!["Check the TOML syntax near the reported line".to_string()],
            Self::InvalidValue { key, .. } => match key.as_str() {
                "retry.max_attempts" => vec!["Use an integer of at least 1".to_string()],
                "monitor.poll_interval_ms" => vec!["Use a positive number of milliseconds".to_string()],
                key if key.starts_with("steps") => vec![
                    "Every step needs a unique name and at least one non-empty command".to_string(),
                ],
                _ => Vec::new(),
            },
        }
    }
}

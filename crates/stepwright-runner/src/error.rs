//! Error types for the runner crate

use thiserror::Error;

/// Failures while starting, grouping, or reaping a child process
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn '{program}': {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process group setup failed: {reason}")]
    GroupSetupFailed { reason: String },

    #[error("Refused to start '{program}': the step's processes are being killed")]
    GroupClosed { program: String },

    #[error("Failed to wait for '{program}': {reason}")]
    WaitFailed { program: String, reason: String },

    #[error("Command has an empty program name")]
    EmptyProgram,
}

//! Process execution for supervised installer steps
//!
//! Every external command a step runs goes through [`CommandSpec`], is placed in
//! its own process group (a Job Object on Windows) and is tracked by a
//! [`ProcessGroupSet`] so the whole subtree can be torn down on cancellation.
//!
//! # Security Model
//!
//! Commands are argv-style only. Arguments cross into the child as discrete
//! elements and are never handed to a shell for evaluation.

pub mod command_spec;
pub mod error;
pub mod output;
pub mod process;

pub use command_spec::CommandSpec;
pub use error::RunnerError;
pub use output::OutputBuffer;
pub use process::{GroupedChild, ProcessGroupSet, SPAWN_FAILURE_CODE, exit_code_of, spawn_grouped};

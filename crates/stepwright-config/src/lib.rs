//! Configuration management for stepwright
//!
//! Hierarchical configuration with precedence CLI > file > defaults. The file
//! is TOML with `[log]`, `[monitor]`, `[retry]`, `[process]` and `[report]`
//! sections. Step scripts, the ordered list of named command steps the CLI
//! executes, are also parsed here.

mod discovery;
mod model;
mod script;
mod validation;

pub use discovery::{CONFIG_ENV_VAR, DEFAULT_CONFIG_FILE};
pub use model::*;
pub use script::{ScriptStep, StepScript};
pub use stepwright_utils::ConfigError;

//! Step scripts: the ordered list of named command steps the CLI executes.

use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use stepwright_runner::CommandSpec;
use stepwright_utils::ConfigError;

/// A parsed and validated step script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepScript {
    pub steps: Vec<ScriptStep>,
}

/// One named step: argv commands run in order inside a single task
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptStep {
    pub name: String,
    /// Wrap each command in the retry wrapper
    #[serde(default)]
    pub retry: bool,
    pub commands: Vec<Vec<String>>,
}

impl StepScript {
    /// Load and validate a script file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingFile`] / [`ConfigError::Io`] when the file cannot
    /// be read, [`ConfigError::Parse`] on bad TOML, and
    /// [`ConfigError::InvalidValue`] with a `steps[..]` key on invalid content.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse and validate script text; `origin` is used in error messages only.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let script: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::from(origin),
            reason: e.to_string(),
        })?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "steps".to_string(),
                reason: "script must declare at least one step".to_string(),
            });
        }

        let mut names = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let key = format!("steps[{index}]");
            if step.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key}.name"),
                    reason: "must not be empty".to_string(),
                });
            }
            if !names.insert(step.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key}.name"),
                    reason: format!("duplicate step name '{}'", step.name),
                });
            }
            if step.commands.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: format!("{key}.commands"),
                    reason: format!("step '{}' has no commands", step.name),
                });
            }
            for (cmd_index, argv) in step.commands.iter().enumerate() {
                CommandSpec::from_argv(argv).map_err(|e| ConfigError::InvalidValue {
                    key: format!("{key}.commands[{cmd_index}]"),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }
}

impl ScriptStep {
    /// Command specs for this step. Validation guarantees every argv has a program.
    #[must_use]
    pub fn command_specs(&self) -> Vec<CommandSpec> {
        self.commands
            .iter()
            .filter_map(|argv| CommandSpec::from_argv(argv).ok())
            .collect()
    }
}

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use tokio::process::Command as TokioCommand;

use crate::error::RunnerError;

// ============================================================================
// CommandSpec - argv-only command description
// ============================================================================

/// Specification for an external command a step runs.
///
/// Arguments are kept as discrete `OsString` elements; nothing here ever builds
/// a shell string. Payloads that genuinely need a shell must ask for one
/// explicitly (`CommandSpec::new("sh").args(["-c", ...])`).
///
/// # Example
///
/// ```rust
/// use stepwright_runner::CommandSpec;
/// use std::ffi::OsString;
///
/// let cmd = CommandSpec::new("sgdisk")
///     .arg("--zap-all")
///     .arg("/dev/sda")
///     .env("LC_ALL", "C");
///
/// assert_eq!(cmd.program, OsString::from("sgdisk"));
/// assert_eq!(cmd.to_string(), "sgdisk --zap-all /dev/sda");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// The program to execute
    pub program: OsString,
    /// Arguments as discrete elements (NOT shell strings)
    pub args: Vec<OsString>,
    /// Optional working directory
    pub cwd: Option<PathBuf>,
    /// Optional environment overrides
    pub env: Option<BTreeMap<OsString, OsString>>,
}

impl CommandSpec {
    /// Create a new `CommandSpec` for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build a spec from an argv vector, first element being the program.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::EmptyProgram`] when `argv` is empty or its first
    /// element is blank.
    pub fn from_argv<S: AsRef<str>>(argv: &[S]) -> Result<Self, RunnerError> {
        let (program, rest) = argv.split_first().ok_or(RunnerError::EmptyProgram)?;
        if program.as_ref().trim().is_empty() {
            return Err(RunnerError::EmptyProgram);
        }
        Ok(Self::new(program.as_ref()).args(rest.iter().map(AsRef::as_ref)))
    }

    /// Add a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set one environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Blocking `std::process::Command`, used to open the log in a pager.
    #[must_use]
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = self.env {
            cmd.envs(env);
        }
        cmd
    }

    /// Async `tokio::process::Command` used by step payloads.
    ///
    /// The returned command is not yet placed in a process group; see
    /// [`crate::spawn_grouped`] for that.
    #[must_use]
    pub fn to_tokio_command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = self.env {
            cmd.envs(env);
        }
        cmd
    }

    /// Program name as lossy UTF-8, for error messages.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// Human-readable command text, used in the audit log and failure reports.
///
/// Arguments containing whitespace are single-quoted so the line reads
/// unambiguously; the text is never executed.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

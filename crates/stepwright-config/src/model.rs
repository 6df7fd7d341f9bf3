use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default durable log location (relative to the working directory)
pub const DEFAULT_LOG_PATH: &str = "stepwright.log";
/// Default product tag written into every log record
pub const DEFAULT_PRODUCT_TAG: &str = "stepwright";
/// Default liveness poll interval: one time unit
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Default attempts for the Retry Wrapper
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default sleep between retry attempts: ten time units
pub const DEFAULT_BACKOFF_MS: u64 = 10_000;
/// Default SIGTERM-to-SIGKILL grace when cancelling a step
pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
/// Default cap of a step's transient output buffer (1 MiB)
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 1024 * 1024;

/// Where a resolved configuration value came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Value provided via CLI argument (highest precedence)
    Cli,
    /// Value loaded from a configuration file
    File(PathBuf),
    /// Built-in default value (lowest precedence)
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Default => write!(f, "default"),
        }
    }
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogConfig {
    pub path: PathBuf,
    pub product_tag: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LOG_PATH),
            product_tag: DEFAULT_PRODUCT_TAG.to_string(),
        }
    }
}

/// `[monitor]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    /// Render the spinner (still suppressed when stderr is not a terminal)
    pub spinner: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            spinner: true,
        }
    }
}

/// `[retry]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

/// `[process]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessConfig {
    pub kill_grace_ms: u64,
    pub output_cap_bytes: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
        }
    }
}

/// `[report]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportConfig {
    /// Offer to page through the log after a failure (interactive sessions only)
    pub offer_pager: bool,
    /// Pager program; `$PAGER` wins when set
    pub pager: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            offer_pager: true,
            pager: "less".to_string(),
        }
    }
}

/// Resolved engine configuration.
///
/// Build it with [`EngineConfig::discover`] for CLI behaviour (file discovery
/// plus CLI overrides), or start from [`EngineConfig::default`] when embedding.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineConfig {
    pub log: LogConfig,
    pub monitor: MonitorConfig,
    pub retry: RetryConfig,
    pub process: ProcessConfig,
    pub report: ReportConfig,
    /// Origin of each resolved key, e.g. `"retry.max_attempts" -> File(..)`
    #[serde(skip)]
    pub source_attribution: BTreeMap<String, ConfigSource>,
}

impl EngineConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.poll_interval_ms)
    }

    #[must_use]
    pub const fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry.backoff_ms)
    }

    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.process.kill_grace_ms)
    }

    /// Source of a resolved key, `Default` when never overridden
    #[must_use]
    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.source_attribution
            .get(key)
            .cloned()
            .unwrap_or(ConfigSource::Default)
    }

    /// `(key, value)` pairs recorded as `PROP` lines at run start
    #[must_use]
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        vec![
            ("log.path", self.log.path.display().to_string()),
            ("log.product_tag", self.log.product_tag.clone()),
            ("monitor.poll_interval_ms", self.monitor.poll_interval_ms.to_string()),
            ("retry.max_attempts", self.retry.max_attempts.to_string()),
            ("retry.backoff_ms", self.retry.backoff_ms.to_string()),
            ("process.kill_grace_ms", self.process.kill_grace_ms.to_string()),
            ("process.output_cap_bytes", self.process.output_cap_bytes.to_string()),
        ]
    }
}

/// CLI overrides, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Explicit configuration file
    pub config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub spinner: Option<bool>,
    pub offer_pager: Option<bool>,
}

// ---------------------------------------------------------------------------
// On-disk shape: every field optional so the file only overrides what it names
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileConfig {
    pub log: Option<FileLog>,
    pub monitor: Option<FileMonitor>,
    pub retry: Option<FileRetry>,
    pub process: Option<FileProcess>,
    pub report: Option<FileReport>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileLog {
    pub path: Option<PathBuf>,
    pub product_tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileMonitor {
    pub poll_interval_ms: Option<u64>,
    pub spinner: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileRetry {
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileProcess {
    pub kill_grace_ms: Option<u64>,
    pub output_cap_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FileReport {
    pub offer_pager: Option<bool>,
    pub pager: Option<String>,
}

//! Durable audit log and diagnostic tracing for stepwright
//!
//! Two channels are kept apart:
//!
//! - The **audit log** ([`AuditLog`]) is the run's durable record. One line per
//!   record, `<timestamp> | <product-tag> | <CATEGORY> | <message>`, append-only.
//!   A log left over from a previous run is rotated to `<path>.bak` when the
//!   new run opens its log; nothing is rewritten afterwards.
//! - **Diagnostics** go through `tracing` ([`init_tracing`]) to stderr and are
//!   filtered with `RUST_LOG`.
//!
//! Every audit record is mirrored to `tracing` under the `stepwright::audit`
//! target.

use chrono::Local;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self as tracing_fmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Timestamp layout of every audit record
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Replacement written in place of registered secret values
pub const SECRET_MASK: &str = "********";

const FIELD_SEPARATOR: &str = " | ";

/// Initialize the `tracing` subscriber for diagnostics on stderr.
///
/// Compact output by default; `verbose` adds targets, span close events and the
/// audit-log mirror.
/// `RUST_LOG` overrides the built-in filter.
pub fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            if verbose {
                EnvFilter::try_new("stepwright=debug,info")
            } else {
                // The audit mirror would duplicate what the progress UI shows.
                EnvFilter::try_new("warn,stepwright::audit=off")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    if verbose {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_fmt::layer()
                    .with_writer(io::stderr)
                    .with_target(false)
                    .compact(),
            )
            .try_init()?;
    }

    Ok(())
}

/// Category tag of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogCategory {
    /// Successful step, run summary
    Info,
    /// Retry warnings, cancellation
    Warn,
    /// Step failure
    Fail,
    /// Run banner and step start
    Head,
    /// Captured payload output
    Proc,
    /// Run properties recorded at start
    Prop,
}

impl LogCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Head => "HEAD",
            Self::Proc => "PROC",
            Self::Prop => "PROP",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Self::Info),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            "HEAD" => Ok(Self::Head),
            "PROC" => Ok(Self::Proc),
            "PROP" => Ok(Self::Prop),
            other => Err(LogError::Malformed(format!("unknown category '{other}'"))),
        }
    }
}

/// Audit log failures
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Failed to open log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to rotate {path} to its backup: {source}")]
    Rotate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to append to log: {0}")]
    Write(#[from] io::Error),

    #[error("Malformed log record: {0}")]
    Malformed(String),
}

/// One parsed line of the audit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: String,
    pub product_tag: String,
    pub category: LogCategory,
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.timestamp,
            self.product_tag,
            self.category,
            self.message,
            sep = FIELD_SEPARATOR
        )
    }
}

impl FromStr for LogRecord {
    type Err = LogError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.splitn(4, FIELD_SEPARATOR);
        let (Some(timestamp), Some(product_tag), Some(category)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(LogError::Malformed(line.to_string()));
        };
        Ok(Self {
            timestamp: timestamp.to_string(),
            product_tag: product_tag.to_string(),
            category: category.parse()?,
            message: fields.next().unwrap_or_default().to_string(),
        })
    }
}

/// Read every record of a log file, in order.
///
/// # Errors
///
/// Fails if the file cannot be read or a line does not parse.
pub fn read_records(path: &Path) -> Result<Vec<LogRecord>, LogError> {
    let text = fs::read_to_string(path).map_err(|source| LogError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    text.lines().map(str::parse).collect()
}

/// Backup location a previous run's log is rotated to
#[must_use]
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

#[derive(Debug)]
struct LogInner {
    file: File,
    path: PathBuf,
    product_tag: String,
    masks: Vec<String>,
}

/// Append-only, category-tagged audit log shared by the whole run.
///
/// Cloning yields another handle to the same file. Writes are serialised by
/// an internal lock and flushed per record.
#[derive(Debug, Clone)]
pub struct AuditLog {
    inner: Arc<Mutex<LogInner>>,
}

impl AuditLog {
    /// Open the log for a new run, rotating any previous file to its backup.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Rotate`] if the old log cannot be moved aside and
    /// [`LogError::Open`] if the new file cannot be created.
    pub fn open(path: impl Into<PathBuf>, product_tag: impl Into<String>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        }
        if path.exists() {
            fs::rename(&path, backup_path(&path)).map_err(|source| LogError::Rotate {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        debug!(path = %path.display(), "audit log opened");

        Ok(Self {
            inner: Arc::new(Mutex::new(LogInner {
                file,
                path,
                product_tag: product_tag.into(),
                masks: Vec::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Location of the log file
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Never write `secret` verbatim; it is replaced with [`SECRET_MASK`].
    pub fn mask(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.is_empty() {
            self.lock().masks.push(secret);
        }
    }

    /// Drop every registered mask (secrets released)
    pub fn clear_masks(&self) {
        self.lock().masks.clear();
    }

    /// Append one record per line of `message`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Write`] if the file cannot be appended to.
    pub fn record(&self, category: LogCategory, message: &str) -> Result<(), LogError> {
        let mut inner = self.lock();
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let mut block = String::new();

        // Masks apply before splitting so a secret spanning lines is still caught.
        let masked = inner
            .masks
            .iter()
            .fold(message.to_string(), |acc, secret| acc.replace(secret.as_str(), SECRET_MASK));
        let lines: Vec<&str> = if masked.is_empty() {
            vec![""]
        } else {
            masked.lines().collect()
        };
        for line in lines {
            let line = line.to_string();
            mirror(category, &line);
            let record = LogRecord {
                timestamp: timestamp.clone(),
                product_tag: inner.product_tag.clone(),
                category,
                message: line,
            };
            block.push_str(&record.to_string());
            block.push('\n');
        }

        inner.file.write_all(block.as_bytes())?;
        inner.file.flush()?;
        Ok(())
    }

    pub fn info(&self, message: &str) -> Result<(), LogError> {
        self.record(LogCategory::Info, message)
    }

    pub fn warn(&self, message: &str) -> Result<(), LogError> {
        self.record(LogCategory::Warn, message)
    }

    pub fn fail(&self, message: &str) -> Result<(), LogError> {
        self.record(LogCategory::Fail, message)
    }

    pub fn head(&self, message: &str) -> Result<(), LogError> {
        self.record(LogCategory::Head, message)
    }

    pub fn prop(&self, key: &str, value: impl fmt::Display) -> Result<(), LogError> {
        self.record(LogCategory::Prop, &format!("{key} = {value}"))
    }

    /// Append a step's captured output, one `PROC` record per line.
    ///
    /// Empty output writes nothing.
    pub fn output(&self, text: &str) -> Result<(), LogError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.record(LogCategory::Proc, text.trim_end_matches('\n'))
    }
}

fn mirror(category: LogCategory, line: &str) {
    match category {
        LogCategory::Fail => error!(target: "stepwright::audit", "{line}"),
        LogCategory::Warn => warn!(target: "stepwright::audit", "{line}"),
        LogCategory::Proc => debug!(target: "stepwright::audit", "{line}"),
        _ => info!(target: "stepwright::audit", "{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_in(dir: &TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("install.log"), "stepwright").unwrap()
    }

    #[test]
    fn test_record_format() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.head("Step started: Prepare Disk").unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let line = text.lines().next().unwrap();
        let fields: Vec<&str> = line.split(" | ").collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0].len(), "2026-01-01 00:00:00".len());
        assert_eq!(fields[1], "stepwright");
        assert_eq!(fields[2], "HEAD");
        assert_eq!(fields[3], "Step started: Prepare Disk");
    }

    #[test]
    fn test_multiline_message_splits_into_records() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.output("line one\nline two\n").unwrap();

        let records = read_records(&log.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.category == LogCategory::Proc));
        assert_eq!(records[1].message, "line two");
    }

    #[test]
    fn test_empty_output_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.output("\n  \n").unwrap();
        assert!(read_records(&log.path()).unwrap().is_empty());
    }

    #[test]
    fn test_open_rotates_previous_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("install.log");
        {
            let first = AuditLog::open(&path, "stepwright").unwrap();
            first.info("first run").unwrap();
        }
        let second = AuditLog::open(&path, "stepwright").unwrap();
        second.info("second run").unwrap();

        let current = read_records(&path).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].message, "second run");

        let backup = read_records(&backup_path(&path)).unwrap();
        assert_eq!(backup[0].message, "first run");
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("var/log/stepwright.log");
        let log = AuditLog::open(&path, "tag").unwrap();
        log.info("ok").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_secrets_are_masked() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.mask("hunter2");
        log.mask("");
        log.output("chpasswd <<< root:hunter2").unwrap();

        let records = read_records(&log.path()).unwrap();
        assert_eq!(records[0].message, format!("chpasswd <<< root:{SECRET_MASK}"));

        log.clear_masks();
        log.info("hunter2").unwrap();
        assert_eq!(read_records(&log.path()).unwrap()[1].message, "hunter2");
    }

    #[test]
    fn test_multiline_secret_is_masked() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.mask("-----BEGIN KEY-----\nc2VjcmV0\n-----END KEY-----");
        log.output("writing key\n-----BEGIN KEY-----\nc2VjcmV0\n-----END KEY-----\ndone")
            .unwrap();

        let records = read_records(&log.path()).unwrap();
        let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["writing key", SECRET_MASK, "done"]);
        assert!(records.iter().all(|r| !r.message.contains("c2VjcmV0")));
    }

    #[test]
    fn test_clones_append_to_same_file() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        let other = log.clone();
        log.info("a").unwrap();
        other.warn("b").unwrap();
        let records = read_records(&log.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].category, LogCategory::Warn);
    }

    #[test]
    fn test_record_parse_keeps_separators_in_message() {
        let record: LogRecord = "2026-10-16 10:00:00 | stepwright | PROC | a | b".parse().unwrap();
        assert_eq!(record.message, "a | b");
        assert_eq!(record.to_string(), "2026-10-16 10:00:00 | stepwright | PROC | a | b");
    }

    #[test]
    fn test_record_parse_rejects_unknown_category() {
        assert!("ts | tag | NOPE | msg".parse::<LogRecord>().is_err());
        assert!("garbage".parse::<LogRecord>().is_err());
    }

    #[test]
    fn test_prop_record() {
        let dir = TempDir::new().unwrap();
        let log = open_in(&dir);
        log.prop("retry.max_attempts", 5).unwrap();
        let records = read_records(&log.path()).unwrap();
        assert_eq!(records[0].category, LogCategory::Prop);
        assert_eq!(records[0].message, "retry.max_attempts = 5");
    }
}

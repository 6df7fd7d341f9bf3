use stepwright_utils::ConfigError;

use crate::model::EngineConfig;

/// Upper bound on retry attempts; beyond this a script is almost certainly wrong
const MAX_ATTEMPTS_LIMIT: u32 = 100;

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

impl EngineConfig {
    /// Validate resolved configuration values
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.log.product_tag.trim().is_empty() {
            return Err(invalid("log.product_tag", "must not be empty"));
        }
        if self.log.product_tag.contains('|') {
            return Err(invalid("log.product_tag", "must not contain '|'"));
        }
        if self.log.path.as_os_str().is_empty() {
            return Err(invalid("log.path", "must not be empty"));
        }

        if self.monitor.poll_interval_ms == 0 {
            return Err(invalid("monitor.poll_interval_ms", "must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(invalid("retry.max_attempts", "exceeds maximum limit of 100"));
        }

        if self.process.output_cap_bytes < 1024 {
            return Err(invalid(
                "process.output_cap_bytes",
                "must be at least 1024 bytes (1 KiB)",
            ));
        }

        if self.report.pager.trim().is_empty() {
            return Err(invalid("report.pager", "must not be empty"));
        }

        Ok(())
    }
}

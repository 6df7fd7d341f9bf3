use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use stepwright_utils::ConfigError;

use crate::model::{CliArgs, ConfigSource, EngineConfig, FileConfig};

/// Environment variable naming a configuration file
pub const CONFIG_ENV_VAR: &str = "STEPWRIGHT_CONFIG";

/// File looked up in the starting directory when nothing else names one
pub const DEFAULT_CONFIG_FILE: &str = "stepwright.toml";

impl EngineConfig {
    /// Discover and load configuration with precedence CLI > file > defaults.
    ///
    /// The file is chosen as: `--config`, else `$STEPWRIGHT_CONFIG`, else
    /// `./stepwright.toml` when it exists, else none.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when a named file is missing or unreadable,
    /// when TOML parsing fails, or when a resolved value is invalid.
    pub fn discover(cli_args: &CliArgs) -> Result<Self, ConfigError> {
        let start_dir = env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        let env_path = env::var_os(CONFIG_ENV_VAR).map(PathBuf::from);
        Self::discover_from(&start_dir, env_path, cli_args)
    }

    /// Path-driven variant of [`discover`](Self::discover) that avoids
    /// process-global state; used by tests.
    ///
    /// # Errors
    ///
    /// See [`discover`](Self::discover).
    pub fn discover_from(
        start_dir: &Path,
        env_path: Option<PathBuf>,
        cli_args: &CliArgs,
    ) -> Result<Self, ConfigError> {
        let explicit = cli_args.config_path.clone().or(env_path);
        let config_path = match explicit {
            Some(path) if !path.is_file() => return Err(ConfigError::MissingFile(path)),
            Some(path) => Some(path),
            None => Some(start_dir.join(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };

        let mut config = Self::default();
        if let Some(path) = config_path {
            let file_config = load_config_file(&path)?;
            config.apply_file(file_config, &ConfigSource::File(path));
        }
        config.apply_cli(cli_args);
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and layer it over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::InvalidValue`].
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let file_config = parse_config(text, origin)?;
        let mut config = Self::default();
        config.apply_file(file_config, &ConfigSource::File(origin.to_path_buf()));
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig, source: &ConfigSource) {
        let mut seen: BTreeMap<String, ConfigSource> = BTreeMap::new();
        let mut mark = |key: &str| {
            seen.insert(key.to_string(), source.clone());
        };

        if let Some(log) = file.log {
            if let Some(path) = log.path {
                self.log.path = path;
                mark("log.path");
            }
            if let Some(tag) = log.product_tag {
                self.log.product_tag = tag;
                mark("log.product_tag");
            }
        }
        if let Some(monitor) = file.monitor {
            if let Some(interval) = monitor.poll_interval_ms {
                self.monitor.poll_interval_ms = interval;
                mark("monitor.poll_interval_ms");
            }
            if let Some(spinner) = monitor.spinner {
                self.monitor.spinner = spinner;
                mark("monitor.spinner");
            }
        }
        if let Some(retry) = file.retry {
            if let Some(attempts) = retry.max_attempts {
                self.retry.max_attempts = attempts;
                mark("retry.max_attempts");
            }
            if let Some(backoff) = retry.backoff_ms {
                self.retry.backoff_ms = backoff;
                mark("retry.backoff_ms");
            }
        }
        if let Some(process) = file.process {
            if let Some(grace) = process.kill_grace_ms {
                self.process.kill_grace_ms = grace;
                mark("process.kill_grace_ms");
            }
            if let Some(cap) = process.output_cap_bytes {
                self.process.output_cap_bytes = cap;
                mark("process.output_cap_bytes");
            }
        }
        if let Some(report) = file.report {
            if let Some(offer) = report.offer_pager {
                self.report.offer_pager = offer;
                mark("report.offer_pager");
            }
            if let Some(pager) = report.pager {
                self.report.pager = pager;
                mark("report.pager");
            }
        }

        self.source_attribution.extend(seen);
    }

    fn apply_cli(&mut self, cli_args: &CliArgs) {
        if let Some(path) = &cli_args.log_path {
            self.log.path = path.clone();
            self.source_attribution
                .insert("log.path".to_string(), ConfigSource::Cli);
        }
        if let Some(spinner) = cli_args.spinner {
            self.monitor.spinner = spinner;
            self.source_attribution
                .insert("monitor.spinner".to_string(), ConfigSource::Cli);
        }
        if let Some(offer) = cli_args.offer_pager {
            self.report.offer_pager = offer;
            self.source_attribution
                .insert("report.offer_pager".to_string(), ConfigSource::Cli);
        }
    }
}

fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "loaded configuration file");
    parse_config(&text, path)
}

fn parse_config(text: &str, path: &Path) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

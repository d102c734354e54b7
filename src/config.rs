//! Runtime configuration read from the process environment.
//!
//! Every knob has a default; [`PipelineConfig::from_map`] parses a plain map
//! so tests never touch the real environment, and
//! [`PipelineConfig::from_env`] feeds it the prefixed environment variables.

use crate::aggregator::AggregatorSettings;
use crate::error::{PipelineError, Result};
use crate::logging::{LogFormat, LoggingConfig};
use std::collections::HashMap;
use std::str::FromStr;

/// Where shards and reports are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Buckets are directories on local disk.
    Local,
    /// Buckets live in the object store.
    ObjectStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_errors: usize,
    pub max_group_size: usize,
    pub use_max_error_slice: bool,
    pub report_root: Option<String>,
    pub storage_mode: StorageMode,
    pub db_secret: Option<String>,
    pub db_user: Option<String>,
    pub db_password: Option<String>,
    pub db_host: Option<String>,
    pub db_name: Option<String>,
    pub queue_url: Option<String>,
    pub output_queue_url: Option<String>,
    pub visibility_timeout_secs: u32,
    /// Worker pool size; `None` lets the pool size itself to the machine.
    pub worker_threads: Option<usize>,
    pub logging: LoggingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50_000,
            max_errors: 1_000_000,
            max_group_size: 200,
            use_max_error_slice: false,
            report_root: None,
            storage_mode: StorageMode::ObjectStore,
            db_secret: None,
            db_user: None,
            db_password: None,
            db_host: None,
            db_name: None,
            queue_url: None,
            output_queue_url: None,
            visibility_timeout_secs: 1200,
            worker_threads: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Collect environment variables starting with `prefix` into a map keyed by
/// the lowercased remainder of their names.
#[must_use]
pub fn config_from_env(prefix: &str) -> HashMap<String, String> {
    let mut config = HashMap::new();

    for (key, value) in std::env::vars() {
        if let Some(key_name) = key.strip_prefix(prefix) {
            config.insert(key_name.to_lowercase(), value);
        }
    }

    config
}

fn parse<T: FromStr>(map: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match map.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::Config(format!("{name}={raw:?}: {e}"))),
    }
}

fn positive(name: &str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(PipelineError::Config(format!("{name} must be greater than zero")));
    }
    Ok(value)
}

fn text(map: &HashMap<String, String>, name: &str) -> Option<String> {
    map.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl PipelineConfig {
    /// Build a configuration from lowercase variable names (`batch_size`,
    /// `max_errors`, `env`, ...). Missing or blank entries keep their default.
    ///
    /// # Errors
    /// Returns [`PipelineError::Config`] for unparseable values and for a
    /// zero batch size, error cap, group cap or worker count.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let storage_mode = match text(map, "env") {
            Some(env) if env.eq_ignore_ascii_case("local") => StorageMode::Local,
            _ => StorageMode::ObjectStore,
        };
        let use_max_error_slice = match text(map, "use_max_err_lf") {
            None => defaults.use_max_error_slice,
            Some(v) => v
                .to_ascii_lowercase()
                .parse::<bool>()
                .map_err(|e| PipelineError::Config(format!("use_max_err_lf={v:?}: {e}")))?,
        };
        let mut logging = LoggingConfig::default();
        if let Some(level) = text(map, "log_level") {
            logging.level = level.to_lowercase();
        }
        if let Some(format) = text(map, "log_format") {
            logging.format = format.parse::<LogFormat>()?;
        }

        Ok(Self {
            batch_size: positive("batch_size", parse(map, "batch_size")?.unwrap_or(defaults.batch_size))?,
            max_errors: positive("max_errors", parse(map, "max_errors")?.unwrap_or(defaults.max_errors))?,
            max_group_size: positive(
                "max_group_size",
                parse(map, "max_group_size")?.unwrap_or(defaults.max_group_size),
            )?,
            use_max_error_slice,
            report_root: text(map, "s3_root"),
            storage_mode,
            db_secret: text(map, "db_secret"),
            db_user: text(map, "db_user"),
            db_password: map.get("db_pwd").cloned().filter(|v| !v.is_empty()),
            db_host: text(map, "db_host"),
            db_name: text(map, "db_name"),
            queue_url: text(map, "queue_url"),
            output_queue_url: text(map, "output_queue_url"),
            visibility_timeout_secs: parse(map, "visibility_timeout")?
                .unwrap_or(defaults.visibility_timeout_secs),
            worker_threads: parse(map, "worker_threads")?
                .map(|n| positive("worker_threads", n))
                .transpose()?,
            logging,
        })
    }

    /// Read variables named `<prefix><NAME>` (an empty prefix reads the bare
    /// names, e.g. `BATCH_SIZE`).
    ///
    /// # Errors
    /// See [`PipelineConfig::from_map`].
    pub fn from_env(prefix: &str) -> Result<Self> {
        Self::from_map(&config_from_env(prefix))
    }

    #[must_use]
    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            max_errors: self.max_errors,
            max_group_size: self.max_group_size,
            use_max_error_slice: self.use_max_error_slice,
            report_root: self.report_root.clone(),
        }
    }
}

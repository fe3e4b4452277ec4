//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, TransactionIsolation};

const LOCAL_CONFIG_BASENAME: &str = "ormcache";
const ENV_PREFIX: &str = "ORMCACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence
/// (`ormcache.toml` → explicit file → `ORMCACHE__SECTION__KEY`).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let max_entries = match cache.max_entries {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_entries",
                "must be greater than zero",
            ));
        }
        Some(value) => to_usize(value, "cache.max_entries")?,
        None => defaults.max_entries,
    };

    let shards = match cache.shards {
        Some(0) => return Err(LoadError::invalid("cache.shards", "must be greater than zero")),
        Some(value) => to_usize(value, "cache.shards")?,
        None => defaults.shards,
    };
    if shards > max_entries {
        return Err(LoadError::invalid(
            "cache.shards",
            format!("must not exceed cache.max_entries ({max_entries})"),
        ));
    }

    if cache.entry_ttl_seconds == Some(0) {
        return Err(LoadError::invalid(
            "cache.entry_ttl_seconds",
            "must be greater than zero when set",
        ));
    }

    Ok(CacheConfig {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        max_entries,
        shards,
        entry_ttl_seconds: cache.entry_ttl_seconds,
        isolation: cache.isolation.unwrap_or_default(),
    })
}

fn to_usize(value: u64, key: &'static str) -> Result<usize, LoadError> {
    value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    max_entries: Option<u64>,
    shards: Option<u64>,
    entry_ttl_seconds: Option<u64>,
    isolation: Option<TransactionIsolation>,
}

//! Tracing subscriber installation and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use thiserror::Error;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

static METRIC_DESCRIPTIONS: Once = Once::new();

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), TelemetryError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Subscriber(err.to_string()))
}

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "ormcache_hit_total",
            Unit::Count,
            "Reads served from the cache."
        );
        describe_counter!(
            "ormcache_miss_total",
            Unit::Count,
            "Cacheable reads that had to run the underlying query."
        );
        describe_counter!(
            "ormcache_bypass_total",
            Unit::Count,
            "Reads sent straight to the database, labelled by reason."
        );
        describe_counter!(
            "ormcache_store_total",
            Unit::Count,
            "Read results written to the cache backend."
        );
        describe_counter!(
            "ormcache_register_race_total",
            Unit::Count,
            "Results discarded because a dependent table was invalidated mid-read."
        );
        describe_counter!(
            "ormcache_invalidated_keys_total",
            Unit::Count,
            "Entries evicted by table invalidation."
        );
        describe_counter!(
            "ormcache_capacity_evict_total",
            Unit::Count,
            "Entries dropped by the in-memory backend to make room."
        );
        describe_counter!(
            "ormcache_backend_error_total",
            Unit::Count,
            "Failed cache backend operations, labelled by operation."
        );
        describe_counter!(
            "ormcache_flush_total",
            Unit::Count,
            "Full cache flushes."
        );
        describe_gauge!(
            "ormcache_indexed_keys",
            Unit::Count,
            "Entries currently tracked by the invalidation index."
        );
    });
}

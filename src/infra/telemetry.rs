use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
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
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric_names::HIT_TOTAL,
            Unit::Count,
            "Total number of reads answered without running the real query."
        );
        describe_counter!(
            metric_names::MISS_TOTAL,
            Unit::Count,
            "Total number of reads that ran the real query."
        );
        describe_counter!(
            metric_names::INVALIDATION_TOTAL,
            Unit::Count,
            "Total number of tier invalidations applied."
        );
        describe_counter!(
            metric_names::STORE_ERROR_TOTAL,
            Unit::Count,
            "Total number of backing store failures absorbed as misses."
        );
        describe_counter!(
            metric_names::SINGLEFLIGHT_WAITERS_TOTAL,
            Unit::Count,
            "Total number of reads that joined an in-flight identical read."
        );
    });
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::*;

    #[test]
    fn second_install_fails_without_panicking() {
        let logging = LoggingSettings {
            level: LevelFilter::WARN,
            format: LogFormat::Compact,
        };

        let first = init(&logging);
        let second = init(&logging);

        // another test in this binary may already own the global subscriber
        assert!(first.is_err() || second.is_err());
        assert!(matches!(second, Err(InfraError::Telemetry(_))));
    }
}

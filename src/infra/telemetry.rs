use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::tracker::coordinator::{
    METRIC_ERROR, METRIC_ETAG_ISSUED, METRIC_FETCH_MS, METRIC_NOT_MODIFIED, METRIC_PASS_THROUGH,
};

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

/// Register metric descriptions with the installed recorder. Safe to call
/// more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_NOT_MODIFIED,
            Unit::Count,
            "Requests answered with 304 Not Modified."
        );
        describe_counter!(
            METRIC_ETAG_ISSUED,
            Unit::Count,
            "Requests passed to the handler with a freshly computed ETag."
        );
        describe_counter!(
            METRIC_PASS_THROUGH,
            Unit::Count,
            "Requests that skipped conditional caching, labelled by reason."
        );
        describe_counter!(
            METRIC_ERROR,
            Unit::Count,
            "Conditional-cache failures, labelled by error kind."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Freshness fetch latency in milliseconds."
        );
    });
}

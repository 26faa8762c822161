use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "papyrus_jobs_submitted_total",
            Unit::Count,
            "Total number of jobs accepted into the pipeline."
        );
        describe_counter!(
            "papyrus_idempotent_replay_total",
            Unit::Count,
            "Total number of submissions answered from the idempotency cache."
        );
        describe_counter!(
            "papyrus_admission_denied_total",
            Unit::Count,
            "Total number of requests denied by admission control."
        );
        describe_counter!(
            "papyrus_admission_store_failure_total",
            Unit::Count,
            "Total number of admission decisions that failed closed on a store error."
        );
        describe_histogram!(
            "papyrus_stage_duration_ms",
            Unit::Milliseconds,
            "Stage handler latency in milliseconds, labelled by stage."
        );
        describe_counter!(
            "papyrus_stage_failed_total",
            Unit::Count,
            "Total number of jobs written to the failed stage, labelled by stage."
        );
        describe_histogram!(
            "papyrus_queue_wait_ms",
            Unit::Milliseconds,
            "Time a message spent queued before a worker reserved it."
        );
        describe_histogram!(
            "papyrus_pool_acquire_wait_ms",
            Unit::Milliseconds,
            "Time spent waiting for a render context."
        );
        describe_gauge!(
            "papyrus_pool_live_resources",
            Unit::Count,
            "Current number of render contexts owned by the pool."
        );
    });
}

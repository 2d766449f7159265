//! Tracing subscriber setup and the OpenTelemetry instruments the round engine records into.
//!
//! Instruments are created from the global meter, so they are no-ops until the host process
//! installs a meter provider.

use anyhow::{anyhow, Result};
use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tracing::info;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedround"));

pub struct FedMetrics {
    pub rounds_completed: Counter<u64>,
    pub rounds_failed: Counter<u64>,
    pub participants_aggregated: Counter<u64>,
    pub participants_excluded: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
    pub round_accuracy: Histogram<f64>,
}

pub static FED_METRICS: Lazy<FedMetrics> = Lazy::new(|| FedMetrics {
    rounds_completed: FED_METER.u64_counter("fedround_rounds_total").with_description("Federated rounds completed").build(),
    rounds_failed: FED_METER.u64_counter("fedround_rounds_failed_total").with_description("Rounds aborted by a round-level error").build(),
    participants_aggregated: FED_METER.u64_counter("fedround_participants_total").with_description("Participant reports folded into an aggregate").build(),
    participants_excluded: FED_METER.u64_counter("fedround_excluded_participants_total").with_description("Participants excluded from a round (timeout, failure, schema)").build(),
    aggregation_latency_ms: FED_METER.f64_histogram("fedround_aggregation_latency_ms").with_description("Aggregation latency ms").with_unit("ms").build(),
    round_accuracy: FED_METER.f64_histogram("fedround_round_accuracy").with_description("Global accuracy (or perplexity) per round").build(),
});

/// Installs the global subscriber once. `FEDROUND_JSON_LOG=1|true` switches to JSON lines;
/// filtering follows `RUST_LOG` and defaults to `info`.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDROUND_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let res = if json {
            tracing_subscriber::fmt()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_env_filter(filter)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_env_filter(filter)
                .try_init()
        };
        res.map_err(|e| anyhow!("tracing init failed: {e}"))
    })?;
    info!(target: "fedround", service, "tracing_initialized");
    Ok(())
}

//! Sample-weighted aggregation of participant payloads into the next global model.
//!
//! The engine screens every report against the baseline schema, drops the ones that disagree,
//! renormalizes sample weights over the rest and hands the batch to exactly one strategy:
//!
//! - [`DeltaStrategy`]: `baseline + sum(delta_i * n_i / N)` accumulated in arrival order.
//! - [`DirectWeightsStrategy`]: a pluggable [`WeightsAggregator`] that works on full weights.
//!
//! Accumulation yields to the runtime once per participant so a large batch does not starve
//! the coordinator's other tasks.

use std::sync::Arc;
use std::time::Instant;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};
use crate::config::AggregationMode;
use crate::error::{AggregationError, WeightError};
use crate::report::{ParticipantId, ParticipantReport};
use crate::telemetry::FED_METRICS;
use crate::weights::{WeightDelta, WeightStore};

/// Aggregation rule over full model weights. `reports[i]` produced `weights_received[i]`.
#[async_trait]
pub trait WeightsAggregator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn aggregate_weights(&self, reports: &[&ParticipantReport], baseline: &WeightStore, weights_received: &[WeightStore]) -> Result<WeightStore, AggregationError>;
}

/// FedAvg over full weights: `sum(w_i * n_i / N)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleWeightedAverage;

#[async_trait]
impl WeightsAggregator for SampleWeightedAverage {
    fn name(&self) -> &'static str { "sample_weighted_average" }

    async fn aggregate_weights(&self, reports: &[&ParticipantReport], baseline: &WeightStore, weights_received: &[WeightStore]) -> Result<WeightStore, AggregationError> {
        if reports.len() != weights_received.len() {
            return Err(AggregationError::Strategy { strategy: self.name(), reason: format!("{} reports but {} weight sets", reports.len(), weights_received.len()) });
        }
        let total: u64 = reports.iter().map(|r| r.num_samples).sum();
        if total == 0 { return Err(AggregationError::ZeroTotalSamples); }
        let mut acc = baseline.zeros_like();
        for (report, weights) in reports.iter().zip(weights_received) {
            acc.add_scaled_in_place(weights, sample_weight(report.num_samples, total) as f32)?;
            tokio::task::yield_now().await;
        }
        Ok(acc)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeltaStrategy;

#[derive(Clone)]
pub struct DirectWeightsStrategy { inner: Arc<dyn WeightsAggregator> }

impl DirectWeightsStrategy {
    pub fn new(aggregator: impl WeightsAggregator + 'static) -> Self { Self { inner: Arc::new(aggregator) } }
    pub fn name(&self) -> &'static str { self.inner.name() }
}

impl Default for DirectWeightsStrategy { fn default() -> Self { Self::new(SampleWeightedAverage) } }

impl std::fmt::Debug for DirectWeightsStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectWeightsStrategy").field("aggregator", &self.inner.name()).finish()
    }
}

#[derive(Clone, Debug)]
pub enum AggregationStrategy {
    Delta(DeltaStrategy),
    DirectWeights(DirectWeightsStrategy),
}

impl AggregationStrategy {
    pub fn from_mode(mode: AggregationMode) -> Self {
        match mode {
            AggregationMode::Delta => AggregationStrategy::Delta(DeltaStrategy),
            AggregationMode::Weights => AggregationStrategy::DirectWeights(DirectWeightsStrategy::default()),
        }
    }

    pub fn mode(&self) -> AggregationMode {
        match self { AggregationStrategy::Delta(_) => AggregationMode::Delta, AggregationStrategy::DirectWeights(_) => AggregationMode::Weights }
    }
}

impl Default for AggregationStrategy { fn default() -> Self { Self::Delta(DeltaStrategy) } }

#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    pub participant_id: ParticipantId,
    pub num_samples: u64,
    /// `num_samples / total_samples` over accepted reports.
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Exclusion {
    pub participant_id: ParticipantId,
    pub reason: WeightError,
}

#[derive(Clone, Debug)]
pub struct AggregationOutcome {
    pub updated: WeightStore,
    pub contributions: Vec<Contribution>,
    pub excluded: Vec<Exclusion>,
    pub total_samples: u64,
}

impl AggregationOutcome {
    pub fn accepted(&self, id: ParticipantId) -> bool { self.contributions.iter().any(|c| c.participant_id == id) }
}

fn sample_weight(num_samples: u64, total: u64) -> f64 { num_samples as f64 / total as f64 }

#[derive(Clone, Debug, Default)]
pub struct AggregationEngine { strategy: AggregationStrategy }

impl AggregationEngine {
    pub fn new(strategy: AggregationStrategy) -> Self { Self { strategy } }
    pub fn strategy(&self) -> &AggregationStrategy { &self.strategy }

    /// Aggregates `reports` (in arrival order) on top of `baseline`. `baseline` is never modified.
    pub async fn aggregate(&self, baseline: &WeightStore, reports: &[ParticipantReport]) -> Result<AggregationOutcome, AggregationError> {
        if reports.is_empty() { return Err(AggregationError::EmptyBatch); }
        let started = Instant::now();

        let mut accepted: Vec<&ParticipantReport> = Vec::with_capacity(reports.len());
        let mut excluded = Vec::new();
        for report in reports {
            match baseline.check_schema(report.payload.store()) {
                Ok(()) => accepted.push(report),
                Err(reason) => {
                    warn!(participant = %report.participant_id, error = %reason, "participant_payload_rejected");
                    FED_METRICS.participants_excluded.add(1, &[KeyValue::new("reason", "schema")]);
                    excluded.push(Exclusion { participant_id: report.participant_id, reason });
                }
            }
        }

        let total_samples: u64 = accepted.iter().map(|r| r.num_samples).sum();
        if total_samples == 0 { return Err(AggregationError::ZeroTotalSamples); }
        let contributions: Vec<Contribution> = accepted.iter()
            .map(|r| Contribution { participant_id: r.participant_id, num_samples: r.num_samples, weight: sample_weight(r.num_samples, total_samples) })
            .collect();

        let updated = match &self.strategy {
            AggregationStrategy::Delta(_) => {
                info!(participants = accepted.len(), "aggregating_weight_deltas");
                let avg_delta = Self::average_deltas(baseline, &accepted, total_samples).await?;
                baseline.apply_delta(&avg_delta)?
            }
            AggregationStrategy::DirectWeights(strategy) => {
                info!(participants = accepted.len(), strategy = strategy.name(), "aggregating_weights_directly");
                let weights_received = accepted.iter().map(|r| r.weights_against(baseline)).collect::<Result<Vec<_>, _>>()?;
                let updated = strategy.inner.aggregate_weights(&accepted, baseline, &weights_received).await?;
                baseline.check_schema(&updated)?;
                updated
            }
        };

        let latency = started.elapsed().as_secs_f64() * 1000.0;
        FED_METRICS.aggregation_latency_ms.record(latency, &[]);
        FED_METRICS.participants_aggregated.add(accepted.len() as u64, &[]);
        debug!(total_samples, latency_ms = latency, excluded = excluded.len(), "aggregation_complete");
        Ok(AggregationOutcome { updated, contributions, excluded, total_samples })
    }

    async fn average_deltas(baseline: &WeightStore, accepted: &[&ParticipantReport], total: u64) -> Result<WeightDelta, AggregationError> {
        let mut avg = baseline.zeros_like();
        for report in accepted {
            let delta = report.delta_against(baseline)?;
            avg.add_scaled_in_place(delta.as_store(), sample_weight(report.num_samples, total) as f32)?;
            tokio::task::yield_now().await;
        }
        Ok(WeightDelta::from(avg))
    }
}

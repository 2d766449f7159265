//! Round coordinator: the state machine that drives one federated round at a time.
//!
//! ```text
//! Selecting -> AwaitingReports -> Aggregating -> Evaluating -> Deciding -> Continuing | Terminated
//! ```
//!
//! The global model lives behind a [`SnapshotHandle`]. A new snapshot is published only once a
//! round has been aggregated, evaluated and recorded, so readers never see a half-built model and
//! a failed round leaves no trace in the model or the traffic counter. Stopping is
//! decided only at the `Deciding` boundary and returned as a [`RoundOutcome`]; errors are reserved
//! for rounds that could not complete.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;
use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, instrument, warn};
use crate::aggregation::{AggregationEngine, AggregationStrategy};
use crate::config::{FederationConfig, Quality, Target};
use crate::convergence::{ConvergenceEstimate, ConvergenceEstimator};
use crate::error::{AggregationError, ReportError, RoundError, WeightError};
use crate::observer::RoundObserver;
use crate::report::{ParticipantId, ParticipantReport};
use crate::reporting::{ClientAccuracy, RoundRecord, RoundRecorder};
use crate::round_metrics::{weighted_mean_std, AccuracySummary, RoundTimings};
use crate::telemetry::FED_METRICS;
use crate::transport::{Collection, ModelTester, ParticipantFailure, ReportCollector};
use crate::weights::WeightStore;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoundPhase { Selecting, AwaitingReports, Aggregating, Evaluating, Deciding, Continuing, Terminated, Failed }

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TerminationReason {
    TargetAccuracy { accuracy: f64, target: f64 },
    TargetPerplexity { perplexity: f64, target: f64 },
    ConvergenceEstimate { stopping_round: f64 },
    RoundLimit { rounds: u64 },
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::TargetAccuracy { accuracy, target } => write!(f, "target accuracy reached ({:.2}% >= {:.2}%)", 100.0 * accuracy, 100.0 * target),
            TerminationReason::TargetPerplexity { perplexity, target } => write!(f, "target perplexity reached ({perplexity:.2} <= {target:.2})"),
            TerminationReason::ConvergenceEstimate { stopping_round } => write!(f, "convergence estimate reached (t = {stopping_round:.2})"),
            TerminationReason::RoundLimit { rounds } => write!(f, "round limit reached ({rounds})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RoundOutcome { Continue, Terminate(TerminationReason) }

#[derive(Clone, Debug, PartialEq)]
pub enum ExclusionReason {
    Failure(ParticipantFailure),
    Invalid(ReportError),
    Schema(WeightError),
}

#[derive(Clone, Debug)]
pub struct RoundState {
    pub round_number: u64,
    pub phase: RoundPhase,
    pub selected_participants: Vec<ParticipantId>,
    /// Arrival order.
    pub received_reports: Vec<ParticipantReport>,
    pub excluded: Vec<(ParticipantId, ExclusionReason)>,
    pub aggregated_weights: Option<Arc<WeightStore>>,
    /// Client-reported path only.
    pub accuracy_summary: Option<AccuracySummary>,
    pub accuracy: Option<f64>,
    pub timings: RoundTimings,
    pub convergence: Option<ConvergenceEstimate>,
    pub stop_recommended: bool,
}

impl RoundState {
    fn new(round_number: u64) -> Self {
        Self {
            round_number,
            phase: RoundPhase::Selecting,
            selected_participants: Vec::new(),
            received_reports: Vec::new(),
            excluded: Vec::new(),
            aggregated_weights: None,
            accuracy_summary: None,
            accuracy: None,
            timings: RoundTimings::default(),
            convergence: None,
            stop_recommended: false,
        }
    }
}

/// Shared read access to the latest global model. Cloning the handle is cheap; `current()`
/// returns an immutable snapshot that stays valid while newer ones are published.
#[derive(Clone, Debug)]
pub struct SnapshotHandle(Arc<RwLock<Arc<WeightStore>>>);

impl SnapshotHandle {
    fn new(initial: WeightStore) -> Self { Self(Arc::new(RwLock::new(Arc::new(initial)))) }
    pub fn current(&self) -> Arc<WeightStore> { self.0.read().clone() }
    fn publish(&self, next: Arc<WeightStore>) { *self.0.write() = next; }
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub rounds_completed: u64,
    pub reason: TerminationReason,
    pub final_accuracy: Option<f64>,
    pub weights: Arc<WeightStore>,
}

pub struct RoundCoordinator {
    config: Arc<FederationConfig>,
    engine: AggregationEngine,
    estimator: ConvergenceEstimator,
    collector: Arc<dyn ReportCollector>,
    tester: Option<Arc<dyn ModelTester>>,
    recorder: Option<Arc<dyn RoundRecorder>>,
    observers: Vec<Arc<dyn RoundObserver>>,
    rng: StdRng,
    global: SnapshotHandle,
    round_number: u64,
    terminated: Option<TerminationReason>,
    last_round: Option<RoundState>,
    comm_overhead_mb: f64,
    started_at: Instant,
}

impl RoundCoordinator {
    pub fn new(config: FederationConfig, initial_weights: WeightStore, collector: Arc<dyn ReportCollector>) -> anyhow::Result<Self> {
        config.validate()?;
        let engine = AggregationEngine::new(AggregationStrategy::from_mode(config.server.aggregation_mode));
        let estimator = ConvergenceEstimator::new(config.convergence);
        info!(total_clients = config.clients.total_clients, per_round = config.clients.per_round, mode = ?config.server.aggregation_mode, "round_coordinator_initialized");
        Ok(Self {
            config: Arc::new(config),
            engine,
            estimator,
            collector,
            tester: None,
            recorder: None,
            observers: Vec::new(),
            rng: StdRng::from_entropy(),
            global: SnapshotHandle::new(initial_weights),
            round_number: 1,
            terminated: None,
            last_round: None,
            comm_overhead_mb: 0.0,
            started_at: Instant::now(),
        })
    }

    pub fn with_tester(mut self, tester: Arc<dyn ModelTester>) -> Self { self.tester = Some(tester); self }
    pub fn with_recorder(mut self, recorder: Arc<dyn RoundRecorder>) -> Self { self.recorder = Some(recorder); self }
    pub fn with_observer(mut self, observer: Arc<dyn RoundObserver>) -> Self { self.observers.push(observer); self }
    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self { self.engine = AggregationEngine::new(strategy); self }
    pub fn with_seed(mut self, seed: u64) -> Self { self.rng = StdRng::seed_from_u64(seed); self }

    pub fn config(&self) -> &FederationConfig { &self.config }
    pub fn round_number(&self) -> u64 { self.round_number }
    pub fn snapshot(&self) -> SnapshotHandle { self.global.clone() }
    pub fn last_round(&self) -> Option<&RoundState> { self.last_round.as_ref() }
    pub fn termination(&self) -> Option<&TerminationReason> { self.terminated.as_ref() }

    /// Runs rounds until one terminates the run. Round-level errors halt the run and are returned.
    pub async fn run(&mut self) -> Result<RunSummary, RoundError> {
        match self.config.trainer.target() {
            Some(Target::Accuracy(t)) => info!("Training: {} rounds or accuracy above {:.1}%", self.config.trainer.rounds, 100.0 * t),
            Some(Target::Perplexity(t)) => info!("Training: {} rounds or perplexity below {:.1}", self.config.trainer.rounds, t),
            None => info!("Training: {} rounds", self.config.trainer.rounds),
        }
        loop {
            if let RoundOutcome::Terminate(reason) = self.run_round().await? {
                info!(reason = %reason, rounds = self.round_number, "training_terminated");
                return Ok(RunSummary {
                    rounds_completed: self.round_number,
                    reason,
                    final_accuracy: self.last_round.as_ref().and_then(|s| s.accuracy),
                    weights: self.global.current(),
                });
            }
        }
    }

    /// Drives one full round. A failed round leaves the global model and round number untouched.
    #[instrument(skip(self), fields(round = self.round_number))]
    pub async fn run_round(&mut self) -> Result<RoundOutcome, RoundError> {
        if self.terminated.is_some() {
            return Err(RoundError::Terminated { last_round: self.round_number });
        }
        let mut state = RoundState::new(self.round_number);
        match self.drive(&mut state).await {
            Ok(outcome) => { self.last_round = Some(state); Ok(outcome) }
            Err(e) => {
                warn!(round = state.round_number, phase = ?state.phase, error = %e, "round_failed");
                FED_METRICS.rounds_failed.add(1, &[]);
                state.phase = RoundPhase::Failed;
                self.last_round = Some(state);
                Err(e)
            }
        }
    }

    async fn drive(&mut self, state: &mut RoundState) -> Result<RoundOutcome, RoundError> {
        let round = state.round_number;
        let baseline = self.global.current();

        state.selected_participants = self.select_participants();
        info!(round, selected = ?state.selected_participants, "participants_selected");

        state.phase = RoundPhase::AwaitingReports;
        let collection = self.collector.collect(round, &state.selected_participants, &baseline).await
            .map_err(|source| RoundError::Collection { round, source })?;
        let quality = (!self.config.server.do_test).then(|| self.config.trainer.quality());
        let inbound = Self::accept_collection(state, collection, quality);
        if state.received_reports.is_empty() { return Err(RoundError::NoRespondents { round }); }
        for observer in &self.observers {
            observer.weights_received(round, &mut state.received_reports).map_err(|source| RoundError::Observer { round, source })?;
        }

        state.phase = RoundPhase::Aggregating;
        let outcome = self.engine.aggregate(&baseline, &state.received_reports).await
            .map_err(|source| RoundError::Aggregation { round, source })?;
        state.excluded.extend(outcome.excluded.iter().map(|e| (e.participant_id, ExclusionReason::Schema(e.reason.clone()))));
        let accepted: Vec<&ParticipantReport> = state.received_reports.iter().filter(|r| outcome.accepted(r.participant_id)).collect();
        state.timings = RoundTimings::from_reports(accepted.iter().copied());
        if !self.config.server.do_test {
            let summary = weighted_mean_std(accepted.iter().copied())
                .ok_or(RoundError::Aggregation { round, source: AggregationError::ZeroTotalSamples })?;
            state.accuracy_summary = Some(summary);
        }
        let outbound = baseline.byte_size() * state.selected_participants.len();
        let updated = Arc::new(outcome.updated);
        state.aggregated_weights = Some(updated.clone());
        for observer in &self.observers { observer.weights_aggregated(round, &accepted, &updated); }
        let client_rows: Vec<ClientAccuracy> = if self.config.records_clients_accuracy() {
            accepted.iter().map(|r| ClientAccuracy { round, client_id: r.participant_id, accuracy: r.accuracy }).collect()
        } else {
            Vec::new()
        };

        state.phase = RoundPhase::Evaluating;
        let estimate = self.estimator.estimate(&updated, round);
        state.stop_recommended = estimate.stop_recommended;
        state.convergence = Some(estimate);
        let (accuracy, accuracy_std) = match (&self.tester, state.accuracy_summary) {
            (_, Some(summary)) => (summary.mean, summary.std),
            (Some(tester), None) => {
                info!(round, "server_model_testing_started");
                let acc = tester.test(&updated).await.map_err(|source| RoundError::Testing { round, source })?;
                (acc, 0.0)
            }
            (None, None) => return Err(RoundError::Testing { round, source: anyhow::anyhow!("server.do_test is set but no model tester is configured") }),
        };
        state.accuracy = Some(accuracy);

        let comm_overhead = self.comm_overhead_mb + (inbound + outbound) as f64 / BYTES_PER_MB;
        let record = RoundRecord {
            round,
            accuracy,
            accuracy_std,
            elapsed_time: self.started_at.elapsed().as_secs_f64(),
            processing_time: state.timings.processing_time,
            comm_time: state.timings.comm_time,
            round_time: state.timings.round_time,
            comm_overhead,
            recorded_at: Utc::now(),
        };
        if let Some(recorder) = &self.recorder {
            if !client_rows.is_empty() {
                recorder.record_clients(&client_rows).map_err(|source| RoundError::Recording { round, source })?;
            }
            recorder.record(&record).map_err(|source| RoundError::Recording { round, source })?;
        }

        // nothing below can fail
        self.global.publish(updated);
        self.comm_overhead_mb = comm_overhead;
        self.emit_summary(state, &record);
        for observer in &self.observers { observer.clients_processed(state); }

        state.phase = RoundPhase::Deciding;
        let outcome = self.decide(state, accuracy);
        match &outcome {
            RoundOutcome::Continue => {
                state.phase = RoundPhase::Continuing;
                self.round_number += 1;
            }
            RoundOutcome::Terminate(reason) => {
                state.phase = RoundPhase::Terminated;
                self.terminated = Some(reason.clone());
            }
        }
        Ok(outcome)
    }

    /// Uniform sample of `per_round` distinct ids out of `1..=total_clients`, ascending.
    fn select_participants(&mut self) -> Vec<ParticipantId> {
        let c = &self.config.clients;
        let mut ids: Vec<ParticipantId> = rand::seq::index::sample(&mut self.rng, c.total_clients, c.per_round)
            .into_iter()
            .map(|i| ParticipantId(i as u32 + 1))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Keeps the first report from each selected participant. Failures and reports with
    /// out-of-range scalars become exclusions. Returns the payload bytes that arrived from
    /// selected participants, rejected reports included.
    fn accept_collection(state: &mut RoundState, collection: Collection, quality: Option<Quality>) -> usize {
        let mut inbound = 0;
        for report in collection.reports {
            let id = report.participant_id;
            if !state.selected_participants.contains(&id) {
                warn!(round = state.round_number, participant = %id, "report_from_unselected_participant_dropped");
            } else if state.received_reports.iter().any(|r| r.participant_id == id) || state.excluded.iter().any(|(x, _)| *x == id) {
                warn!(round = state.round_number, participant = %id, "duplicate_report_dropped");
            } else if let Err(reason) = report.validate(quality) {
                inbound += report.payload_bytes();
                warn!(round = state.round_number, participant = %id, error = %reason, "participant_report_rejected");
                FED_METRICS.participants_excluded.add(1, &[KeyValue::new("reason", "invalid")]);
                state.excluded.push((id, ExclusionReason::Invalid(reason)));
            } else {
                inbound += report.payload_bytes();
                state.received_reports.push(report);
            }
        }
        for (id, failure) in collection.failures {
            warn!(round = state.round_number, participant = %id, failure = %failure, "participant_excluded");
            FED_METRICS.participants_excluded.add(1, &[KeyValue::new("reason", "failure")]);
            state.excluded.push((id, ExclusionReason::Failure(failure)));
        }
        inbound
    }

    fn decide(&self, state: &RoundState, accuracy: f64) -> RoundOutcome {
        match self.config.trainer.target() {
            Some(Target::Accuracy(target)) if accuracy >= target => {
                return RoundOutcome::Terminate(TerminationReason::TargetAccuracy { accuracy, target });
            }
            Some(Target::Perplexity(target)) if accuracy <= target => {
                return RoundOutcome::Terminate(TerminationReason::TargetPerplexity { perplexity: accuracy, target });
            }
            _ => {}
        }
        if let Some(estimate) = state.convergence.filter(|_| state.stop_recommended) {
            return RoundOutcome::Terminate(TerminationReason::ConvergenceEstimate { stopping_round: estimate.stopping_round });
        }
        if state.round_number >= self.config.trainer.rounds {
            return RoundOutcome::Terminate(TerminationReason::RoundLimit { rounds: self.config.trainer.rounds });
        }
        RoundOutcome::Continue
    }

    fn emit_summary(&self, state: &RoundState, record: &RoundRecord) {
        FED_METRICS.rounds_completed.add(1, &[]);
        FED_METRICS.round_accuracy.record(record.accuracy, &[]);
        let quality = match self.config.trainer.target() {
            Some(Target::Perplexity(_)) => format!("perplexity {:.2}", record.accuracy),
            _ => format!("accuracy {:.2}% (std {:.2}%)", 100.0 * record.accuracy, 100.0 * record.accuracy_std),
        };
        let estimate = match state.convergence {
            Some(e) if e.is_valid() => format!("{:.2}", e.stopping_round),
            _ => "n/a".to_string(),
        };
        info!(
            round = record.round,
            respondents = state.received_reports.len(),
            excluded = state.excluded.len(),
            accuracy = record.accuracy,
            accuracy_std = record.accuracy_std,
            round_time = record.round_time,
            comm_overhead_mb = record.comm_overhead,
            "[round {}] global model {}, round time {:.2}s (processing {:.2}s, comm {:.2}s), estimated stopping round {}",
            record.round, quality, record.round_time, record.processing_time, record.comm_time, estimate
        );
    }
}

//! Core round engine for fedround: weight arithmetic, sample-weighted aggregation, the
//! convergence estimate and the round coordinator state machine.

pub mod aggregation;
pub mod config;
pub mod convergence;
pub mod coordinator;
pub mod error;
pub mod observer;
pub mod report;
pub mod reporting;
pub mod round_metrics;
pub mod telemetry;
pub mod transport;
pub mod weights;

pub use aggregation::{AggregationEngine, AggregationOutcome, AggregationStrategy, DeltaStrategy, DirectWeightsStrategy, SampleWeightedAverage, WeightsAggregator};
pub use config::{AggregationMode, FederationConfig, Quality, Target};
pub use convergence::{ConvergenceConstants, ConvergenceEstimate, ConvergenceEstimator, NO_ESTIMATE};
pub use coordinator::{ExclusionReason, RoundCoordinator, RoundOutcome, RoundPhase, RoundState, RunSummary, SnapshotHandle, TerminationReason};
pub use error::{AggregationError, ReportError, RoundError, WeightError};
pub use observer::RoundObserver;
pub use report::{ParticipantId, ParticipantReport, Payload};
pub use reporting::{ClientAccuracy, JsonLinesRecorder, MemoryRecorder, RoundRecord, RoundRecorder};
pub use round_metrics::{weighted_mean_std, AccuracySummary, RoundTimings};
pub use telemetry::{init_tracing, FED_METRICS};
pub use transport::{ChannelCollector, Collection, ModelTester, ParticipantFailure, ReportCollector, RoundSubmission};
pub use weights::{Tensor, WeightDelta, WeightStore};

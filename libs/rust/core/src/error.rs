//! Error taxonomy for the round engine.
//!
//! Per-participant problems (`WeightError`, `ReportError`, `ParticipantFailure`) exclude a single
//! contribution.
//! `AggregationError` and `RoundError` are round-level and surface to the operator.
//! `ConvergenceDomainError` never leaves the estimator.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("parameter `{name}` shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch { name: String, expected: Vec<usize>, found: Vec<usize> },
    #[error("parameter `{0}` missing")]
    MissingParameter(String),
    #[error("unexpected parameter `{0}`")]
    UnexpectedParameter(String),
}

/// A report whose scalars fall outside the data model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReportError {
    #[error("accuracy {0} outside [0, 1]")]
    AccuracyOutOfRange(f64),
    #[error("perplexity {0} is not a positive finite value")]
    InvalidPerplexity(f64),
    #[error("{field} = {value} is not a non-negative finite duration")]
    InvalidTiming { field: &'static str, value: f64 },
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("no reports to aggregate")]
    EmptyBatch,
    #[error("total sample count across accepted reports is zero")]
    ZeroTotalSamples,
    #[error(transparent)]
    Shape(#[from] WeightError),
    #[error("weights strategy `{strategy}` failed: {reason}")]
    Strategy { strategy: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvergenceDomainError {
    #[error("model has no parameters to measure drift from")]
    EmptyModel,
    #[error("logarithm argument out of domain (numerator={numerator}, denominator={denominator})")]
    Argument { numerator: f64, denominator: f64 },
    #[error("invalid logarithm base lambda={0}")]
    Base(f64),
    #[error("stopping round is not finite")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("round {round}: no participant reports arrived")]
    NoRespondents { round: u64 },
    #[error("round {round}: aggregation failed: {source}")]
    Aggregation { round: u64, #[source] source: AggregationError },
    #[error("round {round}: report collection failed: {source}")]
    Collection { round: u64, #[source] source: anyhow::Error },
    #[error("round {round}: server-side model test failed: {source}")]
    Testing { round: u64, #[source] source: anyhow::Error },
    #[error("round {round}: round observer rejected the received payloads: {source}")]
    Observer { round: u64, #[source] source: anyhow::Error },
    #[error("round {round}: recording round result failed: {source}")]
    Recording { round: u64, #[source] source: anyhow::Error },
    #[error("run terminated after round {last_round}; refusing to start another round")]
    Terminated { last_round: u64 },
}

impl RoundError {
    pub fn round(&self) -> u64 {
        match self {
            RoundError::NoRespondents { round }
            | RoundError::Aggregation { round, .. }
            | RoundError::Collection { round, .. }
            | RoundError::Testing { round, .. }
            | RoundError::Observer { round, .. }
            | RoundError::Recording { round, .. } => *round,
            RoundError::Terminated { last_round } => *last_round,
        }
    }
}

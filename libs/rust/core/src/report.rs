use std::fmt::{Display, Formatter};
use serde::{Serialize, Deserialize};
use crate::config::Quality;
use crate::error::{ReportError, WeightError};
use crate::weights::{WeightDelta, WeightStore};

/// Participants are numbered `1..=total_clients`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "client-{}", self.0) }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Weights(WeightStore),
    Delta(WeightDelta),
}

impl Payload {
    pub fn store(&self) -> &WeightStore {
        match self { Payload::Weights(w) => w, Payload::Delta(d) => d.as_store() }
    }
}

/// One participant's result for one round. `accuracy` carries perplexity when the run targets perplexity.
/// Times are seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantReport {
    pub participant_id: ParticipantId,
    pub num_samples: u64,
    pub accuracy: f64,
    pub processing_time: f64,
    pub comm_time: f64,
    pub training_time: f64,
    pub payload: Payload,
}

impl ParticipantReport {
    pub fn new(participant_id: ParticipantId, num_samples: u64, payload: Payload) -> Self {
        Self { participant_id, num_samples, accuracy: 0.0, processing_time: 0.0, comm_time: 0.0, training_time: 0.0, payload }
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self { self.accuracy = accuracy; self }

    pub fn with_timings(mut self, training_time: f64, processing_time: f64, comm_time: f64) -> Self {
        self.training_time = training_time;
        self.processing_time = processing_time;
        self.comm_time = comm_time;
        self
    }

    pub fn payload_bytes(&self) -> usize { self.payload.store().byte_size() }

    /// Range checks on the reported scalars. `quality` says how the `accuracy` field is read;
    /// `None` skips the accuracy check (server-side testing ignores it).
    pub fn validate(&self, quality: Option<Quality>) -> Result<(), ReportError> {
        for (field, value) in [("training_time", self.training_time), ("processing_time", self.processing_time), ("comm_time", self.comm_time)] {
            if !(value.is_finite() && value >= 0.0) { return Err(ReportError::InvalidTiming { field, value }); }
        }
        match quality {
            Some(Quality::Perplexity) if !(self.accuracy.is_finite() && self.accuracy > 0.0) => Err(ReportError::InvalidPerplexity(self.accuracy)),
            Some(Quality::Accuracy) if !(0.0..=1.0).contains(&self.accuracy) => Err(ReportError::AccuracyOutOfRange(self.accuracy)),
            _ => Ok(()),
        }
    }

    /// Delta relative to `baseline`, computed if the participant sent full weights.
    pub fn delta_against(&self, baseline: &WeightStore) -> Result<WeightDelta, WeightError> {
        match &self.payload {
            Payload::Weights(w) => w.subtract(baseline),
            Payload::Delta(d) => { baseline.check_schema(d.as_store())?; Ok(d.clone()) }
        }
    }

    /// Full weights, materialized from `baseline` if the participant sent a delta.
    pub fn weights_against(&self, baseline: &WeightStore) -> Result<WeightStore, WeightError> {
        match &self.payload {
            Payload::Weights(w) => { baseline.check_schema(w)?; Ok(w.clone()) }
            Payload::Delta(d) => baseline.apply_delta(d),
        }
    }
}

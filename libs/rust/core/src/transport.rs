//! Boundary with the participant transport and the optional server-side tester.
//!
//! The coordinator only sees "the reports that arrived before the round's collection
//! deadline". Retries, process spawning and wire formats stay behind [`ReportCollector`].

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use crate::report::{ParticipantId, ParticipantReport};
use crate::weights::WeightStore;

#[derive(Clone, Debug, PartialEq)]
pub enum ParticipantFailure {
    Timeout,
    Dropped(String),
}

impl Display for ParticipantFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self { ParticipantFailure::Timeout => write!(f, "timed out"), ParticipantFailure::Dropped(why) => write!(f, "dropped: {why}") }
    }
}

/// What arrived for one round, in arrival order.
#[derive(Clone, Debug, Default)]
pub struct Collection {
    pub reports: Vec<ParticipantReport>,
    pub failures: Vec<(ParticipantId, ParticipantFailure)>,
}

#[async_trait]
pub trait ReportCollector: Send + Sync {
    /// `global` is the snapshot the selected participants train from.
    async fn collect(&self, round: u64, selected: &[ParticipantId], global: &WeightStore) -> Result<Collection>;
}

#[async_trait]
pub trait ModelTester: Send + Sync {
    /// Accuracy in `[0, 1]`, or perplexity when the run targets perplexity.
    async fn test(&self, weights: &WeightStore) -> Result<f64>;
}

#[derive(Clone, Debug)]
pub struct RoundSubmission {
    pub round: u64,
    pub report: ParticipantReport,
}

/// Collects submissions pushed through an mpsc channel until every selected participant has
/// reported or the deadline passes. Stale-round, unselected and duplicate submissions are dropped.
pub struct ChannelCollector {
    rx: Mutex<mpsc::Receiver<RoundSubmission>>,
    deadline: Duration,
}

impl ChannelCollector {
    pub fn new(capacity: usize, deadline: Duration) -> (Self, mpsc::Sender<RoundSubmission>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { rx: Mutex::new(rx), deadline }, tx)
    }

    pub fn deadline(&self) -> Duration { self.deadline }
}

#[async_trait]
impl ReportCollector for ChannelCollector {
    async fn collect(&self, round: u64, selected: &[ParticipantId], _global: &WeightStore) -> Result<Collection> {
        let mut rx = self.rx.lock().await;
        let mut pending: BTreeSet<ParticipantId> = selected.iter().copied().collect();
        let mut reports = Vec::with_capacity(pending.len());
        let deadline = tokio::time::Instant::now() + self.deadline;
        let mut closed = false;
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(sub)) => {
                    let id = sub.report.participant_id;
                    if sub.round != round {
                        debug!(participant = %id, submitted_for = sub.round, round, "stale_submission_dropped");
                    } else if !pending.remove(&id) {
                        warn!(participant = %id, round, "unexpected_submission_dropped");
                    } else {
                        reports.push(sub.report);
                    }
                }
                Ok(None) => { closed = true; break; }
                Err(_) => break,
            }
        }
        let failure = if closed { ParticipantFailure::Dropped("submission channel closed".into()) } else { ParticipantFailure::Timeout };
        let failures = pending.into_iter().map(|id| (id, failure.clone())).collect();
        Ok(Collection { reports, failures })
    }
}

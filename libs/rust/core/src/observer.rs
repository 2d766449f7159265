//! Extension points along the round pipeline.
//!
//! Observers run in registration order. Only [`RoundObserver::weights_received`] can fail a
//! round; the other two are notifications.

use anyhow::Result;
use crate::coordinator::RoundState;
use crate::report::ParticipantReport;
use crate::weights::WeightStore;

pub trait RoundObserver: Send + Sync {
    /// Sees the accepted reports before aggregation and may rewrite their payloads.
    fn weights_received(&self, _round: u64, _reports: &mut [ParticipantReport]) -> Result<()> { Ok(()) }

    /// The aggregate exists but is not evaluated or published yet; the round may still fail.
    fn weights_aggregated(&self, _round: u64, _reports: &[&ParticipantReport], _updated: &WeightStore) {}

    /// The round's record is written and its snapshot is live.
    fn clients_processed(&self, _state: &RoundState) {}
}

//! Round-level summaries of participant scalars. Every reduction here is order independent.

use serde::{Serialize, Deserialize};
use crate::report::ParticipantReport;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccuracySummary { pub mean: f64, pub std: f64 }

/// Sample-weighted mean and standard deviation of reported accuracy.
/// `None` for an empty batch or one whose sample total is zero.
pub fn weighted_mean_std<'a, I>(reports: I) -> Option<AccuracySummary>
where I: IntoIterator<Item = &'a ParticipantReport>, I::IntoIter: Clone {
    let reports = reports.into_iter();
    let total: u64 = reports.clone().map(|r| r.num_samples).sum();
    if total == 0 { return None; }
    let total = total as f64;
    let mean: f64 = reports.clone().map(|r| r.accuracy * (r.num_samples as f64 / total)).sum();
    let variance: f64 = reports.map(|r| (r.accuracy - mean).powi(2) * (r.num_samples as f64 / total)).sum();
    Some(AccuracySummary { mean, std: variance.sqrt() })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundTimings {
    pub processing_time: f64,
    pub comm_time: f64,
    /// Slowest participant end to end: training + processing + communication.
    pub round_time: f64,
}

impl RoundTimings {
    pub fn from_reports<'a, I>(reports: I) -> Self where I: IntoIterator<Item = &'a ParticipantReport> {
        reports.into_iter().fold(Self::default(), |acc, r| Self {
            processing_time: acc.processing_time.max(r.processing_time),
            comm_time: acc.comm_time.max(r.comm_time),
            round_time: acc.round_time.max(r.training_time + r.processing_time + r.comm_time),
        })
    }
}

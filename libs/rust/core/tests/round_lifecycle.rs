use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use ndarray::arr1;
use parking_lot::Mutex;
use proptest::prelude::*;
use fedround_core::coordinator::ExclusionReason;
use fedround_core::*;

type Script = dyn Fn(u64, &[ParticipantId], &WeightStore) -> Collection + Send + Sync;

struct ScriptedCollector { script: Box<Script>, calls: AtomicUsize }

impl ScriptedCollector {
    fn new(script: impl Fn(u64, &[ParticipantId], &WeightStore) -> Collection + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self { script: Box::new(script), calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl ReportCollector for ScriptedCollector {
    async fn collect(&self, round: u64, selected: &[ParticipantId], global: &WeightStore) -> Result<Collection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.script)(round, selected, global))
    }
}

struct FixedTester(f64);

#[async_trait]
impl ModelTester for FixedTester {
    async fn test(&self, _weights: &WeightStore) -> Result<f64> { Ok(self.0) }
}

fn vector(w: &[f32]) -> WeightStore { WeightStore::new().with_param("w", arr1(w).into_dyn()) }

fn delta_reports(selected: &[ParticipantId], w: &[f32], accuracy: f64) -> Collection {
    let reports = selected.iter()
        .map(|id| ParticipantReport::new(*id, 10, Payload::Delta(vector(w).into())).with_accuracy(accuracy).with_timings(1.0, 0.2, 0.1))
        .collect();
    Collection { reports, failures: Vec::new() }
}

fn config(total: usize, per_round: usize, rounds: u64) -> FederationConfig {
    let mut cfg = FederationConfig::default();
    cfg.clients.total_clients = total;
    cfg.clients.per_round = per_round;
    cfg.trainer.rounds = rounds;
    cfg
}

#[tokio::test]
async fn runs_until_round_limit_and_records_every_round() {
    let recorder = Arc::new(MemoryRecorder::new());
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[0.01, 0.0], 0.5));
    let mut coord = RoundCoordinator::new(config(10, 4, 4), vector(&[0.0, 0.0]), collector.clone()).unwrap()
        .with_recorder(recorder.clone())
        .with_seed(42);
    let summary = coord.run().await.unwrap();

    assert_eq!(summary.rounds_completed, 4);
    assert_eq!(summary.reason, TerminationReason::RoundLimit { rounds: 4 });
    assert_eq!(summary.final_accuracy, Some(0.5));
    let w = summary.weights.get("w").unwrap();
    assert!((w[0] - 0.04).abs() < 1e-6);
    assert_eq!(collector.calls.load(Ordering::SeqCst), 4);

    let rows = recorder.rows();
    assert_eq!(rows.iter().map(|r| r.round).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    assert!(rows.windows(2).all(|p| p[1].comm_overhead > p[0].comm_overhead));
    assert!(rows.iter().all(|r| (r.round_time - 1.3).abs() < 1e-9 && (r.processing_time - 0.2).abs() < 1e-9));
    // 4 participants * 8 bytes each way per round
    assert!((rows[0].comm_overhead - 64.0 / (1024.0 * 1024.0)).abs() < 1e-12);

    assert!(matches!(coord.run_round().await, Err(RoundError::Terminated { last_round: 4 })));
    assert_eq!(collector.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn target_accuracy_stops_the_run() {
    let collector = ScriptedCollector::new(|round, selected, _| delta_reports(selected, &[0.0, 0.0], 0.2 * round as f64));
    let mut cfg = config(5, 5, 20);
    cfg.trainer.target_accuracy = Some(0.55);
    let mut coord = RoundCoordinator::new(cfg, vector(&[0.0, 0.0]), collector).unwrap();
    assert_eq!(coord.run_round().await.unwrap(), RoundOutcome::Continue);
    assert_eq!(coord.last_round().unwrap().phase, RoundPhase::Continuing);
    assert_eq!(coord.run_round().await.unwrap(), RoundOutcome::Continue);
    match coord.run_round().await.unwrap() {
        RoundOutcome::Terminate(TerminationReason::TargetAccuracy { accuracy, target }) => {
            assert!(accuracy >= 0.55);
            assert_eq!(target, 0.55);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(coord.round_number(), 3);
}

#[tokio::test]
async fn convergence_estimate_stops_when_drift_is_large() {
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[3.0, 4.0], 0.1));
    let mut coord = RoundCoordinator::new(config(4, 2, 10), vector(&[0.0, 0.0]), collector).unwrap();
    let outcome = coord.run_round().await.unwrap();
    let RoundOutcome::Terminate(TerminationReason::ConvergenceEstimate { stopping_round }) = outcome else {
        panic!("expected convergence stop, got {outcome:?}");
    };
    assert!((stopping_round - 149.9389).abs() < 1e-3);
    let state = coord.last_round().unwrap();
    assert!(state.stop_recommended);
    assert_eq!(state.convergence.unwrap().drift, Some(5.0));
}

#[tokio::test]
async fn target_takes_precedence_over_convergence() {
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[3.0, 4.0], 0.95));
    let mut cfg = config(4, 2, 1);
    cfg.trainer.target_accuracy = Some(0.9);
    let mut coord = RoundCoordinator::new(cfg, vector(&[0.0, 0.0]), collector).unwrap();
    assert!(matches!(coord.run_round().await.unwrap(), RoundOutcome::Terminate(TerminationReason::TargetAccuracy { .. })));
}

#[tokio::test]
async fn round_without_respondents_fails_and_can_be_retried() {
    let attempts = AtomicUsize::new(0);
    let collector = ScriptedCollector::new(move |_, selected, _| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Collection { reports: Vec::new(), failures: selected.iter().map(|id| (*id, ParticipantFailure::Timeout)).collect() }
        } else {
            delta_reports(selected, &[0.05, 0.0], 0.3)
        }
    });
    let mut coord = RoundCoordinator::new(config(3, 3, 5), vector(&[0.0, 0.0]), collector).unwrap();
    let snapshot = coord.snapshot();
    let before = snapshot.current();

    let err = coord.run_round().await.unwrap_err();
    assert!(matches!(err, RoundError::NoRespondents { round: 1 }));
    assert_eq!(err.round(), 1);
    assert_eq!(coord.round_number(), 1);
    let failed = coord.last_round().unwrap();
    assert_eq!(failed.phase, RoundPhase::Failed);
    assert_eq!(failed.excluded.len(), 3);
    assert!(Arc::ptr_eq(&before, &snapshot.current()));

    assert_eq!(coord.run_round().await.unwrap(), RoundOutcome::Continue);
    assert_eq!(coord.round_number(), 2);
    assert!((snapshot.current().get("w").unwrap()[0] - 0.05).abs() < 1e-6);
    assert_eq!(before.get("w").unwrap()[0], 0.0);
}

#[tokio::test]
async fn client_accuracy_is_sample_weighted() {
    let collector = ScriptedCollector::new(|_, selected, _| {
        let reports = selected.iter().enumerate()
            .map(|(i, id)| ParticipantReport::new(*id, 2, Payload::Delta(vector(&[0.0, 0.0]).into())).with_accuracy(if i == 0 { 0.8 } else { 0.6 }))
            .collect();
        Collection { reports, failures: Vec::new() }
    });
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(config(2, 2, 1), vector(&[0.0, 0.0]), collector).unwrap().with_recorder(recorder.clone());
    coord.run().await.unwrap();
    let row = &recorder.rows()[0];
    assert!((row.accuracy - 0.7).abs() < 1e-12);
    assert!((row.accuracy_std - 0.1).abs() < 1e-12);
}

#[tokio::test]
async fn server_side_testing_in_weights_mode() {
    let collector = ScriptedCollector::new(|_, selected, global| {
        let reports = selected.iter()
            .map(|id| ParticipantReport::new(*id, u64::from(id.0), Payload::Weights(global.add_scaled(&vector(&[1.0, 1.0]), id.0 as f32).unwrap())).with_accuracy(0.0))
            .collect();
        Collection { reports, failures: Vec::new() }
    });
    let mut cfg = config(3, 3, 1);
    cfg.server.aggregation_mode = AggregationMode::Weights;
    cfg.server.do_test = true;
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(cfg, vector(&[0.0, 0.0]), collector).unwrap()
        .with_tester(Arc::new(FixedTester(0.875)))
        .with_recorder(recorder.clone());
    let summary = coord.run().await.unwrap();
    assert_eq!(summary.final_accuracy, Some(0.875));
    assert_eq!(recorder.rows()[0].accuracy_std, 0.0);
    assert!(coord.last_round().unwrap().accuracy_summary.is_none());
    // (1*1 + 2*2 + 3*3) / 6
    let w = summary.weights.get("w").unwrap();
    assert!((w[0] - 14.0 / 6.0).abs() < 1e-5);
}

#[tokio::test]
async fn late_and_malformed_reports_are_excluded() {
    let (collector, tx) = ChannelCollector::new(8, Duration::from_millis(50));
    let good = |id| RoundSubmission { round: 1, report: ParticipantReport::new(ParticipantId(id), 5, Payload::Delta(vector(&[0.1, 0.0]).into())).with_accuracy(0.4) };
    tx.send(good(1)).await.unwrap();
    tx.send(RoundSubmission { round: 1, report: ParticipantReport::new(ParticipantId(2), 50, Payload::Delta(vector(&[9.0]).into())) }).await.unwrap();
    let mut coord = RoundCoordinator::new(config(3, 3, 2), vector(&[0.0, 0.0]), Arc::new(collector)).unwrap();

    assert_eq!(coord.run_round().await.unwrap(), RoundOutcome::Continue);
    let state = coord.last_round().unwrap();
    assert_eq!(state.selected_participants, vec![ParticipantId(1), ParticipantId(2), ParticipantId(3)]);
    assert_eq!(state.received_reports.len(), 2);
    assert!(state.excluded.contains(&(ParticipantId(3), ExclusionReason::Failure(ParticipantFailure::Timeout))));
    assert!(state.excluded.iter().any(|(id, why)| *id == ParticipantId(2) && matches!(why, ExclusionReason::Schema(_))));
    assert_eq!(coord.snapshot().current(), Arc::new(vector(&[0.1, 0.0])));
    drop(tx);
}

/// Fails the first `failures` calls to `record`, then behaves like a `MemoryRecorder`.
struct FlakyRecorder { failures: AtomicUsize, inner: MemoryRecorder }

impl RoundRecorder for FlakyRecorder {
    fn record(&self, record: &RoundRecord) -> Result<()> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("disk full");
        }
        self.inner.record(record)
    }
}

#[tokio::test]
async fn recording_failure_leaves_round_retryable() {
    let recorder = Arc::new(FlakyRecorder { failures: AtomicUsize::new(1), inner: MemoryRecorder::new() });
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[0.05, 0.0], 0.4));
    let mut coord = RoundCoordinator::new(config(1, 1, 5), vector(&[0.0, 0.0]), collector).unwrap().with_recorder(recorder.clone());
    let snapshot = coord.snapshot();
    let before = snapshot.current();

    let err = coord.run_round().await.unwrap_err();
    assert!(matches!(err, RoundError::Recording { round: 1, .. }));
    assert_eq!(coord.round_number(), 1);
    assert_eq!(coord.last_round().unwrap().phase, RoundPhase::Failed);
    assert!(Arc::ptr_eq(&before, &snapshot.current()));

    assert_eq!(coord.run_round().await.unwrap(), RoundOutcome::Continue);
    assert!((snapshot.current().get("w").unwrap()[0] - 0.05).abs() < 1e-6);
    let rows = recorder.inner.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].round, 1);
    // one participant: 8 bytes out, 8 bytes back, counted once
    assert!((rows[0].comm_overhead - 16.0 / (1024.0 * 1024.0)).abs() < 1e-15);
}

#[tokio::test]
async fn zero_sample_round_fails_without_touching_model() {
    let collector = ScriptedCollector::new(|_, selected, _| {
        let reports = selected.iter().map(|id| ParticipantReport::new(*id, 0, Payload::Delta(vector(&[1.0, 1.0]).into())).with_accuracy(0.5)).collect();
        Collection { reports, failures: Vec::new() }
    });
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(config(4, 2, 3), vector(&[0.0, 0.0]), collector).unwrap().with_recorder(recorder.clone());
    let before = coord.snapshot().current();

    let err = coord.run_round().await.unwrap_err();
    assert!(matches!(err, RoundError::Aggregation { round: 1, source: AggregationError::ZeroTotalSamples }));
    assert_eq!(coord.last_round().unwrap().phase, RoundPhase::Failed);
    assert_eq!(coord.round_number(), 1);
    assert!(Arc::ptr_eq(&before, &coord.snapshot().current()));
    assert!(recorder.rows().is_empty());
}

#[tokio::test]
async fn out_of_range_reports_are_excluded_before_aggregation() {
    let collector = ScriptedCollector::new(|_, selected, _| {
        let reports = selected.iter()
            .map(|id| ParticipantReport::new(*id, 10, Payload::Delta(vector(&[0.01, 0.0]).into())).with_accuracy(if id.0 == 1 { f64::NAN } else { 0.6 }))
            .collect();
        Collection { reports, failures: Vec::new() }
    });
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(config(3, 3, 1), vector(&[0.0, 0.0]), collector).unwrap().with_recorder(recorder.clone());
    coord.run().await.unwrap();

    let state = coord.last_round().unwrap();
    assert_eq!(state.received_reports.len(), 2);
    assert!(state.excluded.iter().any(|(id, why)| *id == ParticipantId(1) && matches!(why, ExclusionReason::Invalid(ReportError::AccuracyOutOfRange(_)))));
    assert!((recorder.rows()[0].accuracy - 0.6).abs() < 1e-12);
    // the rejected payload still crossed the wire: 3 x 8 bytes out, 3 x 8 bytes back
    assert!((recorder.rows()[0].comm_overhead - 48.0 / (1024.0 * 1024.0)).abs() < 1e-15);
}

#[derive(Default)]
struct TracingObserver { events: Mutex<Vec<String>>, reject: bool }

impl RoundObserver for TracingObserver {
    fn weights_received(&self, round: u64, reports: &mut [ParticipantReport]) -> Result<()> {
        self.events.lock().push(format!("received {round}:{}", reports.len()));
        if self.reject { anyhow::bail!("payload policy violated"); }
        for r in reports.iter_mut() { r.payload = Payload::Delta(vector(&[0.01, 0.0]).into()); }
        Ok(())
    }

    fn weights_aggregated(&self, round: u64, reports: &[&ParticipantReport], updated: &WeightStore) {
        self.events.lock().push(format!("aggregated {round}:{}:{:.2}", reports.len(), updated.get("w").map(|t| t[0]).unwrap_or(f32::NAN)));
    }

    fn clients_processed(&self, state: &RoundState) {
        self.events.lock().push(format!("processed {}:{:?}", state.round_number, state.accuracy));
    }
}

#[tokio::test]
async fn observers_see_each_stage_and_may_rewrite_payloads() {
    let observer = Arc::new(TracingObserver::default());
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[0.05, 0.0], 0.5));
    let mut coord = RoundCoordinator::new(config(2, 2, 1), vector(&[0.0, 0.0]), collector).unwrap().with_observer(observer.clone());
    let summary = coord.run().await.unwrap();

    assert!((summary.weights.get("w").unwrap()[0] - 0.01).abs() < 1e-6);
    assert_eq!(*observer.events.lock(), vec!["received 1:2".to_string(), "aggregated 1:2:0.01".to_string(), "processed 1:Some(0.5)".to_string()]);
}

#[tokio::test]
async fn rejecting_observer_fails_the_round() {
    let observer = Arc::new(TracingObserver { reject: true, ..Default::default() });
    let collector = ScriptedCollector::new(|_, selected, _| delta_reports(selected, &[0.05, 0.0], 0.5));
    let mut coord = RoundCoordinator::new(config(2, 2, 3), vector(&[0.0, 0.0]), collector).unwrap().with_observer(observer.clone());
    let before = coord.snapshot().current();
    assert!(matches!(coord.run_round().await, Err(RoundError::Observer { round: 1, .. })));
    assert!(Arc::ptr_eq(&before, &coord.snapshot().current()));
    assert_eq!(observer.events.lock().len(), 1);
}

#[tokio::test]
async fn client_accuracy_rows_follow_config() {
    let collector = ScriptedCollector::new(|round, selected, _| delta_reports(selected, &[0.0, 0.0], 0.1 * round as f64));
    let mut cfg = config(5, 3, 2);
    cfg.clients.do_test = true;
    cfg.results.record_clients_accuracy = true;
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(cfg.clone(), vector(&[0.0, 0.0]), collector.clone()).unwrap().with_recorder(recorder.clone());
    coord.run().await.unwrap();
    let rows = recorder.client_rows();
    assert_eq!(rows.len(), 6);
    assert!(rows[..3].iter().all(|r| r.round == 1 && (r.accuracy - 0.1).abs() < 1e-12));
    assert!(rows[3..].iter().all(|r| r.round == 2));
    assert!(rows[..3].windows(2).all(|w| w[0].client_id < w[1].client_id));

    cfg.clients.do_test = false;
    let recorder = Arc::new(MemoryRecorder::new());
    let mut coord = RoundCoordinator::new(cfg, vector(&[0.0, 0.0]), collector).unwrap().with_recorder(recorder.clone());
    coord.run().await.unwrap();
    assert!(recorder.client_rows().is_empty());
    assert_eq!(recorder.rows().len(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn contribution_weights_sum_to_one(samples in proptest::collection::vec(1u64..10_000, 1..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let baseline = vector(&[0.5, -0.5]);
        let reports: Vec<_> = samples.iter().enumerate()
            .map(|(i, n)| ParticipantReport::new(ParticipantId(i as u32 + 1), *n, Payload::Delta(vector(&[i as f32, 1.0]).into())))
            .collect();
        let out = rt.block_on(AggregationEngine::default().aggregate(&baseline, &reports)).unwrap();
        let total: f64 = out.contributions.iter().map(|c| c.weight).sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
        prop_assert_eq!(out.updated.schema(), baseline.schema());
        prop_assert_eq!(out.total_samples, samples.iter().sum::<u64>());
    }

    #[test]
    fn weighted_accuracy_stays_within_reported_range(entries in proptest::collection::vec((1u64..1000, 0.0f64..1.0), 1..12)) {
        let reports: Vec<_> = entries.iter().enumerate()
            .map(|(i, (n, acc))| ParticipantReport::new(ParticipantId(i as u32 + 1), *n, Payload::Weights(WeightStore::new())).with_accuracy(*acc))
            .collect();
        let s = weighted_mean_std(&reports).unwrap();
        let lo = entries.iter().map(|e| e.1).fold(f64::INFINITY, f64::min);
        let hi = entries.iter().map(|e| e.1).fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(s.mean >= lo - 1e-9 && s.mean <= hi + 1e-9);
        prop_assert!(s.std >= 0.0);
    }
}

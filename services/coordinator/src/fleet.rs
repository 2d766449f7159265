//! In-process participant fleet used to drive the coordinator without a real transport.
//!
//! Every selected participant is a tokio task that waits out a simulated training latency, pulls
//! the global model toward a hidden target and submits the result over the collector channel.
//! A participant may silently fail, in which case the collection deadline excludes it.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use async_trait::async_trait;
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use fedround_core::{AggregationMode, ChannelCollector, Collection, ModelTester, ParticipantId, ParticipantReport, Payload, ReportCollector, RoundSubmission, WeightStore};

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    pub deadline_ms: u64,
    pub failure_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub min_samples: u64,
    pub max_samples: u64,
    /// Fraction of the remaining distance to the target covered by one local update.
    pub learning_rate: f32,
    pub noise: f32,
    /// Half-width of the uniform range the hidden target is drawn from.
    pub target_scale: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 7,
            deadline_ms: 2_000,
            failure_rate: 0.05,
            min_latency_ms: 20,
            max_latency_ms: 300,
            min_samples: 50,
            max_samples: 500,
            learning_rate: 0.3,
            noise: 0.002,
            target_scale: 0.05,
        }
    }
}

#[derive(Deserialize, Default)]
struct SimulationRoot { #[serde(default)] simulation: SimulationConfig }

impl SimulationConfig {
    /// `simulation` section of the same sources `FederationConfig::load` reads.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(file) = std::env::var("FEDROUND_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("FEDROUND").separator("__").try_parsing(true));
        let root: SimulationRoot = builder.build()?.try_deserialize()?;
        root.simulation.validate()?;
        Ok(root.simulation)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!((0.0..=1.0).contains(&self.failure_rate), "simulation.failure_rate must be within [0, 1]");
        anyhow::ensure!(self.min_latency_ms <= self.max_latency_ms, "simulation latency range is empty");
        anyhow::ensure!(0 < self.min_samples && self.min_samples <= self.max_samples, "simulation sample range is invalid");
        anyhow::ensure!(self.target_scale > 0.0, "simulation.target_scale must be positive");
        Ok(())
    }
}

/// Two-layer perceptron layout shared by the global model and every participant.
pub fn demo_model() -> WeightStore {
    WeightStore::new()
        .with_param("fc1.weight", ArrayD::zeros(vec![8, 4]))
        .with_param("fc1.bias", ArrayD::zeros(vec![8]))
        .with_param("fc2.weight", ArrayD::zeros(vec![2, 8]))
        .with_param("fc2.bias", ArrayD::zeros(vec![2]))
}

fn hidden_target(seed: u64, scale: f32) -> WeightStore {
    let mut rng = StdRng::seed_from_u64(seed);
    demo_model().iter().map(|(n, t)| (n.clone(), t.mapv(|_| rng.gen_range(-scale..=scale)))).collect()
}

fn distance(a: &WeightStore, b: &WeightStore) -> Result<f64> {
    let diff = a.subtract(b)?;
    Ok(diff.as_store().iter().flat_map(|(_, t)| t.iter()).map(|v| f64::from(*v).powi(2)).sum::<f64>().sqrt())
}

/// Accuracy proxy: 1 at the target, 0 at (or beyond) the initial distance from it.
#[derive(Clone, Debug)]
pub struct DistanceTester { target: Arc<WeightStore>, initial_distance: f64 }

impl DistanceTester {
    fn new(target: Arc<WeightStore>) -> Result<Self> {
        let initial_distance = distance(&target, &demo_model())?;
        Ok(Self { target, initial_distance })
    }

    pub fn score(&self, weights: &WeightStore) -> Result<f64> {
        if self.initial_distance == 0.0 { return Ok(1.0); }
        Ok((1.0 - distance(weights, &self.target)? / self.initial_distance).clamp(0.0, 1.0))
    }
}

#[async_trait]
impl ModelTester for DistanceTester {
    async fn test(&self, weights: &WeightStore) -> Result<f64> { self.score(weights) }
}

pub struct SimulatedFleet {
    sim: SimulationConfig,
    mode: AggregationMode,
    tester: DistanceTester,
    inbox: ChannelCollector,
    tx: mpsc::Sender<RoundSubmission>,
}

impl SimulatedFleet {
    pub fn new(sim: SimulationConfig, mode: AggregationMode, capacity: usize) -> Result<Self> {
        sim.validate()?;
        let tester = DistanceTester::new(Arc::new(hidden_target(sim.seed, sim.target_scale)))?;
        let (inbox, tx) = ChannelCollector::new(capacity.max(1), Duration::from_millis(sim.deadline_ms));
        info!(deadline_ms = sim.deadline_ms, failure_rate = sim.failure_rate, ?mode, "simulated_fleet_ready");
        Ok(Self { sim, mode, tester, inbox, tx })
    }

    pub fn tester(&self) -> DistanceTester { self.tester.clone() }

    fn spawn_participant(&self, round: u64, id: ParticipantId, global: Arc<WeightStore>) {
        let sim = self.sim.clone();
        let mode = self.mode;
        let tester = self.tester.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(sim.seed ^ (round << 32) ^ u64::from(id.0));
            let latency = rng.gen_range(sim.min_latency_ms..=sim.max_latency_ms);
            tokio::time::sleep(Duration::from_millis(latency)).await;
            if rng.gen_bool(sim.failure_rate) {
                debug!(round, participant = %id, "simulated_participant_failure");
                return;
            }
            let report = match local_update(&sim, &mut rng, &tester, &global, mode) {
                Ok((payload, accuracy)) => ParticipantReport::new(id, rng.gen_range(sim.min_samples..=sim.max_samples), payload)
                    .with_accuracy(accuracy)
                    .with_timings(latency as f64 / 1000.0, rng.gen_range(0.001..0.01), rng.gen_range(0.001..0.05)),
                Err(e) => {
                    debug!(round, participant = %id, error = %e, "simulated_update_failed");
                    return;
                }
            };
            // receiver gone means the run is over
            let _ = tx.send(RoundSubmission { round, report }).await;
        });
    }
}

fn local_update(sim: &SimulationConfig, rng: &mut StdRng, tester: &DistanceTester, global: &WeightStore, mode: AggregationMode) -> Result<(Payload, f64)> {
    let step = tester.target.subtract(global)?;
    let trained = global.add_scaled(step.as_store(), sim.learning_rate)?;
    let local: WeightStore = trained.iter()
        .map(|(n, t)| (n.clone(), t.mapv(|v| v + rng.gen_range(-sim.noise..=sim.noise))))
        .collect();
    let accuracy = tester.score(&local)?;
    let payload = match mode {
        AggregationMode::Delta => Payload::Delta(local.subtract(global)?),
        AggregationMode::Weights => Payload::Weights(local),
    };
    Ok((payload, accuracy))
}

#[async_trait]
impl ReportCollector for SimulatedFleet {
    async fn collect(&self, round: u64, selected: &[ParticipantId], global: &WeightStore) -> Result<Collection> {
        let snapshot = Arc::new(global.clone());
        for id in selected { self.spawn_participant(round, *id, snapshot.clone()); }
        self.inbox.collect(round, selected, global).await
    }
}

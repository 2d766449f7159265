use std::sync::Arc;
use anyhow::Result;
use tracing::info;
use fedround_core::{FederationConfig, JsonLinesRecorder, RoundCoordinator, RunSummary};
use crate::fleet::{demo_model, SimulatedFleet, SimulationConfig};

pub struct FederationModule {
    coordinator: RoundCoordinator,
}

impl FederationModule {
    pub fn new(cfg: FederationConfig, sim: SimulationConfig) -> Result<Self> {
        let fleet = SimulatedFleet::new(sim, cfg.server.aggregation_mode, cfg.clients.per_round * 2)?;
        let tester = fleet.tester();
        let recorder = match &cfg.results.result_path {
            Some(path) => {
                let rec = JsonLinesRecorder::open(path, cfg.results.columns())?;
                match cfg.results.client_accuracy_path().filter(|_| cfg.records_clients_accuracy()) {
                    Some(clients) => Some(rec.with_client_accuracy(clients)?),
                    None => Some(rec),
                }
            }
            None => None,
        };
        let do_test = cfg.server.do_test;
        let mut coordinator = RoundCoordinator::new(cfg, demo_model(), Arc::new(fleet))?;
        if do_test { coordinator = coordinator.with_tester(Arc::new(tester)); }
        if let Some(rec) = recorder {
            info!(path = %rec.path().display(), "round_results_recording");
            coordinator = coordinator.with_recorder(Arc::new(rec));
        }
        info!("federation_module_initialized");
        Ok(Self { coordinator })
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        Ok(self.coordinator.run().await?)
    }

    pub async fn shutdown(&self) -> Result<()> {
        info!(round = self.coordinator.round_number(), terminated = self.coordinator.termination().is_some(), "federation_module_shutdown");
        Ok(())
    }
}

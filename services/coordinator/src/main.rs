use anyhow::Result;
use tokio::signal;
use tracing::{info, warn};
use fedround_core::{init_tracing, FederationConfig};

mod federation;
mod fleet;

use federation::FederationModule;
use fleet::SimulationConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("fedround-coordinator")?;

    let cfg = FederationConfig::load()?;
    let sim = SimulationConfig::load()?;
    info!(?cfg, ?sim, "config loaded");

    let mut module = FederationModule::new(cfg, sim)?;
    tokio::select! {
        res = module.run() => {
            let summary = res?;
            info!(rounds = summary.rounds_completed, reason = %summary.reason, final_accuracy = ?summary.final_accuracy, "training_finished");
        }
        _ = signal::ctrl_c() => warn!("shutdown requested before the run finished"),
    }
    module.shutdown().await?;
    Ok(())
}

//! Run configuration.
//!
//! Loaded once (defaults -> optional YAML file from `FEDROUND_CONFIG_FILE` -> `FEDROUND__*`
//! environment overrides) and then handed to the coordinator as an immutable value.

use std::path::PathBuf;
use anyhow::{bail, Result};
use serde::{Serialize, Deserialize};
use crate::convergence::ConvergenceConstants;
use crate::reporting::RoundRecord;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode { #[default] Delta, Weights }

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Target { Accuracy(f64), Perplexity(f64) }

/// What the reported `accuracy` scalar measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quality { Accuracy, Perplexity }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientsConfig {
    pub total_clients: usize,
    pub per_round: usize,
    /// Participants test their local model and report the result as `accuracy`.
    pub do_test: bool,
}

impl Default for ClientsConfig { fn default() -> Self { Self { total_clients: 10, per_round: 5, do_test: false } } }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub rounds: u64,
    pub target_accuracy: Option<f64>,
    pub target_perplexity: Option<f64>,
}

impl Default for TrainerConfig { fn default() -> Self { Self { rounds: 10, target_accuracy: None, target_perplexity: None } } }

impl TrainerConfig {
    pub fn target(&self) -> Option<Target> {
        match (self.target_accuracy, self.target_perplexity) {
            (Some(a), _) => Some(Target::Accuracy(a)),
            (None, Some(p)) => Some(Target::Perplexity(p)),
            (None, None) => None,
        }
    }

    pub fn quality(&self) -> Quality {
        match self.target() { Some(Target::Perplexity(_)) => Quality::Perplexity, _ => Quality::Accuracy }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub aggregation_mode: AggregationMode,
    /// Test the global model on the server instead of averaging client-reported accuracy.
    pub do_test: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Comma separated column list; `round` is always the first column.
    pub types: String,
    pub result_path: Option<PathBuf>,
    /// Also log `round, client_id, accuracy` rows. Only takes effect with `clients.do_test`.
    pub record_clients_accuracy: bool,
}

impl Default for ResultsConfig {
    fn default() -> Self { Self { types: "accuracy, elapsed_time, round_time".into(), result_path: None, record_clients_accuracy: false } }
}

impl ResultsConfig {
    /// Sibling of `result_path`: `<stem>_accuracy.jsonl`.
    pub fn client_accuracy_path(&self) -> Option<PathBuf> {
        let path = self.result_path.as_ref()?;
        let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "result".into());
        Some(path.with_file_name(format!("{stem}_accuracy.jsonl")))
    }

    pub fn columns(&self) -> Vec<String> {
        std::iter::once("round".to_string())
            .chain(self.types.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty() && c != "round"))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    pub clients: ClientsConfig,
    pub trainer: TrainerConfig,
    pub server: ServerConfig,
    pub convergence: ConvergenceConstants,
    pub results: ResultsConfig,
}

impl FederationConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("trainer.rounds", 10_i64)?;
        if let Ok(file) = std::env::var("FEDROUND_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("FEDROUND").separator("__").try_parsing(true));
        let cfg: FederationConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: FederationConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Per-participant accuracy rows are kept only when participants test locally and the
    /// results section asks for them.
    pub fn records_clients_accuracy(&self) -> bool { self.clients.do_test && self.results.record_clients_accuracy }

    pub fn validate(&self) -> Result<()> {
        let c = &self.clients;
        if c.per_round == 0 || c.per_round > c.total_clients {
            bail!("clients.per_round must be in 1..={} (got {})", c.total_clients, c.per_round);
        }
        if c.total_clients > u32::MAX as usize { bail!("clients.total_clients too large: {}", c.total_clients); }
        if self.trainer.rounds == 0 { bail!("trainer.rounds must be at least 1"); }
        match (self.trainer.target_accuracy, self.trainer.target_perplexity) {
            (Some(_), Some(_)) => bail!("configure either trainer.target_accuracy or trainer.target_perplexity, not both"),
            (Some(a), None) if !(0.0..=1.0).contains(&a) => bail!("trainer.target_accuracy must be within [0, 1] (got {a})"),
            (None, Some(p)) if p <= 0.0 => bail!("trainer.target_perplexity must be positive (got {p})"),
            _ => {}
        }
        if self.convergence.mu == 0.0 { bail!("convergence.mu must be non-zero"); }
        if let Some(unknown) = self.results.columns().iter().find(|c| !RoundRecord::COLUMNS.contains(&c.as_str())) {
            bail!("results.types: unknown column `{unknown}`");
        }
        Ok(())
    }
}

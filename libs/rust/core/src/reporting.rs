//! Per-round result rows and the append-only sinks that persist them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use crate::report::ParticipantId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round: u64,
    pub accuracy: f64,
    pub accuracy_std: f64,
    /// Seconds since the coordinator started.
    pub elapsed_time: f64,
    pub processing_time: f64,
    pub comm_time: f64,
    pub round_time: f64,
    /// Cumulative payload traffic in MB, both directions: the global model sent to every selected
    /// participant plus every payload that arrived, including ones later excluded from aggregation.
    pub comm_overhead: f64,
    pub recorded_at: DateTime<Utc>,
}

impl RoundRecord {
    pub const COLUMNS: [&'static str; 8] = ["round", "accuracy", "accuracy_std", "elapsed_time", "processing_time", "comm_time", "round_time", "comm_overhead"];

    pub fn value(&self, column: &str) -> Option<Value> {
        let v = match column {
            "round" => Value::from(self.round),
            "accuracy" => Value::from(self.accuracy),
            "accuracy_std" => Value::from(self.accuracy_std),
            "elapsed_time" => Value::from(self.elapsed_time),
            "processing_time" => Value::from(self.processing_time),
            "comm_time" => Value::from(self.comm_time),
            "round_time" => Value::from(self.round_time),
            "comm_overhead" => Value::from(self.comm_overhead),
            _ => return None,
        };
        Some(v)
    }

    /// Row restricted to `columns`, in that order. Unknown columns map to `null`.
    pub fn project(&self, columns: &[String]) -> Map<String, Value> {
        columns.iter().map(|c| (c.clone(), self.value(c).unwrap_or(Value::Null))).collect()
    }
}

/// One participant's locally tested accuracy for one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientAccuracy {
    pub round: u64,
    pub client_id: ParticipantId,
    pub accuracy: f64,
}

pub trait RoundRecorder: Send + Sync {
    fn record(&self, record: &RoundRecord) -> Result<()>;

    /// Written before the round's own row. Sinks that keep no per-client log ignore it.
    fn record_clients(&self, _rows: &[ClientAccuracy]) -> Result<()> { Ok(()) }
}

#[derive(Default)]
pub struct MemoryRecorder {
    rows: Mutex<Vec<RoundRecord>>,
    clients: Mutex<Vec<ClientAccuracy>>,
}

impl MemoryRecorder {
    pub fn new() -> Self { Self::default() }
    pub fn rows(&self) -> Vec<RoundRecord> { self.rows.lock().clone() }
    pub fn client_rows(&self) -> Vec<ClientAccuracy> { self.clients.lock().clone() }
}

impl RoundRecorder for MemoryRecorder {
    fn record(&self, record: &RoundRecord) -> Result<()> { self.rows.lock().push(record.clone()); Ok(()) }
    fn record_clients(&self, rows: &[ClientAccuracy]) -> Result<()> { self.clients.lock().extend_from_slice(rows); Ok(()) }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating result dir {}", dir.display()))?;
    }
    OpenOptions::new().create(true).append(true).open(path).with_context(|| format!("opening {}", path.display()))
}

fn append_line(file: &Mutex<File>, value: &impl Serialize) -> Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut f = file.lock();
    f.write_all(line.as_bytes())?;
    f.flush()?;
    Ok(())
}

/// One JSON object per line, appended to `path`. Per-client accuracy rows go to a second file
/// when one is attached with [`JsonLinesRecorder::with_client_accuracy`].
pub struct JsonLinesRecorder {
    path: PathBuf,
    columns: Vec<String>,
    file: Mutex<File>,
    clients: Option<Mutex<File>>,
}

impl JsonLinesRecorder {
    pub fn open(path: impl AsRef<Path>, columns: Vec<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_append(&path)?;
        Ok(Self { path, columns, file: Mutex::new(file), clients: None })
    }

    pub fn with_client_accuracy(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.clients = Some(Mutex::new(open_append(path.as_ref())?));
        Ok(self)
    }

    pub fn path(&self) -> &Path { &self.path }
}

impl RoundRecorder for JsonLinesRecorder {
    fn record(&self, record: &RoundRecord) -> Result<()> { append_line(&self.file, &record.project(&self.columns)) }

    fn record_clients(&self, rows: &[ClientAccuracy]) -> Result<()> {
        let Some(file) = &self.clients else { return Ok(()) };
        rows.iter().try_for_each(|row| append_line(file, row))
    }
}

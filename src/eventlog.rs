//! Append-only JSONL record of everything a station did during a run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::config::Station;
use crate::error::Result;

pub type SharedEventLog = Arc<Mutex<EventLog>>;

pub struct EventLog {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl EventLog {
    /// Open `<dir>/<station>-<unix ts>.jsonl` for appending.
    pub async fn create(dir: &Path, station: Station) -> Result<Self> {
        let path = dir.join(format!("{}-{}.jsonl", station, unix_now()));
        Self::open(path).await
    }

    pub async fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        log::info!("Logging events to {}", path.display());
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub fn shared(self) -> SharedEventLog {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Append one event, stamped with a `ts` field (float seconds since the
    /// epoch), and echo it to the console.
    pub async fn record(&mut self, fields: Map<String, Value>) -> Result<()> {
        let ts = unix_now();
        let echo: Vec<String> = fields.values().map(display_value).collect();
        log::info!("{}\t{}", ts, echo.join("\t"));

        let mut fields = fields;
        fields.insert("ts".to_string(), Value::from(ts));
        let json = serde_json::to_string(&fields)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.records += 1;
        Ok(())
    }
}

/// Build the field map for [`EventLog::record`] from `key => value` pairs.
#[macro_export]
macro_rules! event {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut fields = serde_json::Map::new();
        $( fields.insert($key.to_string(), serde_json::Value::from($value)); )*
        fields
    }};
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

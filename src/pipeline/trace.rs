// Relay run tracing
// Append-only JSONL file, one line per stage event, tagged with the run id

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Started,
    Ok,
    Skipped,
    Failed,
}

/// A single line of the run trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// RFC 3339 timestamp of when this entry was created
    pub timestamp: String,

    /// Filled in by the writer
    #[serde(default)]
    pub run_id: String,

    /// Relay stage (e.g., "run", "fetch", "media", "publish")
    pub stage: String,

    pub status: TraceStatus,

    pub message: String,

    /// Optional structured data (post id, tweet id, counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(stage: String, status: TraceStatus, message: String) -> Self {
        TraceEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: String::new(),
            stage,
            status,
            message,
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize to JSON line (with newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Appends entries for one relay run
pub struct TraceWriter {
    file_path: PathBuf,
    run_id: String,
}

impl TraceWriter {
    /// New writer with a fresh run id
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter {
            file_path,
            run_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append an entry, stamping it with this run's id.
    /// Creates the file (and its directory) if needed.
    pub fn write(&self, mut entry: TraceEntry) -> Result<(), TraceError> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;

        entry.run_id = self.run_id.clone();
        let json_line = entry.to_json_line()?;
        file.write_all(json_line.as_bytes())?;
        file.flush()?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Helper builder for trace entries
pub struct TraceBuilder {
    stage: String,
}

impl TraceBuilder {
    pub fn stage(stage: impl Into<String>) -> Self {
        TraceBuilder {
            stage: stage.into(),
        }
    }

    pub fn started(self, message: impl Into<String>) -> TraceEntry {
        TraceEntry::new(self.stage, TraceStatus::Started, message.into())
    }

    pub fn ok(self, message: impl Into<String>) -> TraceEntry {
        TraceEntry::new(self.stage, TraceStatus::Ok, message.into())
    }

    pub fn skipped(self, message: impl Into<String>) -> TraceEntry {
        TraceEntry::new(self.stage, TraceStatus::Skipped, message.into())
    }

    pub fn failed(self, message: impl Into<String>) -> TraceEntry {
        TraceEntry::new(self.stage, TraceStatus::Failed, message.into())
    }
}

/// Read trace entries from a JSONL file
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let contents = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let entry: TraceEntry = serde_json::from_str(line)?;
        entries.push(entry);
    }

    Ok(entries)
}

//! File-backed persistence: JSONL logs and atomic JSON snapshots.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use crate::scrub::scrub_sensitive;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O failure at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn io_err(path: &Path, source: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// The durable store under a data root.
///
/// One writer per process: appends are serialized by an internal lock so
/// each log line lands whole.
pub struct Persistence {
    logs_dir: PathBuf,
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl Persistence {
    /// Open (creating if needed) `logs/` and `state/` under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        let logs_dir = root.join("logs");
        let state_dir = root.join("state");
        fs::create_dir_all(&logs_dir).map_err(|e| io_err(&logs_dir, e))?;
        fs::create_dir_all(&state_dir).map_err(|e| io_err(&state_dir, e))?;
        Ok(Self {
            logs_dir,
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn log_path(&self, channel: &str) -> PathBuf {
        self.logs_dir.join(format!("{channel}.jsonl"))
    }

    pub fn state_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.json"))
    }

    /// Append one scrubbed JSON line to a channel.
    pub fn append_log(&self, channel: &str, item: &Value) -> Result<(), PersistenceError> {
        let path = self.log_path(channel);
        let line = serde_json::to_string(&scrub_sensitive(item))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        writeln!(file, "{line}").map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Append a `{ts, event_type, payload}` entry to a channel.
    ///
    /// Best-effort: the event log is an observability sidechannel, so a
    /// write failure is reported via tracing and does not fail the caller.
    pub fn emit_event(&self, channel: &str, event_type: &str, payload: Value) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "event_type": event_type,
            "payload": payload,
        });
        if let Err(e) = self.append_log(channel, &entry) {
            warn!(channel = %channel, event_type = %event_type, error = %e, "Event log write failed");
        }
    }

    /// Read a snapshot, returning `default` on any failure (missing file,
    /// bad JSON, I/O error).
    pub fn load_state(&self, name: &str, default: Value) -> Value {
        let path = self.state_path(name);
        let Ok(raw) = fs::read_to_string(&path) else {
            return default;
        };
        serde_json::from_str(&raw).unwrap_or(default)
    }

    /// Write a snapshot via `<name>.json.tmp` followed by atomic rename.
    pub fn save_state(&self, name: &str, value: &Value) -> Result<(), PersistenceError> {
        let path = self.state_path(name);
        let tmp = self.state_dir.join(format!("{name}.json.tmp"));
        let body = serde_json::to_string_pretty(&scrub_sensitive(value))?;

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    /// Read the last `limit` entries of a log channel, skipping corrupt
    /// lines.
    pub fn tail_log(&self, channel: &str, limit: usize) -> Vec<Value> {
        let path = self.log_path(channel);
        let Ok(raw) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        let mut entries: Vec<Value> = raw
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        entries
    }
}

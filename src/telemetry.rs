use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE: &str = "telemetry.jsonl";
const ROTATED_FILE: &str = "telemetry.1.jsonl";

/// Local JSONL journal of pipeline events. Events queue in memory and are
/// appended in batches; the file rolls over once past its size cap.
#[derive(Clone)]
pub struct TelemetryClient {
    enabled: Arc<AtomicBool>,
    queue: Arc<Mutex<Vec<TelemetryEvent>>>,
    journal_path: PathBuf,
    batch_size: usize,
    max_file_bytes: u64,
}

impl TelemetryClient {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.telemetry_enabled)),
            queue: Arc::new(Mutex::new(Vec::new())),
            journal_path: data_dir.join(JOURNAL_FILE),
            batch_size: config.telemetry_batch_size.max(1),
            max_file_bytes: config.telemetry_buffer_max_bytes,
        })
    }

    pub fn record(&self, name: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }

        let mut queue = self.queue.lock();
        queue.push(TelemetryEvent {
            name: name.into(),
            timestamp: Utc::now(),
            payload,
        });
        if queue.len() >= self.batch_size {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn persist_locked(&self, queue: &mut Vec<TelemetryEvent>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::new();
        for event in queue.iter() {
            serde_json::to_writer(&mut encoded, event)?;
            encoded.push(b'\n');
        }
        self.rotate_if_needed(encoded.len() as u64)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)?;
        file.write_all(&encoded)?;
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current = fs::metadata(&self.journal_path)
            .map(|m| m.len())
            .unwrap_or(0);
        if current == 0 || current + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }
        let rotated = self
            .journal_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(ROTATED_FILE);
        fs::rename(&self.journal_path, rotated)?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Stable, non-reversible token for a place id so the journal never holds raw
/// identifiers.
pub fn place_hash(place_id: &str) -> String {
    let digest = Sha256::digest(place_id.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}

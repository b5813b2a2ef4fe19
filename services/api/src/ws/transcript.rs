//! Session transcript: an in-memory view plus an append-only JSONL log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// True for text that is structured/control data rather than dialogue.
pub fn is_control_payload(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.starts_with('{') && trimmed.ends_with('}')
}

/// True for the textual barge-in marker some model versions emit.
pub fn is_interruption(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text.trim())
        .ok()
        .and_then(|value| value.get("interrupted").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

pub struct TranscriptLog {
    entries: Mutex<Vec<TranscriptEntry>>,
    writer: Mutex<Option<mpsc::UnboundedSender<TranscriptEntry>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptLog {
    /// A transcript kept in memory only.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// A transcript also appended to `<dir>/<session_id>.jsonl`.
    pub fn with_file(dir: &Path, session_id: &str) -> Self {
        let path = dir.join(format!("{session_id}.jsonl"));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_entries(path, rx));
        Self {
            entries: Mutex::new(Vec::new()),
            writer: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
        }
    }

    /// Records a line of dialogue. Control payloads are skipped and the call
    /// returns false.
    pub fn record_text(&self, role: &str, content: &str) -> bool {
        if is_control_payload(content) {
            debug!(role, "Filtered control payload from transcript.");
            return false;
        }
        self.append(role, content);
        true
    }

    pub fn record_tool_call(&self, name: &str, call_id: &str, input: &serde_json::Value) {
        self.append("tool", &format!("call {name} [{call_id}] with {input}"));
    }

    pub fn record_tool_result(&self, name: &str, call_id: &str, result: &str, is_error: bool) {
        let outcome = if is_error { "failed" } else { "returned" };
        self.append("tool", &format!("{name} [{call_id}] {outcome}: {result}"));
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Clears the in-memory view. The file log is append-only and keeps
    /// everything.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Stops accepting entries and waits for the file writer to drain.
    pub async fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Transcript writer task failed.");
            }
        }
    }

    fn append(&self, role: &str, content: &str) {
        let entry = TranscriptEntry {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        if let Ok(writer) = self.writer.lock() {
            if let Some(tx) = writer.as_ref() {
                if tx.send(entry.clone()).is_err() {
                    debug!(role, "Transcript writer has stopped; entry kept in memory only.");
                }
            }
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

async fn write_entries(path: PathBuf, mut rx: mpsc::UnboundedReceiver<TranscriptEntry>) {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %path.display(), error = %e, "Cannot create transcript directory; file log disabled.");
            return;
        }
    }
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open transcript log; file log disabled.");
            return;
        }
    };

    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize transcript entry.");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to append to transcript log.");
        }
    }
    if let Err(e) = file.flush().await {
        warn!(path = %path.display(), error = %e, "Failed to flush transcript log.");
    }
}

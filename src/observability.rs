//! Request Log
//!
//! One structured entry per finished pipeline run, kept in a bounded
//! in-memory ring and optionally appended to a JSONL file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub question: String,
    pub generated_query: Option<String>,
    /// Terminal pipeline state, e.g. `executed` or `invalid`
    pub final_state: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub rows_returned: Option<u64>,
    pub elapsed_ms: u64,
}

pub struct RequestLog {
    log_file: Option<PathBuf>,
    entries: Mutex<VecDeque<RequestLogEntry>>,
    max_in_memory: usize,
}

impl RequestLog {
    pub fn new(log_file: Option<PathBuf>, max_in_memory: usize) -> Self {
        Self {
            log_file,
            entries: Mutex::new(VecDeque::new()),
            max_in_memory,
        }
    }

    /// Record an entry. File write failures are logged and otherwise ignored
    /// so logging never fails a request.
    pub fn record(&self, entry: RequestLogEntry) {
        if let Some(ref log_file) = self.log_file {
            if let Err(e) = Self::append(log_file, &entry) {
                warn!("Failed to write request log {}: {}", log_file.display(), e);
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > self.max_in_memory {
            entries.pop_front();
        }
    }

    /// Most recent entries, newest last.
    pub fn recent(&self, limit: usize) -> Vec<RequestLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    fn append(log_file: &PathBuf, entry: &RequestLogEntry) -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(log_file)?;
        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(question: &str) -> RequestLogEntry {
        RequestLogEntry {
            timestamp: Utc::now(),
            request_id: Uuid::new_v4(),
            question: question.to_string(),
            generated_query: Some("SELECT 1 FORMAT JSON".to_string()),
            final_state: "executed".to_string(),
            error_kind: None,
            error_message: None,
            rows_returned: Some(1),
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = RequestLog::new(None, 2);
        for q in ["a", "b", "c"] {
            log.record(entry(q));
        }
        let recent: Vec<String> = log.recent(10).into_iter().map(|e| e.question).collect();
        assert_eq!(recent, vec!["b", "c"]);
        assert_eq!(log.recent(1)[0].question, "c");
    }

    #[test]
    fn test_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        let log = RequestLog::new(Some(path.clone()), 10);
        log.record(entry("first"));
        log.record(entry("second"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<RequestLogEntry> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].question, "second");
    }
}

//! Per-instance log stream, polled by API consumers.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub text: String,
}

/// Append-only log per instance; cleared only when a `start` begins.
#[derive(Default)]
pub struct LogBook {
    entries: RwLock<HashMap<String, Vec<LogEntry>>>,
}

impl LogBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, instance_id: &str, text: impl Into<String>) {
        let text = text.into();
        log::info!("[{}] {}", instance_id, text.trim_end());

        let entry = LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            text,
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.entry(instance_id.to_string()).or_default().push(entry);
    }

    pub fn clear(&self, instance_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(log) = entries.get_mut(instance_id) {
            log.clear();
        }
    }

    /// Drop the log entirely (instance deleted).
    pub fn forget(&self, instance_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(instance_id);
    }

    pub fn entries(&self, instance_id: &str) -> Vec<LogEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(instance_id).cloned().unwrap_or_default()
    }

    pub fn len(&self, instance_id: &str) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(instance_id).map_or(0, Vec::len)
    }

    pub fn contains(&self, instance_id: &str, needle: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(instance_id)
            .is_some_and(|log| log.iter().any(|e| e.text.contains(needle)))
    }
}

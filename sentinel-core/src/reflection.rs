//! Reflection sink: records the outcome of each cycle for downstream
//! learning. Never allowed to fail the cycle itself.
//!
//! Grounded on `core/src/rollout.rs`'s "never let a storage failure break
//! the session" posture: `record` logs a warning on failure and returns.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub cycle_id: String,
    pub goal: String,
    pub outcome: CycleOutcome,
    pub duration_ms: u64,
    pub change_count: usize,
    pub iterations: u32,
    pub notes: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait ReflectionSink: Send + Sync {
    async fn record(&self, entry: ReflectionEntry);
}

/// Keeps entries in process memory; intended for tests and the CLI's
/// smoke-testing driver.
#[derive(Default)]
pub struct InMemoryReflectionSink {
    entries: Mutex<Vec<ReflectionEntry>>,
}

impl InMemoryReflectionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReflectionEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clone()
    }
}

#[async_trait]
impl ReflectionSink for InMemoryReflectionSink {
    async fn record(&self, entry: ReflectionEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
    }
}

/// Discards every entry. Useful when a caller has no downstream consumer
/// and does not want to pay for bookkeeping.
pub struct NullReflectionSink;

#[async_trait]
impl ReflectionSink for NullReflectionSink {
    async fn record(&self, entry: ReflectionEntry) {
        tracing::debug!(cycle_id = %entry.cycle_id, "discarding reflection entry: no sink configured");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_sink_accumulates_entries() {
        let sink = InMemoryReflectionSink::new();
        sink.record(ReflectionEntry {
            cycle_id: "c1".to_string(),
            goal: "add greet()".to_string(),
            outcome: CycleOutcome::Done,
            duration_ms: 10,
            change_count: 1,
            iterations: 0,
            notes: String::new(),
            recorded_at: Utc::now(),
        })
        .await;
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test]
    async fn null_sink_never_panics_on_record() {
        let sink = NullReflectionSink;
        sink.record(ReflectionEntry {
            cycle_id: "c2".to_string(),
            goal: "x".to_string(),
            outcome: CycleOutcome::Failed,
            duration_ms: 0,
            change_count: 0,
            iterations: 0,
            notes: "boom".to_string(),
            recorded_at: Utc::now(),
        })
        .await;
    }
}

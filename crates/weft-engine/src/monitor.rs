//! Per-execution monitoring trace.
//!
//! A side channel keyed by [`ExecutionId`], independent of the state store.
//! Recording never fails and never influences control flow.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use weft_core::types::{ExecutionId, NodeId, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
    Recovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathEntry {
    pub node: NodeId,
    pub status: StepStatus,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub node: Option<NodeId>,
    pub phase: Phase,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringRecord {
    pub execution_id: ExecutionId,
    pub flow: String,
    pub status: RunStatus,
    pub path: Vec<PathEntry>,
    pub errors: Vec<ErrorEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<Value>,
}

/// Completed records kept by [`MonitoringRecorder::new`].
pub const DEFAULT_MAX_RECORDS: usize = 1000;

pub struct MonitoringRecorder {
    records: Mutex<HashMap<ExecutionId, MonitoringRecord>>,
    max_records: usize,
}

impl Default for MonitoringRecorder {
    fn default() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }
}

impl MonitoringRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_records` records once they complete, evicting the
    /// oldest completed first (0 = unbounded). Running records are never
    /// evicted.
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_records,
        }
    }

    /// Create (or reset) the record for `id`.
    pub fn start(&self, id: &ExecutionId, flow: &str) {
        let record = MonitoringRecord {
            execution_id: id.clone(),
            flow: flow.to_string(),
            status: RunStatus::Running,
            path: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            result: None,
        };
        if let Ok(mut records) = self.records.lock() {
            records.insert(id.clone(), record);
        }
    }

    /// Append a node step to the execution path.
    pub fn update(&self, id: &ExecutionId, node: &str, status: StepStatus, metadata: Value) {
        self.with_record(id, |record| {
            record.path.push(PathEntry {
                node: node.to_string(),
                status,
                metadata,
                timestamp: Utc::now(),
            });
        });
    }

    /// Append an error entry and mark the execution as errored.
    pub fn record_error(&self, id: &ExecutionId, node: Option<&str>, phase: Phase, message: &str) {
        self.with_record(id, |record| {
            record.status = RunStatus::Error;
            record.errors.push(ErrorEntry {
                timestamp: Utc::now(),
                node: node.map(String::from),
                phase,
                message: message.to_string(),
            });
        });
    }

    /// Close the record. `Some(result)` marks it completed (even after
    /// recovered errors); `None` marks it errored.
    pub fn complete(&self, id: &ExecutionId, result: Option<Value>) {
        self.with_record(id, |record| {
            let now = Utc::now();
            record.status = if result.is_some() {
                RunStatus::Completed
            } else {
                RunStatus::Error
            };
            record.ended_at = Some(now);
            record.duration_ms = Some((now - record.started_at).num_milliseconds().max(0) as u64);
            record.result = result;
        });
        self.evict_completed();
    }

    pub fn cleanup(&self, id: &ExecutionId) {
        if let Ok(mut records) = self.records.lock() {
            records.remove(id);
        }
    }

    pub fn snapshot(&self, id: &ExecutionId) -> Option<MonitoringRecord> {
        self.records.lock().ok()?.get(id).cloned()
    }

    /// Ids of every record still held.
    pub fn active(&self) -> Vec<ExecutionId> {
        self.records
            .lock()
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn evict_completed(&self) {
        if self.max_records == 0 {
            return;
        }
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        if records.len() <= self.max_records {
            return;
        }
        let mut completed: Vec<_> = records
            .values()
            .filter_map(|r| r.ended_at.map(|ended| (ended, r.execution_id.clone())))
            .collect();
        completed.sort();
        let excess = records.len() - self.max_records;
        for (_, id) in completed.into_iter().take(excess) {
            records.remove(&id);
        }
        debug!(held = records.len(), max = self.max_records, "Evicted completed monitoring records");
    }

    fn with_record(&self, id: &ExecutionId, f: impl FnOnce(&mut MonitoringRecord)) {
        let Ok(mut records) = self.records.lock() else {
            return;
        };
        match records.get_mut(id) {
            Some(record) => f(record),
            None => debug!(execution_id = %id, "No monitoring record, dropping entry"),
        }
    }
}

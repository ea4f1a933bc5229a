//! Structured event records.
//!
//! The engine emits one record per significant event. Sinks decide where
//! records go; the default writes them as `tracing` events.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::{current_timestamp, to_rfc3339};

/// Kinds of engine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A run began.
    RunStart,
    /// A run reached a terminal status.
    RunEnd,
    /// A unit began.
    UnitStart,
    /// A unit finished (any outcome).
    UnitEnd,
    /// A checkpoint was persisted.
    CheckpointCreated,
    /// Per-unit or integrity validation produced a verdict.
    ValidationResult,
    /// A rollback began.
    RollbackStart,
    /// A rollback finished.
    RollbackEnd,
}

impl EventKind {
    /// Snake-case name used in log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStart => "run_start",
            EventKind::RunEnd => "run_end",
            EventKind::UnitStart => "unit_start",
            EventKind::UnitEnd => "unit_end",
            EventKind::CheckpointCreated => "checkpoint_created",
            EventKind::ValidationResult => "validation_result",
            EventKind::RollbackStart => "rollback_start",
            EventKind::RollbackEnd => "rollback_end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Emission time (microseconds since epoch).
    pub timestamp: u64,
    /// Run (or rollback) identifier.
    pub run_id: String,
    /// Unit identity, for unit-scoped events.
    pub unit: Option<String>,
    /// What happened.
    pub kind: EventKind,
    /// Elapsed time, for events that close a span of work.
    pub duration_ms: Option<u64>,
    /// Outcome or detail.
    pub outcome: Option<String>,
}

impl EventRecord {
    /// Create a record stamped with the current time.
    pub fn new(run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            timestamp: current_timestamp(),
            run_id: run_id.into(),
            unit: None,
            kind,
            duration_ms: None,
            outcome: None,
        }
    }

    /// Attach the unit identity.
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Attach a duration.
    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach an outcome.
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    /// Format the record as a single log line.
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "{} run={} kind={}",
            to_rfc3339(self.timestamp),
            self.run_id,
            self.kind
        );
        if let Some(unit) = &self.unit {
            line.push_str(&format!(" unit={}", unit));
        }
        if let Some(ms) = self.duration_ms {
            line.push_str(&format!(" duration_ms={}", ms));
        }
        if let Some(outcome) = &self.outcome {
            line.push_str(&format!(" outcome={:?}", outcome));
        }
        line
    }
}

/// Destination for event records.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn emit(&self, record: EventRecord);
}

/// Emits each record as a `tracing` event on target `sqlshift::event`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, record: EventRecord) {
        tracing::info!(
            target: "sqlshift::event",
            timestamp = %to_rfc3339(record.timestamp),
            run_id = %record.run_id,
            unit = record.unit.as_deref().unwrap_or(""),
            kind = %record.kind,
            duration_ms = record.duration_ms,
            outcome = record.outcome.as_deref().unwrap_or(""),
            "{}",
            record.kind
        );
    }
}

/// Collects records in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far.
    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Records of one kind.
    pub fn of_kind(&self, kind: EventKind) -> Vec<EventRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no records were collected.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, record: EventRecord) {
        self.records.lock().push(record);
    }
}

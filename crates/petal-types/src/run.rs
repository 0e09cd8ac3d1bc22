//! Run-time records: step records, events, snapshots and the run manifest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::AdapterKind;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a single step.
///
/// `Pending`, `Running` and `Retrying` are transient and only ever appear in
/// events. A committed [`StepRecord`] always carries a terminal status or
/// `AwaitingApproval`, which the engine never advances on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
    AwaitingApproval,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::AwaitingApproval => "awaiting_approval",
        };
        f.write_str(s)
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// At least one approval gate is waiting for a decision.
    Paused,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// The single write slot a step owns in the run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            outputs: BTreeMap::new(),
            cache_hit: false,
            attempts: 0,
            started_at: None,
            finished_at: None,
            duration_ms: 0,
            cache_key: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(StepStatus::Failed)
        }
    }
}

/// Persisted run state, used to resume a paused or failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub spec_hash: String,
    pub status: RunStatus,
    pub records: BTreeMap<String, StepRecord>,
}

/// An external decision for a step parked in `awaiting_approval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub step_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunFinished,
    StepStarted,
    StepFinished,
    StepSkipped,
    StepRetrying,
    CacheHit,
    AwaitingApproval,
    Error,
}

/// One append-only record per state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    pub fn new(event_kind: EventKind, run_id: Uuid) -> Self {
        Self {
            event_kind,
            timestamp: Utc::now(),
            run_id,
            step_id: None,
            attempt: 0,
            duration_ms: None,
            cache_hit: false,
            status: None,
            error: None,
        }
    }

    pub fn for_step(event_kind: EventKind, run_id: Uuid, step_id: &str) -> Self {
        Self {
            step_id: Some(step_id.to_string()),
            ..Self::new(event_kind, run_id)
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn cache_hit(mut self, hit: bool) -> Self {
        self.cache_hit = hit;
        self
    }

    pub fn status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// End-of-run summary written to `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub name: String,
    pub spec_hash: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub dry_run: bool,
    pub steps: Vec<ManifestStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: String,
    pub adapter: AdapterKind,
    pub adapter_version: String,
    pub status: StepStatus,
    pub cache_hit: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Output name -> sha256 of its canonical JSON (or file content).
    #[serde(default)]
    pub output_digests: BTreeMap<String, String>,
    /// Output name -> materialized file path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub materialized: BTreeMap<String, String>,
    /// Exact prompt and sampling parameters for generative steps (redacted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Value>,
    /// Resolved configuration for dry runs (redacted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(StepStatus::Succeeded.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::AwaitingApproval.is_terminal());
        assert!(!StepStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_event_serializes_minimum_fields() {
        let run_id = Uuid::now_v7();
        let event = Event::for_step(EventKind::StepFinished, run_id, "build")
            .attempt(2)
            .duration_ms(15)
            .status(StepStatus::Succeeded);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_kind"], "step_finished");
        assert_eq!(json["step_id"], "build");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["duration_ms"], 15);
        assert_eq!(json["cache_hit"], false);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failed_record() {
        let record = StepRecord::failed("boom");
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("boom"));
    }
}

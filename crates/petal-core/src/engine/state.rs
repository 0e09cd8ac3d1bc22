//! Run state: one record slot per step id.
//!
//! Steps never write to the state directly. A finished step task hands its
//! record back to the scheduler, which commits it into that step's slot.

use std::collections::BTreeMap;

use petal_types::run::{RunSnapshot, RunStatus, StepRecord, StepStatus};
use petal_types::step::CanonicalStep;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Readiness of a step with respect to its `needs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// A need has not reached a terminal state (e.g. a gate awaiting approval).
    Blocked,
    /// A need failed; the step fails without dispatch.
    DependencyFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunState {
    records: BTreeMap<String, StepRecord>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        Self {
            records: snapshot.records.clone(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StepRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> &BTreeMap<String, StepRecord> {
        &self.records
    }

    /// Commit a step's record into its slot.
    pub fn commit(&mut self, id: &str, record: StepRecord) {
        self.records.insert(id.to_string(), record);
    }

    /// Drop a slot so the step is scheduled again (used when resuming).
    pub fn clear(&mut self, id: &str) -> Option<StepRecord> {
        self.records.remove(id)
    }

    pub fn is_settled(&self, id: &str) -> bool {
        self.records
            .get(id)
            .is_some_and(|r| r.status.is_terminal() || r.status == StepStatus::AwaitingApproval)
    }

    pub fn readiness(&self, step: &CanonicalStep) -> Readiness {
        for need in &step.needs {
            match self.records.get(need).map(|r| r.status) {
                Some(StepStatus::Failed) => return Readiness::DependencyFailed(need.clone()),
                Some(status) if status.is_terminal() => {}
                _ => return Readiness::Blocked,
            }
        }
        Readiness::Ready
    }

    /// Outputs of the step's needs, keyed by step id. Skipped needs map to
    /// null so every key they would have produced reads as null.
    pub fn outputs_for(&self, step: &CanonicalStep) -> BTreeMap<String, Value> {
        step.needs
            .iter()
            .map(|need| {
                let outputs = match self.records.get(need) {
                    Some(r) if r.status != StepStatus::Skipped => {
                        Value::Object(r.outputs.clone().into_iter().collect::<Map<String, Value>>())
                    }
                    _ => Value::Null,
                };
                (need.clone(), outputs)
            })
            .collect()
    }

    /// Overall status once scheduling has stopped.
    pub fn status(&self, cancelled: bool) -> RunStatus {
        let any = |s: StepStatus| self.records.values().any(|r| r.status == s);
        if cancelled {
            RunStatus::Cancelled
        } else if any(StepStatus::AwaitingApproval) {
            RunStatus::Paused
        } else if any(StepStatus::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }

    pub fn snapshot(&self, run_id: Uuid, spec_hash: &str, status: RunStatus) -> RunSnapshot {
        RunSnapshot {
            run_id,
            spec_hash: spec_hash.to_string(),
            status,
            records: self.records.clone(),
        }
    }
}

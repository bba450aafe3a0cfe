//! Workflows: ordered, persistable lists of operations.
//!
//! A workflow references labware only by id and type, so it can be stored and replayed
//! against any deck. Ids absent from the current deck are resolved with
//! [`crate::engine::remap`] before a run.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::sequencer::ExecutionReport;
use crate::error::{AppResult, PipettorError};
use crate::operation::{LabwareRef, Operation};

/// One operation inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub operation_id: Uuid,
    #[serde(default)]
    pub description: String,
    /// Channel count the entry was built for; checked before it runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<usize>,
    pub operation: Operation,
}

impl WorkflowEntry {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            description: operation.describe(),
            channels: None,
            operation,
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub operations: Vec<WorkflowEntry>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            created_at: Utc::now(),
            operations: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append an operation and return its id.
    pub fn add(&mut self, operation: Operation) -> Uuid {
        self.push(WorkflowEntry::new(operation))
    }

    pub fn push(&mut self, entry: WorkflowEntry) -> Uuid {
        let id = entry.operation_id;
        self.operations.push(entry);
        id
    }

    pub fn remove(&mut self, operation_id: Uuid) -> Option<WorkflowEntry> {
        let index = self
            .operations
            .iter()
            .position(|e| e.operation_id == operation_id)?;
        Some(self.operations.remove(index))
    }

    /// Move the entry at `from` so it ends up at `to`.
    pub fn move_entry(&mut self, from: usize, to: usize) -> AppResult<()> {
        let len = self.operations.len();
        if from >= len || to >= len {
            return Err(PipettorError::Config(format!(
                "cannot move entry {from} to {to} in a workflow of {len}"
            )));
        }
        let entry = self.operations.remove(from);
        self.operations.insert(to, entry);
        Ok(())
    }

    /// Every distinct labware reference, in first-use order.
    pub fn referenced_labware(&self) -> Vec<&LabwareRef> {
        let mut seen: Vec<&LabwareRef> = Vec::new();
        for entry in &self.operations {
            for reference in entry.operation.referenced_labware() {
                if !seen.iter().any(|r| r.id == reference.id) {
                    seen.push(reference);
                }
            }
        }
        seen
    }

    pub fn load_json(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> AppResult<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    NotStarted,
    Running,
    /// Parked between two device commands until resumed or aborted.
    Paused,
    Completed,
    Failed,
    Aborted,
}

/// Live view of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowProgress {
    pub workflow_id: Uuid,
    pub name: String,
    pub status: WorkflowStatus,
    /// Entry running now, or the last one reached.
    pub index: usize,
    pub operations_completed: usize,
    pub total_operations: usize,
}

impl WorkflowProgress {
    pub fn progress_percent(&self) -> f64 {
        percent(self.operations_completed, self.total_operations)
    }
}

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    done as f64 / total as f64 * 100.0
}

/// Outcome of a workflow run.
///
/// `operations_completed` counts entries before `start_from` as done.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub operations_completed: usize,
    pub total_operations: usize,
    /// Indices skipped because they reference unresolved labware.
    pub skipped: Vec<usize>,
    pub failed_operation_index: Option<usize>,
    pub error_message: Option<String>,
    pub reports: Vec<ExecutionReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowResult {
    pub fn new(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.workflow_id,
            status: WorkflowStatus::NotStarted,
            operations_completed: 0,
            total_operations: workflow.len(),
            skipped: Vec::new(),
            failed_operation_index: None,
            error_message: None,
            reports: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        percent(self.operations_completed, self.total_operations)
    }

    pub(crate) fn progress(&self, name: &str, index: usize) -> WorkflowProgress {
        WorkflowProgress {
            workflow_id: self.workflow_id,
            name: name.to_string(),
            status: self.status,
            index,
            operations_completed: self.operations_completed,
            total_operations: self.total_operations,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    pub(crate) fn fail(&mut self, index: usize, error: &PipettorError) {
        self.status = WorkflowStatus::Failed;
        self.failed_operation_index = Some(index);
        self.error_message = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn abort(&mut self, index: usize, error: &PipettorError) {
        self.fail(index, error);
        self.status = WorkflowStatus::Aborted;
    }

    pub(crate) fn finish(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labware::LabwareType;

    fn pick(holder: &str) -> Operation {
        Operation::PickTips {
            holder: LabwareRef::new(holder, LabwareType::PipetteHolder),
            position: None,
        }
    }

    #[test]
    fn entries_can_be_reordered_and_removed() {
        let mut workflow = Workflow::new("exchange");
        let first = workflow.add(pick("a"));
        workflow.add(pick("b"));
        workflow.add(pick("c"));

        workflow.move_entry(0, 2).unwrap();
        assert_eq!(workflow.operations[2].operation_id, first);
        assert!(workflow.move_entry(3, 0).is_err());

        assert!(workflow.remove(first).is_some());
        assert!(workflow.remove(first).is_none());
        assert_eq!(workflow.len(), 2);
    }

    #[test]
    fn referenced_labware_is_deduplicated() {
        let mut workflow = Workflow::new("w");
        workflow.add(pick("a"));
        workflow.add(pick("a"));
        workflow.add(pick("b"));
        let ids: Vec<&str> = workflow
            .referenced_labware()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn saves_and_loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let mut workflow = Workflow::new("w").with_description("round trip");
        workflow.push(WorkflowEntry::new(pick("a")).with_channels(8));
        workflow.save_json(&path).unwrap();

        let loaded = Workflow::load_json(&path).unwrap();
        assert_eq!(loaded, workflow);
    }

    #[test]
    fn progress_counts_completed_operations() {
        let mut workflow = Workflow::new("w");
        workflow.add(pick("a"));
        workflow.add(pick("b"));
        let mut result = WorkflowResult::new(&workflow);
        result.operations_completed = 1;
        assert_eq!(result.progress_percent(), 50.0);

        result.status = WorkflowStatus::Running;
        let progress = result.progress("w", 1);
        assert_eq!(progress.status, WorkflowStatus::Running);
        assert_eq!(progress.progress_percent(), 50.0);
    }
}

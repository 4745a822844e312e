//! Task and progress ledgers
//!
//! Two append-only projections ride alongside the event stream:
//! [`TaskLedger`] records the plan the planning phase produced, sealed by a
//! content hash for integrity verification; [`ProgressLedger`] records what
//! actually happened, entry by entry, and feeds the loop detector its
//! observation window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{Result, WorkflowError};

/// Lifecycle status of a planned task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// One planned unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Ids of tasks that must complete first
    pub dependencies: Vec<String>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Bitmask of capabilities the executing agent must have
    pub required_capabilities: u64,
}

/// Immutable plan projection with integrity hash
///
/// The hash covers the original request plus the ordered task ids and
/// descriptions, so any tampering or reordering is detectable via
/// [`TaskLedger::verify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub original_request: String,
    pub tasks: Vec<TaskEntry>,
    pub content_hash: String,
}

impl TaskLedger {
    pub fn new(original_request: impl Into<String>, tasks: Vec<TaskEntry>) -> Self {
        let original_request = original_request.into();
        let content_hash = Self::hash(&original_request, &tasks);
        Self {
            original_request,
            tasks,
            content_hash,
        }
    }

    fn hash(request: &str, tasks: &[TaskEntry]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.as_bytes());
        hasher.update([0u8]);
        for task in tasks {
            hasher.update(task.id.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0u8]);
        for task in tasks {
            hasher.update(task.description.as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }

    /// Recompute the content hash and compare
    pub fn verify(&self) -> bool {
        Self::hash(&self.original_request, &self.tasks) == self.content_hash
    }

    /// Append a task, producing a new ledger with a fresh hash
    pub fn with_task(&self, task: TaskEntry) -> Self {
        let mut tasks = self.tasks.clone();
        tasks.push(task);
        Self::new(self.original_request.clone(), tasks)
    }

    /// Update one task's status, producing a new ledger
    pub fn with_status(&self, task_id: &str, status: TaskStatus) -> Result<Self> {
        let mut tasks = self.tasks.clone();
        let task = tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("task '{task_id}'")))?;
        task.status = status;
        Ok(Self::new(self.original_request.clone(), tasks))
    }

    /// Tasks whose dependencies have all completed
    pub fn ready(&self) -> Vec<&TaskEntry> {
        let completed: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        self.tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies.iter().all(|dep| completed.contains(dep.as_str()))
            })
            .collect()
    }
}

/// Typed outcome signal attached to a progress entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSignal {
    Success,
    Failure,
    HelpNeeded,
    Blocked,
    InProgress,
}

/// One observed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    /// Short action label, e.g. the step name
    pub action: String,
    pub output: String,
    pub tokens: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<ProgressSignal>,
    pub progress_made: bool,
}

impl ProgressEntry {
    pub fn new(timestamp: DateTime<Utc>, action: impl Into<String>) -> Self {
        Self {
            timestamp,
            action: action.into(),
            output: String::new(),
            tokens: 0,
            duration_ms: 0,
            artifacts: Vec::new(),
            signal: None,
            progress_made: true,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_signal(mut self, signal: ProgressSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_progress_made(mut self, progress_made: bool) -> Self {
        self.progress_made = progress_made;
        self
    }

    pub fn with_artifact(mut self, uri: impl Into<String>) -> Self {
        self.artifacts.push(uri.into());
        self
    }
}

/// Derived totals over a progress ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMetrics {
    pub entries: usize,
    pub total_tokens: u64,
    pub total_duration_ms: u64,
    pub successes: usize,
    pub failures: usize,
    pub unique_artifacts: usize,
}

/// Append-only execution history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressLedger {
    pub entries: Vec<ProgressEntry>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ProgressEntry) {
        self.entries.push(entry);
    }

    /// The most recent `window` entries, oldest first
    pub fn recent(&self, window: usize) -> &[ProgressEntry] {
        let start = self.entries.len().saturating_sub(window);
        &self.entries[start..]
    }

    pub fn metrics(&self) -> ProgressMetrics {
        let unique_artifacts: HashSet<&str> = self
            .entries
            .iter()
            .flat_map(|e| e.artifacts.iter().map(String::as_str))
            .collect();
        ProgressMetrics {
            entries: self.entries.len(),
            total_tokens: self.entries.iter().map(|e| e.tokens).sum(),
            total_duration_ms: self.entries.iter().map(|e| e.duration_ms).sum(),
            successes: self
                .entries
                .iter()
                .filter(|e| e.signal == Some(ProgressSignal::Success))
                .count(),
            failures: self
                .entries
                .iter()
                .filter(|e| e.signal == Some(ProgressSignal::Failure))
                .count(),
            unique_artifacts: unique_artifacts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> TaskEntry {
        TaskEntry {
            id: id.to_string(),
            description: format!("task {id}"),
            status: TaskStatus::Pending,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: 1,
            deadline: None,
            required_capabilities: 0,
        }
    }

    #[test]
    fn test_content_hash_verifies_and_detects_tampering() {
        let ledger = TaskLedger::new("build a report", vec![task("t1", &[]), task("t2", &["t1"])]);
        assert!(ledger.verify());

        let mut tampered = ledger.clone();
        tampered.tasks[0].description = "something else".to_string();
        assert!(!tampered.verify());

        let mut reordered = ledger.clone();
        reordered.tasks.reverse();
        assert!(!reordered.verify());
    }

    #[test]
    fn test_ready_respects_dependencies() {
        let ledger = TaskLedger::new("plan", vec![task("t1", &[]), task("t2", &["t1"])]);
        let ready: Vec<&str> = ledger.ready().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["t1"]);

        let ledger = ledger.with_status("t1", TaskStatus::Completed).unwrap();
        let ready: Vec<&str> = ledger.ready().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ready, vec!["t2"]);
        assert!(ledger.verify());
    }

    #[test]
    fn test_progress_metrics() {
        let now = Utc::now();
        let mut ledger = ProgressLedger::new();
        ledger.append(
            ProgressEntry::new(now, "plan")
                .with_tokens(100)
                .with_duration_ms(50)
                .with_signal(ProgressSignal::Success)
                .with_artifact("artifact://reports/a"),
        );
        ledger.append(
            ProgressEntry::new(now, "execute")
                .with_tokens(300)
                .with_duration_ms(75)
                .with_signal(ProgressSignal::Failure)
                .with_artifact("artifact://reports/a"),
        );

        let metrics = ledger.metrics();
        assert_eq!(metrics.entries, 2);
        assert_eq!(metrics.total_tokens, 400);
        assert_eq!(metrics.total_duration_ms, 125);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.unique_artifacts, 1);
    }

    #[test]
    fn test_recent_window() {
        let now = Utc::now();
        let mut ledger = ProgressLedger::new();
        for i in 0..8 {
            ledger.append(ProgressEntry::new(now, format!("a{i}")));
        }
        let recent = ledger.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].action, "a3");
        assert_eq!(recent[4].action, "a7");
    }
}

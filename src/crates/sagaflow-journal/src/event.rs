//! Persisted workflow event model
//!
//! Every observable transition of a workflow instance is recorded as a
//! [`WorkflowEvent`] wrapped in an [`EventEnvelope`]. Within one instance the
//! envelopes form a contiguous, gap-free version sequence starting at 1; the
//! envelope fields (`workflow_id`, `version`, `committed_at` and the event
//! `type` tag) are wire-stable, while inner event fields may evolve under
//! additive rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a workflow instance (UUID v4 rendered as a string)
pub type WorkflowId = String;

/// Lifecycle phase of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Created,
    Running,
    AwaitingApproval,
    Compensating,
    Completed,
    Failed,
}

impl WorkflowPhase {
    /// Phases from which no further tick will be scheduled
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Created => "created",
            WorkflowPhase::Running => "running",
            WorkflowPhase::AwaitingApproval => "awaiting_approval",
            WorkflowPhase::Compensating => "compensating",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }
}

/// Final outcome of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Success,
    Failed,
    Cancelled,
    Rejected,
    TimedOut,
}

impl WorkflowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowOutcome::Success => "success",
            WorkflowOutcome::Failed => "failed",
            WorkflowOutcome::Cancelled => "cancelled",
            WorkflowOutcome::Rejected => "rejected",
            WorkflowOutcome::TimedOut => "timed_out",
        }
    }
}

/// Terminal status of one fork path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    /// Path ran to completion
    Success,
    /// Path failed terminally; it contributes no state to the join
    Failed,
    /// Path failed but its failure handler ran to completion
    FailedWithRecovery,
}

/// Human decision delivered to a pending approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        option: Option<String>,
    },
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Escalate,
}

/// Classified loop shape reported by the loop detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    ExactRepetition,
    SemanticRepetition,
    Oscillation,
    NoProgress,
}

/// Recovery action recommended for a detected loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    InjectVariation,
    ForceRotation,
    Synthesize,
    Decompose,
    Escalate,
}

/// One persisted workflow event
///
/// `StepCompleted` carries the sparse state update the step produced so that
/// replaying the stream through the reducer rebuilds the exact state the
/// engine held in memory. `PathCompleted` likewise carries the path's
/// accumulated update (absent for failed paths).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow: String,
        namespace: String,
        /// Initial state the instance was started with; replay seeds from it
        #[serde(default)]
        initial: Value,
    },
    PhaseChanged {
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
    StepCompleted {
        step_id: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<String>,
        update: Value,
    },
    BranchTaken {
        branch_id: String,
        case: String,
    },
    LoopIterationCompleted {
        loop_name: String,
        iteration: u32,
    },
    LoopLimitReached {
        loop_name: String,
    },
    PathCompleted {
        path_index: usize,
        status: PathStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<Value>,
    },
    ApprovalRequested {
        approver: String,
        options: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    ApprovalReceived {
        decision: ApprovalDecision,
    },
    ApprovalTimedOut,
    ExecutionFailed {
        step_id: String,
        reason: String,
        recoverable: bool,
    },
    LoopDetected {
        loop_kind: LoopKind,
        confidence: f64,
        strategy: RecoveryStrategy,
    },
    RecoveryStrategyApplied {
        strategy: RecoveryStrategy,
        loop_kind: LoopKind,
        action: String,
    },
    TaskPlanned {
        id: String,
        description: String,
        priority: u8,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dependencies: Vec<String>,
    },
    TaskCompleted {
        id: String,
        final_status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    WorkflowCompleted {
        outcome: WorkflowOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        final_answer: Option<String>,
        total_duration_ms: u64,
    },
}

impl WorkflowEvent {
    /// Short human-readable description, used in logs
    pub fn description(&self) -> String {
        match self {
            WorkflowEvent::WorkflowStarted {
                workflow, namespace, ..
            } => {
                format!("workflow started: {namespace}/{workflow}")
            }
            WorkflowEvent::PhaseChanged { from, to } => {
                format!("phase {} -> {}", from.as_str(), to.as_str())
            }
            WorkflowEvent::StepCompleted { step_id, duration_ms, .. } => {
                format!("step completed: {step_id} ({duration_ms}ms)")
            }
            WorkflowEvent::BranchTaken { branch_id, case } => {
                format!("branch {branch_id} took case '{case}'")
            }
            WorkflowEvent::LoopIterationCompleted { loop_name, iteration } => {
                format!("loop {loop_name} iteration {iteration}")
            }
            WorkflowEvent::LoopLimitReached { loop_name } => {
                format!("loop {loop_name} hit its iteration limit")
            }
            WorkflowEvent::PathCompleted { path_index, status, .. } => {
                format!("fork path {path_index} completed: {status:?}")
            }
            WorkflowEvent::ApprovalRequested { approver, .. } => {
                format!("approval requested from {approver}")
            }
            WorkflowEvent::ApprovalReceived { decision } => {
                format!("approval received: {decision:?}")
            }
            WorkflowEvent::ApprovalTimedOut => "approval timed out".to_string(),
            WorkflowEvent::ExecutionFailed { step_id, reason, .. } => {
                format!("step {step_id} failed: {reason}")
            }
            WorkflowEvent::LoopDetected { loop_kind, confidence, .. } => {
                format!("loop detected: {loop_kind:?} (confidence {confidence:.2})")
            }
            WorkflowEvent::RecoveryStrategyApplied { strategy, .. } => {
                format!("recovery strategy applied: {strategy:?}")
            }
            WorkflowEvent::TaskPlanned { id, .. } => format!("task planned: {id}"),
            WorkflowEvent::TaskCompleted { id, final_status, .. } => {
                format!("task {id} completed: {final_status}")
            }
            WorkflowEvent::WorkflowCompleted { outcome, .. } => {
                format!("workflow completed: {}", outcome.as_str())
            }
        }
    }
}

/// A committed event with its position in the instance stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub workflow_id: WorkflowId,
    /// 1-based, contiguous within the instance
    pub version: u64,
    pub event: WorkflowEvent,
    pub committed_at: DateTime<Utc>,
}

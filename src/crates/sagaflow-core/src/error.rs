//! Error types and transience classification for workflow execution
//!
//! Every failure the engine can observe is a [`WorkflowError`] kind. The
//! retry machinery only looks at [`WorkflowError::is_transient`]: transient
//! kinds are retried with backoff up to the policy's attempt limit, fatal
//! kinds skip retries and go straight to the nearest failure handler.

use sagaflow_journal::{JournalError, LoopKind};
use thiserror::Error;

/// Convenience result type using [`WorkflowError`]
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// All error kinds surfaced by the engine or returned by steps
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Inputs violated a precondition; never retried
    #[error("validation failed: {0}")]
    Validation(String),

    /// An artifact, instance or graph is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-lock failure on the instance version; the engine retries
    /// the whole tick
    #[error("version conflict for workflow '{workflow_id}': expected {expected}, found {found}")]
    Conflict {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    /// A budget reservation would take a dimension negative
    #[error("budget exhausted: {dimension}")]
    BudgetExhausted { dimension: String },

    /// External service back-pressure; retried with backoff
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transport failure reaching an external collaborator
    #[error("network error: {0}")]
    Network(String),

    /// An operation exceeded its time limit
    #[error("operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Upstream gateway failure; transient
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// External service is temporarily down; transient
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Opaque upstream failure classified by the caller's policy
    #[error("external failure: {0}")]
    External(String),

    /// Branch discriminator produced a value with no matching case
    #[error("no matching branch case in '{branch}' for discriminant '{discriminant}'")]
    NoMatchingBranch { branch: String, discriminant: String },

    /// Engine-initiated abort after the reset budget was spent
    #[error("loop detection aborted workflow: {loop_kind:?} after {resets} resets")]
    LoopDetection { loop_kind: LoopKind, resets: u32 },

    /// Step implementation failed with its own message
    #[error("step '{step}' failed: {reason}")]
    StepExecution { step: String, reason: String },

    /// State reduction failed
    #[error("state error: {0}")]
    State(String),

    /// Persistence layer failure
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// JSON serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The workflow was cancelled cooperatively
    #[error("workflow cancelled")]
    Cancelled,

    /// A bug: surface and stop
    #[error("internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    /// Whether the retry policy may re-attempt after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WorkflowError::RateLimited(_)
                | WorkflowError::Network(_)
                | WorkflowError::Timeout { .. }
                | WorkflowError::BadGateway(_)
                | WorkflowError::ServiceUnavailable(_)
                | WorkflowError::External(_)
        )
    }

    /// Helper constructor for step failures
    pub fn step(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable kind tag, recorded in failure events
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Conflict { .. } => "conflict",
            WorkflowError::BudgetExhausted { .. } => "budget_exhausted",
            WorkflowError::RateLimited(_) => "rate_limited",
            WorkflowError::Network(_) => "network",
            WorkflowError::Timeout { .. } => "timeout",
            WorkflowError::BadGateway(_) => "bad_gateway",
            WorkflowError::ServiceUnavailable(_) => "service_unavailable",
            WorkflowError::External(_) => "external",
            WorkflowError::NoMatchingBranch { .. } => "no_matching_branch",
            WorkflowError::LoopDetection { .. } => "loop_detection",
            WorkflowError::StepExecution { .. } => "step_execution",
            WorkflowError::State(_) => "state",
            WorkflowError::Journal(_) => "journal",
            WorkflowError::Serialization(_) => "serialization",
            WorkflowError::Cancelled => "cancelled",
            WorkflowError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transience_classification() {
        assert!(WorkflowError::Network("reset".into()).is_transient());
        assert!(WorkflowError::RateLimited("429".into()).is_transient());
        assert!(WorkflowError::Timeout {
            operation: "llm call".into(),
            duration_ms: 5000
        }
        .is_transient());
        assert!(WorkflowError::ServiceUnavailable("503".into()).is_transient());

        assert!(!WorkflowError::Validation("bad input".into()).is_transient());
        assert!(!WorkflowError::NotFound("missing".into()).is_transient());
        assert!(!WorkflowError::BudgetExhausted {
            dimension: "tokens".into()
        }
        .is_transient());
        assert!(!WorkflowError::Internal("bug".into()).is_transient());
    }

    #[test]
    fn test_journal_conflict_maps_through() {
        let err: WorkflowError = JournalError::Conflict {
            workflow_id: "wf".into(),
            expected: 3,
            found: 4,
        }
        .into();
        assert_eq!(err.kind(), "journal");
        assert!(!err.is_transient());
    }
}

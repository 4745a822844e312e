//! Step implementation interface
//!
//! A step is the unit of user work: it reads the current state and returns a
//! sparse [`StateUpdate`] plus optional emitted events, progress telemetry
//! and artifact references. Steps never invoke the engine; control flow is
//! entirely the graph's business. The step universe is fixed at graph-build
//! time through a [`StepRegistry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use sagaflow_journal::{CancelSignal, PathStatus, WorkflowEvent};

use crate::budget::BudgetDimensions;
use crate::error::{Result, WorkflowError};
use crate::ledger::ProgressEntry;
use crate::state::{StateUpdate, WorkflowState};

/// Outcome of one fork path, delivered to the join step in path-index order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathResult {
    pub index: usize,
    pub status: PathStatus,
    /// Accumulated update of the path; `None` for failed paths, which cannot
    /// participate in a merge
    pub state: Option<StateUpdate>,
}

/// Ordered path results handed to a join step
///
/// The join's implementation owns the merge policy: it may fold successful
/// deltas, fail the workflow, or anything between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkContext {
    pub results: Vec<PathResult>,
}

impl ForkContext {
    pub fn successes(&self) -> impl Iterator<Item = &PathResult> {
        self.results
            .iter()
            .filter(|r| r.status != PathStatus::Failed)
    }

    pub fn failed_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.status == PathStatus::Failed)
            .count()
    }
}

/// Per-invocation context handed to a step
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_name: String,
    /// Unique per invocation attempt
    pub invocation_id: String,
    /// Stable across retries of the same dispatch
    pub correlation_id: String,
    /// 1-based attempt counter under the retry policy
    pub attempt: u32,
    pub cancel: CancelSignal,
    /// Present only when this step is a fork join
    pub fork: Option<ForkContext>,
}

/// What a step hands back to the engine
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    /// Sparse state update folded in by the reducer
    pub update: StateUpdate,
    /// Domain events appended verbatim after the step's own events
    pub events: Vec<WorkflowEvent>,
    /// Progress telemetry feeding the loop detector
    pub progress: Option<ProgressEntry>,
    /// Tokens consumed, committed against the budget
    pub tokens: Option<u64>,
    /// Tool invocations made, committed against the budget
    pub tool_calls: u64,
    /// Claim-check references produced by this step
    pub artifacts: Vec<String>,
    /// Final answer, recorded when this step completes the workflow
    pub final_answer: Option<String>,
}

impl StepResult {
    pub fn new(update: StateUpdate) -> Self {
        Self {
            update,
            ..Self::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_event(mut self, event: WorkflowEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_progress(mut self, progress: ProgressEntry) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_artifact(mut self, uri: impl Into<String>) -> Self {
        self.artifacts.push(uri.into());
        self
    }

    pub fn with_final_answer(mut self, answer: impl Into<String>) -> Self {
        self.final_answer = Some(answer.into());
        self
    }
}

/// A user-defined unit of work
#[async_trait]
pub trait Step: Send + Sync {
    /// Execute against an immutable state snapshot
    ///
    /// Implementations should check `ctx.cancel` at their I/O boundaries and
    /// return structured [`WorkflowError`] kinds so the retry policy can
    /// classify failures.
    async fn execute(&self, state: &WorkflowState, ctx: &StepContext) -> Result<StepResult>;

    /// Budget the engine reserves before dispatching this step
    fn budget_estimate(&self) -> BudgetDimensions {
        BudgetDimensions::single_step()
    }

    /// State fields contributing to the cache fingerprint; `None` uses the
    /// whole state
    fn fingerprint_fields(&self) -> Option<Vec<String>> {
        None
    }
}

/// Adapter turning an async closure into a [`Step`]
struct FnStep<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(WorkflowState, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult>> + Send + 'static,
{
    async fn execute(&self, state: &WorkflowState, ctx: &StepContext) -> Result<StepResult> {
        (self.func)(state.clone(), ctx.clone()).await
    }
}

/// Wrap an async closure as a step implementation
pub fn from_fn<F, Fut>(func: F) -> Arc<dyn Step>
where
    F: Fn(WorkflowState, StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepResult>> + Send + 'static,
{
    Arc::new(FnStep { func })
}

/// Registry of step implementations, fixed at graph-build time
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step_type: impl Into<String>, step: Arc<dyn Step>) {
        self.steps.insert(step_type.into(), step);
    }

    /// Builder-style registration of a closure step
    pub fn with_fn<F, Fut>(mut self, step_type: impl Into<String>, func: F) -> Self
    where
        F: Fn(WorkflowState, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult>> + Send + 'static,
    {
        self.register(step_type, from_fn(func));
        self
    }

    pub fn get(&self, step_type: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(step_type)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("step type '{step_type}'")))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> StepContext {
        StepContext {
            workflow_id: "wf".to_string(),
            step_name: "double".to_string(),
            invocation_id: "inv-1".to_string(),
            correlation_id: "corr-1".to_string(),
            attempt: 1,
            cancel: CancelSignal::never(),
            fork: None,
        }
    }

    #[tokio::test]
    async fn test_fn_step_executes() {
        let step = from_fn(|state: WorkflowState, _ctx| async move {
            let current = state.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(StepResult::new(StateUpdate::new().set("x", json!(current * 2))))
        });

        let state = WorkflowState::new("wf", json!({"x": 21})).unwrap();
        let result = step.execute(&state, &ctx()).await.unwrap();
        assert_eq!(result.update.get("x"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = StepRegistry::new()
            .with_fn("noop", |_state, _ctx| async { Ok(StepResult::empty()) });

        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(WorkflowError::NotFound(_))
        ));
    }

    #[test]
    fn test_fork_context_partitions() {
        let fork = ForkContext {
            results: vec![
                PathResult {
                    index: 0,
                    status: PathStatus::Success,
                    state: Some(StateUpdate::new().set("a", json!(1))),
                },
                PathResult {
                    index: 1,
                    status: PathStatus::Failed,
                    state: None,
                },
                PathResult {
                    index: 2,
                    status: PathStatus::FailedWithRecovery,
                    state: Some(StateUpdate::new()),
                },
            ],
        };
        assert_eq!(fork.successes().count(), 2);
        assert_eq!(fork.failed_count(), 1);
    }
}

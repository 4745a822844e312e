//! End-to-end engine scenarios over the in-memory journal
//!
//! Every test drives a real engine through the outbox dispatcher with a
//! manual clock, then asserts on the committed event stream and the
//! persisted instance.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;

use sagaflow_core::builder::{ApprovalSpec, Sequence, WorkflowBuilder};
use sagaflow_core::budget::{BudgetConfig, BudgetDimensions, ScarcityLevel};
use sagaflow_core::detector::SemanticSimilarityCalculator;
use sagaflow_core::engine::{EngineCommand, EngineConfig, EngineStores, SagaEngine};
use sagaflow_core::error::WorkflowError;
use sagaflow_core::graph::CompiledWorkflow;
use sagaflow_core::state::{FieldShape, MergeRule, StateSchema, StateUpdate};
use sagaflow_core::step::{StepRegistry, StepResult};
use sagaflow_journal::{
    ApprovalDecision, Clock, EventEnvelope, EventStore, ManualClock, MemoryJournal, OutboxStore,
    PathStatus, WorkflowEvent, WorkflowOutcome, WorkflowPhase,
};

fn schema() -> Arc<StateSchema> {
    let mut schema = StateSchema::new("scenario");
    schema
        .add_field("logs", FieldShape::Sequence, MergeRule::Append)
        .unwrap();
    schema
        .add_field("meta", FieldShape::Mapping, MergeRule::Merge)
        .unwrap();
    Arc::new(schema)
}

struct Harness {
    engine: SagaEngine,
    journal: Arc<MemoryJournal>,
    clock: Arc<ManualClock>,
}

fn harness(registry: StepRegistry, config: EngineConfig) -> Harness {
    let clock = Arc::new(ManualClock::from_system());
    let journal = Arc::new(MemoryJournal::with_clock(clock.clone()));
    let stores = EngineStores::in_memory(journal.clone(), clock.clone());
    let engine = SagaEngine::new(stores, registry, config).unwrap();
    Harness {
        engine,
        journal,
        clock,
    }
}

async fn events_of(journal: &MemoryJournal, workflow_id: &str) -> Vec<EventEnvelope> {
    journal.read(workflow_id, None).await.unwrap()
}

fn kinds(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .map(|envelope| {
            serde_json::to_value(&envelope.event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

fn completed_steps(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .filter_map(|envelope| match &envelope.event {
            WorkflowEvent::StepCompleted { step_id, .. } => Some(step_id.clone()),
            _ => None,
        })
        .collect()
}

fn outcome_of(events: &[EventEnvelope]) -> Option<WorkflowOutcome> {
    events.iter().rev().find_map(|envelope| match &envelope.event {
        WorkflowEvent::WorkflowCompleted { outcome, .. } => Some(*outcome),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Scenario 1: happy path
// ---------------------------------------------------------------------------

fn linear_registry() -> StepRegistry {
    StepRegistry::new()
        .with_fn("a", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("x", json!(1))))
        })
        .with_fn("b", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("logs", json!(["b"]))))
        })
        .with_fn("c", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("complete", json!(true))))
        })
}

fn linear_graph() -> CompiledWorkflow {
    WorkflowBuilder::new("tests", "linear", schema())
        .step("a")
        .step("b")
        .terminal_step("c")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_happy_path_linear_workflow() {
    let h = harness(linear_registry(), EngineConfig::default());
    h.engine.register(linear_graph());

    let wf = h
        .engine
        .start_workflow("tests", "linear", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("x"), Some(&json!(1)));
    assert_eq!(state.get("logs"), Some(&json!(["b"])));
    assert_eq!(state.get("complete"), Some(&json!(true)));

    let events = events_of(&h.journal, &wf).await;
    assert_eq!(
        kinds(&events),
        vec![
            "workflow_started",
            "phase_changed",
            "step_completed",
            "step_completed",
            "step_completed",
            "phase_changed",
            "workflow_completed",
        ]
    );
    assert_eq!(completed_steps(&events), vec!["a", "b", "c"]);
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));

    // Versions form a contiguous 1..N sequence.
    for (index, envelope) in events.iter().enumerate() {
        assert_eq!(envelope.version, index as u64 + 1);
    }

    // Event-sourced determinism: replay equals the engine's state.
    let rebuilt = h.engine.rebuild_state(&wf, None).await.unwrap();
    assert_eq!(rebuilt.fields, state.fields);
}

// ---------------------------------------------------------------------------
// Scenario 2: crash-recovery through the outbox
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_crash_recovery_resumes_from_outbox() {
    let clock = Arc::new(ManualClock::from_system());
    let journal = Arc::new(MemoryJournal::with_clock(clock.clone()));

    let wf = {
        let stores = EngineStores::in_memory(journal.clone(), clock.clone());
        let engine = SagaEngine::new(stores, linear_registry(), EngineConfig::default()).unwrap();
        engine.register(linear_graph());
        let wf = engine
            .start_workflow("tests", "linear", json!({}))
            .await
            .unwrap();
        // Advance through a and b, then "crash" with c still queued.
        engine.pump().await.unwrap();
        engine.pump().await.unwrap();
        wf
    };

    assert_eq!(
        completed_steps(&events_of(&journal, &wf).await),
        vec!["a", "b"]
    );

    // A fresh engine process over the same journal picks up the queued
    // command.
    let stores = EngineStores::in_memory(journal.clone(), clock.clone());
    let engine = SagaEngine::new(stores, linear_registry(), EngineConfig::default()).unwrap();
    engine.register(linear_graph());
    engine.run_until_idle().await.unwrap();

    let events = events_of(&journal, &wf).await;
    assert_eq!(completed_steps(&events), vec!["a", "b", "c"]);
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));

    let state = engine.state(&wf).await.unwrap();
    assert_eq!(state.get("x"), Some(&json!(1)));
    assert_eq!(state.get("logs"), Some(&json!(["b"])));
    assert_eq!(state.get("complete"), Some(&json!(true)));
}

#[tokio::test]
async fn test_duplicate_command_delivery_is_idempotent() {
    let h = harness(linear_registry(), EngineConfig::default());
    h.engine.register(linear_graph());

    let wf = h
        .engine
        .start_workflow("tests", "linear", json!({}))
        .await
        .unwrap();
    // Step a completes and enqueues the command for b.
    h.engine.pump().await.unwrap();

    // Play dispatcher by hand: lease b's command and deliver it twice, as a
    // dispatcher that crashed between handling and completion would.
    let leased = h
        .journal
        .lease(h.clock.now(), chrono::Duration::seconds(30), 10)
        .await
        .unwrap();
    assert_eq!(leased.len(), 1);
    let command: EngineCommand = serde_json::from_value(leased[0].command.clone()).unwrap();
    assert!(matches!(command, EngineCommand::Execute { .. }));

    h.engine.handle(&wf, command.clone()).await.unwrap();
    h.engine.handle(&wf, command).await.unwrap();
    h.journal.complete(&leased[0].id).await.unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    let completions = completed_steps(&events);
    let b_completions = completions.iter().filter(|step| *step == "b").count();
    assert_eq!(b_completions, 1);
    // The append field was applied exactly once.
    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("logs"), Some(&json!(["b"])));
    assert_eq!(completions, vec!["a", "b", "c"]);
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
}

// ---------------------------------------------------------------------------
// Scenario 3: loop limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_loop_exits_at_max_iterations() {
    let registry = StepRegistry::new()
        .with_fn("gen", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("logs", json!(["gen"]))))
        })
        .with_fn("test", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("logs", json!(["test"]))))
        })
        .with_fn("wrap_up", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("done", json!(true))))
        });

    let graph = WorkflowBuilder::new("tests", "loopy", schema())
        .step("gen")
        .repeat_until(
            "refine",
            Sequence::new().named_step("gen", "gen_again").step("test"),
            |state| state.get("passed").and_then(|v| v.as_bool()).unwrap_or(false),
            3,
        )
        .terminal_step("wrap_up")
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "loopy", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    let iterations = events
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::LoopIterationCompleted { .. }))
        .count();
    let limits = events
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::LoopLimitReached { .. }))
        .count();

    assert_eq!(iterations, 3);
    assert_eq!(limits, 1);
    // The continuation runs after the limit; outcome is whatever downstream
    // decides, success here.
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("done"), Some(&json!(true)));
}

// ---------------------------------------------------------------------------
// Scenario 4: semantic loop detection
// ---------------------------------------------------------------------------

struct FixedSimilarity(f64);

impl SemanticSimilarityCalculator for FixedSimilarity {
    fn max_pairwise_similarity(&self, _outputs: &[String]) -> f64 {
        self.0
    }
}

fn chain_registry() -> StepRegistry {
    StepRegistry::new().with_fn("work", |_state, _ctx| async {
        Ok(StepResult::new(StateUpdate::new().set("logs", json!(["worked"]))))
    })
}

fn chain_graph(name: &str, steps: usize) -> CompiledWorkflow {
    let mut builder = WorkflowBuilder::new("tests", name, schema());
    for i in 0..steps - 1 {
        builder = builder.named_step("work", format!("s{i:02}"));
    }
    builder.named_step("work", "final").build().unwrap()
}

#[tokio::test]
async fn test_semantic_loop_detection_applies_strategy() {
    let clock = Arc::new(ManualClock::from_system());
    let journal = Arc::new(MemoryJournal::with_clock(clock.clone()));
    let stores = EngineStores::in_memory(journal.clone(), clock.clone());
    let engine = SagaEngine::with_similarity(
        stores,
        chain_registry(),
        EngineConfig::default(),
        Box::new(FixedSimilarity(0.9)),
    )
    .unwrap();
    engine.register(chain_graph("drift", 7));

    let wf = engine
        .start_workflow("tests", "drift", json!({}))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    let events = events_of(&journal, &wf).await;
    let detected: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::LoopDetected {
                loop_kind,
                strategy,
                confidence,
            } => Some((*loop_kind, *strategy, *confidence)),
            _ => None,
        })
        .collect();

    assert_eq!(detected.len(), 1);
    let (kind, strategy, confidence) = detected[0];
    assert_eq!(kind, sagaflow_journal::LoopKind::SemanticRepetition);
    assert_eq!(strategy, sagaflow_journal::RecoveryStrategy::ForceRotation);
    assert!(confidence >= 0.85);
    assert!(events
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::RecoveryStrategyApplied { .. })));
    // One reset is within budget; the workflow still completes.
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
}

#[tokio::test]
async fn test_loop_detection_aborts_after_max_resets() {
    let clock = Arc::new(ManualClock::from_system());
    let journal = Arc::new(MemoryJournal::with_clock(clock.clone()));
    let stores = EngineStores::in_memory(journal.clone(), clock.clone());
    let engine = SagaEngine::with_similarity(
        stores,
        chain_registry(),
        EngineConfig::default(),
        Box::new(FixedSimilarity(0.95)),
    )
    .unwrap();
    // Four full detector windows: resets 1, 2, 3, then the fatal fourth.
    engine.register(chain_graph("spiral", 20));

    let wf = engine
        .start_workflow("tests", "spiral", json!({}))
        .await
        .unwrap();
    engine.run_until_idle().await.unwrap();

    let events = events_of(&journal, &wf).await;
    let detections = events
        .iter()
        .filter(|e| matches!(e.event, WorkflowEvent::LoopDetected { .. }))
        .count();
    assert_eq!(detections, 4);
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Failed));
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ExecutionFailed { reason, .. } if reason.contains("loop detection")
    )));
}

// ---------------------------------------------------------------------------
// Scenario 5: approval timeout
// ---------------------------------------------------------------------------

fn approval_graph(timeout: Option<chrono::Duration>) -> CompiledWorkflow {
    let mut spec = ApprovalSpec::new("sign_off", "lead", vec!["approve", "reject"]);
    if let Some(timeout) = timeout {
        spec = spec.with_timeout(timeout);
    }
    WorkflowBuilder::new("tests", "gated", schema())
        .step("draft")
        .approval(spec)
        .terminal_step("publish")
        .build()
        .unwrap()
}

fn approval_registry() -> StepRegistry {
    StepRegistry::new()
        .with_fn("draft", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("draft", json!("v1"))))
        })
        .with_fn("publish", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("published", json!(true))))
        })
        .with_fn("teardown", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("torn_down", json!(true))))
        })
}

#[tokio::test]
async fn test_approval_timeout_terminates_timed_out() {
    let h = harness(
        approval_registry(),
        EngineConfig::default(),
    );
    h.engine
        .register(approval_graph(Some(chrono::Duration::minutes(10))));

    let wf = h
        .engine
        .start_workflow("tests", "gated", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let instance = h.engine.instance(&wf).await.unwrap();
    assert_eq!(instance.phase, WorkflowPhase::AwaitingApproval);

    // Nothing fires before the deadline.
    assert_eq!(h.engine.sweep_approval_timeouts().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(h.engine.sweep_approval_timeouts().await.unwrap(), 1);
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::ApprovalTimedOut)));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::TimedOut));
}

#[tokio::test]
async fn test_approval_approve_resumes_main_sequence() {
    let h = harness(approval_registry(), EngineConfig::default());
    h.engine.register(approval_graph(None));

    let wf = h
        .engine
        .start_workflow("tests", "gated", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    h.engine
        .resolve_approval(&wf, ApprovalDecision::Approve { option: None })
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::ApprovalReceived { .. })));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("published"), Some(&json!(true)));
}

#[tokio::test]
async fn test_approval_rejection_runs_rejection_path() {
    let graph = {
        let spec = ApprovalSpec::new("sign_off", "lead", vec!["approve", "reject"])
            .with_rejection(Sequence::new().step("teardown"));
        WorkflowBuilder::new("tests", "gated_reject", schema())
            .step("draft")
            .approval(spec)
            .terminal_step("publish")
            .build()
            .unwrap()
    };

    let h = harness(approval_registry(), EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "gated_reject", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    h.engine
        .resolve_approval(&wf, ApprovalDecision::Reject { reason: Some("nope".into()) })
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(completed_steps(&events).contains(&"teardown".to_string()));
    // The main-sequence publish step never ran.
    assert!(!completed_steps(&events).contains(&"publish".to_string()));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Rejected));
}

// ---------------------------------------------------------------------------
// Scenario 6: fork/join with one failed path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fork_join_merges_successful_paths() {
    let registry = StepRegistry::new()
        .with_fn("start", |_state, _ctx| async { Ok(StepResult::empty()) })
        .with_fn("left", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("logs", json!(["left"]))))
        })
        .with_fn("boom", |_state, _ctx| async {
            Err(WorkflowError::Validation("path two always fails".into()))
        })
        .with_fn("merge", |_state, ctx| async move {
            let fork = ctx.fork.expect("join must receive a fork context");
            assert_eq!(fork.results.len(), 2);
            assert_eq!(fork.results[0].status, PathStatus::Success);
            assert_eq!(fork.results[1].status, PathStatus::Failed);
            assert!(fork.results[1].state.is_none());
            Ok(StepResult::new(StateUpdate::new().set("merged", json!(true))))
        });

    let graph = WorkflowBuilder::new("tests", "forked", schema())
        .step("start")
        .fork(
            "scatter",
            vec![Sequence::new().step("left"), Sequence::new().step("boom")],
            "merge",
        )
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "forked", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    let paths: Vec<(usize, PathStatus)> = events
        .iter()
        .filter_map(|e| match &e.event {
            WorkflowEvent::PathCompleted {
                path_index, status, ..
            } => Some((*path_index, *status)),
            _ => None,
        })
        .collect();
    assert_eq!(paths.len(), 2);
    assert!(paths.contains(&(0, PathStatus::Success)));
    assert!(paths.contains(&(1, PathStatus::Failed)));

    // The join ran exactly once, after both paths landed.
    let merges = completed_steps(&events)
        .into_iter()
        .filter(|s| s == "merge")
        .count();
    assert_eq!(merges, 1);

    // Shared-state application: the successful path's delta is present.
    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("logs"), Some(&json!(["left"])));
    assert_eq!(state.get("merged"), Some(&json!(true)));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
}

// ---------------------------------------------------------------------------
// Branching, retries, budgets, handlers, cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_branch_routes_by_discriminator() {
    let registry = StepRegistry::new()
        .with_fn("classify", |_state, _ctx| async { Ok(StepResult::empty()) })
        .with_fn("fast", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("lane", json!("fast"))))
        })
        .with_fn("slow", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("lane", json!("slow"))))
        })
        .with_fn("finish", |_state, _ctx| async { Ok(StepResult::empty()) });

    let graph = WorkflowBuilder::new("tests", "routed", schema())
        .step("classify")
        .branch(
            "route",
            |state| {
                state
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .unwrap_or("simple")
                    .to_string()
            },
            vec![
                ("simple", Sequence::new().step("fast")),
                ("complex", Sequence::new().step("slow")),
            ],
            true,
        )
        .terminal_step("finish")
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "routed", json!({"kind": "complex"}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::BranchTaken { case, .. } if case == "complex"
    )));
    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("lane"), Some(&json!("slow")));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
}

#[tokio::test]
async fn test_transient_failures_retry_with_backoff() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let registry = StepRegistry::new().with_fn("flaky", move |_state, _ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(WorkflowError::Network("connection reset".into()))
            } else {
                Ok(StepResult::new(StateUpdate::new().set("ok", json!(true))))
            }
        }
    });

    let graph = WorkflowBuilder::new("tests", "flaky", schema())
        .terminal_step("flaky")
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "flaky", json!({}))
        .await
        .unwrap();

    // Each failure schedules a delayed retry; advance past the backoff.
    for _ in 0..3 {
        h.engine.run_until_idle().await.unwrap();
        h.clock.advance(chrono::Duration::seconds(300));
    }
    h.engine.run_until_idle().await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let events = events_of(&h.journal, &wf).await;
    let recoverable_failures = events
        .iter()
        .filter(|e| matches!(
            &e.event,
            WorkflowEvent::ExecutionFailed { recoverable: true, .. }
        ))
        .count();
    assert_eq!(recoverable_failures, 2);
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));

    let instance = h.engine.instance(&wf).await.unwrap();
    assert_eq!(instance.retry_count, 2);
}

#[tokio::test]
async fn test_budget_exhaustion_fails_workflow() {
    let mut config = EngineConfig::default();
    config.budget = BudgetConfig {
        allocation: BudgetDimensions {
            steps: 2,
            tokens: 10_000,
            executions: 10,
            tool_calls: 10,
            wall_seconds: 3_600,
        },
        scarcity: ScarcityLevel::Abundant,
        ..BudgetConfig::default()
    };

    let h = harness(chain_registry(), config);
    h.engine.register(chain_graph("expensive", 4));

    let wf = h
        .engine
        .start_workflow("tests", "expensive", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ExecutionFailed { reason, recoverable: false, .. }
            if reason.contains("budget exhausted")
    )));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Failed));
    // Only the affordable steps completed.
    assert_eq!(completed_steps(&events).len(), 2);
}

#[tokio::test]
async fn test_workflow_failure_handler_runs_and_terminates() {
    let registry = StepRegistry::new()
        .with_fn("risky", |_state, _ctx| async {
            Err(WorkflowError::Validation("bad input".into()))
        })
        .with_fn("cleanup", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("cleaned", json!(true))))
        })
        .with_fn("after", |_state, _ctx| async { Ok(StepResult::empty()) });

    let graph = WorkflowBuilder::new("tests", "handled", schema())
        .step("risky")
        .terminal_step("after")
        .on_failure(vec!["cleanup"], true)
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "handled", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(completed_steps(&events).contains(&"cleanup".to_string()));
    assert!(!completed_steps(&events).contains(&"after".to_string()));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Failed));

    let state = h.engine.state(&wf).await.unwrap();
    assert_eq!(state.get("cleaned"), Some(&json!(true)));
}

#[tokio::test]
async fn test_non_terminal_handler_rejoins_after_failed_step() {
    let registry = StepRegistry::new()
        .with_fn("risky", |_state, _ctx| async {
            Err(WorkflowError::Validation("bad input".into()))
        })
        .with_fn("patch", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("patched", json!(true))))
        })
        .with_fn("after", |_state, _ctx| async {
            Ok(StepResult::new(StateUpdate::new().set("after_ran", json!(true))))
        });

    let graph = WorkflowBuilder::new("tests", "patched", schema())
        .step("risky")
        .terminal_step("after")
        .on_failure(vec!["patch"], false)
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "patched", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(completed_steps(&events).contains(&"patch".to_string()));
    assert!(completed_steps(&events).contains(&"after".to_string()));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Success));
}

#[tokio::test]
async fn test_no_matching_branch_is_fatal() {
    let registry = StepRegistry::new()
        .with_fn("classify", |_state, _ctx| async { Ok(StepResult::empty()) })
        .with_fn("fast", |_state, _ctx| async { Ok(StepResult::empty()) });

    let graph = WorkflowBuilder::new("tests", "no_case", schema())
        .step("classify")
        .branch(
            "route",
            |_state| "unknown".to_string(),
            vec![("known", Sequence::new().step("fast"))],
            true,
        )
        .build()
        .unwrap();

    let h = harness(registry, EngineConfig::default());
    h.engine.register(graph);

    let wf = h
        .engine
        .start_workflow("tests", "no_case", json!({}))
        .await
        .unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert!(events.iter().any(|e| matches!(
        &e.event,
        WorkflowEvent::ExecutionFailed { reason, recoverable: false, .. }
            if reason.contains("no matching branch")
    )));
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Failed));
}

#[tokio::test]
async fn test_cancellation_terminates_with_cancelled_outcome() {
    let h = harness(linear_registry(), EngineConfig::default());
    h.engine.register(linear_graph());

    let wf = h
        .engine
        .start_workflow("tests", "linear", json!({}))
        .await
        .unwrap();
    h.engine.cancel(&wf).await.unwrap();
    h.engine.run_until_idle().await.unwrap();

    let events = events_of(&h.journal, &wf).await;
    assert_eq!(outcome_of(&events), Some(WorkflowOutcome::Cancelled));
    let instance = h.engine.instance(&wf).await.unwrap();
    assert_eq!(instance.phase, WorkflowPhase::Failed);
}

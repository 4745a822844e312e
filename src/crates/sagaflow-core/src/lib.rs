//! # sagaflow-core - durable saga engine for agentic workflow graphs
//!
//! A workflow here is a declaratively built graph of steps that transform an
//! immutable state record while emitting auditable events. The engine
//! guarantees that every instance, once started, advances exactly-once in
//! observable behavior across process restarts - even when individual steps
//! crash mid-execution - by combining:
//!
//! - **event sourcing** with a per-instance, gap-free version sequence,
//! - a **transactional outbox** delivering next-step commands at-least-once,
//! - a **content-addressed step ledger** neutralizing duplicate deliveries,
//! - a **pure reducer** folding sparse updates through per-field merge
//!   rules.
//!
//! ## Crate layout
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`state`] | State algebra: schemas, merge rules, reducer |
//! | [`graph`] | Definition tree and normalized compiled graph |
//! | [`builder`] | Fluent DSL and graph compiler |
//! | [`verify`] | Structural verifier and diagnostics |
//! | [`step`] | Step interface, registry, fork context |
//! | [`cache`] | Step execution ledger (single-flight result cache) |
//! | [`engine`] | The saga engine: ticks, fork/join, loops, approvals |
//! | [`retry`] | Exponential backoff and failure classification |
//! | [`budget`] | Atomic multi-dimensional budget guard |
//! | [`detector`] | Windowed loop detection and recovery strategies |
//! | [`selector`] | Thompson-sampling agent selection |
//! | [`approval`] | Human-approval routing rules |
//! | [`ledger`] | Task and progress projections |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sagaflow_core::builder::WorkflowBuilder;
//! use sagaflow_core::engine::{EngineConfig, EngineStores, SagaEngine};
//! use sagaflow_core::state::{StateSchema, StateUpdate};
//! use sagaflow_core::step::{StepRegistry, StepResult};
//! use sagaflow_journal::{MemoryJournal, SystemClock};
//!
//! # async fn example() -> sagaflow_core::error::Result<()> {
//! let registry = StepRegistry::new().with_fn("greet", |_state, _ctx| async {
//!     Ok(StepResult::new(StateUpdate::new().set("greeting", json!("hello"))))
//! });
//!
//! let graph = WorkflowBuilder::new("demo", "hello", Arc::new(StateSchema::new("hello")))
//!     .terminal_step("greet")
//!     .build()
//!     .expect("valid workflow");
//!
//! let journal = Arc::new(MemoryJournal::new());
//! let stores = EngineStores::in_memory(journal, Arc::new(SystemClock));
//! let engine = SagaEngine::new(stores, registry, EngineConfig::default())?;
//! engine.register(graph);
//!
//! let workflow_id = engine.start_workflow("demo", "hello", json!({})).await?;
//! engine.run_until_idle().await?;
//! let state = engine.state(&workflow_id).await?;
//! assert_eq!(state.get("greeting"), Some(&json!("hello")));
//! # Ok(())
//! # }
//! ```

pub mod approval;
pub mod budget;
pub mod builder;
pub mod cache;
pub mod detector;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod retry;
pub mod selector;
pub mod state;
pub mod step;
pub mod verify;

pub use builder::{ApprovalSpec, Sequence, WorkflowBuilder};
pub use engine::{EngineConfig, EngineStores, SagaEngine, WorkflowInstance};
pub use error::{Result, WorkflowError};
pub use graph::{CompiledWorkflow, WorkflowDefinition};
pub use state::{FieldShape, MergeRule, StateSchema, StateUpdate, WorkflowState};
pub use step::{ForkContext, Step, StepContext, StepRegistry, StepResult};
pub use verify::{Diagnostic, Severity};

// Re-exported so downstream crates depend on one surface for the shared
// event vocabulary.
pub use sagaflow_journal as journal;

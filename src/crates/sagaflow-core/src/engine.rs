//! The durable saga engine
//!
//! [`SagaEngine`] advances workflow instances as a persistent state machine
//! over the journal stores. One **tick** handles one command for one
//! instance: load the instance document, resolve the addressed node in the
//! compiled graph, dispatch it (branch, fork, loop, approval or step), fold
//! the resulting update through the reducer, and commit everything - events,
//! instance document, step-cache writes and the next-step commands - in a
//! single journal transaction. The outbox delivers those commands
//! at-least-once; duplicate deliveries are neutralized by per-command
//! dispatch ids and the step ledger's fingerprints, which together yield
//! exactly-once observable behavior.
//!
//! Concurrency model: parallel across instances, single-writer within an
//! instance. A per-instance advisory lock serializes ticks; fork paths
//! interleave at tick granularity and the join fires only when every path
//! has committed its `PathCompleted` event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sagaflow_journal::{
    next_attempt_at, ApprovalDecision, ApprovalStore, CancelHandle, CancelSignal, Clock, Commit,
    EventStore, MemoryJournal, NewCommand, OutboxStore, PathStatus, PendingApproval, Snapshot,
    SnapshotStore, StepCacheStore, WorkflowEvent, WorkflowId, WorkflowOutcome, WorkflowPhase,
};

use crate::approval::{self, ApprovalRouting};
use crate::budget::{self, BudgetConfig, BudgetDimensions};
use crate::cache::{fingerprint, BuildPermit, Lookup, StepLedger};
use crate::detector::{DetectorConfig, LoopDetector, SemanticSimilarityCalculator};
use crate::error::{Result, WorkflowError};
use crate::graph::{
    CompiledNode, CompiledWorkflow, Continuation, Enclosing, HandlerOwner, NodeId, NodeKind,
};
use crate::ledger::ProgressEntry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::state::{StateUpdate, WorkflowState};
use crate::step::{ForkContext, PathResult, StepContext, StepRegistry};
use crate::verify::Severity;

const DISPATCH_HISTORY: usize = 128;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Snapshot the state every N committed events; 0 disables snapshots
    pub snapshot_interval: u64,
    pub outbox_batch: usize,
    pub outbox_lease_secs: i64,
    pub retry: RetryPolicy,
    pub budget: BudgetConfig,
    pub detector: DetectorConfig,
    /// Soft per-step timeout surfaced to the retry policy
    pub step_timeout_ms: Option<u64>,
    /// Default TTL for step-cache entries
    pub cache_ttl: Option<chrono::Duration>,
    /// Progress entries retained on the instance for the detector
    pub progress_window_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 32,
            outbox_batch: 16,
            outbox_lease_secs: 30,
            retry: RetryPolicy::default(),
            budget: BudgetConfig::default(),
            detector: DetectorConfig::default(),
            step_timeout_ms: None,
            cache_ttl: Some(chrono::Duration::hours(12)),
            progress_window_cap: 64,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;
        self.detector.validate()?;
        Ok(())
    }
}

/// Command delivered through the outbox to advance an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineCommand {
    Execute {
        node: NodeId,
        /// Unique per dispatch; redeliveries carry the same id
        dispatch: String,
        /// Stable across retry attempts of one logical dispatch
        correlation: String,
        attempt: u32,
    },
    Resume {
        decision: ApprovalDecision,
    },
    ApprovalTimeout {
        node: NodeId,
    },
    Cancel,
}

/// Serialized failure-handler scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum HandlerOwnerDoc {
    Workflow,
    ForkPath { fork: NodeId, index: usize },
    LoopBody { loop_node: NodeId },
}

impl From<HandlerOwner> for HandlerOwnerDoc {
    fn from(owner: HandlerOwner) -> Self {
        match owner {
            HandlerOwner::Workflow => HandlerOwnerDoc::Workflow,
            HandlerOwner::ForkPath { fork, index } => HandlerOwnerDoc::ForkPath { fork, index },
            HandlerOwner::LoopBody { loop_node } => HandlerOwnerDoc::LoopBody { loop_node },
        }
    }
}

/// Active failure-handler frame on an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFrame {
    pub owner: HandlerOwnerDoc,
    pub terminal: bool,
    /// The step whose failure triggered the handler; non-terminal handlers
    /// rejoin at its continuation
    pub failed_node: NodeId,
}

/// Per-fork completion tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkProgress {
    pub results: Vec<Option<PathResult>>,
    /// Accumulated state delta per path, combined update by update
    pub deltas: Vec<StateUpdate>,
}

impl ForkProgress {
    fn sized(paths: usize) -> Self {
        Self {
            results: vec![None; paths],
            deltas: vec![StateUpdate::new(); paths],
        }
    }
}

/// The persistent instance document, committed with every tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub workflow_id: WorkflowId,
    pub namespace: String,
    pub workflow: String,
    pub phase: WorkflowPhase,
    pub state: WorkflowState,
    /// Head event version as of the last commit
    pub version: u64,
    pub loop_iterations: HashMap<NodeId, u32>,
    pub forks: HashMap<NodeId, ForkProgress>,
    pub handler: Option<HandlerFrame>,
    /// Remaining budget across all five dimensions
    pub budget: BudgetDimensions,
    /// Total retry re-dispatches so far
    pub retry_count: u32,
    /// Loop-detector recovery rounds consumed
    pub resets: u32,
    pub progress: Vec<ProgressEntry>,
    pub completed_dispatches: VecDeque<String>,
    pub awaiting_approval: Option<NodeId>,
    pub started_at: DateTime<Utc>,
    pub final_answer: Option<String>,
}

/// Store handles the engine runs against
#[derive(Clone)]
pub struct EngineStores {
    pub events: Arc<dyn EventStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub step_cache: Arc<dyn StepCacheStore>,
    pub clock: Arc<dyn Clock>,
}

impl EngineStores {
    /// Every store backed by one in-memory journal
    pub fn in_memory(journal: Arc<MemoryJournal>, clock: Arc<dyn Clock>) -> Self {
        Self {
            events: journal.clone(),
            snapshots: journal.clone(),
            outbox: journal.clone(),
            approvals: journal.clone(),
            step_cache: journal,
            clock,
        }
    }
}

/// Everything one tick wants to persist, accumulated then committed once
#[derive(Default)]
struct Tick {
    events: Vec<WorkflowEvent>,
    enqueue: Vec<NewCommand>,
    cache: Vec<sagaflow_journal::CacheWrite>,
    put_approval: Option<PendingApproval>,
    remove_approval: bool,
    /// Single-flight permits released after the commit lands
    permits: Vec<BuildPermit>,
}

impl Tick {
    fn push_command(
        &mut self,
        command: &EngineCommand,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let doc = serde_json::to_value(command)?;
        self.enqueue.push(NewCommand {
            command: doc,
            not_before,
        });
        Ok(())
    }

    /// Enqueue a fresh first-attempt dispatch of a node
    fn execute(&mut self, node: &str) -> Result<()> {
        self.push_command(
            &EngineCommand::Execute {
                node: node.to_string(),
                dispatch: Uuid::new_v4().to_string(),
                correlation: Uuid::new_v4().to_string(),
                attempt: 1,
            },
            None,
        )
    }

    fn execute_retry(
        &mut self,
        node: &str,
        correlation: &str,
        attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        self.push_command(
            &EngineCommand::Execute {
                node: node.to_string(),
                dispatch: Uuid::new_v4().to_string(),
                correlation: correlation.to_string(),
                attempt,
            },
            Some(not_before),
        )
    }
}

/// The durable saga engine
pub struct SagaEngine {
    graphs: std::sync::RwLock<HashMap<(String, String), Arc<CompiledWorkflow>>>,
    steps: StepRegistry,
    stores: EngineStores,
    ledger: StepLedger,
    detector: LoopDetector,
    config: EngineConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cancels: std::sync::Mutex<HashMap<String, Arc<CancelHandle>>>,
}

impl SagaEngine {
    pub fn new(stores: EngineStores, steps: StepRegistry, config: EngineConfig) -> Result<Self> {
        Self::with_similarity(
            stores,
            steps,
            config,
            Box::new(crate::detector::NullSimilarity),
        )
    }

    pub fn with_similarity(
        stores: EngineStores,
        steps: StepRegistry,
        config: EngineConfig,
        similarity: Box<dyn SemanticSimilarityCalculator>,
    ) -> Result<Self> {
        config.validate()?;
        let ledger = StepLedger::new(
            stores.step_cache.clone(),
            stores.clock.clone(),
            config.cache_ttl,
        );
        let detector = LoopDetector::new(config.detector.clone(), similarity)?;
        Ok(Self {
            graphs: std::sync::RwLock::new(HashMap::new()),
            steps,
            stores,
            ledger,
            detector,
            config,
            locks: Mutex::new(HashMap::new()),
            cancels: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Register a compiled workflow; warnings are logged and kept
    pub fn register(&self, graph: CompiledWorkflow) {
        for warning in &graph.warnings {
            if warning.severity == Severity::Warning {
                warn!(diagnostic = %warning, "workflow verifier warning");
            }
        }
        let key = (graph.namespace.clone(), graph.name.clone());
        self.graphs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(graph));
    }

    fn graph_for(&self, namespace: &str, name: &str) -> Result<Arc<CompiledWorkflow>> {
        self.graphs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow '{namespace}/{name}'")))
    }

    async fn instance_lock(&self, workflow_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn cancel_handle(&self, workflow_id: &str) -> Arc<CancelHandle> {
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(CancelHandle::new()))
            .clone()
    }

    fn cancel_signal(&self, workflow_id: &str) -> CancelSignal {
        self.cancel_handle(workflow_id).signal()
    }

    fn cancel_requested(&self, workflow_id: &str) -> bool {
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels
            .get(workflow_id)
            .map_or(false, |handle| handle.is_cancelled())
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Start a new instance of a registered workflow
    pub async fn start_workflow(
        &self,
        namespace: &str,
        name: &str,
        initial: Value,
    ) -> Result<WorkflowId> {
        let graph = self.graph_for(namespace, name)?;
        let workflow_id = Uuid::new_v4().to_string();
        let state = WorkflowState::new(&workflow_id, initial.clone())?;
        let now = self.stores.clock.now();

        let mut instance = WorkflowInstance {
            workflow_id: workflow_id.clone(),
            namespace: namespace.to_string(),
            workflow: name.to_string(),
            phase: WorkflowPhase::Running,
            state,
            version: 0,
            loop_iterations: HashMap::new(),
            forks: HashMap::new(),
            handler: None,
            budget: self.config.budget.allocation,
            retry_count: 0,
            resets: 0,
            progress: Vec::new(),
            completed_dispatches: VecDeque::new(),
            awaiting_approval: None,
            started_at: now,
            final_answer: None,
        };

        let mut tick = Tick::default();
        tick.events.push(WorkflowEvent::WorkflowStarted {
            workflow: name.to_string(),
            namespace: namespace.to_string(),
            initial,
        });
        tick.events.push(WorkflowEvent::PhaseChanged {
            from: WorkflowPhase::Created,
            to: WorkflowPhase::Running,
        });

        match &graph.entry {
            Some(entry) => tick.execute(entry)?,
            None => self.finalize(&mut instance, &mut tick, WorkflowOutcome::Success),
        }

        self.commit_tick(&mut instance, tick).await?;
        info!(workflow_id = %workflow_id, workflow = %name, "workflow started");
        Ok(workflow_id)
    }

    /// Deliver a human decision to a suspended approval
    pub async fn resolve_approval(
        &self,
        workflow_id: &str,
        decision: ApprovalDecision,
    ) -> Result<()> {
        self.handle(workflow_id, EngineCommand::Resume { decision })
            .await
    }

    /// Request cooperative cancellation of an instance
    pub async fn cancel(&self, workflow_id: &str) -> Result<()> {
        self.cancel_handle(workflow_id).cancel();
        let lock = self.instance_lock(workflow_id).await;
        let _guard = lock.lock().await;
        let mut instance = self.load_instance(workflow_id).await?;
        if instance.phase.is_terminal() {
            return Ok(());
        }
        let mut tick = Tick::default();
        tick.push_command(&EngineCommand::Cancel, None)?;
        self.commit_tick(&mut instance, tick).await
    }

    /// Lease and handle due outbox commands once; returns how many were
    /// leased
    pub async fn pump(&self) -> Result<usize> {
        let now = self.stores.clock.now();
        let lease = chrono::Duration::seconds(self.config.outbox_lease_secs);
        let messages = self
            .stores
            .outbox
            .lease(now, lease, self.config.outbox_batch)
            .await?;
        let count = messages.len();

        for message in messages {
            let command: EngineCommand = match serde_json::from_value(message.command.clone()) {
                Ok(command) => command,
                Err(err) => {
                    warn!(message_id = %message.id, error = %err, "dropping undecodable outbox command");
                    self.stores.outbox.complete(&message.id).await?;
                    continue;
                }
            };
            match self.handle(&message.workflow_id, command).await {
                Ok(()) => self.stores.outbox.complete(&message.id).await?,
                Err(err) => {
                    warn!(
                        workflow_id = %message.workflow_id,
                        message_id = %message.id,
                        attempts = message.attempts,
                        error = %err,
                        "tick failed; re-queueing command"
                    );
                    self.stores
                        .outbox
                        .fail(&message.id, &err.to_string(), next_attempt_at(now, message.attempts))
                        .await?;
                }
            }
        }
        Ok(count)
    }

    /// Pump until no command is currently due
    ///
    /// Commands scheduled in the future (retry backoff) are left queued;
    /// advance the injected clock and pump again to drain them.
    pub async fn run_until_idle(&self) -> Result<()> {
        while self.pump().await? > 0 {}
        Ok(())
    }

    /// Time out overdue approvals; returns how many fired
    pub async fn sweep_approval_timeouts(&self) -> Result<usize> {
        let now = self.stores.clock.now();
        let due = self.stores.approvals.due(now).await?;
        let mut fired = 0;
        for pending in due {
            let instance = match self.load_instance(&pending.workflow_id).await {
                Ok(instance) => instance,
                Err(_) => {
                    // Orphan row from a commit that never landed.
                    let _ = self.stores.approvals.remove(&pending.workflow_id).await;
                    continue;
                }
            };
            match instance.awaiting_approval {
                Some(node) => {
                    self.handle(
                        &pending.workflow_id,
                        EngineCommand::ApprovalTimeout { node },
                    )
                    .await?;
                    fired += 1;
                }
                None => {
                    let _ = self.stores.approvals.remove(&pending.workflow_id).await;
                }
            }
        }
        Ok(fired)
    }

    /// Latest persisted instance document
    pub async fn instance(&self, workflow_id: &str) -> Result<WorkflowInstance> {
        self.load_instance(workflow_id).await
    }

    /// Current state of an instance
    pub async fn state(&self, workflow_id: &str) -> Result<WorkflowState> {
        Ok(self.load_instance(workflow_id).await?.state)
    }

    /// Rebuild state purely from the event stream (snapshot + deltas)
    ///
    /// Used by recovery and by determinism checks: the result must equal the
    /// engine's persisted state at the same version.
    pub async fn rebuild_state(
        &self,
        workflow_id: &str,
        up_to: Option<u64>,
    ) -> Result<WorkflowState> {
        let instance = self.load_instance(workflow_id).await?;
        let graph = self.graph_for(&instance.namespace, &instance.workflow)?;

        let snapshot = self.stores.snapshots.latest(workflow_id, up_to).await?;
        let (mut state, from_version) = match snapshot {
            Some(snapshot) => (
                WorkflowState::new(workflow_id, snapshot.state)?,
                snapshot.version,
            ),
            None => (WorkflowState::empty(workflow_id), 0),
        };

        let events = self.stores.events.read(workflow_id, up_to).await?;
        for envelope in events {
            if envelope.version <= from_version {
                continue;
            }
            match envelope.event {
                WorkflowEvent::WorkflowStarted { initial, .. } => {
                    state = WorkflowState::new(workflow_id, initial)?;
                }
                WorkflowEvent::StepCompleted { update, .. } => {
                    state = graph.schema.reduce(&state, &StateUpdate::from_value(update)?)?;
                }
                _ => {}
            }
        }
        Ok(state)
    }

    /// Handle one command for one instance (one tick)
    pub async fn handle(&self, workflow_id: &str, command: EngineCommand) -> Result<()> {
        let lock = self.instance_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(workflow_id).await?;
        if instance.phase.is_terminal() {
            debug!(workflow_id, "command for terminal instance ignored");
            return Ok(());
        }
        let graph = self.graph_for(&instance.namespace, &instance.workflow)?;

        let mut tick = Tick::default();
        let proceed = match command {
            EngineCommand::Execute {
                node,
                dispatch,
                correlation,
                attempt,
            } => {
                if instance.completed_dispatches.contains(&dispatch) {
                    debug!(workflow_id, node, "duplicate dispatch ignored");
                    false
                } else if self.cancel_requested(workflow_id) {
                    self.apply_cancel(&mut instance, &mut tick)
                } else {
                    self.dispatch_node(
                        &graph,
                        &mut instance,
                        &mut tick,
                        &node,
                        &dispatch,
                        &correlation,
                        attempt,
                    )
                    .await?
                }
            }
            EngineCommand::Resume { decision } => {
                self.apply_decision(&graph, &mut instance, &mut tick, decision)?
            }
            EngineCommand::ApprovalTimeout { node } => {
                self.apply_timeout(&mut instance, &mut tick, &node).await?
            }
            EngineCommand::Cancel => self.apply_cancel(&mut instance, &mut tick),
        };

        if proceed {
            self.commit_tick(&mut instance, tick).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tick internals
    // -----------------------------------------------------------------------

    async fn load_instance(&self, workflow_id: &str) -> Result<WorkflowInstance> {
        let doc = self
            .stores
            .events
            .load_instance(workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("workflow instance '{workflow_id}'")))?;
        Ok(serde_json::from_value(doc)?)
    }

    async fn commit_tick(&self, instance: &mut WorkflowInstance, tick: Tick) -> Result<()> {
        let Tick {
            events,
            enqueue,
            cache,
            put_approval,
            remove_approval,
            permits,
        } = tick;

        // Armed before the commit so a timeout can never be lost; a failed
        // commit leaves an orphan row the sweeper cleans up.
        if let Some(pending) = put_approval {
            self.stores.approvals.put(pending).await?;
        }

        let expected = instance.version;
        instance.version += events.len() as u64;
        let commit = Commit {
            workflow_id: instance.workflow_id.clone(),
            expected_version: expected,
            events,
            instance: serde_json::to_value(&*instance)?,
            phase: instance.phase,
            enqueue,
            cache,
        };
        let head = self.stores.events.commit(commit).await?;

        if remove_approval {
            let _ = self.stores.approvals.remove(&instance.workflow_id).await;
        }

        let interval = self.config.snapshot_interval;
        if interval > 0 && expected / interval != head / interval {
            let snapshot = Snapshot {
                workflow_id: instance.workflow_id.clone(),
                version: head,
                state: instance.state.as_value(),
            };
            if let Err(err) = self.stores.snapshots.save(snapshot).await {
                warn!(workflow_id = %instance.workflow_id, error = %err, "snapshot save failed");
            }
        }

        // Cache rows landed transactionally; now wake single-flight waiters.
        drop(permits);

        if instance.phase.is_terminal() {
            let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            cancels.remove(&instance.workflow_id);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_node(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        node_id: &str,
        dispatch: &str,
        correlation: &str,
        attempt: u32,
    ) -> Result<bool> {
        let Some(node) = graph.node(node_id) else {
            warn!(workflow_id = %instance.workflow_id, node_id, "command addressed unknown node");
            return Ok(false);
        };
        let node = node.clone();
        record_dispatch(instance, dispatch);

        match &node.kind {
            NodeKind::Step {
                step_type,
                name,
                terminal,
            } => {
                self.run_step(
                    graph,
                    instance,
                    tick,
                    &node,
                    step_type.clone(),
                    name.clone(),
                    *terminal,
                    correlation,
                    attempt,
                )
                .await?;
            }
            NodeKind::Branch {
                name,
                discriminator,
                cases,
                rejoin,
            } => {
                let key = discriminator(&instance.state);
                match cases.iter().find(|(case_key, _)| *case_key == key) {
                    Some((_, entry)) => {
                        tick.events.push(WorkflowEvent::BranchTaken {
                            branch_id: name.clone(),
                            case: key,
                        });
                        match entry {
                            Some(entry) => tick.execute(entry)?,
                            None => {
                                let continuation = if *rejoin {
                                    graph.continuation(&node.id)
                                } else {
                                    graph.continuation_after_scope(&node.id)
                                };
                                self.advance(graph, instance, tick, continuation)?;
                            }
                        }
                    }
                    None => {
                        let err = WorkflowError::NoMatchingBranch {
                            branch: name.clone(),
                            discriminant: key,
                        };
                        self.fail_step(graph, instance, tick, &node, err, correlation, attempt)?;
                    }
                }
            }
            NodeKind::Fork { name, paths, join } => {
                debug!(workflow_id = %instance.workflow_id, fork = %name, paths = paths.len(), "fork dispatch");
                instance
                    .forks
                    .insert(node.id.clone(), ForkProgress::sized(paths.len()));
                let mut empty_paths = Vec::new();
                for (index, path) in paths.iter().enumerate() {
                    match &path.entry {
                        Some(entry) => tick.execute(entry)?,
                        None => empty_paths.push(index),
                    }
                }
                for index in empty_paths {
                    self.complete_path(graph, instance, tick, &node.id, index, PathStatus::Success)?;
                }
                // Join enqueueing is handled by complete_path once the final
                // PathCompleted lands; an all-empty fork joins right here.
                let _ = join;
            }
            NodeKind::Loop {
                name,
                exit,
                body,
                max_iterations,
                ..
            } => {
                let iterations = *instance.loop_iterations.get(&node.id).unwrap_or(&0);
                let exit_now = exit(&instance.state);
                if exit_now || iterations >= *max_iterations || body.is_none() {
                    if !exit_now && iterations >= *max_iterations {
                        tick.events.push(WorkflowEvent::LoopLimitReached {
                            loop_name: name.clone(),
                        });
                    }
                    instance.loop_iterations.remove(&node.id);
                    let continuation = graph.continuation(&node.id);
                    self.advance(graph, instance, tick, continuation)?;
                } else if let Some(entry) = body {
                    tick.execute(entry)?;
                }
            }
            NodeKind::Approval {
                name,
                approver,
                options,
                ..
            } => {
                let now = self.stores.clock.now();
                tick.events.push(WorkflowEvent::ApprovalRequested {
                    approver: approver.clone(),
                    options: options.clone(),
                    context: Some(name.clone()),
                });
                tick.events.push(WorkflowEvent::PhaseChanged {
                    from: instance.phase,
                    to: WorkflowPhase::AwaitingApproval,
                });
                instance.phase = WorkflowPhase::AwaitingApproval;
                instance.awaiting_approval = Some(node.id.clone());
                tick.put_approval = approval::pending_for(&instance.workflow_id, &node, now);
                // Suspended: no command enqueued until a decision or timeout.
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        node: &CompiledNode,
        step_type: String,
        name: String,
        terminal: bool,
        correlation: &str,
        attempt: u32,
    ) -> Result<()> {
        // Wall-clock budget is enforced against elapsed time since start.
        let now = self.stores.clock.now();
        let elapsed_secs = (now - instance.started_at).num_seconds().max(0) as u64;
        if elapsed_secs > self.config.budget.allocation.wall_seconds {
            let err = WorkflowError::BudgetExhausted {
                dimension: "wall_seconds".to_string(),
            };
            return self.fail_step(graph, instance, tick, node, err, correlation, attempt);
        }

        let step = match self.steps.get(&step_type) {
            Ok(step) => step,
            Err(err) => {
                return self.fail_step(graph, instance, tick, node, err, correlation, attempt)
            }
        };

        let cost = self.config.budget.effective_cost(&step.budget_estimate());
        let reserved = match budget::reserve(&mut instance.budget, &cost) {
            Ok(reserved) => reserved,
            Err(err) => {
                return self.fail_step(graph, instance, tick, node, err, correlation, attempt)
            }
        };

        let fields = step.fingerprint_fields();
        let fp = fingerprint(&node.id, &instance.state, fields.as_deref());

        match self.ledger.acquire(&node.id, &fp).await {
            Lookup::Hit(cached) => {
                debug!(workflow_id = %instance.workflow_id, step = %name, "step ledger hit; invocation skipped");
                budget::refund(&mut instance.budget, &reserved);
                let cached: CachedStepResult = serde_json::from_value(cached)?;
                self.absorb_step_result(
                    graph,
                    instance,
                    tick,
                    node,
                    &name,
                    terminal,
                    cached,
                    Vec::new(),
                    None,
                    0,
                    false,
                )?;
            }
            Lookup::Build(permit) => {
                let ctx = StepContext {
                    workflow_id: instance.workflow_id.clone(),
                    step_name: name.clone(),
                    invocation_id: Uuid::new_v4().to_string(),
                    correlation_id: correlation.to_string(),
                    attempt,
                    cancel: self.cancel_signal(&instance.workflow_id),
                    fork: self.fork_context_for(graph, instance, &node.id),
                };

                let started = self.stores.clock.now();
                let invocation = step.execute(&instance.state, &ctx);
                let outcome = match self.config.step_timeout_ms {
                    Some(ms) => {
                        match tokio::time::timeout(std::time::Duration::from_millis(ms), invocation)
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(WorkflowError::Timeout {
                                operation: format!("step '{name}'"),
                                duration_ms: ms,
                            }),
                        }
                    }
                    None => invocation.await,
                };

                match outcome {
                    Ok(result) => {
                        let duration_ms =
                            (self.stores.clock.now() - started).num_milliseconds().max(0) as u64;
                        let actual = self.config.budget.effective_cost(&BudgetDimensions {
                            steps: step.budget_estimate().steps,
                            tokens: result.tokens.unwrap_or(0),
                            executions: step.budget_estimate().executions,
                            tool_calls: result.tool_calls,
                            wall_seconds: 0,
                        });
                        budget::commit(&mut instance.budget, &reserved, &actual);

                        let cached = CachedStepResult {
                            update: result.update,
                            tokens: result.tokens,
                            tool_calls: result.tool_calls,
                            artifacts: result.artifacts,
                            final_answer: result.final_answer,
                        };
                        tick.cache.push(self.ledger.cache_write(
                            &node.id,
                            &fp,
                            serde_json::to_value(&cached)?,
                            None,
                        ));
                        tick.permits.push(permit);

                        self.absorb_step_result(
                            graph,
                            instance,
                            tick,
                            node,
                            &name,
                            terminal,
                            cached,
                            result.events,
                            result.progress,
                            duration_ms,
                            true,
                        )?;
                    }
                    Err(err) => {
                        // The permit drops here, releasing the slot without
                        // caching the failure.
                        drop(permit);
                        budget::commit(&mut instance.budget, &reserved, &reserved);
                        self.fail_step(graph, instance, tick, node, err, correlation, attempt)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fold a (fresh or cached) step result into the instance and advance
    #[allow(clippy::too_many_arguments)]
    fn absorb_step_result(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        node: &CompiledNode,
        name: &str,
        terminal: bool,
        result: CachedStepResult,
        mut emitted: Vec<WorkflowEvent>,
        progress: Option<ProgressEntry>,
        duration_ms: u64,
        invoked: bool,
    ) -> Result<()> {
        let new_state = graph.schema.reduce(&instance.state, &result.update)?;
        tick.events.push(WorkflowEvent::StepCompleted {
            step_id: name.to_string(),
            duration_ms,
            tokens: result.tokens,
            artifacts: result.artifacts.clone(),
            update: result.update.as_value(),
        });
        tick.events.append(&mut emitted);

        if let Some((fork, index)) = fork_scope_of(graph, &node.id) {
            let paths = fork_width(graph, &fork);
            let progress = instance
                .forks
                .entry(fork)
                .or_insert_with(|| ForkProgress::sized(paths));
            if let Some(delta) = progress.deltas.get_mut(index) {
                *delta = graph.schema.combine(delta, &result.update)?;
            }
        }

        instance.state = new_state;
        if let Some(answer) = result.final_answer {
            instance.final_answer = Some(answer);
        }

        if invoked {
            let entry = progress.unwrap_or_else(|| {
                ProgressEntry::new(self.stores.clock.now(), name)
                    .with_tokens(result.tokens.unwrap_or(0))
                    .with_duration_ms(duration_ms)
                    .with_output(result.update.as_value().to_string())
                    .with_progress_made(!result.update.is_empty())
            });
            push_progress(instance, entry, self.config.progress_window_cap);

            if self.run_detector(instance, tick, name) {
                return Ok(());
            }
        }

        // A join step consumed its fork; drop the bookkeeping.
        if let Some(fork) = graph.fork_of_join(&node.id).map(|f| f.id.clone()) {
            instance.forks.remove(&fork);
        }

        if terminal {
            self.finalize(instance, tick, WorkflowOutcome::Success);
        } else {
            let continuation = graph.continuation(&node.id);
            self.advance(graph, instance, tick, continuation)?;
        }
        Ok(())
    }

    /// Loop-detector pass after an invoked step; returns true when the
    /// instance was aborted
    fn run_detector(
        &self,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        step_name: &str,
    ) -> bool {
        let verdict = self.detector.detect(&instance.progress);
        if !verdict.detected {
            return false;
        }
        let (Some(loop_kind), Some(strategy)) = (verdict.loop_kind, verdict.strategy) else {
            return false;
        };

        tick.events.push(WorkflowEvent::LoopDetected {
            loop_kind,
            confidence: verdict.confidence,
            strategy,
        });
        instance.resets += 1;

        if instance.resets > self.detector.config().max_resets {
            let err = WorkflowError::LoopDetection {
                loop_kind,
                resets: instance.resets,
            };
            // Loop-detection aborts bypass failure handlers entirely.
            tick.events.push(WorkflowEvent::ExecutionFailed {
                step_id: step_name.to_string(),
                reason: err.to_string(),
                recoverable: false,
            });
            self.finalize(instance, tick, WorkflowOutcome::Failed);
            true
        } else {
            tick.events.push(WorkflowEvent::RecoveryStrategyApplied {
                strategy,
                loop_kind,
                action: "cleared progress window".to_string(),
            });
            instance.progress.clear();
            false
        }
    }

    /// Route a step failure: retry, failure handler, path failure or
    /// terminal outcome
    #[allow(clippy::too_many_arguments)]
    fn fail_step(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        node: &CompiledNode,
        err: WorkflowError,
        correlation: &str,
        attempt: u32,
    ) -> Result<()> {
        let decision = self.config.retry.decide(&err, attempt);
        let recoverable = matches!(decision, RetryDecision::Retry(_));
        tick.events.push(WorkflowEvent::ExecutionFailed {
            step_id: node.display_name().to_string(),
            reason: err.to_string(),
            recoverable,
        });

        match decision {
            RetryDecision::Retry(delay) => {
                instance.retry_count += 1;
                let retry_at = self.stores.clock.now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                debug!(
                    workflow_id = %instance.workflow_id,
                    step = %node.display_name(),
                    attempt,
                    "transient failure; retrying with backoff"
                );
                tick.execute_retry(&node.id, correlation, attempt + 1, retry_at)?;
            }
            RetryDecision::GiveUp => {
                let cancelled = matches!(err, WorkflowError::Cancelled);
                match graph.handler_for(&node.id) {
                    Some((handler, owner)) if instance.handler.is_none() => {
                        tick.events.push(WorkflowEvent::PhaseChanged {
                            from: instance.phase,
                            to: WorkflowPhase::Compensating,
                        });
                        instance.phase = WorkflowPhase::Compensating;
                        instance.handler = Some(HandlerFrame {
                            owner: owner.into(),
                            terminal: handler.terminal,
                            failed_node: node.id.clone(),
                        });
                        tick.execute(&handler.entry)?;
                    }
                    _ => match fork_scope_of(graph, &node.id) {
                        Some((fork, index)) => {
                            self.complete_path(
                                graph,
                                instance,
                                tick,
                                &fork,
                                index,
                                PathStatus::Failed,
                            )?;
                        }
                        None => {
                            let outcome = if cancelled {
                                WorkflowOutcome::Cancelled
                            } else {
                                WorkflowOutcome::Failed
                            };
                            self.finalize(instance, tick, outcome);
                        }
                    },
                }
            }
        }
        Ok(())
    }

    /// Drive a resolved continuation until a command is enqueued or the
    /// workflow settles
    fn advance(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        continuation: Continuation,
    ) -> Result<()> {
        match continuation {
            Continuation::Node(next) => tick.execute(&next)?,
            Continuation::PathEnd { fork, index } => {
                self.complete_path(graph, instance, tick, &fork, index, PathStatus::Success)?;
            }
            Continuation::LoopHead(loop_id) => {
                let loop_name = graph
                    .node(&loop_id)
                    .map(|n| n.display_name().to_string())
                    .unwrap_or_else(|| loop_id.clone());
                let iteration = instance
                    .loop_iterations
                    .entry(loop_id.clone())
                    .and_modify(|i| *i += 1)
                    .or_insert(1);
                tick.events.push(WorkflowEvent::LoopIterationCompleted {
                    loop_name,
                    iteration: *iteration,
                });
                tick.execute(&loop_id)?;
            }
            Continuation::HandlerEnd { .. } => {
                self.complete_handler(graph, instance, tick)?;
            }
            Continuation::Rejected => {
                self.finalize(instance, tick, WorkflowOutcome::Rejected);
            }
            Continuation::Complete => {
                self.finalize(instance, tick, WorkflowOutcome::Success);
            }
        }
        Ok(())
    }

    /// Record a path's terminal status; the join fires when the last path
    /// lands
    fn complete_path(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        fork_id: &str,
        index: usize,
        status: PathStatus,
    ) -> Result<()> {
        let Some(NodeKind::Fork { join, paths, .. }) = graph.node(fork_id).map(|n| &n.kind) else {
            return Err(WorkflowError::Internal(format!(
                "path completion addressed non-fork node '{fork_id}'"
            )));
        };
        let join = join.clone();
        let width = paths.len();

        let progress = instance
            .forks
            .entry(fork_id.to_string())
            .or_insert_with(|| ForkProgress::sized(width));
        let Some(slot) = progress.results.get_mut(index) else {
            return Err(WorkflowError::Internal(format!(
                "fork '{fork_id}' has no path {index}"
            )));
        };
        if slot.is_some() {
            return Ok(());
        }

        let delta = match status {
            PathStatus::Failed => None,
            _ => progress.deltas.get(index).cloned(),
        };
        tick.events.push(WorkflowEvent::PathCompleted {
            path_index: index,
            status,
            state: delta.as_ref().map(|d| d.as_value()),
        });
        *slot = Some(PathResult {
            index,
            status,
            state: delta,
        });

        if progress.results.iter().all(|slot| slot.is_some()) {
            tick.execute(&join)?;
        }
        Ok(())
    }

    /// Resolve a completed failure-handler chain
    fn complete_handler(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
    ) -> Result<()> {
        let Some(frame) = instance.handler.take() else {
            return Err(WorkflowError::Internal(
                "handler completion without an active handler frame".to_string(),
            ));
        };
        tick.events.push(WorkflowEvent::PhaseChanged {
            from: instance.phase,
            to: WorkflowPhase::Running,
        });
        instance.phase = WorkflowPhase::Running;

        match (&frame.owner, frame.terminal) {
            (HandlerOwnerDoc::Workflow, true) => {
                self.finalize(instance, tick, WorkflowOutcome::Failed);
            }
            (HandlerOwnerDoc::ForkPath { fork, index }, true) => {
                let fork = fork.clone();
                let index = *index;
                self.complete_path(
                    graph,
                    instance,
                    tick,
                    &fork,
                    index,
                    PathStatus::FailedWithRecovery,
                )?;
            }
            (HandlerOwnerDoc::LoopBody { loop_node }, true) => {
                // A terminal loop handler terminates the loop's own scope.
                match fork_scope_of(graph, loop_node) {
                    Some((fork, index)) => {
                        self.complete_path(
                            graph,
                            instance,
                            tick,
                            &fork,
                            index,
                            PathStatus::FailedWithRecovery,
                        )?;
                    }
                    None => self.finalize(instance, tick, WorkflowOutcome::Failed),
                }
            }
            (_, false) => {
                // Rejoin the normal flow after the failed step.
                let continuation = graph.continuation(&frame.failed_node);
                self.advance(graph, instance, tick, continuation)?;
            }
        }
        Ok(())
    }

    fn apply_decision(
        &self,
        graph: &CompiledWorkflow,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        decision: ApprovalDecision,
    ) -> Result<bool> {
        let Some(awaiting) = instance.awaiting_approval.clone() else {
            debug!(workflow_id = %instance.workflow_id, "decision without pending approval ignored");
            return Ok(false);
        };
        let Some(node) = graph.node(&awaiting).cloned() else {
            return Err(WorkflowError::Internal(format!(
                "awaiting unknown approval node '{awaiting}'"
            )));
        };

        tick.events.push(WorkflowEvent::ApprovalReceived {
            decision: decision.clone(),
        });
        tick.events.push(WorkflowEvent::PhaseChanged {
            from: instance.phase,
            to: WorkflowPhase::Running,
        });
        instance.phase = WorkflowPhase::Running;
        instance.awaiting_approval = None;
        tick.remove_approval = true;

        match approval::route_decision(&node, &decision) {
            Some(ApprovalRouting::Resume) => {
                let continuation = graph.continuation(&awaiting);
                self.advance(graph, instance, tick, continuation)?;
            }
            Some(ApprovalRouting::RunRejection(entry)) => tick.execute(&entry)?,
            Some(ApprovalRouting::Rejected) => {
                self.finalize(instance, tick, WorkflowOutcome::Rejected);
            }
            Some(ApprovalRouting::RunEscalation(entry)) => tick.execute(&entry)?,
            Some(ApprovalRouting::ReRequest) => {
                // Escalation with no configured path re-requests the same
                // approval with a re-armed deadline.
                let now = self.stores.clock.now();
                if let NodeKind::Approval {
                    approver, options, ..
                } = &node.kind
                {
                    tick.events.push(WorkflowEvent::ApprovalRequested {
                        approver: approver.clone(),
                        options: options.clone(),
                        context: Some(node.display_name().to_string()),
                    });
                }
                tick.events.push(WorkflowEvent::PhaseChanged {
                    from: instance.phase,
                    to: WorkflowPhase::AwaitingApproval,
                });
                instance.phase = WorkflowPhase::AwaitingApproval;
                instance.awaiting_approval = Some(awaiting.clone());
                tick.remove_approval = false;
                tick.put_approval = approval::pending_for(&instance.workflow_id, &node, now);
            }
            None => {
                return Err(WorkflowError::Internal(format!(
                    "decision routed to non-approval node '{awaiting}'"
                )))
            }
        }
        Ok(true)
    }

    async fn apply_timeout(
        &self,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        node_id: &str,
    ) -> Result<bool> {
        if instance.awaiting_approval.as_deref() != Some(node_id) {
            return Ok(false);
        }
        let now = self.stores.clock.now();
        let pending = self.stores.approvals.get(&instance.workflow_id).await?;
        match pending {
            Some(pending) if approval::timed_out(&pending, now) => {
                tick.events.push(WorkflowEvent::ApprovalTimedOut);
                instance.awaiting_approval = None;
                tick.remove_approval = true;
                self.finalize(instance, tick, WorkflowOutcome::TimedOut);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn apply_cancel(&self, instance: &mut WorkflowInstance, tick: &mut Tick) -> bool {
        tick.events.push(WorkflowEvent::ExecutionFailed {
            step_id: "workflow".to_string(),
            reason: "cancellation requested".to_string(),
            recoverable: false,
        });
        if instance.awaiting_approval.take().is_some() {
            tick.remove_approval = true;
        }
        self.finalize(instance, tick, WorkflowOutcome::Cancelled);
        true
    }

    fn finalize(
        &self,
        instance: &mut WorkflowInstance,
        tick: &mut Tick,
        outcome: WorkflowOutcome,
    ) {
        let to = match outcome {
            WorkflowOutcome::Success => WorkflowPhase::Completed,
            _ => WorkflowPhase::Failed,
        };
        let now = self.stores.clock.now();
        tick.events.push(WorkflowEvent::PhaseChanged {
            from: instance.phase,
            to,
        });
        tick.events.push(WorkflowEvent::WorkflowCompleted {
            outcome,
            final_answer: instance.final_answer.clone(),
            total_duration_ms: (now - instance.started_at).num_milliseconds().max(0) as u64,
        });
        instance.phase = to;
        info!(
            workflow_id = %instance.workflow_id,
            outcome = outcome.as_str(),
            "workflow finished"
        );
    }

    fn fork_context_for(
        &self,
        graph: &CompiledWorkflow,
        instance: &WorkflowInstance,
        node_id: &str,
    ) -> Option<ForkContext> {
        let fork = graph.fork_of_join(node_id)?;
        let progress = instance.forks.get(&fork.id)?;
        let results: Vec<PathResult> = progress
            .results
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.clone().unwrap_or(PathResult {
                    index,
                    status: PathStatus::Failed,
                    state: None,
                })
            })
            .collect();
        Some(ForkContext { results })
    }
}

/// Cached form of a step's result, stored in the step ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedStepResult {
    update: StateUpdate,
    #[serde(default)]
    tokens: Option<u64>,
    #[serde(default)]
    tool_calls: u64,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    final_answer: Option<String>,
}

fn record_dispatch(instance: &mut WorkflowInstance, dispatch: &str) {
    instance.completed_dispatches.push_back(dispatch.to_string());
    while instance.completed_dispatches.len() > DISPATCH_HISTORY {
        instance.completed_dispatches.pop_front();
    }
}

fn push_progress(instance: &mut WorkflowInstance, entry: ProgressEntry, cap: usize) {
    instance.progress.push(entry);
    let len = instance.progress.len();
    if len > cap {
        instance.progress.drain(..len - cap);
    }
}

/// The fork path enclosing `id`, walking out through loops, branches and
/// handler chains
fn fork_scope_of(graph: &CompiledWorkflow, id: &str) -> Option<(NodeId, usize)> {
    let mut current = graph.node(id)?;
    loop {
        match &current.enclosing {
            Enclosing::ForkPath { fork, index } => return Some((fork.clone(), *index)),
            Enclosing::Handler {
                owner: HandlerOwner::ForkPath { fork, index },
                ..
            } => return Some((fork.clone(), *index)),
            Enclosing::Handler {
                owner: HandlerOwner::LoopBody { loop_node },
                ..
            }
            | Enclosing::LoopBody { loop_node } => current = graph.node(loop_node)?,
            Enclosing::BranchCase { branch } => current = graph.node(branch)?,
            Enclosing::ApprovalEscalation { approval }
            | Enclosing::ApprovalRejection { approval } => current = graph.node(approval)?,
            Enclosing::Handler {
                owner: HandlerOwner::Workflow,
                ..
            }
            | Enclosing::Top => return None,
        }
    }
}

fn fork_width(graph: &CompiledWorkflow, fork_id: &str) -> usize {
    match graph.node(fork_id).map(|n| &n.kind) {
        Some(NodeKind::Fork { paths, .. }) => paths.len(),
        _ => 0,
    }
}

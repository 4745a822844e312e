//! Store trait abstractions for workflow persistence
//!
//! The engine talks to durability through these traits only. A backend is a
//! set of stores sharing one transactional boundary: [`EventStore::commit`]
//! must atomically append the tick's events, persist the instance document,
//! write step-cache entries, and enqueue outbox commands - either everything
//! in the [`Commit`] lands or nothing does. [`MemoryJournal`] is the
//! reference implementation; `sagaflow-sqlite` provides the production
//! backend over the same traits.
//!
//! [`MemoryJournal`]: crate::memory::MemoryJournal

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::{EventEnvelope, WorkflowEvent, WorkflowPhase};
use crate::outbox::{NewCommand, OutboxMessage};

/// A step-cache write carried inside a [`Commit`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheWrite {
    pub step_id: String,
    pub fingerprint: String,
    pub result: Value,
    /// Absolute expiry; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything one engine tick persists, as a single atomic unit
#[derive(Debug, Clone)]
pub struct Commit {
    pub workflow_id: String,
    /// Head version the committer observed; a mismatch yields
    /// [`JournalError::Conflict`](crate::error::JournalError::Conflict)
    pub expected_version: u64,
    pub events: Vec<WorkflowEvent>,
    /// Opaque instance document owned by the engine
    pub instance: Value,
    /// Phase column kept beside the opaque document for recovery scans
    pub phase: WorkflowPhase,
    pub enqueue: Vec<NewCommand>,
    pub cache: Vec<CacheWrite>,
}

/// Append-only per-instance event stream plus the instance document
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically apply a commit; returns the new head version
    async fn commit(&self, commit: Commit) -> Result<u64>;

    /// Read the stream in version order, optionally bounded (time-travel)
    async fn read(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Vec<EventEnvelope>>;

    /// Current head version; 0 when the instance has no events
    async fn head(&self, workflow_id: &str) -> Result<u64>;

    /// Latest persisted instance document
    async fn load_instance(&self, workflow_id: &str) -> Result<Option<Value>>;

    /// Workflow ids currently in the given phase (all when `None`)
    async fn list_instances(&self, phase: Option<WorkflowPhase>) -> Result<Vec<String>>;
}

/// Periodic state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub workflow_id: String,
    pub version: u64,
    pub state: Value,
}

/// Periodic snapshots enabling bounded replay on recovery
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> Result<()>;

    /// Most recent snapshot at or below `up_to` (unbounded when `None`)
    async fn latest(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Option<Snapshot>>;
}

/// Durable queue of pending next-step commands
///
/// Delivery is at-least-once: a lease makes a message invisible for its
/// duration, completion deletes it, and failure re-queues it with backoff.
/// Duplicate deliveries are neutralized downstream by the step ledger.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` due messages, making them invisible until the
    /// lease expires. Each lease counts as a delivery attempt.
    async fn lease(
        &self,
        now: DateTime<Utc>,
        lease_for: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>>;

    /// Delete a delivered message; unknown ids are ignored
    async fn complete(&self, id: &str) -> Result<()>;

    /// Release a message back to the queue with an error note and a
    /// not-before time for the next attempt
    async fn fail(&self, id: &str, error: &str, retry_at: DateTime<Utc>) -> Result<()>;

    /// Number of queued (unleased or lease-expired) messages for an instance
    async fn pending(&self, workflow_id: &str) -> Result<usize>;
}

/// Persisted half of the step execution ledger
#[async_trait]
pub trait StepCacheStore: Send + Sync {
    /// Non-expired cached result, if any; expired entries are evicted on touch
    async fn get(
        &self,
        step_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>>;

    async fn put(&self, write: CacheWrite) -> Result<()>;

    /// Drop every expired entry; returns how many were removed
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// A suspended approval awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub workflow_id: String,
    pub approver: String,
    pub options: Vec<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub requested_at: DateTime<Utc>,
}

/// Pending approvals, persisted so timeouts survive restarts
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn put(&self, approval: PendingApproval) -> Result<()>;

    async fn get(&self, workflow_id: &str) -> Result<Option<PendingApproval>>;

    /// Remove and return the pending approval, if present
    async fn remove(&self, workflow_id: &str) -> Result<Option<PendingApproval>>;

    /// Approvals whose deadline has passed
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>>;
}

/// One Beta belief cell for an (agent, task-category) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefCell {
    pub agent_id: String,
    pub category: String,
    pub alpha: f64,
    pub beta: f64,
    pub observations: u64,
    pub updated_at: DateTime<Utc>,
}

/// Agent beliefs with compare-and-swap updates for concurrent observers
#[async_trait]
pub trait BeliefStore: Send + Sync {
    async fn get(&self, agent_id: &str, category: &str) -> Result<Option<BeliefCell>>;

    /// Store `next` only if the current cell equals `expected` (`None` means
    /// the cell must not exist yet). Returns whether the swap happened.
    async fn compare_and_put(&self, expected: Option<&BeliefCell>, next: BeliefCell)
        -> Result<bool>;
}

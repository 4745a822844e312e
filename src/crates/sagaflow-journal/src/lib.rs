//! # sagaflow-journal - durability layer for the sagaflow engine
//!
//! This crate defines what the saga engine persists and how backends expose
//! it, without committing to a storage technology:
//!
//! - [`event`] - the persisted [`WorkflowEvent`] model and envelope
//! - [`traits`] - store abstractions sharing one transactional boundary
//!   ([`EventStore::commit`] applies events, instance document, step-cache
//!   writes and outbox rows atomically)
//! - [`memory`] - [`MemoryJournal`], the in-memory reference backend used by
//!   tests and development
//! - [`outbox`] - the at-least-once command queue model and redelivery
//!   backoff
//! - [`artifact`] - claim-check storage for payloads exceeding event size
//! - [`clock`] / [`signal`] - injectable time and cooperative cancellation
//! - [`serializer`] - codecs for snapshot blobs and event payloads
//!
//! Production persistence lives in `sagaflow-sqlite`, which implements the
//! same traits over SQLite.

pub mod artifact;
pub mod clock;
pub mod error;
pub mod event;
pub mod memory;
pub mod outbox;
pub mod serializer;
pub mod signal;
pub mod traits;

pub use artifact::{
    retrieve_json, store_json, ArtifactStore, ArtifactUri, FsArtifactStore, MemoryArtifactStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{JournalError, Result};
pub use event::{
    ApprovalDecision, EventEnvelope, LoopKind, PathStatus, RecoveryStrategy, WorkflowEvent,
    WorkflowId, WorkflowOutcome, WorkflowPhase,
};
pub use memory::MemoryJournal;
pub use outbox::{next_attempt_at, redelivery_backoff, NewCommand, OutboxMessage};
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use signal::{CancelHandle, CancelSignal};
pub use traits::{
    ApprovalStore, BeliefCell, BeliefStore, CacheWrite, Commit, EventStore, OutboxStore,
    PendingApproval, Snapshot, SnapshotStore, StepCacheStore,
};

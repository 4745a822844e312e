//! In-memory journal for development and testing
//!
//! [`MemoryJournal`] is the reference implementation of every store trait in
//! this crate. A single mutex guards all tables, which makes
//! [`EventStore::commit`] trivially atomic: the events, instance document,
//! cache writes and outbox rows of one commit become visible together or not
//! at all. Data is lost on restart; use the SQLite backend for durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{JournalError, Result};
use crate::event::{EventEnvelope, WorkflowPhase};
use crate::outbox::OutboxMessage;
use crate::traits::{
    ApprovalStore, BeliefCell, BeliefStore, CacheWrite, Commit, EventStore, OutboxStore,
    PendingApproval, Snapshot, SnapshotStore, StepCacheStore,
};

#[derive(Debug, Clone)]
struct OutboxRow {
    message: OutboxMessage,
    leased_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<String, Vec<EventEnvelope>>,
    instances: HashMap<String, (WorkflowPhase, Value)>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    outbox: Vec<OutboxRow>,
    cache: HashMap<(String, String), CacheWrite>,
    approvals: HashMap<String, PendingApproval>,
    beliefs: HashMap<(String, String), BeliefCell>,
}

/// All journal stores backed by process memory
pub struct MemoryJournal {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Drop every table; used for test isolation
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        *inner = Inner::default();
    }

    /// Total committed events across all instances
    pub async fn event_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.events.values().map(|v| v.len()).sum()
    }

    /// Queued outbox rows across all instances, leased or not
    pub async fn outbox_len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.outbox.len()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryJournal {
    async fn commit(&self, commit: Commit) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = self.clock.now();

        let stream = inner.events.entry(commit.workflow_id.clone()).or_default();
        let head = stream.len() as u64;
        if head != commit.expected_version {
            return Err(JournalError::Conflict {
                workflow_id: commit.workflow_id,
                expected: commit.expected_version,
                found: head,
            });
        }

        let mut version = head;
        for event in commit.events {
            version += 1;
            stream.push(EventEnvelope {
                workflow_id: commit.workflow_id.clone(),
                version,
                event,
                committed_at: now,
            });
        }

        inner
            .instances
            .insert(commit.workflow_id.clone(), (commit.phase, commit.instance));

        for write in commit.cache {
            inner
                .cache
                .insert((write.step_id.clone(), write.fingerprint.clone()), write);
        }

        for new in commit.enqueue {
            inner.outbox.push(OutboxRow {
                message: OutboxMessage {
                    id: Uuid::new_v4().to_string(),
                    workflow_id: commit.workflow_id.clone(),
                    command: new.command,
                    not_before: new.not_before.unwrap_or(now),
                    attempts: 0,
                    last_error: None,
                },
                leased_until: None,
            });
        }

        Ok(version)
    }

    async fn read(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Vec<EventEnvelope>> {
        let inner = self.inner.lock().await;
        let stream = inner.events.get(workflow_id).cloned().unwrap_or_default();
        Ok(match up_to {
            Some(bound) => stream.into_iter().filter(|e| e.version <= bound).collect(),
            None => stream,
        })
    }

    async fn head(&self, workflow_id: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(workflow_id).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn load_instance(&self, workflow_id: &str) -> Result<Option<Value>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(workflow_id).map(|(_, doc)| doc.clone()))
    }

    async fn list_instances(&self, phase: Option<WorkflowPhase>) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .instances
            .iter()
            .filter(|(_, (p, _))| phase.map_or(true, |want| *p == want))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryJournal {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .snapshots
            .entry(snapshot.workflow_id.clone())
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn latest(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Option<Snapshot>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(workflow_id)
            .and_then(|snaps| {
                snaps
                    .iter()
                    .filter(|s| up_to.map_or(true, |bound| s.version <= bound))
                    .max_by_key(|s| s.version)
            })
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for MemoryJournal {
    async fn lease(
        &self,
        now: DateTime<Utc>,
        lease_for: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let mut inner = self.inner.lock().await;

        let mut due: Vec<usize> = inner
            .outbox
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.message.not_before <= now
                    && row.leased_until.map_or(true, |until| until <= now)
            })
            .map(|(idx, _)| idx)
            .collect();
        due.sort_by_key(|&idx| inner.outbox[idx].message.not_before);
        due.truncate(limit);

        let mut leased = Vec::with_capacity(due.len());
        for idx in due {
            let row = &mut inner.outbox[idx];
            row.leased_until = Some(now + lease_for);
            row.message.attempts += 1;
            leased.push(row.message.clone());
        }
        Ok(leased)
    }

    async fn complete(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.outbox.retain(|row| row.message.id != id);
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.outbox.iter_mut().find(|row| row.message.id == id) {
            row.message.last_error = Some(error.to_string());
            row.message.not_before = retry_at;
            row.leased_until = None;
        }
        Ok(())
    }

    async fn pending(&self, workflow_id: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        let now = self.clock.now();
        Ok(inner
            .outbox
            .iter()
            .filter(|row| {
                row.message.workflow_id == workflow_id
                    && row.leased_until.map_or(true, |until| until <= now)
            })
            .count())
    }
}

#[async_trait]
impl StepCacheStore for MemoryJournal {
    async fn get(
        &self,
        step_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        let mut inner = self.inner.lock().await;
        let key = (step_id.to_string(), fingerprint.to_string());
        let expired = match inner.cache.get(&key) {
            Some(entry) if entry.expires_at.map_or(true, |at| at > now) => {
                return Ok(Some(entry.result.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            // Expired: evict lazily on touch.
            inner.cache.remove(&key);
        }
        Ok(None)
    }

    async fn put(&self, write: CacheWrite) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .cache
            .insert((write.step_id.clone(), write.fingerprint.clone()), write);
        Ok(())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let before = inner.cache.len();
        inner
            .cache
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        Ok(before - inner.cache.len())
    }
}

#[async_trait]
impl ApprovalStore for MemoryJournal {
    async fn put(&self, approval: PendingApproval) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.approvals.insert(approval.workflow_id.clone(), approval);
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<PendingApproval>> {
        let inner = self.inner.lock().await;
        Ok(inner.approvals.get(workflow_id).cloned())
    }

    async fn remove(&self, workflow_id: &str) -> Result<Option<PendingApproval>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.approvals.remove(workflow_id))
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .approvals
            .values()
            .filter(|a| a.deadline.map_or(false, |d| d <= now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BeliefStore for MemoryJournal {
    async fn get(&self, agent_id: &str, category: &str) -> Result<Option<BeliefCell>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .beliefs
            .get(&(agent_id.to_string(), category.to_string()))
            .cloned())
    }

    async fn compare_and_put(
        &self,
        expected: Option<&BeliefCell>,
        next: BeliefCell,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let key = (next.agent_id.clone(), next.category.clone());
        let current = inner.beliefs.get(&key);

        let matches = match (current, expected) {
            (None, None) => true,
            (Some(cur), Some(exp)) => {
                cur.alpha == exp.alpha
                    && cur.beta == exp.beta
                    && cur.observations == exp.observations
            }
            _ => false,
        };

        if matches {
            inner.beliefs.insert(key, next);
        }
        Ok(matches)
    }
}

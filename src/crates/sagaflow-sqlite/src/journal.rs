//! SQLite implementations of the journal store traits
//!
//! One [`SqliteJournal`] implements every store over a shared pool, so
//! [`EventStore::commit`] can apply the events, instance document,
//! step-cache writes and outbox rows of a tick inside a single SQL
//! transaction. Everything else is ordinary row traffic in the repository
//! style: runtime-checked queries, explicit binds, storage errors mapped to
//! one error kind.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use sagaflow_journal::{
    ApprovalStore, BeliefCell, BeliefStore, CacheWrite, Clock, Commit, EventEnvelope, EventStore,
    JournalError, OutboxMessage, OutboxStore, PendingApproval, Result, Snapshot, SnapshotStore,
    StepCacheStore, SystemClock, WorkflowPhase,
};

use crate::db::{storage, Database};

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn phase_from_str(raw: &str) -> WorkflowPhase {
    match raw {
        "created" => WorkflowPhase::Created,
        "awaiting_approval" => WorkflowPhase::AwaitingApproval,
        "compensating" => WorkflowPhase::Compensating,
        "completed" => WorkflowPhase::Completed,
        "failed" => WorkflowPhase::Failed,
        _ => WorkflowPhase::Running,
    }
}

/// All journal stores backed by one SQLite database
pub struct SqliteJournal {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteJournal {
    pub fn new(db: Database) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl EventStore for SqliteJournal {
    async fn commit(&self, commit: Commit) -> Result<u64> {
        let now = to_ms(self.clock.now());
        let mut tx = self.db.pool().begin().await.map_err(storage)?;

        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM workflow_events WHERE workflow_id = ?",
        )
        .bind(&commit.workflow_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(storage)?;

        if head as u64 != commit.expected_version {
            return Err(JournalError::Conflict {
                workflow_id: commit.workflow_id,
                expected: commit.expected_version,
                found: head as u64,
            });
        }

        let mut version = head;
        for event in &commit.events {
            version += 1;
            let payload = serde_json::to_value(event)?;
            let event_type = payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            sqlx::query(
                "INSERT INTO workflow_events (workflow_id, version, type, payload, committed_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&commit.workflow_id)
            .bind(version)
            .bind(event_type)
            .bind(payload.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        sqlx::query(
            "INSERT INTO workflow_instances (workflow_id, phase, document, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET
                 phase = excluded.phase,
                 document = excluded.document,
                 updated_at = excluded.updated_at",
        )
        .bind(&commit.workflow_id)
        .bind(commit.phase.as_str())
        .bind(commit.instance.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for write in &commit.cache {
            sqlx::query(
                "INSERT INTO step_cache (step_id, fingerprint, result, expires_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (step_id, fingerprint) DO UPDATE SET
                     result = excluded.result,
                     expires_at = excluded.expires_at",
            )
            .bind(&write.step_id)
            .bind(&write.fingerprint)
            .bind(write.result.to_string())
            .bind(write.expires_at.map(to_ms))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        for command in &commit.enqueue {
            sqlx::query(
                "INSERT INTO outbox (id, workflow_id, command, not_before, attempts)
                 VALUES (?, ?, ?, ?, 0)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&commit.workflow_id)
            .bind(command.command.to_string())
            .bind(command.not_before.map(to_ms).unwrap_or(now))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(version as u64)
    }

    async fn read(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            "SELECT version, payload, committed_at FROM workflow_events
             WHERE workflow_id = ? AND version <= ?
             ORDER BY version",
        )
        .bind(workflow_id)
        .bind(up_to.map(|v| v as i64).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                let payload: String = row.get("payload");
                Ok(EventEnvelope {
                    workflow_id: workflow_id.to_string(),
                    version: row.get::<i64, _>("version") as u64,
                    event: serde_json::from_str(&payload)?,
                    committed_at: from_ms(row.get("committed_at")),
                })
            })
            .collect()
    }

    async fn head(&self, workflow_id: &str) -> Result<u64> {
        let head: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM workflow_events WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_one(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(head as u64)
    }

    async fn load_instance(&self, workflow_id: &str) -> Result<Option<Value>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM workflow_instances WHERE workflow_id = ?")
                .bind(workflow_id)
                .fetch_optional(self.db.pool())
                .await
                .map_err(storage)?;
        document
            .map(|doc| serde_json::from_str(&doc).map_err(JournalError::from))
            .transpose()
    }

    async fn list_instances(&self, phase: Option<WorkflowPhase>) -> Result<Vec<String>> {
        let rows = match phase {
            Some(phase) => {
                sqlx::query_scalar("SELECT workflow_id FROM workflow_instances WHERE phase = ?")
                    .bind(phase.as_str())
                    .fetch_all(self.db.pool())
                    .await
            }
            None => {
                sqlx::query_scalar("SELECT workflow_id FROM workflow_instances")
                    .fetch_all(self.db.pool())
                    .await
            }
        };
        rows.map_err(storage)
    }
}

#[async_trait]
impl SnapshotStore for SqliteJournal {
    async fn save(&self, snapshot: Snapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_snapshots (workflow_id, version, state)
             VALUES (?, ?, ?)
             ON CONFLICT (workflow_id, version) DO UPDATE SET state = excluded.state",
        )
        .bind(&snapshot.workflow_id)
        .bind(snapshot.version as i64)
        .bind(snapshot.state.to_string())
        .execute(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn latest(&self, workflow_id: &str, up_to: Option<u64>) -> Result<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT version, state FROM workflow_snapshots
             WHERE workflow_id = ? AND version <= ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id)
        .bind(up_to.map(|v| v as i64).unwrap_or(i64::MAX))
        .fetch_optional(self.db.pool())
        .await
        .map_err(storage)?;

        row.map(|row| {
            let state: String = row.get("state");
            Ok(Snapshot {
                workflow_id: workflow_id.to_string(),
                version: row.get::<i64, _>("version") as u64,
                state: serde_json::from_str(&state)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OutboxStore for SqliteJournal {
    async fn lease(
        &self,
        now: DateTime<Utc>,
        lease_for: Duration,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let now_ms = to_ms(now);
        let until_ms = to_ms(now + lease_for);
        let mut tx = self.db.pool().begin().await.map_err(storage)?;

        let rows = sqlx::query(
            "SELECT id, workflow_id, command, not_before, attempts, last_error FROM outbox
             WHERE not_before <= ? AND (leased_until IS NULL OR leased_until <= ?)
             ORDER BY not_before LIMIT ?",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            sqlx::query("UPDATE outbox SET leased_until = ?, attempts = attempts + 1 WHERE id = ?")
                .bind(until_ms)
                .bind(&id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;

            let command: String = row.get("command");
            leased.push(OutboxMessage {
                id,
                workflow_id: row.get("workflow_id"),
                command: serde_json::from_str(&command)?,
                not_before: from_ms(row.get("not_before")),
                attempts: row.get::<i64, _>("attempts") as u32 + 1,
                last_error: row.get("last_error"),
            });
        }

        tx.commit().await.map_err(storage)?;
        Ok(leased)
    }

    async fn complete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn fail(&self, id: &str, error: &str, retry_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET last_error = ?, not_before = ?, leased_until = NULL WHERE id = ?",
        )
        .bind(error)
        .bind(to_ms(retry_at))
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn pending(&self, workflow_id: &str) -> Result<usize> {
        let now_ms = to_ms(self.clock.now());
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox
             WHERE workflow_id = ? AND (leased_until IS NULL OR leased_until <= ?)",
        )
        .bind(workflow_id)
        .bind(now_ms)
        .fetch_one(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(count as usize)
    }
}

#[async_trait]
impl StepCacheStore for SqliteJournal {
    async fn get(
        &self,
        step_id: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT result, expires_at FROM step_cache WHERE step_id = ? AND fingerprint = ?",
        )
        .bind(step_id)
        .bind(fingerprint)
        .fetch_optional(self.db.pool())
        .await
        .map_err(storage)?;

        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<i64> = row.get("expires_at");
        if let Some(expires_at) = expires_at {
            if from_ms(expires_at) <= now {
                // Expired: evict lazily on touch.
                sqlx::query("DELETE FROM step_cache WHERE step_id = ? AND fingerprint = ?")
                    .bind(step_id)
                    .bind(fingerprint)
                    .execute(self.db.pool())
                    .await
                    .map_err(storage)?;
                return Ok(None);
            }
        }
        let result: String = row.get("result");
        Ok(Some(serde_json::from_str(&result)?))
    }

    async fn put(&self, write: CacheWrite) -> Result<()> {
        sqlx::query(
            "INSERT INTO step_cache (step_id, fingerprint, result, expires_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (step_id, fingerprint) DO UPDATE SET
                 result = excluded.result,
                 expires_at = excluded.expires_at",
        )
        .bind(&write.step_id)
        .bind(&write.fingerprint)
        .bind(write.result.to_string())
        .bind(write.expires_at.map(to_ms))
        .execute(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result =
            sqlx::query("DELETE FROM step_cache WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(to_ms(now))
                .execute(self.db.pool())
                .await
                .map_err(storage)?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl ApprovalStore for SqliteJournal {
    async fn put(&self, approval: PendingApproval) -> Result<()> {
        sqlx::query(
            "INSERT INTO approvals_pending (workflow_id, approver_id, options, deadline, requested_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (workflow_id) DO UPDATE SET
                 approver_id = excluded.approver_id,
                 options = excluded.options,
                 deadline = excluded.deadline,
                 requested_at = excluded.requested_at",
        )
        .bind(&approval.workflow_id)
        .bind(&approval.approver)
        .bind(serde_json::to_string(&approval.options)?)
        .bind(approval.deadline.map(to_ms))
        .bind(to_ms(approval.requested_at))
        .execute(self.db.pool())
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<PendingApproval>> {
        let row = sqlx::query(
            "SELECT approver_id, options, deadline, requested_at FROM approvals_pending
             WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(storage)?;

        row.map(|row| {
            let options: String = row.get("options");
            Ok(PendingApproval {
                workflow_id: workflow_id.to_string(),
                approver: row.get("approver_id"),
                options: serde_json::from_str(&options)?,
                deadline: row.get::<Option<i64>, _>("deadline").map(from_ms),
                requested_at: from_ms(row.get("requested_at")),
            })
        })
        .transpose()
    }

    async fn remove(&self, workflow_id: &str) -> Result<Option<PendingApproval>> {
        let pending = ApprovalStore::get(self, workflow_id).await?;
        if pending.is_some() {
            sqlx::query("DELETE FROM approvals_pending WHERE workflow_id = ?")
                .bind(workflow_id)
                .execute(self.db.pool())
                .await
                .map_err(storage)?;
        }
        Ok(pending)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>> {
        let rows = sqlx::query(
            "SELECT workflow_id, approver_id, options, deadline, requested_at
             FROM approvals_pending
             WHERE deadline IS NOT NULL AND deadline <= ?",
        )
        .bind(to_ms(now))
        .fetch_all(self.db.pool())
        .await
        .map_err(storage)?;

        rows.into_iter()
            .map(|row| {
                let options: String = row.get("options");
                Ok(PendingApproval {
                    workflow_id: row.get("workflow_id"),
                    approver: row.get("approver_id"),
                    options: serde_json::from_str(&options)?,
                    deadline: row.get::<Option<i64>, _>("deadline").map(from_ms),
                    requested_at: from_ms(row.get("requested_at")),
                })
            })
            .collect()
    }
}

#[async_trait]
impl BeliefStore for SqliteJournal {
    async fn get(&self, agent_id: &str, category: &str) -> Result<Option<BeliefCell>> {
        let row = sqlx::query(
            "SELECT alpha, beta, observations, updated_at FROM agent_beliefs
             WHERE agent_id = ? AND task_category = ?",
        )
        .bind(agent_id)
        .bind(category)
        .fetch_optional(self.db.pool())
        .await
        .map_err(storage)?;

        Ok(row.map(|row| BeliefCell {
            agent_id: agent_id.to_string(),
            category: category.to_string(),
            alpha: row.get("alpha"),
            beta: row.get("beta"),
            observations: row.get::<i64, _>("observations") as u64,
            updated_at: from_ms(row.get("updated_at")),
        }))
    }

    async fn compare_and_put(
        &self,
        expected: Option<&BeliefCell>,
        next: BeliefCell,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO agent_beliefs
                         (agent_id, task_category, alpha, beta, observations, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?)
                     ON CONFLICT (agent_id, task_category) DO NOTHING",
                )
                .bind(&next.agent_id)
                .bind(&next.category)
                .bind(next.alpha)
                .bind(next.beta)
                .bind(next.observations as i64)
                .bind(to_ms(next.updated_at))
                .execute(self.db.pool())
                .await
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE agent_beliefs
                     SET alpha = ?, beta = ?, observations = ?, updated_at = ?
                     WHERE agent_id = ? AND task_category = ?
                       AND alpha = ? AND beta = ? AND observations = ?",
                )
                .bind(next.alpha)
                .bind(next.beta)
                .bind(next.observations as i64)
                .bind(to_ms(next.updated_at))
                .bind(&next.agent_id)
                .bind(&next.category)
                .bind(expected.alpha)
                .bind(expected.beta)
                .bind(expected.observations as i64)
                .execute(self.db.pool())
                .await
            }
        };
        Ok(result.map_err(storage)?.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_journal::{NewCommand, WorkflowEvent, WorkflowOutcome};
    use serde_json::json;

    async fn journal() -> SqliteJournal {
        SqliteJournal::new(Database::open_in_memory().await.unwrap())
    }

    fn start_commit(workflow_id: &str, expected_version: u64) -> Commit {
        Commit {
            workflow_id: workflow_id.to_string(),
            expected_version,
            events: vec![WorkflowEvent::WorkflowStarted {
                workflow: "demo".to_string(),
                namespace: "tests".to_string(),
                initial: json!({}),
            }],
            instance: json!({"phase": "running"}),
            phase: WorkflowPhase::Running,
            enqueue: vec![],
            cache: vec![],
        }
    }

    #[tokio::test]
    async fn test_commit_and_read_round_trip() {
        let journal = journal().await;

        let mut commit = start_commit("wf-1", 0);
        commit.events.push(WorkflowEvent::WorkflowCompleted {
            outcome: WorkflowOutcome::Success,
            final_answer: Some("42".to_string()),
            total_duration_ms: 10,
        });
        let head = journal.commit(commit).await.unwrap();
        assert_eq!(head, 2);

        let events = journal.read("wf-1", None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);
        assert!(matches!(
            events[1].event,
            WorkflowEvent::WorkflowCompleted { outcome: WorkflowOutcome::Success, .. }
        ));

        assert_eq!(journal.head("wf-1").await.unwrap(), 2);
        let instance = journal.load_instance("wf-1").await.unwrap().unwrap();
        assert_eq!(instance, json!({"phase": "running"}));
    }

    #[tokio::test]
    async fn test_version_conflict_rolls_back_everything() {
        let journal = journal().await;
        journal.commit(start_commit("wf-1", 0)).await.unwrap();

        let mut stale = start_commit("wf-1", 0);
        stale.enqueue = vec![NewCommand::immediate(json!({"kind": "tick"}))];
        let err = journal.commit(stale).await.unwrap_err();
        assert!(matches!(err, JournalError::Conflict { expected: 0, found: 1, .. }));

        // The conflicting commit left no outbox rows behind.
        let leased = journal
            .lease(Utc::now(), Duration::seconds(30), 10)
            .await
            .unwrap();
        assert!(leased.is_empty());
        assert_eq!(journal.head("wf-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outbox_lease_complete_fail_cycle() {
        let journal = journal().await;
        let mut commit = start_commit("wf-1", 0);
        commit.enqueue = vec![NewCommand::immediate(json!({"kind": "tick"}))];
        journal.commit(commit).await.unwrap();

        let now = Utc::now();
        let leased = journal.lease(now, Duration::seconds(30), 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempts, 1);

        // Invisible while leased.
        assert!(journal.lease(now, Duration::seconds(30), 10).await.unwrap().is_empty());

        let retry_at = now + Duration::seconds(90);
        journal.fail(&leased[0].id, "busy", retry_at).await.unwrap();
        assert!(journal.lease(now, Duration::seconds(30), 10).await.unwrap().is_empty());

        let again = journal
            .lease(retry_at, Duration::seconds(30), 10)
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 2);
        assert_eq!(again[0].last_error.as_deref(), Some("busy"));

        journal.complete(&again[0].id).await.unwrap();
        assert_eq!(journal.pending("wf-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_step_cache_expiry() {
        let journal = journal().await;
        let now = Utc::now();
        StepCacheStore::put(
            &journal,
            CacheWrite {
                step_id: "gen".to_string(),
                fingerprint: "fp".to_string(),
                result: json!({"x": 1}),
                expires_at: Some(now + Duration::seconds(60)),
            },
        )
        .await
        .unwrap();

        assert!(StepCacheStore::get(&journal, "gen", "fp", now)
            .await
            .unwrap()
            .is_some());
        assert!(StepCacheStore::get(&journal, "gen", "fp", now + Duration::seconds(120))
            .await
            .unwrap()
            .is_none());
        // Lazy eviction removed the row already.
        assert_eq!(
            journal
                .evict_expired(now + Duration::seconds(120))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_belief_compare_and_put() {
        let journal = journal().await;
        let cell = BeliefCell {
            agent_id: "coder".to_string(),
            category: "code_generation".to_string(),
            alpha: 2.0,
            beta: 2.0,
            observations: 0,
            updated_at: Utc::now(),
        };

        assert!(journal.compare_and_put(None, cell.clone()).await.unwrap());
        assert!(!journal.compare_and_put(None, cell.clone()).await.unwrap());

        let mut next = cell.clone();
        next.alpha = 3.0;
        next.observations = 1;
        assert!(journal
            .compare_and_put(Some(&cell), next.clone())
            .await
            .unwrap());
        assert!(!journal.compare_and_put(Some(&cell), next.clone()).await.unwrap());

        let loaded = BeliefStore::get(&journal, "coder", "code_generation")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.alpha, 3.0);
        assert_eq!(loaded.observations, 1);
    }

    #[tokio::test]
    async fn test_approvals_due_and_remove() {
        let journal = journal().await;
        let now = Utc::now();
        ApprovalStore::put(
            &journal,
            PendingApproval {
                workflow_id: "wf-1".to_string(),
                approver: "ops".to_string(),
                options: vec!["approve".to_string(), "reject".to_string()],
                deadline: Some(now + Duration::minutes(10)),
                requested_at: now,
            },
        )
        .await
        .unwrap();

        assert!(journal.due(now).await.unwrap().is_empty());
        let due = journal.due(now + Duration::minutes(11)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].options.len(), 2);

        let removed = journal.remove("wf-1").await.unwrap();
        assert!(removed.is_some());
        assert!(journal.remove("wf-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_latest_with_bound() {
        let journal = journal().await;
        for version in [8u64, 16, 24] {
            journal
                .save(Snapshot {
                    workflow_id: "wf-1".to_string(),
                    version,
                    state: json!({"at": version}),
                })
                .await
                .unwrap();
        }

        let latest = journal.latest("wf-1", None).await.unwrap().unwrap();
        assert_eq!(latest.version, 24);

        let bounded = journal.latest("wf-1", Some(20)).await.unwrap().unwrap();
        assert_eq!(bounded.version, 16);
        assert_eq!(bounded.state, json!({"at": 16}));

        assert!(journal.latest("wf-2", None).await.unwrap().is_none());
    }
}

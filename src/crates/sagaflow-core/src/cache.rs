//! Step execution ledger - content-addressed result memoization
//!
//! The ledger caches a step's resulting state keyed by
//! `(step identity, input fingerprint)`. Recovery replays and duplicate
//! outbox deliveries consult it before invoking the step, which is what
//! turns at-least-once delivery into exactly-once observable behavior.
//!
//! Guarantees:
//! - **At most one build per fingerprint**: concurrent lookups for a key
//!   that is currently being built park on the in-flight build and all
//!   observe its result.
//! - **Failures are not cached**: an abandoned build releases the slot so
//!   the next caller re-attempts.
//! - **TTL**: entries expire against the injected clock and are evicted
//!   lazily on touch.
//! - **Graceful degradation**: a backend read failure is a miss, never
//!   fatal.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use sagaflow_journal::{CacheWrite, Clock, StepCacheStore};

use crate::state::WorkflowState;

/// Stable fingerprint over a step's identity and its chosen input fields
///
/// `fields` restricts which state fields contribute; `None` hashes the whole
/// state. `serde_json` maps are key-ordered, so serialization is canonical.
pub fn fingerprint(step_type: &str, state: &WorkflowState, fields: Option<&[String]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step_type.as_bytes());
    hasher.update([0u8]);
    match fields {
        Some(fields) => {
            for field in fields {
                hasher.update(field.as_bytes());
                hasher.update([0x1f]);
                if let Some(value) = state.get(field) {
                    hasher.update(value.to_string().as_bytes());
                }
                hasher.update([0x1e]);
            }
        }
        None => {
            hasher.update(Value::Object(state.fields.clone()).to_string().as_bytes());
        }
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

type LedgerKey = (String, String);

/// Outcome of [`StepLedger::acquire`]
pub enum Lookup {
    /// Cached result; the step must not be invoked
    Hit(Value),
    /// This caller owns the build and must resolve the permit
    Build(BuildPermit),
}

/// Exclusive right to build one fingerprint
///
/// Dropping the permit without [`BuildPermit::complete`] releases the slot
/// without caching, so failed builds are re-attempted by the next caller.
pub struct BuildPermit {
    key: LedgerKey,
    in_flight: Arc<Mutex<HashMap<LedgerKey, Arc<Notify>>>>,
    resolved: bool,
}

impl BuildPermit {
    fn release(&mut self) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        let notify = {
            let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            map.remove(&self.key)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Release the slot without caching (failed build)
    pub fn abandon(mut self) {
        self.release();
    }
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// The step execution ledger
pub struct StepLedger {
    store: Arc<dyn StepCacheStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Option<chrono::Duration>,
    in_flight: Arc<Mutex<HashMap<LedgerKey, Arc<Notify>>>>,
}

impl StepLedger {
    pub fn new(
        store: Arc<dyn StepCacheStore>,
        clock: Arc<dyn Clock>,
        default_ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            store,
            clock,
            default_ttl,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Plain lookup: cached result or `None`, never blocking on builds
    pub async fn try_get(&self, step_id: &str, fp: &str) -> Option<Value> {
        match self.store.get(step_id, fp, self.clock.now()).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(step_id, error = %err, "step cache lookup failed; treating as miss");
                None
            }
        }
    }

    /// Lookup that coordinates concurrent builders
    ///
    /// Returns [`Lookup::Hit`] with the cached value, or [`Lookup::Build`]
    /// granting this caller the build. Concurrent callers for the same key
    /// wait for the in-flight build and re-check the cache.
    pub async fn acquire(&self, step_id: &str, fp: &str) -> Lookup {
        let key: LedgerKey = (step_id.to_string(), fp.to_string());
        loop {
            if let Some(value) = self.try_get(step_id, fp).await {
                return Lookup::Hit(value);
            }

            let waiter = {
                let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                match map.get(&key) {
                    Some(notify) => Some(notify.clone()),
                    None => {
                        map.insert(key.clone(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match waiter {
                None => {
                    return Lookup::Build(BuildPermit {
                        key,
                        in_flight: self.in_flight.clone(),
                        resolved: false,
                    });
                }
                Some(notify) => {
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // The builder may have finished between the map read and
                    // enabling the waiter; only park while the slot is held.
                    let still_building = {
                        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                        map.contains_key(&key)
                    };
                    if still_building {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Cache a successful build and release its permit
    ///
    /// A backend write failure degrades to "not cached": the permit is still
    /// released and waiting callers re-attempt.
    pub async fn complete(
        &self,
        mut permit: BuildPermit,
        result: Value,
        ttl: Option<chrono::Duration>,
    ) {
        let write = self.cache_write(&permit.key.0, &permit.key.1, result, ttl);
        if let Err(err) = self.store.put(write).await {
            tracing::warn!(step_id = %permit.key.0, error = %err, "step cache write failed");
        }
        permit.release();
    }

    /// The write this ledger would perform, for callers that fold it into a
    /// larger transaction before releasing the permit
    pub fn cache_write(
        &self,
        step_id: &str,
        fp: &str,
        result: Value,
        ttl: Option<chrono::Duration>,
    ) -> CacheWrite {
        let ttl = ttl.or(self.default_ttl);
        CacheWrite {
            step_id: step_id.to_string(),
            fingerprint: fp.to_string(),
            result,
            expires_at: ttl.map(|ttl| self.clock.now() + ttl),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_journal::{ManualClock, MemoryJournal};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ledger_with_clock(clock: Arc<ManualClock>) -> StepLedger {
        let journal = Arc::new(MemoryJournal::with_clock(clock.clone()));
        StepLedger::new(journal, clock, Some(chrono::Duration::minutes(10)))
    }

    #[test]
    fn test_fingerprint_is_stable_and_field_sensitive() {
        let state_a = WorkflowState::new("wf", json!({"x": 1, "y": 2})).unwrap();
        let state_b = WorkflowState::new("wf", json!({"y": 2, "x": 1})).unwrap();
        let fields = vec!["x".to_string()];

        // Key order does not matter; serialization is canonical.
        assert_eq!(
            fingerprint("gen", &state_a, None),
            fingerprint("gen", &state_b, None)
        );

        // Restricting fields ignores the rest of the state.
        let state_c = WorkflowState::new("wf", json!({"x": 1, "y": 99})).unwrap();
        assert_eq!(
            fingerprint("gen", &state_a, Some(&fields)),
            fingerprint("gen", &state_c, Some(&fields))
        );

        // Different step identity, different key.
        assert_ne!(
            fingerprint("gen", &state_a, None),
            fingerprint("test", &state_a, None)
        );

        // Changing a contributing field changes the key.
        let state_d = WorkflowState::new("wf", json!({"x": 2, "y": 2})).unwrap();
        assert_ne!(
            fingerprint("gen", &state_a, Some(&fields)),
            fingerprint("gen", &state_d, Some(&fields))
        );
    }

    #[tokio::test]
    async fn test_build_then_hit() {
        let clock = Arc::new(ManualClock::from_system());
        let ledger = ledger_with_clock(clock);

        let permit = match ledger.acquire("step", "fp").await {
            Lookup::Build(permit) => permit,
            Lookup::Hit(_) => panic!("expected a miss"),
        };
        ledger.complete(permit, json!({"out": 1}), None).await;

        match ledger.acquire("step", "fp").await {
            Lookup::Hit(value) => assert_eq!(value, json!({"out": 1})),
            Lookup::Build(_) => panic!("expected a hit"),
        }
    }

    #[tokio::test]
    async fn test_abandoned_build_releases_slot_without_caching() {
        let clock = Arc::new(ManualClock::from_system());
        let ledger = ledger_with_clock(clock);

        match ledger.acquire("step", "fp").await {
            Lookup::Build(permit) => permit.abandon(),
            Lookup::Hit(_) => panic!("expected a miss"),
        }

        // Next caller gets the build again.
        assert!(matches!(
            ledger.acquire("step", "fp").await,
            Lookup::Build(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquires_build_exactly_once() {
        let clock = Arc::new(ManualClock::from_system());
        let ledger = Arc::new(ledger_with_clock(clock));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                match ledger.acquire("step", "fp").await {
                    Lookup::Hit(value) => value,
                    Lookup::Build(permit) => {
                        builds.fetch_add(1, Ordering::SeqCst);
                        // Simulate work before publishing.
                        tokio::task::yield_now().await;
                        let value = json!({"out": "built"});
                        ledger.complete(permit, value.clone(), None).await;
                        value
                    }
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!({"out": "built"}));
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_yields_rebuild() {
        let clock = Arc::new(ManualClock::from_system());
        let ledger = ledger_with_clock(clock.clone());

        let permit = match ledger.acquire("step", "fp").await {
            Lookup::Build(permit) => permit,
            Lookup::Hit(_) => panic!("expected a miss"),
        };
        ledger
            .complete(permit, json!(1), Some(chrono::Duration::seconds(30)))
            .await;

        assert!(ledger.try_get("step", "fp").await.is_some());
        clock.advance(chrono::Duration::seconds(31));
        assert!(ledger.try_get("step", "fp").await.is_none());
        assert!(matches!(
            ledger.acquire("step", "fp").await,
            Lookup::Build(_)
        ));
    }
}

//! Outbox message model and redelivery backoff
//!
//! Commands that advance a workflow instance are not sent directly: the tick
//! that produces them commits them into the outbox alongside its events, and
//! a dispatcher pump leases and delivers them afterwards. A crash between
//! commit and dispatch is recovered by the next lease scan.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command being enqueued as part of a [`Commit`](crate::traits::Commit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCommand {
    /// Opaque engine command document
    pub command: Value,
    /// Earliest delivery time; `None` means immediately
    pub not_before: Option<DateTime<Utc>>,
}

impl NewCommand {
    pub fn immediate(command: Value) -> Self {
        Self {
            command,
            not_before: None,
        }
    }

    pub fn delayed(command: Value, not_before: DateTime<Utc>) -> Self {
        Self {
            command,
            not_before: Some(not_before),
        }
    }
}

/// A leased outbox row as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub workflow_id: String,
    pub command: Value,
    pub not_before: DateTime<Utc>,
    /// Delivery attempts so far, including the current lease
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Exponential redelivery backoff for failed outbox deliveries
///
/// Doubles from `base` per attempt, capped at `max`. Attempt numbering is
/// 1-based (the first redelivery after one failed attempt waits `base`).
pub fn redelivery_backoff(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    let delay = base * 2_i32.saturating_pow(exp);
    if delay > max {
        max
    } else {
        delay
    }
}

/// Default not-before for a failed delivery observed at `now`
pub fn next_attempt_at(now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
    now + redelivery_backoff(attempts, Duration::seconds(1), Duration::minutes(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::seconds(1);
        let max = Duration::minutes(5);

        assert_eq!(redelivery_backoff(1, base, max), Duration::seconds(1));
        assert_eq!(redelivery_backoff(2, base, max), Duration::seconds(2));
        assert_eq!(redelivery_backoff(3, base, max), Duration::seconds(4));
        assert_eq!(redelivery_backoff(10, base, max), max);
        assert_eq!(redelivery_backoff(32, base, max), max);
    }

    #[test]
    fn test_next_attempt_moves_forward() {
        let now = Utc::now();
        assert!(next_attempt_at(now, 1) > now);
        assert!(next_attempt_at(now, 5) > next_attempt_at(now, 2));
    }
}

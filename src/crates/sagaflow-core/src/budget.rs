//! Budget guard - atomic multi-dimensional resource accounting
//!
//! Each workflow instance owns a single [`BudgetDimensions`] allocation
//! covering five dimensions: steps, tokens, executions, tool calls and wall
//! seconds. Reservation is all-or-nothing: if any dimension would go
//! negative the reservation fails with `BudgetExhausted` and nothing is
//! consumed. A [`ScarcityLevel`] scales reservation costs through strictly
//! increasing multipliers, so the same allocation drains faster under
//! pressure.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, WorkflowError};

/// The five budget dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetDimensions {
    pub steps: u64,
    pub tokens: u64,
    pub executions: u64,
    pub tool_calls: u64,
    pub wall_seconds: u64,
}

impl BudgetDimensions {
    pub const ZERO: BudgetDimensions = BudgetDimensions {
        steps: 0,
        tokens: 0,
        executions: 0,
        tool_calls: 0,
        wall_seconds: 0,
    };

    /// Default per-step reservation estimate
    pub fn single_step() -> Self {
        Self {
            steps: 1,
            tokens: 0,
            executions: 1,
            tool_calls: 0,
            wall_seconds: 0,
        }
    }

    /// Scale every dimension by a cost multiplier, rounding up
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |units: u64| -> u64 { ((units as f64) * factor).ceil() as u64 };
        Self {
            steps: scale(self.steps),
            tokens: scale(self.tokens),
            executions: scale(self.executions),
            tool_calls: scale(self.tool_calls),
            wall_seconds: scale(self.wall_seconds),
        }
    }

    /// Subtract `other` from every dimension; `None` names the first
    /// dimension that would go negative
    pub fn checked_sub(&self, other: &Self) -> std::result::Result<Self, &'static str> {
        Ok(Self {
            steps: self.steps.checked_sub(other.steps).ok_or("steps")?,
            tokens: self.tokens.checked_sub(other.tokens).ok_or("tokens")?,
            executions: self
                .executions
                .checked_sub(other.executions)
                .ok_or("executions")?,
            tool_calls: self
                .tool_calls
                .checked_sub(other.tool_calls)
                .ok_or("tool_calls")?,
            wall_seconds: self
                .wall_seconds
                .checked_sub(other.wall_seconds)
                .ok_or("wall_seconds")?,
        })
    }

    pub fn saturating_add(&self, other: &Self) -> Self {
        Self {
            steps: self.steps.saturating_add(other.steps),
            tokens: self.tokens.saturating_add(other.tokens),
            executions: self.executions.saturating_add(other.executions),
            tool_calls: self.tool_calls.saturating_add(other.tool_calls),
            wall_seconds: self.wall_seconds.saturating_add(other.wall_seconds),
        }
    }

    pub fn saturating_sub(&self, other: &Self) -> Self {
        Self {
            steps: self.steps.saturating_sub(other.steps),
            tokens: self.tokens.saturating_sub(other.tokens),
            executions: self.executions.saturating_sub(other.executions),
            tool_calls: self.tool_calls.saturating_sub(other.tool_calls),
            wall_seconds: self.wall_seconds.saturating_sub(other.wall_seconds),
        }
    }
}

/// How scarce shared capacity currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScarcityLevel {
    Abundant,
    Normal,
    Scarce,
    Critical,
}

impl ScarcityLevel {
    fn index(&self) -> usize {
        match self {
            ScarcityLevel::Abundant => 0,
            ScarcityLevel::Normal => 1,
            ScarcityLevel::Scarce => 2,
            ScarcityLevel::Critical => 3,
        }
    }
}

/// Validated budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Base allocation granted to each new instance
    pub allocation: BudgetDimensions,
    /// Cost multipliers per scarcity level, strictly increasing
    pub scarcity_multipliers: [f64; 4],
    /// Weight per dimension when scoring spend; all non-negative
    pub weights: [f64; 5],
    /// Fraction of the allocation held back for retries, in [0, 0.5]
    pub retry_margin: f64,
    pub scarcity: ScarcityLevel,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            allocation: BudgetDimensions {
                steps: 256,
                tokens: 1_000_000,
                executions: 512,
                tool_calls: 256,
                wall_seconds: 3_600,
            },
            scarcity_multipliers: [1.0, 1.5, 3.0, 10.0],
            weights: [1.0; 5],
            retry_margin: 0.1,
            scarcity: ScarcityLevel::Normal,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        for window in self.scarcity_multipliers.windows(2) {
            if window[1] <= window[0] {
                return Err(WorkflowError::Validation(
                    "scarcity multipliers must be strictly increasing".to_string(),
                ));
            }
        }
        if self.weights.iter().any(|w| *w < 0.0) {
            return Err(WorkflowError::Validation(
                "budget weights must be non-negative".to_string(),
            ));
        }
        if !(0.0..=0.5).contains(&self.retry_margin) {
            return Err(WorkflowError::Validation(
                "retry margin must lie in [0, 0.5]".to_string(),
            ));
        }
        Ok(())
    }

    /// Cost multiplier at the configured scarcity level
    pub fn cost_multiplier(&self) -> f64 {
        self.scarcity_multipliers[self.scarcity.index()]
    }

    /// An estimate scaled by the scarcity cost multiplier
    pub fn effective_cost(&self, estimate: &BudgetDimensions) -> BudgetDimensions {
        estimate.scaled(self.cost_multiplier())
    }
}

/// Pure, all-or-nothing reservation against an allocation
///
/// The engine calls this on the allocation embedded in the instance record,
/// inside the per-instance tick lock; [`BudgetGuard`] wraps the same logic
/// behind a mutex for callers outside the engine.
pub fn reserve(
    remaining: &mut BudgetDimensions,
    request: &BudgetDimensions,
) -> Result<BudgetDimensions> {
    match remaining.checked_sub(request) {
        Ok(next) => {
            *remaining = next;
            Ok(*request)
        }
        Err(dimension) => Err(WorkflowError::BudgetExhausted {
            dimension: dimension.to_string(),
        }),
    }
}

/// Settle a reservation against actual usage
///
/// Unused reservation flows back; overage beyond the reservation is drained
/// saturating at zero.
pub fn commit(remaining: &mut BudgetDimensions, reserved: &BudgetDimensions, actual: &BudgetDimensions) {
    let refund = reserved.saturating_sub(actual);
    let overage = actual.saturating_sub(reserved);
    *remaining = remaining.saturating_add(&refund).saturating_sub(&overage);
}

/// Return an unused reservation in full
pub fn refund(remaining: &mut BudgetDimensions, unused: &BudgetDimensions) {
    *remaining = remaining.saturating_add(unused);
}

/// Thread-safe budget allocation for concurrent reservation
///
/// Concurrent step dispatches within a fork serialize on the internal mutex,
/// so reservations can never over-commit the shared allocation.
pub struct BudgetGuard {
    remaining: Mutex<BudgetDimensions>,
    config: BudgetConfig,
}

impl BudgetGuard {
    pub fn new(config: BudgetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            remaining: Mutex::new(config.allocation),
            config,
        })
    }

    pub async fn reserve(&self, estimate: &BudgetDimensions) -> Result<BudgetDimensions> {
        let cost = self.config.effective_cost(estimate);
        let mut remaining = self.remaining.lock().await;
        reserve(&mut remaining, &cost)
    }

    pub async fn commit(&self, reserved: &BudgetDimensions, actual: &BudgetDimensions) {
        let actual = self.config.effective_cost(actual);
        let mut remaining = self.remaining.lock().await;
        commit(&mut remaining, reserved, &actual);
    }

    pub async fn refund(&self, unused: &BudgetDimensions) {
        let mut remaining = self.remaining.lock().await;
        refund(&mut remaining, unused);
    }

    pub async fn remaining(&self) -> BudgetDimensions {
        *self.remaining.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BudgetDimensions {
        BudgetDimensions {
            steps: 10,
            tokens: 1000,
            executions: 10,
            tool_calls: 5,
            wall_seconds: 60,
        }
    }

    #[test]
    fn test_failed_reservation_leaves_dimensions_unchanged() {
        let mut remaining = small();
        let request = BudgetDimensions {
            steps: 1,
            tokens: 5000, // exceeds the token dimension
            executions: 1,
            tool_calls: 0,
            wall_seconds: 0,
        };

        let err = reserve(&mut remaining, &request).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::BudgetExhausted { ref dimension } if dimension == "tokens"
        ));
        assert_eq!(remaining, small());
    }

    #[test]
    fn test_successful_reservation_decrements_exactly() {
        let mut remaining = small();
        let request = BudgetDimensions {
            steps: 2,
            tokens: 100,
            executions: 1,
            tool_calls: 1,
            wall_seconds: 10,
        };

        reserve(&mut remaining, &request).unwrap();
        assert_eq!(remaining.steps, 8);
        assert_eq!(remaining.tokens, 900);
        assert_eq!(remaining.executions, 9);
        assert_eq!(remaining.tool_calls, 4);
        assert_eq!(remaining.wall_seconds, 50);
    }

    #[test]
    fn test_commit_refunds_unused_and_drains_overage() {
        let mut remaining = small();
        let reserved = reserve(
            &mut remaining,
            &BudgetDimensions {
                steps: 1,
                tokens: 500,
                executions: 1,
                tool_calls: 0,
                wall_seconds: 0,
            },
        )
        .unwrap();

        // Used fewer tokens than reserved but one extra tool call.
        let actual = BudgetDimensions {
            steps: 1,
            tokens: 200,
            executions: 1,
            tool_calls: 1,
            wall_seconds: 0,
        };
        commit(&mut remaining, &reserved, &actual);

        assert_eq!(remaining.tokens, 800);
        assert_eq!(remaining.tool_calls, 4);
        assert_eq!(remaining.steps, 9);
    }

    #[test]
    fn test_config_validation() {
        let mut config = BudgetConfig::default();
        assert!(config.validate().is_ok());

        config.scarcity_multipliers = [1.0, 1.5, 1.5, 10.0];
        assert!(config.validate().is_err());

        config = BudgetConfig::default();
        config.retry_margin = 0.6;
        assert!(config.validate().is_err());

        config = BudgetConfig::default();
        config.weights[2] = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scarcity_scales_cost() {
        let mut config = BudgetConfig::default();
        config.scarcity = ScarcityLevel::Critical;
        let estimate = BudgetDimensions {
            steps: 1,
            tokens: 100,
            executions: 1,
            tool_calls: 0,
            wall_seconds: 0,
        };
        let cost = config.effective_cost(&estimate);
        assert_eq!(cost.tokens, 1000);
        assert_eq!(cost.steps, 10);
    }

    #[tokio::test]
    async fn test_guard_serializes_concurrent_reservations() {
        let mut config = BudgetConfig::default();
        config.allocation = BudgetDimensions {
            steps: 4,
            tokens: 1000,
            executions: 4,
            tool_calls: 4,
            wall_seconds: 600,
        };
        config.scarcity = ScarcityLevel::Abundant;
        let guard = std::sync::Arc::new(BudgetGuard::new(config).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.reserve(&BudgetDimensions::single_step()).await.is_ok()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        // Only four single-step reservations fit; no over-commit.
        assert_eq!(granted, 4);
        assert_eq!(guard.remaining().await.steps, 0);
    }
}

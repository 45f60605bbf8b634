//! Adaptive batch sizing.
//!
//! The thresholds and deltas are empirical; they live in [`BatchPolicy`] so a
//! deployment can retune them from `conductor.toml` without a rebuild.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for [`AdaptiveBatchController`]. All fields map 1:1 to the
/// `[batch]` section of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Lower bound of the batch window
    pub min_batch: u32,
    /// Upper bound of the batch window
    pub max_batch: u32,
    /// Successful cycles faster than this grow the batch
    pub fast_threshold_secs: u64,
    /// Successful cycles slower than this shrink the batch
    pub slow_threshold_secs: u64,
    pub grow_step: u32,
    pub shrink_step: u32,
    /// Slow cycles never shrink the batch below this
    pub slow_floor: u32,
    pub failure_step: u32,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            min_batch: 1,
            max_batch: 20,
            fast_threshold_secs: 60,
            slow_threshold_secs: 180,
            grow_step: 2,
            shrink_step: 1,
            slow_floor: 3,
            failure_step: 2,
        }
    }
}

impl BatchPolicy {
    /// Problems with the policy itself, for config validation.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.min_batch == 0 {
            problems.push("batch.min_batch must be at least 1".to_string());
        }
        if self.min_batch > self.max_batch {
            problems.push(format!(
                "batch.min_batch ({}) exceeds batch.max_batch ({})",
                self.min_batch, self.max_batch
            ));
        }
        if self.fast_threshold_secs > self.slow_threshold_secs {
            problems.push(format!(
                "batch.fast_threshold_secs ({}) exceeds batch.slow_threshold_secs ({})",
                self.fast_threshold_secs, self.slow_threshold_secs
            ));
        }
        problems
    }

    /// Clamp `size` into `[min_batch, max_batch]`.
    pub fn clamp(&self, size: u32) -> u32 {
        size.clamp(self.min_batch, self.max_batch.max(self.min_batch))
    }
}

/// Computes the next cycle's batch size from the previous cycle.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchController {
    policy: BatchPolicy,
    current: u32,
    enabled: bool,
}

impl AdaptiveBatchController {
    pub fn new(policy: BatchPolicy, initial: u32, enabled: bool) -> Self {
        let current = policy.clamp(initial);
        Self {
            policy,
            current,
            enabled,
        }
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Apply the outcome of a cycle and return the new batch size.
    pub fn observe(&mut self, success: bool, duration: Duration) -> u32 {
        if !self.enabled {
            return self.current;
        }
        let p = &self.policy;
        let next = if !success {
            self.current
                .saturating_sub(p.failure_step)
                .max(p.min_batch)
        } else if duration < Duration::from_secs(p.fast_threshold_secs) {
            self.current.saturating_add(p.grow_step).min(p.max_batch)
        } else if duration > Duration::from_secs(p.slow_threshold_secs) {
            self.current.saturating_sub(p.shrink_step).max(p.slow_floor)
        } else {
            self.current
        };
        self.current = self.policy.clamp(next);
        self.current
    }

    /// Force the batch size (recovery baseline, resumed sessions).
    pub fn reset_to(&mut self, size: u32) -> u32 {
        self.current = self.policy.clamp(size);
        self.current
    }
}

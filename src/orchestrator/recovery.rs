//! Bounded recovery after a failed cycle.

use crate::errors::RecoveryError;
use crate::orchestrator::batch::AdaptiveBatchController;
use crate::registry::DiscoveryClient;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// `[recovery]` section of `conductor.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub max_recovery_attempts: u32,
    /// Batch size a recovery falls back to
    pub baseline_batch_size: u32,
    /// Capability of an external coordination service to re-resolve on recovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator_capability: Option<String>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            baseline_batch_size: 5,
            coordinator_capability: None,
        }
    }
}

/// A collaborator that needs re-initialising when the orchestrator recovers.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    fn name(&self) -> &str;
    async fn reinitialize(&self) -> Result<()>;
}

/// Re-resolves a coordination service through discovery and pings it.
pub struct ServiceReconnect {
    discovery: DiscoveryClient,
    capability: String,
}

impl ServiceReconnect {
    pub fn new(discovery: DiscoveryClient, capability: impl Into<String>) -> Self {
        Self {
            discovery,
            capability: capability.into(),
        }
    }
}

#[async_trait]
impl RecoveryHook for ServiceReconnect {
    fn name(&self) -> &str {
        &self.capability
    }

    async fn reinitialize(&self) -> Result<()> {
        let service = self
            .discovery
            .find_service(&self.capability, true)
            .await
            .ok_or_else(|| anyhow!("no provider for capability '{}'", self.capability))?;
        let endpoint = service.health_endpoint.as_deref().unwrap_or("/health");
        self.discovery
            .call_service(&service.id, endpoint, None)
            .await
            .ok_or_else(|| {
                anyhow!(
                    "coordination service {} at {}:{} did not answer",
                    service.name,
                    service.host,
                    service.port
                )
            })?;
        tracing::info!(
            component = "recovery",
            capability = %self.capability,
            service_id = %service.id,
            "Re-established coordination service"
        );
        Ok(())
    }
}

/// Tracks recovery attempts against a fixed budget.
pub struct RecoveryManager {
    policy: RecoveryPolicy,
    attempts: u32,
    hooks: Vec<Arc<dyn RecoveryHook>>,
}

impl RecoveryManager {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn RecoveryHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_recovery_attempts
    }

    /// Restore a counter from a persisted session.
    pub fn restore(&mut self, attempts: u32) {
        self.attempts = attempts.min(self.policy.max_recovery_attempts);
    }

    /// Try to recover. On success the batch size is at the baseline and the
    /// orchestrator may re-enter the pipeline.
    pub async fn attempt(
        &mut self,
        batch: &mut AdaptiveBatchController,
    ) -> Result<u32, RecoveryError> {
        if self.attempts >= self.policy.max_recovery_attempts {
            return Err(RecoveryError::Exhausted {
                attempts: self.attempts,
                max: self.policy.max_recovery_attempts,
            });
        }
        self.attempts += 1;
        let batch_size = batch.reset_to(self.policy.baseline_batch_size);

        for hook in &self.hooks {
            if let Err(e) = hook.reinitialize().await {
                tracing::warn!(
                    component = "recovery",
                    hook = hook.name(),
                    error = %e,
                    "Collaborator re-initialisation failed"
                );
            }
        }

        tracing::info!(
            component = "recovery",
            attempt = self.attempts,
            max = self.policy.max_recovery_attempts,
            batch_size,
            "Recovery attempt succeeded"
        );
        Ok(self.attempts)
    }

    /// A cycle completed successfully; a prior recovery is now settled.
    pub fn record_success(&mut self) {
        if self.attempts > 0 {
            tracing::debug!(
                component = "recovery",
                attempts = self.attempts,
                "Resetting recovery counter after successful cycle"
            );
            self.attempts = 0;
        }
    }
}

//! Read-only discovery over a [`ServiceRegistry`].
//!
//! Selection is deliberately minimal: prefer loopback providers, then healthy
//! ones, then take the oldest registration. There is no weighting and no load
//! tracking.

use crate::registry::store::ServiceRegistry;
use crate::registry::types::{DiscoveryFilter, ServiceRegistration, ServiceStatus};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    registry: ServiceRegistry,
    http: reqwest::Client,
    call_timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub async fn discover(&self, filter: &DiscoveryFilter) -> Vec<ServiceRegistration> {
        self.registry.discover(filter).await
    }

    /// Pick one provider of `capability`, or `None` when there is none.
    pub async fn find_service(
        &self,
        capability: &str,
        prefer_local: bool,
    ) -> Option<ServiceRegistration> {
        let providers = self
            .registry
            .discover(&DiscoveryFilter::capability(capability))
            .await;
        let selected = select(providers, prefer_local);
        match &selected {
            Some(service) => tracing::debug!(
                component = "discovery",
                capability,
                service_id = %service.id,
                status = %service.status,
                "Selected provider"
            ),
            None => tracing::debug!(component = "discovery", capability, "No provider found"),
        }
        selected
    }

    /// Base URL a step uses to reach `service`.
    pub fn service_url(&self, service: &ServiceRegistration) -> String {
        service.base_url()
    }

    /// Call `{host}:{port}{endpoint}` on a registered service: GET without a
    /// payload, POST JSON with one. Any failure is logged and yields `None`.
    /// Non-JSON bodies are returned as a JSON string.
    pub async fn call_service(
        &self,
        service_id: &str,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> Option<Value> {
        let Some(service) = self.registry.get(service_id).await else {
            tracing::warn!(component = "discovery", service_id, "Unknown service id");
            return None;
        };
        let url = service.url_for(endpoint);
        let request = match payload {
            Some(body) => self.http.post(&url).json(body),
            None => self.http.get(&url),
        };
        let response = match request.timeout(self.call_timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(component = "discovery", url = %url, error = %e, "Service call failed");
                return None;
            }
        };
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                component = "discovery",
                url = %url,
                status = status.as_u16(),
                "Service call returned error status"
            );
            return None;
        }
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(component = "discovery", url = %url, error = %e, "Failed to read response");
                return None;
            }
        };
        Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Narrow to local providers if any, then healthy ones if any; first wins.
fn select(providers: Vec<ServiceRegistration>, prefer_local: bool) -> Option<ServiceRegistration> {
    let mut candidates = providers;
    if prefer_local && candidates.iter().any(ServiceRegistration::is_local) {
        candidates.retain(ServiceRegistration::is_local);
    }
    if candidates
        .iter()
        .any(|s| s.status == ServiceStatus::Healthy)
    {
        candidates.retain(|s| s.status == ServiceStatus::Healthy);
    }
    candidates.into_iter().next()
}

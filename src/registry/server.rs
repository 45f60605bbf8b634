//! HTTP API over a [`ServiceRegistry`], plus the periodic health sweep.
//!
//! Worker processes register here instead of touching the store files.

use crate::errors::RegistryError;
use crate::registry::store::ServiceRegistry;
use crate::registry::types::{
    CapabilityEntry, DiscoveryFilter, RegisterRequest, ServiceRegistration, ServiceStatus,
    ServiceType,
};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::InvalidRegistration(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: ServiceStatus,
}

/// Query string of `GET /services`; `tags` is comma-separated.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceQuery {
    pub service_type: Option<ServiceType>,
    pub capability: Option<String>,
    pub tags: Option<String>,
    pub status: Option<ServiceStatus>,
}

impl From<ServiceQuery> for DiscoveryFilter {
    fn from(q: ServiceQuery) -> Self {
        DiscoveryFilter {
            service_type: q.service_type,
            capability: q.capability,
            tags: q
                .tags
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            status: q.status,
        }
    }
}

pub fn build_router(registry: ServiceRegistry) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/services", get(list_services).post(register_service))
        .route(
            "/services/{id}",
            get(get_service).delete(unregister_service),
        )
        .route("/services/{id}/heartbeat", post(heartbeat))
        .route("/services/{id}/status", put(update_status))
        .route("/capabilities", get(list_capabilities))
        .with_state(registry)
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn register_service(
    State(registry): State<ServiceRegistry>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let id = registry.register(request).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { id })))
}

async fn list_services(
    State(registry): State<ServiceRegistry>,
    Query(query): Query<ServiceQuery>,
) -> Json<Vec<ServiceRegistration>> {
    Json(registry.discover(&query.into()).await)
}

async fn get_service(
    State(registry): State<ServiceRegistry>,
    Path(id): Path<String>,
) -> Result<Json<ServiceRegistration>, ApiError> {
    registry
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Service {} not found", id)))
}

async fn unregister_service(
    State(registry): State<ServiceRegistry>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if registry.unregister(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Service {} not found", id)))
    }
}

async fn heartbeat(
    State(registry): State<ServiceRegistry>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if registry.heartbeat(&id).await {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("Service {} not found", id)))
    }
}

async fn update_status(
    State(registry): State<ServiceRegistry>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> Result<StatusCode, ApiError> {
    if registry.update_status(&id, update.status).await {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::NotFound(format!("Service {} not found", id)))
    }
}

async fn list_capabilities(
    State(registry): State<ServiceRegistry>,
) -> Json<BTreeMap<String, Vec<CapabilityEntry>>> {
    Json(registry.capabilities().await)
}

/// Run `health_check_services()` every `interval` until `stop` flips.
async fn sweep_loop(registry: ServiceRegistry, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.health_check_services().await;
                tracing::debug!(
                    component = "registry",
                    checked = report.checked,
                    probed = report.probed,
                    changed = report.changes.len(),
                    "Health sweep finished"
                );
            }
            _ = stop.changed() => break,
        }
    }
}

/// Serve the API on `listener` and sweep in the background until `shutdown`
/// resolves.
pub async fn serve<F>(
    registry: ServiceRegistry,
    listener: TcpListener,
    sweep_interval: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweep_loop(registry.clone(), sweep_interval, stop_rx));

    let addr = listener.local_addr().context("Failed to read listener address")?;
    tracing::info!(component = "registry", addr = %addr, "Registry API listening");

    let result = axum::serve(listener, build_router(registry))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Registry server error");

    let _ = stop_tx.send(true);
    let _ = sweeper.await;
    tracing::info!(component = "registry", "Registry API shut down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::store::testing::ManualClock;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn lint_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "service_type": "ANALYZER",
            "name": name,
            "host": "127.0.0.1",
            "port": 9000,
            "capabilities": [{"name": "lint", "endpoints": ["/lint"]}],
            "tags": ["python"]
        })
    }

    async fn register(app: &Router, name: &str) -> String {
        let response = app
            .clone()
            .oneshot(json_request("POST", "/services", lint_body(name)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created: RegisterResponse = body_json(response.into_body()).await;
        created.id
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(ServiceRegistry::in_memory());
        let response = app.oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_register_get_and_heartbeat() {
        let app = build_router(ServiceRegistry::in_memory());
        let id = register(&app, "linter").await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/services/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let svc: ServiceRegistration = body_json(response.into_body()).await;
        assert_eq!(svc.status, ServiceStatus::Starting);

        let response = app
            .clone()
            .oneshot(empty_request("POST", &format!("/services/{id}/heartbeat")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/services?capability=lint&status=HEALTHY"))
            .await
            .unwrap();
        let found: Vec<ServiceRegistration> = body_json(response.into_body()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
    }

    #[tokio::test]
    async fn test_invalid_registration_is_bad_request() {
        let app = build_router(ServiceRegistry::in_memory());
        let mut body = lint_body("x");
        body["port"] = serde_json::json!(0);
        let response = app
            .oneshot(json_request("POST", "/services", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = build_router(ServiceRegistry::in_memory());
        for (method, uri) in [
            ("GET", "/services/missing"),
            ("DELETE", "/services/missing"),
            ("POST", "/services/missing/heartbeat"),
        ] {
            let response = app.clone().oneshot(empty_request(method, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
        }
        let response = app
            .oneshot(json_request(
                "PUT",
                "/services/missing/status",
                serde_json::json!({"status": "STOPPED"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_update_and_unregister() {
        let registry = ServiceRegistry::in_memory();
        let app = build_router(registry.clone());
        let id = register(&app, "linter").await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                &format!("/services/{id}/status"),
                serde_json::json!({"status": "DEGRADED"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            registry.get(&id).await.unwrap().status,
            ServiceStatus::Degraded
        );

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/services/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("GET", "/capabilities"))
            .await
            .unwrap();
        let caps: BTreeMap<String, Vec<CapabilityEntry>> = body_json(response.into_body()).await;
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_lists_every_provider() {
        let app = build_router(ServiceRegistry::in_memory());
        register(&app, "a").await;
        register(&app, "b").await;
        let response = app
            .oneshot(empty_request("GET", "/capabilities"))
            .await
            .unwrap();
        let caps: BTreeMap<String, Vec<CapabilityEntry>> = body_json(response.into_body()).await;
        assert_eq!(caps["lint"].len(), 2);
    }

    #[tokio::test]
    async fn test_query_tags_are_split() {
        let app = build_router(ServiceRegistry::in_memory());
        register(&app, "a").await;
        let response = app
            .clone()
            .oneshot(empty_request("GET", "/services?tags=python"))
            .await
            .unwrap();
        let found: Vec<ServiceRegistration> = body_json(response.into_body()).await;
        assert_eq!(found.len(), 1);

        let response = app
            .oneshot(empty_request("GET", "/services?tags=python,%20rust"))
            .await
            .unwrap();
        let found: Vec<ServiceRegistration> = body_json(response.into_body()).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_loop_runs_until_stopped() {
        let clock = ManualClock::new();
        let registry = ServiceRegistry::in_memory().with_clock(clock.clone());
        let id = registry
            .register(RegisterRequest::new(
                ServiceType::Worker,
                "w",
                "127.0.0.1",
                9000,
            ))
            .await
            .unwrap();
        registry.heartbeat(&id).await;
        clock.advance(Duration::from_secs(300));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(sweep_loop(
            registry.clone(),
            Duration::from_millis(20),
            stop_rx,
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(
            registry.get(&id).await.unwrap().status,
            ServiceStatus::Unhealthy
        );
    }
}

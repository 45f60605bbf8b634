//! The service registry: registrations, the capability index and the health
//! sweep.
//!
//! [`ServiceRegistry`] is a cheap-to-clone handle. Every read and write of the
//! registration map goes through its methods, which serialize on one lock, so
//! the HTTP API, the sweep task and in-process callers never race on the map.
//! When opened on a directory, every mutation is written back to
//! `services.json` and `capabilities.json` before the lock is released.

use crate::config::RegistryConfig;
use crate::errors::RegistryError;
use crate::registry::probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
use crate::registry::types::{
    CapabilityEntry, DiscoveryFilter, RegisterRequest, ServiceRegistration, ServiceStatus,
};
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub const SERVICES_FILE: &str = "services.json";
pub const CAPABILITIES_FILE: &str = "capabilities.json";

pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of "now" for heartbeat ageing.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

type CapabilityIndex = BTreeMap<String, Vec<CapabilityEntry>>;

#[derive(Debug, Default)]
struct Inner {
    services: BTreeMap<String, ServiceRegistration>,
    capabilities: CapabilityIndex,
}

impl Inner {
    fn insert(&mut self, service: ServiceRegistration) {
        for cap in &service.capabilities {
            self.capabilities
                .entry(cap.name.clone())
                .or_default()
                .push(CapabilityEntry {
                    service_id: service.id.clone(),
                    capability: cap.clone(),
                });
        }
        self.services.insert(service.id.clone(), service);
    }

    fn remove(&mut self, id: &str) -> Option<ServiceRegistration> {
        let service = self.services.remove(id)?;
        for cap in &service.capabilities {
            if let Some(entries) = self.capabilities.get_mut(&cap.name) {
                entries.retain(|e| e.service_id != id);
                if entries.is_empty() {
                    self.capabilities.remove(&cap.name);
                }
            }
        }
        Some(service)
    }
}

/// On-disk location of a registry.
#[derive(Debug, Clone)]
struct RegistryFiles {
    services: PathBuf,
    capabilities: PathBuf,
}

impl RegistryFiles {
    fn new(dir: &Path) -> Self {
        Self {
            services: dir.join(SERVICES_FILE),
            capabilities: dir.join(CAPABILITIES_FILE),
        }
    }

    fn load(&self) -> Result<Inner, RegistryError> {
        let mut inner = Inner::default();
        if !self.services.exists() {
            return Ok(inner);
        }
        let content = std::fs::read_to_string(&self.services).map_err(|source| RegistryError::Io {
            path: self.services.clone(),
            source,
        })?;
        let services: BTreeMap<String, ServiceRegistration> =
            serde_json::from_str(&content).map_err(|source| RegistryError::Corrupt {
                path: self.services.clone(),
                source,
            })?;
        // The capability index is derived; rebuilding it keeps it free of orphans.
        for service in services.into_values() {
            inner.insert(service);
        }
        Ok(inner)
    }

    fn save(&self, inner: &Inner) -> Result<(), RegistryError> {
        self.write(&self.services, &inner.services)?;
        self.write(&self.capabilities, &inner.capabilities)
    }

    fn write<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), RegistryError> {
        let json = serde_json::to_vec_pretty(value).map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &json).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A status change made by the health sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub service_id: String,
    pub from: ServiceStatus,
    pub to: ServiceStatus,
}

/// Outcome of one `health_check_services()` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub probed: usize,
    pub changes: Vec<StatusChange>,
}

/// What the sweep concluded about one service before re-taking the lock.
enum Verdict {
    Probed(ServiceStatus),
    Stale,
}

#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RwLock<Inner>>,
    files: Option<RegistryFiles>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn HealthProbe>,
    service_timeout: Duration,
    probe_timeout: Duration,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("files", &self.files)
            .field("service_timeout", &self.service_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceRegistry {
    /// A registry that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            files: None,
            clock: Arc::new(SystemClock),
            probe: Arc::new(HttpHealthProbe::new()),
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Open (or create) the registry stored in `config.dir`.
    pub fn open(config: &RegistryConfig) -> Result<Self, RegistryError> {
        std::fs::create_dir_all(&config.dir).map_err(|source| RegistryError::Io {
            path: config.dir.clone(),
            source,
        })?;
        let files = RegistryFiles::new(&config.dir);
        let inner = files.load()?;
        tracing::debug!(
            component = "registry",
            dir = %config.dir.display(),
            services = inner.services.len(),
            "Opened service registry"
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            files: Some(files),
            clock: Arc::new(SystemClock),
            probe: Arc::new(HttpHealthProbe::new()),
            service_timeout: config.service_timeout(),
            probe_timeout: config.probe_timeout(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_service_timeout(mut self, timeout: Duration) -> Self {
        self.service_timeout = timeout;
        self
    }

    fn persist(&self, inner: &Inner) -> Result<(), RegistryError> {
        match &self.files {
            Some(files) => files.save(inner),
            None => Ok(()),
        }
    }

    fn persist_logged(&self, inner: &Inner, operation: &str) {
        if let Err(e) = self.persist(inner) {
            tracing::error!(
                component = "registry",
                operation,
                error = %e,
                "Failed to persist registry"
            );
        }
    }

    /// Register a service in `STARTING` state and return its id.
    pub async fn register(&self, request: RegisterRequest) -> Result<String, RegistryError> {
        request.validate()?;
        let now = self.clock.now();
        let id = uuid::Uuid::new_v4().to_string();
        let service = ServiceRegistration {
            id: id.clone(),
            service_type: request.service_type,
            name: request.name,
            version: request.version,
            host: request.host,
            port: request.port,
            capabilities: request.capabilities,
            status: ServiceStatus::Starting,
            metadata: request.metadata,
            registered_at: now,
            last_heartbeat: now,
            health_endpoint: request.health_endpoint,
            tags: request.tags,
        };

        let mut inner = self.inner.write().await;
        let (name, capabilities) = (
            service.name.clone(),
            service
                .capabilities
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>(),
        );
        inner.insert(service);
        if let Err(e) = self.persist(&inner) {
            inner.remove(&id);
            return Err(e);
        }
        tracing::info!(
            component = "registry",
            service_id = %id,
            name = %name,
            capabilities = ?capabilities,
            "Service registered"
        );
        Ok(id)
    }

    /// Remove a registration and its index entries. Unknown ids return false.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(service) = inner.remove(id) else {
            return false;
        };
        self.persist_logged(&inner, "unregister");
        tracing::info!(
            component = "registry",
            service_id = %id,
            name = %service.name,
            "Service unregistered"
        );
        true
    }

    /// Record liveness; promotes `STARTING` to `HEALTHY`.
    pub async fn heartbeat(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let Some(service) = inner.services.get_mut(id) else {
            return false;
        };
        service.last_heartbeat = now;
        if service.status == ServiceStatus::Starting {
            service.status = ServiceStatus::Healthy;
            tracing::info!(component = "registry", service_id = %id, "Service is healthy");
        }
        self.persist_logged(&inner, "heartbeat");
        true
    }

    /// Set a status directly.
    pub async fn update_status(&self, id: &str, status: ServiceStatus) -> bool {
        let mut inner = self.inner.write().await;
        let Some(service) = inner.services.get_mut(id) else {
            return false;
        };
        let from = service.status;
        service.status = status;
        self.persist_logged(&inner, "update_status");
        tracing::info!(
            component = "registry",
            service_id = %id,
            from = %from,
            to = %status,
            "Service status updated"
        );
        true
    }

    pub async fn get(&self, id: &str) -> Option<ServiceRegistration> {
        self.inner.read().await.services.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.services.is_empty()
    }

    /// Registrations matching every filter, oldest registration first.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Vec<ServiceRegistration> {
        let inner = self.inner.read().await;
        let mut found: Vec<ServiceRegistration> = match &filter.capability {
            Some(cap) => inner
                .capabilities
                .get(cap)
                .into_iter()
                .flatten()
                .filter_map(|e| inner.services.get(&e.service_id))
                .filter(|s| filter.matches(s))
                .cloned()
                .collect(),
            None => inner
                .services
                .values()
                .filter(|s| filter.matches(s))
                .cloned()
                .collect(),
        };
        found.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        found
    }

    /// The capability index: name → descriptors from every provider.
    pub async fn capabilities(&self) -> BTreeMap<String, Vec<CapabilityEntry>> {
        self.inner.read().await.capabilities.clone()
    }

    /// One health sweep.
    ///
    /// A heartbeat older than the service timeout marks a service `UNHEALTHY`.
    /// When a health endpoint is configured its probe result replaces the
    /// heartbeat verdict: 2xx `HEALTHY`, other status `DEGRADED`, error or
    /// timeout `UNHEALTHY`. Services that are stopping are skipped. Probes run
    /// without holding the lock, so verdicts are applied only to entries whose
    /// status is unchanged since they were read; a heartbeat that lands
    /// mid-sweep cancels a verdict based on heartbeat age alone.
    pub async fn health_check_services(&self) -> SweepReport {
        let now = self.clock.now();
        let candidates: Vec<(String, ServiceStatus, DateTime<Utc>, Option<String>)> = {
            let inner = self.inner.read().await;
            inner
                .services
                .values()
                .filter(|s| !s.status.is_winding_down())
                .map(|s| (s.id.clone(), s.status, s.last_heartbeat, s.health_url()))
                .collect()
        };

        let mut report = SweepReport {
            checked: candidates.len(),
            ..SweepReport::default()
        };
        let mut verdicts = Vec::new();
        for (id, status, last_heartbeat, health_url) in candidates {
            let verdict = match health_url {
                Some(url) => {
                    report.probed += 1;
                    Verdict::Probed(self.probe_status(&id, &url).await)
                }
                None if self.is_stale(now, last_heartbeat) => Verdict::Stale,
                None => continue,
            };
            verdicts.push((id, status, last_heartbeat, verdict));
        }

        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        for (id, seen_status, seen_heartbeat, verdict) in verdicts {
            // Removed, stopped or re-statused while probing.
            let Some(service) = inner.services.get_mut(&id) else {
                continue;
            };
            if service.status.is_winding_down() || service.status != seen_status {
                continue;
            }
            let to = match verdict {
                Verdict::Probed(to) => to,
                Verdict::Stale
                    if service.last_heartbeat == seen_heartbeat
                        || self.is_stale(now, service.last_heartbeat) =>
                {
                    ServiceStatus::Unhealthy
                }
                Verdict::Stale => continue,
            };
            if service.status == to {
                continue;
            }
            tracing::info!(
                component = "registry",
                service_id = %id,
                from = %service.status,
                to = %to,
                "Health sweep changed service status"
            );
            report.changes.push(StatusChange {
                service_id: id,
                from: service.status,
                to,
            });
            service.status = to;
        }
        if !report.changes.is_empty() {
            self.persist_logged(&inner, "health_check_services");
        }
        report
    }

    fn is_stale(&self, now: DateTime<Utc>, last_heartbeat: DateTime<Utc>) -> bool {
        (now - last_heartbeat).to_std().unwrap_or_default() > self.service_timeout
    }

    async fn probe_status(&self, id: &str, url: &str) -> ServiceStatus {
        match self.probe.probe(url, self.probe_timeout).await {
            Ok(ProbeOutcome::Healthy) => ServiceStatus::Healthy,
            Ok(ProbeOutcome::Degraded { status: code }) => {
                tracing::warn!(
                    component = "registry",
                    service_id = %id,
                    status = code,
                    "Health probe returned non-success status"
                );
                ServiceStatus::Degraded
            }
            Err(e) => {
                tracing::warn!(
                    component = "registry",
                    service_id = %id,
                    error = %e,
                    "Health probe failed"
                );
                ServiceStatus::Unhealthy
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A clock tests move by hand.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Utc::now()),
            })
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }

    /// Answers every probe with a scripted result per URL.
    #[derive(Default)]
    pub struct ScriptedProbe {
        pub answers: Mutex<BTreeMap<String, Result<ProbeOutcome, crate::errors::HealthProbeError>>>,
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, crate::errors::HealthProbeError> {
            self.answers
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or(Err(crate::errors::HealthProbeError::Timeout {
                    url: url.to_string(),
                }))
        }
    }
}

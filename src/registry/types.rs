//! Registry data model.

use crate::errors::RegistryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// What kind of worker a service is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Analyzer,
    Fixer,
    Scanner,
    TestRunner,
    Coordinator,
    Monitor,
    Worker,
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "ANALYZER" => Ok(Self::Analyzer),
            "FIXER" => Ok(Self::Fixer),
            "SCANNER" => Ok(Self::Scanner),
            "TEST_RUNNER" => Ok(Self::TestRunner),
            "COORDINATOR" => Ok(Self::Coordinator),
            "MONITOR" => Ok(Self::Monitor),
            "WORKER" => Ok(Self::Worker),
            _ => Err(format!("unknown service type '{}'", s)),
        }
    }
}

/// Lifecycle status of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Unhealthy => "UNHEALTHY",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Services winding down are left alone by the health sweep.
    pub fn is_winding_down(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STARTING" => Ok(Self::Starting),
            "HEALTHY" => Ok(Self::Healthy),
            "DEGRADED" => Ok(Self::Degraded),
            "UNHEALTHY" => Ok(Self::Unhealthy),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(format!("unknown service status '{}'", s)),
        }
    }
}

/// A named, versioned unit of functionality a service advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            endpoints: Vec::new(),
            requirements: BTreeMap::new(),
        }
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }
}

/// One entry of the capability index: a descriptor and who provides it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub service_id: String,
    #[serde(flatten)]
    pub capability: Capability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub service_type: ServiceType,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub capabilities: Vec<Capability>,
    pub status: ServiceStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ServiceRegistration {
    /// `http://{host}:{port}`; IPv6 literals are bracketed.
    pub fn base_url(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{}]:{}", ip, self.port),
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// `http://{host}:{port}{endpoint}`, tolerating a missing leading slash.
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{}", self.base_url(), endpoint)
        } else {
            format!("{}/{}", self.base_url(), endpoint)
        }
    }

    pub fn health_url(&self) -> Option<String> {
        self.health_endpoint.as_deref().map(|e| self.url_for(e))
    }

    /// Bound to a loopback address.
    pub fn is_local(&self) -> bool {
        let host = self.host.trim_start_matches('[').trim_end_matches(']');
        host.eq_ignore_ascii_case("localhost")
            || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

/// Body of `register()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub service_type: ServiceType,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl RegisterRequest {
    pub fn new(
        service_type: ServiceType,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_type,
            name: name.into(),
            version: default_version(),
            host: host.into(),
            port,
            capabilities: Vec::new(),
            metadata: BTreeMap::new(),
            health_endpoint: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "name must not be empty".into(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "host must not be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidRegistration(
                "port must not be 0".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for cap in &self.capabilities {
            if cap.name.trim().is_empty() {
                return Err(RegistryError::InvalidRegistration(
                    "capability name must not be empty".into(),
                ));
            }
            if !seen.insert(cap.name.as_str()) {
                return Err(RegistryError::InvalidRegistration(format!(
                    "capability '{}' listed twice",
                    cap.name
                )));
            }
        }
        Ok(())
    }
}

/// Filters for `discover()`; every provided filter must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryFilter {
    pub service_type: Option<ServiceType>,
    pub capability: Option<String>,
    /// All of these tags must be present
    pub tags: Vec<String>,
    pub status: Option<ServiceStatus>,
}

impl DiscoveryFilter {
    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            capability: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, service: &ServiceRegistration) -> bool {
        self.service_type.is_none_or(|t| service.service_type == t)
            && self
                .capability
                .as_deref()
                .is_none_or(|c| service.has_capability(c))
            && self.tags.iter().all(|t| service.tags.contains(t))
            && self.status.is_none_or(|s| service.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(host: &str) -> ServiceRegistration {
        let now = Utc::now();
        ServiceRegistration {
            id: "svc-1".into(),
            service_type: ServiceType::Analyzer,
            name: "linter".into(),
            version: "1.0.0".into(),
            host: host.into(),
            port: 9000,
            capabilities: vec![Capability::new("lint")],
            status: ServiceStatus::Healthy,
            metadata: BTreeMap::new(),
            registered_at: now,
            last_heartbeat: now,
            health_endpoint: Some("health".into()),
            tags: ["python".to_string(), "fast".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_is_local() {
        assert!(registration("127.0.0.1").is_local());
        assert!(registration("localhost").is_local());
        assert!(registration("::1").is_local());
        assert!(!registration("10.0.0.7").is_local());
        assert!(!registration("lint.internal").is_local());
    }

    #[test]
    fn test_urls() {
        let reg = registration("127.0.0.1");
        assert_eq!(reg.url_for("/lint"), "http://127.0.0.1:9000/lint");
        assert_eq!(reg.health_url().unwrap(), "http://127.0.0.1:9000/health");
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let reg = registration("::1");
        assert_eq!(reg.base_url(), "http://[::1]:9000");
        assert_eq!(reg.health_url().unwrap(), "http://[::1]:9000/health");
        assert!(reg.is_local());

        let reg = registration("[::1]");
        assert_eq!(reg.base_url(), "http://[::1]:9000");
        assert!(reg.is_local());
        assert_eq!(registration("fe80::2").url_for("lint"), "http://[fe80::2]:9000/lint");
    }

    #[test]
    fn test_filter_is_conjunctive() {
        let reg = registration("127.0.0.1");
        assert!(DiscoveryFilter::default().matches(&reg));
        assert!(DiscoveryFilter::capability("lint").matches(&reg));
        assert!(!DiscoveryFilter::capability("format").matches(&reg));
        assert!(
            DiscoveryFilter::capability("lint")
                .with_status(ServiceStatus::Healthy)
                .with_tags(["python"])
                .matches(&reg)
        );
        assert!(
            !DiscoveryFilter::capability("lint")
                .with_tags(["python", "rust"])
                .matches(&reg)
        );
        assert!(
            !DiscoveryFilter::default()
                .with_type(ServiceType::Fixer)
                .matches(&reg)
        );
    }

    #[test]
    fn test_validate_rejects_bad_requests() {
        let ok = RegisterRequest::new(ServiceType::Scanner, "scan", "127.0.0.1", 8000)
            .with_capability(Capability::new("scan"));
        assert!(ok.validate().is_ok());

        let no_port = RegisterRequest::new(ServiceType::Scanner, "scan", "127.0.0.1", 0);
        assert!(no_port.validate().is_err());

        let dup = ok.clone().with_capability(Capability::new("scan"));
        assert!(matches!(
            dup.validate(),
            Err(RegistryError::InvalidRegistration(msg)) if msg.contains("twice")
        ));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("healthy".parse::<ServiceStatus>().unwrap(), ServiceStatus::Healthy);
        assert!("sleepy".parse::<ServiceStatus>().is_err());
        assert_eq!(
            "test-runner".parse::<ServiceType>().unwrap(),
            ServiceType::TestRunner
        );
    }

    #[test]
    fn test_capability_entry_flattens() {
        let entry = CapabilityEntry {
            service_id: "abc".into(),
            capability: Capability::new("lint").with_endpoints(["/lint"]),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["service_id"], "abc");
        assert_eq!(value["name"], "lint");
        assert_eq!(value["endpoints"][0], "/lint");
    }
}

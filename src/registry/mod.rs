//! Service registry and discovery.
//!
//! Independently started worker services advertise capabilities here and are
//! found by name or capability. The registry is an explicit handle passed to
//! whoever needs it; there is no global instance.

pub mod discovery;
pub mod probe;
pub mod server;
pub mod store;
pub mod types;

pub use discovery::DiscoveryClient;
pub use probe::{HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use store::{Clock, ServiceRegistry, StatusChange, SweepReport, SystemClock};
pub use types::{
    Capability, CapabilityEntry, DiscoveryFilter, RegisterRequest, ServiceRegistration,
    ServiceStatus, ServiceType,
};

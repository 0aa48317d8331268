use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

/// A listener requested by a requesting application.
/// Published in the requester's app bag, one entry per service name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service_name: String,

    /// Port the load balancer binds for this service
    pub frontend_port: u16,

    /// Health check flavour, e.g. "http" or "https"
    pub check_type: String,
}

/// A backend advertised by one requesting unit.
/// Published in the unit's own bag, one entry per service the unit backs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRegistration {
    pub service_name: String,
    pub backend_port: u16,
    pub backend_ip: String,
}

/// App-level facts for one service after merging every peer's requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendRequest {
    pub frontend_port: u16,
    pub check_type: String,
}

/// One backend endpoint of an aggregated service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMember {
    /// Publishing unit's name with '/' replaced by '_'
    pub unit_name: String,
    pub backend_ip: String,
    pub backend_port: u16,
}

/// A requested service together with every backend currently registered for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedService {
    pub frontend_port: u16,
    pub check_type: String,

    /// Ordered by unit_name; empty until a backend registers
    #[serde(default)]
    pub members: Vec<BackendMember>,
}

/// The provider's consolidated view of all load balancer requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadbalancerRequests {
    pub endpoints: BTreeMap<String, AggregatedService>,
}

/// Where a service is reachable on one network partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEndpoint {
    #[serde(rename = "ip")]
    pub addresses: Vec<String>,
    pub port: u16,
    pub protocol: String,
}

/// Readiness per service name, then per partition name.
/// Same shape as the `frontends` payload the provider publishes.
pub type FrontendResponse = BTreeMap<String, BTreeMap<String, PartitionEndpoint>>;

/// Result of an attempt to publish readiness to the requesters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Response slots were written on this many peer connections
    Published { peers: usize },

    /// The caller does not hold write authority; nothing was written
    NotWriter,
}

/// Stable slug for a unit name: "ceph-dashboard/0" becomes "ceph-dashboard_0".
pub fn unit_slug(unit: &str) -> String {
    unit.replace('/', "_")
}

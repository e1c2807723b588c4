//! The configuration snapshot handed to the proxy.
//!
//! Snapshots compare structurally. Backends and L4 services compare as
//! unordered sets, endpoint lists compare as unordered sets, and service
//! back-references compare by namespace and name only. Servers and their
//! locations keep their order; builders sort them.

use crate::CertificateArtifact;
use ingress_controller_k8s_api::{IntOrString, ObjectReference, ServiceSpec};
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub backends: Vec<Backend>,
    pub servers: Vec<Server>,
    pub tcp_endpoints: Vec<L4Service>,
    pub udp_endpoints: Vec<L4Service>,
}

/// A service back-reference. Only the service spec is serialized.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ServiceRef {
    #[serde(skip)]
    pub namespace: String,
    #[serde(skip)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<ServiceSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    pub port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectReference>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
    pub port: IntOrString,
    pub ssl_passthrough: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(rename = "sessionAffinityConfig")]
    pub session_affinity: SessionAffinity,
    #[serde(rename = "upstream-hash-by", skip_serializing_if = "String::is_empty")]
    pub upstream_hash_by: String,
    #[serde(rename = "load-balance", skip_serializing_if = "String::is_empty")]
    pub load_balancing: String,
    pub no_server: bool,
    pub traffic_shaping_policy: TrafficShapingPolicy,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternative_backends: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinity {
    #[serde(rename = "name")]
    pub affinity_type: String,
    #[serde(rename = "cookieSessionAffinity")]
    pub cookie: CookieSessionAffinity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CookieSessionAffinity {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficShapingPolicy {
    pub weight: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub header_value: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cookie: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub hostname: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub ssl_passthrough: bool,
    #[serde(skip)]
    pub certificate: Option<Arc<CertificateArtifact>>,
    pub locations: Vec<Location>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub path: String,
    pub path_type: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
    pub port: IntOrString,
    /// Key of the route that produced the location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(rename = "isDefBackend")]
    pub is_default_backend: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct L4Service {
    pub port: u16,
    pub backend: L4Backend,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(skip)]
    pub service: Option<ServiceRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct L4Backend {
    pub port: IntOrString,
    pub name: String,
    pub namespace: String,
    pub protocol: String,
    pub proxy_protocol: ProxyProtocol,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProxyProtocol {
    pub decode: bool,
    pub encode: bool,
}

/// Compares two lists as unordered collections.
pub fn set_eq<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x)) && b.iter().all(|x| a.contains(x))
}

// === impl Configuration ===

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        set_eq(&self.backends, &other.backends)
            && self.servers == other.servers
            && set_eq(&self.tcp_endpoints, &other.tcp_endpoints)
            && set_eq(&self.udp_endpoints, &other.udp_endpoints)
    }
}

// === impl ServiceRef ===

impl PartialEq for ServiceRef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}

// === impl Backend ===

impl Backend {
    pub fn new(name: impl Into<String>, port: IntOrString) -> Self {
        Self {
            name: name.into(),
            service: None,
            port,
            ssl_passthrough: false,
            endpoints: Vec::new(),
            session_affinity: SessionAffinity::default(),
            upstream_hash_by: String::new(),
            load_balancing: String::new(),
            no_server: false,
            traffic_shaping_policy: TrafficShapingPolicy::default(),
            alternative_backends: Vec::new(),
        }
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.service == other.service
            && self.port == other.port
            && self.ssl_passthrough == other.ssl_passthrough
            && self.session_affinity == other.session_affinity
            && self.upstream_hash_by == other.upstream_hash_by
            && self.load_balancing == other.load_balancing
            && self.no_server == other.no_server
            && self.traffic_shaping_policy == other.traffic_shaping_policy
            && self.alternative_backends == other.alternative_backends
            && set_eq(&self.endpoints, &other.endpoints)
    }
}

// === impl L4Service ===

/// The service back-reference is informational and does not take part in
/// equality.
impl PartialEq for L4Service {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.backend == other.backend
            && set_eq(&self.endpoints, &other.endpoints)
    }
}

//! Builds configuration snapshots from the store's read API.

use crate::{
    core::{
        configuration::{
            Backend, Endpoint, L4Backend, L4Service, Location, ProxyProtocol, Server, ServiceRef,
        },
        CertificateArtifact, Configuration, ResourceId, CATCH_ALL_HOSTNAME, DEFAULT_BACKEND_NAME,
    },
    dynamic::BuildConfiguration,
    k8s::{IngressBackend, IngressServiceBackend, IntOrString},
    store::{AdmittedRoute, Store},
};
use std::{collections::BTreeMap, sync::Arc};

/// Builds snapshots of every admitted route, the services they reference
/// and the configured L4 services.
#[derive(Clone, Debug)]
pub struct SnapshotBuilder {
    store: Arc<Store>,
}

// === impl SnapshotBuilder ===

impl SnapshotBuilder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn snapshot(&self) -> Configuration {
        let mut backends = BTreeMap::new();
        backends.insert(
            DEFAULT_BACKEND_NAME.to_string(),
            Backend::new(DEFAULT_BACKEND_NAME, IntOrString::Int(80)),
        );

        let mut servers = BTreeMap::new();
        servers.insert(
            CATCH_ALL_HOSTNAME.to_string(),
            Server {
                hostname: CATCH_ALL_HOSTNAME.to_string(),
                certificate: self.store.default_certificate(),
                locations: vec![default_location()],
                ..Default::default()
            },
        );

        // Routes are listed oldest first, so the oldest route wins a
        // conflicting host and path.
        for route in self.store.list_routes() {
            self.add_route(&route, &mut backends, &mut servers);
        }

        let mut servers = servers.into_values().collect::<Vec<_>>();
        for server in &mut servers {
            // Reverse lexicographic by path.
            server.locations.sort_by(|a, b| b.path.cmp(&a.path));
        }

        let config = self.store.config();
        Configuration {
            backends: backends.into_values().collect(),
            servers,
            tcp_endpoints: self.streams(config.tcp_config_map.as_ref(), "TCP"),
            udp_endpoints: self.streams(config.udp_config_map.as_ref(), "UDP"),
        }
    }

    fn add_route(
        &self,
        route: &AdmittedRoute,
        backends: &mut BTreeMap<String, Backend>,
        servers: &mut BTreeMap<String, Server>,
    ) {
        let Some(spec) = route.ingress.spec.as_ref() else {
            return;
        };
        let ns = route.id.namespace.as_str();
        let annotations = &route.annotations;

        let mut add_backend = |svc: &IngressServiceBackend| -> Option<(String, IntOrString)> {
            let port = service_port(svc)?;
            let name = format!("{ns}-{}-{}", svc.name, port_str(&port));
            backends.entry(name.clone()).or_insert_with(|| {
                let id = ResourceId::new(ns, svc.name.clone());
                let (service, endpoints) = self.resolve(&id, &port);
                let mut backend = Backend::new(name.clone(), port.clone());
                backend.service = service;
                backend.endpoints = endpoints;
                backend.ssl_passthrough = annotations.get_bool("ssl-passthrough");
                if let Some(hash_by) = annotations.get("upstream-hash-by") {
                    backend.upstream_hash_by = hash_by.to_string();
                }
                if let Some(lb) = annotations.get("load-balance") {
                    backend.load_balancing = lb.to_string();
                }
                backend
            });
            Some((name, port))
        };

        let mk_location = |path: String, path_type: String, backend: String, port, svc: &str| {
            Location {
                path,
                path_type,
                backend,
                service: Some(ServiceRef {
                    namespace: ns.to_string(),
                    name: svc.to_string(),
                    spec: None,
                }),
                port,
                route: Some(route.id.to_string()),
                is_default_backend: false,
            }
        };

        if let Some(svc) = spec.default_backend.as_ref().and_then(service_backend) {
            if let Some((backend, port)) = add_backend(svc) {
                if let Some(catch_all) = servers.get_mut(CATCH_ALL_HOSTNAME) {
                    if catch_all.locations.iter().all(|l| l.route.is_none()) {
                        let location = mk_location(
                            "/".to_string(),
                            "Prefix".to_string(),
                            backend,
                            port,
                            &svc.name,
                        );
                        catch_all.locations = vec![location];
                    }
                }
            }
        }

        let aliases = annotations
            .get("server-alias")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        for rule in spec.rules.iter().flatten() {
            let host = rule
                .host
                .clone()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| CATCH_ALL_HOSTNAME.to_string());
            let certificate = self.certificate_for(route, &host);
            let server = servers.entry(host.clone()).or_insert_with(|| Server {
                hostname: host.clone(),
                ..Default::default()
            });
            if server.certificate.is_none() {
                server.certificate = certificate;
            }
            if host != CATCH_ALL_HOSTNAME {
                server.ssl_passthrough |= annotations.get_bool("ssl-passthrough");
                for alias in &aliases {
                    if !server.aliases.contains(alias) {
                        server.aliases.push(alias.clone());
                    }
                }
            }

            for path in rule.http.iter().flat_map(|http| http.paths.iter()) {
                let Some(svc) = service_backend(&path.backend) else {
                    continue;
                };
                let Some((backend, port)) = add_backend(svc) else {
                    tracing::debug!(route = %route.id, service = %svc.name, "Backend has no port");
                    continue;
                };
                let path_str = path.path.clone().unwrap_or_else(|| "/".to_string());

                // Locations from a route override the catch-all's default.
                server.locations.retain(|l| !l.is_default_backend || l.path != path_str);
                if server.locations.iter().any(|l| l.path == path_str) {
                    tracing::debug!(route = %route.id, %host, path = %path_str, "Path already claimed");
                    continue;
                }
                server.locations.push(mk_location(
                    path_str,
                    path.path_type.clone(),
                    backend,
                    port,
                    &svc.name,
                ));
            }
        }
    }

    /// The certificate a route declares for `host` through `spec.tls`.
    fn certificate_for(
        &self,
        route: &AdmittedRoute,
        host: &str,
    ) -> Option<Arc<CertificateArtifact>> {
        let tls = route.ingress.spec.as_ref()?.tls.as_ref()?;
        tls.iter()
            .filter(|tls| tls.hosts.iter().flatten().any(|h| h == host))
            .find_map(|tls| {
                let secret = tls.secret_name.as_deref()?;
                let id = ResourceId::new(route.id.namespace.clone(), secret);
                match self.store.local_certificate(&id) {
                    Ok(cert) => Some(cert),
                    Err(error) => {
                        tracing::debug!(route = %route.id, %host, %error, "Certificate unavailable");
                        None
                    }
                }
            })
    }

    /// Resolves a service port to the service reference and its ready
    /// endpoints.
    fn resolve(
        &self,
        id: &ResourceId,
        port: &IntOrString,
    ) -> (Option<ServiceRef>, Vec<Endpoint>) {
        let svc = match self.store.get_service(id) {
            Ok(svc) => svc,
            Err(error) => {
                tracing::debug!(%error, "Service unavailable");
                return (None, Vec::new());
            }
        };
        let spec = svc.spec.clone().unwrap_or_default();
        let service = ServiceRef {
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            spec: Some(spec.clone()),
        };

        let Some(svc_port) = spec.ports.iter().flatten().find(|p| match port {
            IntOrString::Int(n) => p.port == *n,
            IntOrString::String(name) => p.name.as_deref() == Some(name.as_str()),
        }) else {
            tracing::debug!(service = %id, port = %port_str(port), "Service port not found");
            return (Some(service), Vec::new());
        };

        if spec.type_.as_deref() == Some("ExternalName") {
            let endpoints = spec
                .external_name
                .iter()
                .map(|name| Endpoint {
                    address: name.clone(),
                    port: svc_port.port.to_string(),
                    target: None,
                })
                .collect();
            return (Some(service), endpoints);
        }

        let Ok(endpoints) = self.store.get_endpoints(id) else {
            return (Some(service), Vec::new());
        };
        let port_name = svc_port.name.as_deref().unwrap_or_default();
        let mut resolved = Vec::new();
        for subset in endpoints.subsets.iter().flatten() {
            for ep_port in subset.ports.iter().flatten() {
                if ep_port.name.as_deref().unwrap_or_default() != port_name {
                    continue;
                }
                for addr in subset.addresses.iter().flatten() {
                    resolved.push(Endpoint {
                        address: addr.ip.clone(),
                        port: ep_port.port.to_string(),
                        target: addr.target_ref.clone(),
                    });
                }
            }
        }
        (Some(service), resolved)
    }

    /// L4 services from a ConfigMap mapping exposed ports to
    /// `namespace/service:port[:PROXY[:PROXY]]`.
    fn streams(&self, id: Option<&ResourceId>, protocol: &str) -> Vec<L4Service> {
        let Some(cm) = id.and_then(|id| self.store.get_config_map(id).ok()) else {
            return Vec::new();
        };

        let mut streams = Vec::new();
        for (exposed, value) in cm.data.iter().flatten() {
            let Ok(exposed) = exposed.parse::<u16>() else {
                tracing::warn!(port = %exposed, "Invalid L4 service port");
                continue;
            };
            let Some((svc, port, proxy_protocol)) = parse_stream(value) else {
                tracing::warn!(port = exposed, %value, "Invalid L4 service reference");
                continue;
            };
            let (service, endpoints) = self.resolve(&svc, &port);
            if service.is_none() {
                tracing::warn!(port = exposed, service = %svc, "L4 service not found");
                continue;
            }
            streams.push(L4Service {
                port: exposed,
                backend: L4Backend {
                    port,
                    name: svc.name,
                    namespace: svc.namespace,
                    protocol: protocol.to_string(),
                    proxy_protocol,
                },
                endpoints,
                service,
            });
        }
        streams.sort_by_key(|s| s.port);
        streams
    }
}

#[async_trait::async_trait]
impl BuildConfiguration for SnapshotBuilder {
    async fn build(&self) -> anyhow::Result<Configuration> {
        Ok(self.snapshot())
    }
}

fn default_location() -> Location {
    Location {
        path: "/".to_string(),
        path_type: "Prefix".to_string(),
        backend: DEFAULT_BACKEND_NAME.to_string(),
        service: None,
        port: IntOrString::Int(80),
        route: None,
        is_default_backend: true,
    }
}

fn service_backend(backend: &IngressBackend) -> Option<&IngressServiceBackend> {
    backend.service.as_ref()
}

fn service_port(svc: &IngressServiceBackend) -> Option<IntOrString> {
    let port = svc.port.as_ref()?;
    match (port.number, port.name.as_ref()) {
        (Some(n), _) if n > 0 => Some(IntOrString::Int(n)),
        (_, Some(name)) if !name.is_empty() => Some(IntOrString::String(name.clone())),
        _ => None,
    }
}

fn port_str(port: &IntOrString) -> String {
    match port {
        IntOrString::Int(n) => n.to_string(),
        IntOrString::String(s) => s.clone(),
    }
}

fn parse_stream(value: &str) -> Option<(ResourceId, IntOrString, ProxyProtocol)> {
    let mut parts = value.split(':');
    let svc = parts.next()?.parse::<ResourceId>().ok()?;
    if svc.namespace.is_empty() {
        return None;
    }
    let port = match parts.next()? {
        "" => return None,
        p => p
            .parse::<i32>()
            .map(IntOrString::Int)
            .unwrap_or_else(|_| IntOrString::String(p.to_string())),
    };
    let proxy_protocol = ProxyProtocol {
        decode: parts.next() == Some("PROXY"),
        encode: parts.next() == Some("PROXY"),
    };
    Some((svc, port, proxy_protocol))
}

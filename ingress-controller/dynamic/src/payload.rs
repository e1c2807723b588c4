//! Side-channel payloads derived from a snapshot.

use ingress_controller_core::{
    configuration::{Backend, Endpoint, L4Service},
    Configuration, NO_CERTIFICATE,
};
use ingress_controller_k8s_api::IntOrString;
use serde::Serialize;
use std::collections::BTreeMap;

/// The servers payload: certificate bundles keyed by content hash, and the
/// certificate each hostname serves.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SslConfiguration {
    pub certificates: BTreeMap<String, String>,
    pub servers: BTreeMap<String, String>,
}

/// Backends as the proxy balances them. Endpoints keep only their address
/// and port; services serialize as their spec alone.
pub fn backends(config: &Configuration) -> Vec<Backend> {
    config
        .backends
        .iter()
        .map(|backend| Backend {
            endpoints: backend.endpoints.iter().map(address_only).collect(),
            ..backend.clone()
        })
        .collect()
}

pub fn ssl_configuration(config: &Configuration) -> SslConfiguration {
    let mut ssl = SslConfiguration::default();
    for server in &config.servers {
        let id = match server.certificate.as_deref() {
            Some(cert) => {
                ssl.certificates
                    .entry(cert.pem_sha.clone())
                    .or_insert_with(|| cert.pem_bundle.clone());
                cert.pem_sha.as_str()
            }
            None => NO_CERTIFICATE,
        };
        ssl.servers.insert(server.hostname.clone(), id.to_string());

        for alias in &server.aliases {
            let id = match server.certificate.as_deref() {
                Some(cert) if cert.matches_hostname(alias) => cert.pem_sha.as_str(),
                _ => NO_CERTIFICATE,
            };
            ssl.servers.insert(alias.clone(), id.to_string());
        }
    }
    ssl
}

/// L4 services as stream backends, TCP first, named
/// `{protocol}-{namespace}-{service}-{port}`.
pub fn streams(config: &Configuration) -> Vec<Backend> {
    let tcp = config.tcp_endpoints.iter().map(|svc| stream("tcp", svc));
    let udp = config.udp_endpoints.iter().map(|svc| stream("udp", svc));
    tcp.chain(udp).collect()
}

fn stream(protocol: &str, svc: &L4Service) -> Backend {
    let port = match &svc.backend.port {
        IntOrString::Int(port) => port.to_string(),
        IntOrString::String(name) => name.clone(),
    };
    let name = format!(
        "{protocol}-{}-{}-{port}",
        svc.backend.namespace, svc.backend.name
    );
    Backend {
        service: svc.service.clone(),
        endpoints: svc.endpoints.clone(),
        ..Backend::new(name, IntOrString::Int(svc.port.into()))
    }
}

fn address_only(ep: &Endpoint) -> Endpoint {
    Endpoint {
        address: ep.address.clone(),
        port: ep.port.clone(),
        target: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ingress_controller_core::{
        configuration::{L4Backend, ProxyProtocol, Server},
        CertificateArtifact,
    };
    use ingress_controller_k8s_api::ObjectReference;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use std::{path::PathBuf, sync::Arc};

    fn mk_certificate(names: &[&str]) -> Arc<CertificateArtifact> {
        Arc::new(CertificateArtifact {
            uid: "uid".to_string(),
            namespace: "ns".to_string(),
            name: "tls".to_string(),
            subject_names: names.iter().map(|n| n.to_string()).collect(),
            pem_sha: "c0ffee".to_string(),
            pem_path: PathBuf::from("/ssl/ns-tls.pem"),
            pem_bundle: "-----BEGIN CERTIFICATE-----".to_string(),
            ca_path: None,
            ca_sha: None,
            crl_path: None,
            crl_sha: None,
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        })
    }

    #[test]
    fn aliases_bind_only_covered_names() {
        let config = Configuration {
            servers: vec![
                Server {
                    hostname: "a.example.com".to_string(),
                    aliases: vec!["b.example.com".to_string(), "www.other.org".to_string()],
                    certificate: Some(mk_certificate(&["a.example.com", "*.example.com"])),
                    ..Default::default()
                },
                Server {
                    hostname: "plain.example.org".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(
            ssl_configuration(&config),
            SslConfiguration {
                certificates: btreemap! {
                    "c0ffee".to_string() => "-----BEGIN CERTIFICATE-----".to_string(),
                },
                servers: btreemap! {
                    "a.example.com".to_string() => "c0ffee".to_string(),
                    "b.example.com".to_string() => "c0ffee".to_string(),
                    "www.other.org".to_string() => NO_CERTIFICATE.to_string(),
                    "plain.example.org".to_string() => NO_CERTIFICATE.to_string(),
                },
            }
        );
    }

    #[test]
    fn backend_endpoints_drop_targets() {
        let mut backend = Backend::new("ns-svc-80", IntOrString::Int(80));
        backend.endpoints = vec![Endpoint {
            address: "10.0.0.1".to_string(),
            port: "8080".to_string(),
            target: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some("svc-abc".to_string()),
                ..Default::default()
            }),
        }];
        let config = Configuration {
            backends: vec![backend],
            ..Default::default()
        };

        let json = serde_json::to_value(backends(&config)).unwrap();
        assert_eq!(
            json[0]["endpoints"],
            serde_json::json!([{ "address": "10.0.0.1", "port": "8080" }])
        );
    }

    #[test]
    fn streams_are_named_by_protocol() {
        let svc = |protocol: &str, port: u16| L4Service {
            port,
            backend: L4Backend {
                port: IntOrString::String("db".to_string()),
                name: "postgres".to_string(),
                namespace: "data".to_string(),
                protocol: protocol.to_string(),
                proxy_protocol: ProxyProtocol::default(),
            },
            endpoints: Vec::new(),
            service: None,
        };
        let config = Configuration {
            tcp_endpoints: vec![svc("TCP", 5432)],
            udp_endpoints: vec![svc("UDP", 53)],
            ..Default::default()
        };

        let streams = streams(&config);
        let names = streams.iter().map(|b| b.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["tcp-data-postgres-db", "udp-data-postgres-db"]);
        assert_eq!(streams[0].port, IntOrString::Int(5432));
    }
}

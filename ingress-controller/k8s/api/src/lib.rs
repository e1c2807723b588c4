#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_openapi::{
    api::{
        core::v1::{
            ConfigMap, EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference,
            Secret, Service, ServicePort, ServiceSpec,
        },
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressClass,
            IngressClassSpec, IngressRule, IngressServiceBackend, IngressSpec, IngressTLS,
            ServiceBackendPort,
        },
    },
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    ByteString, NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    runtime::watcher,
    Client,
};

/// Key under which a TLS secret stores its certificate chain.
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Key under which a TLS secret stores its private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

/// Key under which a secret stores a CA bundle.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Key under which a secret stores a certificate revocation list.
pub const CA_CRL_KEY: &str = "ca.crl";

/// Annotation consulted when a route carries no class name.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Returns the `namespace/name` key of a namespaced object, or just `name` for
/// cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let name = obj.meta().name.as_deref().unwrap_or_default();
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        let secret = Secret {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("tls".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(object_key(&secret), "default/tls");

        let class = IngressClass {
            metadata: ObjectMeta {
                name: Some("nginx".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(object_key(&class), "nginx");
    }
}

//! Derivation of route annotation records.

use crate::{BackendConfiguration, NotFound};
use ingress_controller_core::{AuthSslCert, ResourceId, RouteAnnotations};
use ingress_controller_k8s_api::{Ingress, ResourceExt};
use std::sync::Arc;

pub const DEFAULT_ANNOTATION_PREFIX: &str = "nginx.ingress.kubernetes.io";

/// Annotations whose value names a secret.
const SECRET_ANNOTATIONS: [&str; 4] = [
    "auth-secret",
    "auth-tls-secret",
    "proxy-ssl-secret",
    "secure-verify-ca-secret",
];

/// Annotations whose value names a ConfigMap.
const CONFIG_MAP_ANNOTATIONS: [&str; 2] = ["custom-headers", "auth-proxy-set-headers"];

/// Read access the extractor needs while deriving a record.
pub trait Resolver {
    /// Looks up verification material for an already synchronized secret.
    fn auth_certificate(&self, secret: &ResourceId) -> Result<AuthSslCert, NotFound>;

    fn backend_configuration(&self) -> Arc<BackendConfiguration>;
}

/// Derives a route's annotation record.
pub trait AnnotationExtractor: std::fmt::Debug + Send + Sync + 'static {
    fn extract(
        &self,
        route: &Ingress,
        resolver: &dyn Resolver,
    ) -> Result<RouteAnnotations, AnnotationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AnnotationError {
    #[error("annotation {annotation} contains the blocked word {word:?}")]
    Blocked { annotation: String, word: String },

    #[error("annotation {annotation} references an unavailable secret: {source}")]
    MissingSecret {
        annotation: String,
        #[source]
        source: NotFound,
    },
}

/// Reads controller-prefixed annotations and resolves the secrets they
/// reference.
#[derive(Clone, Debug)]
pub struct DefaultExtractor {
    prefix: String,
}

// === impl DefaultExtractor ===

impl DefaultExtractor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn resolve_secret(
        &self,
        route: &Ingress,
        values: &std::collections::BTreeMap<String, String>,
        annotation: &str,
        resolver: &dyn Resolver,
    ) -> Result<Option<AuthSslCert>, AnnotationError> {
        let Some(value) = values.get(annotation) else {
            return Ok(None);
        };
        let id = secret_key(&route.namespace().unwrap_or_default(), value);
        resolver
            .auth_certificate(&id)
            .map(Some)
            .map_err(|source| AnnotationError::MissingSecret {
                annotation: format!("{}/{annotation}", self.prefix),
                source,
            })
    }
}

impl Default for DefaultExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_PREFIX)
    }
}

impl AnnotationExtractor for DefaultExtractor {
    fn extract(
        &self,
        route: &Ingress,
        resolver: &dyn Resolver,
    ) -> Result<RouteAnnotations, AnnotationError> {
        let values = prefixed(route, &self.prefix);

        let config = resolver.backend_configuration();
        for (name, value) in &values {
            if let Some(word) = config
                .annotation_value_word_blocklist
                .iter()
                .find(|w| value.contains(w.as_str()))
            {
                return Err(AnnotationError::Blocked {
                    annotation: format!("{}/{name}", self.prefix),
                    word: word.clone(),
                });
            }
        }

        let auth_tls = self.resolve_secret(route, &values, "auth-tls-secret", resolver)?;
        let proxy_ssl = self.resolve_secret(route, &values, "proxy-ssl-secret", resolver)?;
        Ok(RouteAnnotations {
            values,
            auth_tls,
            proxy_ssl,
        })
    }
}

/// Returns the annotations under `prefix/`, keyed without the prefix.
fn prefixed(route: &Ingress, prefix: &str) -> std::collections::BTreeMap<String, String> {
    route
        .annotations()
        .iter()
        .filter_map(|(k, v)| {
            let name = k.strip_prefix(prefix)?.strip_prefix('/')?;
            Some((name.to_string(), v.clone()))
        })
        .collect()
}

/// Parses a `name` or `namespace/name` secret reference.
fn secret_key(namespace: &str, value: &str) -> ResourceId {
    match value.split_once('/') {
        Some((ns, name)) => ResourceId::new(ns, name),
        None => ResourceId::new(namespace, value),
    }
}

/// Secrets named in `spec.tls`.
pub fn tls_secrets(route: &Ingress) -> Vec<ResourceId> {
    let ns = route.namespace().unwrap_or_default();
    let mut ids = route
        .spec
        .iter()
        .flat_map(|s| s.tls.iter().flatten())
        .filter_map(|tls| tls.secret_name.as_deref())
        .filter(|name| !name.is_empty())
        .map(|name| ResourceId::new(ns.clone(), name))
        .collect::<Vec<_>>();
    ids.sort();
    ids.dedup();
    ids
}

/// Every secret a route references, through `spec.tls` or annotations.
pub fn referenced_secrets(route: &Ingress, prefix: &str) -> Vec<ResourceId> {
    let ns = route.namespace().unwrap_or_default();
    let values = prefixed(route, prefix);
    let mut ids = tls_secrets(route);
    ids.extend(
        SECRET_ANNOTATIONS
            .iter()
            .filter_map(|a| values.get(*a))
            .filter(|v| !v.is_empty())
            .map(|v| secret_key(&ns, v)),
    );
    ids.sort();
    ids.dedup();
    ids
}

/// True when the route's annotations name a ConfigMap.
pub fn references_config_map(route: &Ingress, prefix: &str) -> bool {
    let values = prefixed(route, prefix);
    CONFIG_MAP_ANNOTATIONS
        .iter()
        .any(|a| values.get(*a).is_some_and(|v| !v.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;
    use ingress_controller_k8s_api::{IngressSpec, IngressTLS, ObjectMeta};
    use maplit::btreemap;
    use std::{collections::BTreeMap, path::PathBuf};

    struct MockResolver {
        config: Arc<BackendConfiguration>,
        certs: BTreeMap<ResourceId, AuthSslCert>,
    }

    impl Resolver for MockResolver {
        fn auth_certificate(&self, secret: &ResourceId) -> Result<AuthSslCert, NotFound> {
            self.certs
                .get(secret)
                .cloned()
                .ok_or_else(|| NotFound::new(Kind::Certificate, secret))
        }

        fn backend_configuration(&self) -> Arc<BackendConfiguration> {
            self.config.clone()
        }
    }

    fn mk_route(annotations: BTreeMap<String, String>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some("route".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                tls: Some(vec![
                    IngressTLS {
                        hosts: Some(vec!["a.example.com".to_string()]),
                        secret_name: Some("a-tls".to_string()),
                    },
                    IngressTLS {
                        hosts: Some(vec!["b.example.com".to_string()]),
                        secret_name: Some("a-tls".to_string()),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn mk_auth(secret: &str) -> AuthSslCert {
        AuthSslCert {
            secret: secret.to_string(),
            ca_file: PathBuf::from("/ssl/ca.pem"),
            ca_sha: "sha".to_string(),
            crl_file: None,
            crl_sha: None,
            pem_file: PathBuf::from("/ssl/ca.pem"),
        }
    }

    #[test]
    fn collects_references() {
        let route = mk_route(btreemap! {
            "nginx.ingress.kubernetes.io/auth-tls-secret".to_string() => "other/client-ca".to_string(),
            "nginx.ingress.kubernetes.io/auth-secret".to_string() => "basic".to_string(),
            "nginx.ingress.kubernetes.io/custom-headers".to_string() => "ns/headers".to_string(),
            "unrelated/auth-secret".to_string() => "ignored".to_string(),
        });
        assert_eq!(
            referenced_secrets(&route, DEFAULT_ANNOTATION_PREFIX),
            vec![
                ResourceId::new("ns", "a-tls"),
                ResourceId::new("ns", "basic"),
                ResourceId::new("other", "client-ca"),
            ]
        );
        assert_eq!(tls_secrets(&route), vec![ResourceId::new("ns", "a-tls")]);
        assert!(references_config_map(&route, DEFAULT_ANNOTATION_PREFIX));
        assert!(!references_config_map(&mk_route(BTreeMap::new()), DEFAULT_ANNOTATION_PREFIX));
    }

    #[test]
    fn extracts_record() {
        let resolver = MockResolver {
            config: Default::default(),
            certs: btreemap! { ResourceId::new("ns", "client-ca") => mk_auth("ns/client-ca") },
        };
        let route = mk_route(btreemap! {
            "nginx.ingress.kubernetes.io/auth-tls-secret".to_string() => "client-ca".to_string(),
            "nginx.ingress.kubernetes.io/ssl-redirect".to_string() => "true".to_string(),
        });
        let record = DefaultExtractor::default()
            .extract(&route, &resolver)
            .unwrap();
        assert!(record.get_bool("ssl-redirect"));
        assert_eq!(record.auth_tls, Some(mk_auth("ns/client-ca")));
        assert_eq!(record.proxy_ssl, None);
    }

    #[test]
    fn missing_secret_fails() {
        let resolver = MockResolver {
            config: Default::default(),
            certs: BTreeMap::new(),
        };
        let route = mk_route(btreemap! {
            "nginx.ingress.kubernetes.io/proxy-ssl-secret".to_string() => "upstream-ca".to_string(),
        });
        let err = DefaultExtractor::default()
            .extract(&route, &resolver)
            .unwrap_err();
        assert!(matches!(err, AnnotationError::MissingSecret { .. }));
    }

    #[test]
    fn blocked_words_fail() {
        let resolver = MockResolver {
            config: Arc::new(BackendConfiguration {
                annotation_value_word_blocklist: vec!["load_module".to_string()],
                ..Default::default()
            }),
            certs: BTreeMap::new(),
        };
        let route = mk_route(btreemap! {
            "nginx.ingress.kubernetes.io/configuration-snippet".to_string() => "load_module evil.so;".to_string(),
        });
        let err = DefaultExtractor::default()
            .extract(&route, &resolver)
            .unwrap_err();
        assert!(matches!(err, AnnotationError::Blocked { ref word, .. } if word == "load_module"));
    }
}

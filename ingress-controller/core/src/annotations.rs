use crate::AuthSslCert;
use std::collections::BTreeMap;

/// Settings derived from a route's controller-prefixed annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteAnnotations {
    /// Annotation values keyed by name with the controller prefix stripped.
    pub values: BTreeMap<String, String>,

    /// Client certificate verification material from `auth-tls-secret`.
    pub auth_tls: Option<AuthSslCert>,

    /// Upstream verification material from `proxy-ssl-secret`.
    pub proxy_ssl: Option<AuthSslCert>,
}

impl RouteAnnotations {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

use chrono::{offset::Utc, DateTime};
use serde::Serialize;
use std::{collections::BTreeSet, path::PathBuf};

/// Validated certificate material that has been written to disk.
///
/// Artifacts are replaced, never mutated, when their source changes.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateArtifact {
    /// UID of the object the material was read from.
    pub uid: String,
    pub namespace: String,
    pub name: String,

    /// Common name and DNS subject alternative names, sorted and deduplicated.
    pub subject_names: Vec<String>,

    /// Hex-encoded SHA-1 of the PEM bundle.
    pub pem_sha: String,
    pub pem_path: PathBuf,

    /// The bundle itself, as pushed over the side channel.
    #[serde(skip)]
    pub pem_bundle: String,

    pub ca_path: Option<PathBuf>,
    pub ca_sha: Option<String>,
    pub crl_path: Option<PathBuf>,
    pub crl_sha: Option<String>,

    pub expires_at: DateTime<Utc>,
}

/// File references needed to verify client certificates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSslCert {
    pub secret: String,
    pub ca_file: PathBuf,
    pub ca_sha: String,
    pub crl_file: Option<PathBuf>,
    pub crl_sha: Option<String>,
    pub pem_file: PathBuf,
}

// === impl CertificateArtifact ===

impl CertificateArtifact {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Client verification material, when the artifact carries a CA.
    pub fn auth_ssl_cert(&self) -> Option<AuthSslCert> {
        Some(AuthSslCert {
            secret: self.key(),
            ca_file: self.ca_path.clone()?,
            ca_sha: self.ca_sha.clone()?,
            crl_file: self.crl_path.clone(),
            crl_sha: self.crl_sha.clone(),
            pem_file: self.pem_path.clone(),
        })
    }

    /// True when the certificate covers `hostname`, either exactly or through a
    /// wildcard on the first label.
    pub fn matches_hostname(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.subject_names.iter().any(|name| {
            let name = name.to_ascii_lowercase();
            if name == hostname {
                return true;
            }
            match (name.strip_prefix("*."), hostname.split_once('.')) {
                (Some(suffix), Some((label, rest))) => !label.is_empty() && rest == suffix,
                _ => false,
            }
        })
    }

    fn subject_set(&self) -> BTreeSet<&str> {
        self.subject_names.iter().map(String::as_str).collect()
    }
}

impl PartialEq for CertificateArtifact {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.pem_sha == other.pem_sha
            && self.pem_path == other.pem_path
            && self.ca_path == other.ca_path
            && self.ca_sha == other.ca_sha
            && self.crl_path == other.crl_path
            && self.crl_sha == other.crl_sha
            && self.expires_at == other.expires_at
            && self.subject_set() == other.subject_set()
    }
}

impl Eq for CertificateArtifact {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_artifact(names: &[&str]) -> CertificateArtifact {
        CertificateArtifact {
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            name: "tls".to_string(),
            subject_names: names.iter().map(|n| n.to_string()).collect(),
            pem_sha: "abc".to_string(),
            pem_path: PathBuf::from("/ssl/default-tls.pem"),
            pem_bundle: String::new(),
            ca_path: None,
            ca_sha: None,
            crl_path: None,
            crl_sha: None,
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn hostname_matching() {
        let cert = mk_artifact(&["example.com", "*.apps.example.com"]);
        assert!(cert.matches_hostname("example.com"));
        assert!(cert.matches_hostname("EXAMPLE.com"));
        assert!(cert.matches_hostname("foo.apps.example.com"));
        assert!(!cert.matches_hostname("apps.example.com"));
        assert!(!cert.matches_hostname("a.b.apps.example.com"));
        assert!(!cert.matches_hostname("other.com"));
    }

    #[test]
    fn equality_ignores_subject_order_and_bundle() {
        let a = mk_artifact(&["a.example.com", "b.example.com"]);
        let mut b = mk_artifact(&["b.example.com", "a.example.com"]);
        b.pem_bundle = "ignored".to_string();
        assert_eq!(a, b);

        let mut c = a.clone();
        c.pem_sha = "def".to_string();
        assert_ne!(a, c);

        let mut d = a.clone();
        d.uid = "uid-2".to_string();
        assert_ne!(a, d);

        let mut e = a.clone();
        e.expires_at = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        assert_ne!(a, e);
    }
}

use crate::{Kind, NotFound};
use ahash::AHashMap as HashMap;
use ingress_controller_core::CertificateArtifact;
use parking_lot::Mutex;
use std::sync::Arc;

/// The certificates currently believed valid, keyed by owning object.
///
/// The lock is held only while the map is touched, never across a
/// filesystem write.
#[derive(Debug, Default)]
pub struct SslCertTracker {
    certs: Mutex<HashMap<String, Arc<CertificateArtifact>>>,
}

impl SslCertTracker {
    pub fn get(&self, key: &str) -> Result<Arc<CertificateArtifact>, NotFound> {
        self.certs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| NotFound::new(Kind::Certificate, key))
    }

    /// Stores `artifact`, returning the artifact it replaced.
    pub fn upsert(
        &self,
        key: impl Into<String>,
        artifact: Arc<CertificateArtifact>,
    ) -> Option<Arc<CertificateArtifact>> {
        self.certs.lock().insert(key.into(), artifact)
    }

    pub fn delete(&self, key: &str) -> Option<Arc<CertificateArtifact>> {
        self.certs.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.certs.lock().contains_key(key)
    }

    /// Returns every tracked artifact, sorted by key.
    pub fn list(&self) -> Vec<(String, Arc<CertificateArtifact>)> {
        let mut certs = self
            .certs
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        certs.sort_by(|(a, _), (b, _)| a.cmp(b));
        certs
    }

    pub fn len(&self) -> usize {
        self.certs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn mk_artifact(name: &str, sha: &str) -> Arc<CertificateArtifact> {
        Arc::new(CertificateArtifact {
            uid: format!("uid-{name}"),
            namespace: "ns".to_string(),
            name: name.to_string(),
            subject_names: vec![format!("{name}.example.com")],
            pem_sha: sha.to_string(),
            pem_path: PathBuf::from(format!("/etc/ingress-controller/ssl/ns-{name}.pem")),
            pem_bundle: String::new(),
            ca_path: None,
            ca_sha: None,
            crl_path: None,
            crl_sha: None,
            expires_at: Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        })
    }

    #[test]
    fn get_missing() {
        let tracker = SslCertTracker::default();
        assert_eq!(
            tracker.get("ns/web").unwrap_err(),
            NotFound::new(Kind::Certificate, "ns/web")
        );
        assert!(!tracker.contains("ns/web"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn upsert_replaces() {
        let tracker = SslCertTracker::default();
        assert!(tracker.upsert("ns/web", mk_artifact("web", "a")).is_none());

        let old = tracker
            .upsert("ns/web", mk_artifact("web", "b"))
            .expect("previous artifact is returned");
        assert_eq!(old.pem_sha, "a");
        assert_eq!(tracker.get("ns/web").unwrap().pem_sha, "b");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn delete_missing() {
        let tracker = SslCertTracker::default();
        tracker.upsert("ns/web", mk_artifact("web", "a"));
        assert!(tracker.delete("ns/other").is_none());
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.delete("ns/web").unwrap().pem_sha, "a");
        assert!(tracker.delete("ns/web").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn list_is_sorted() {
        let tracker = SslCertTracker::default();
        for name in ["web", "api", "mail"] {
            tracker.upsert(format!("ns/{name}"), mk_artifact(name, name));
        }
        let keys = tracker
            .list()
            .into_iter()
            .map(|(key, cert)| {
                assert_eq!(key, format!("ns/{}", cert.name));
                key
            })
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["ns/api", "ns/mail", "ns/web"]);
    }
}

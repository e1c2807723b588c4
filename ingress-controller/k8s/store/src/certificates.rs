//! Turns raw TLS material into certificate artifacts on disk.

use crate::{
    fs::{write_atomic, Filesystem},
    ssl::{self, ChainStatus, SslError},
    SslCertTracker,
};
use ingress_controller_core::{CertificateArtifact, ResourceId};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// A certificate/key pair with optional CA bundle and CRL.
#[derive(Copy, Clone, Debug)]
pub struct KeyMaterial<'a> {
    pub cert: &'a [u8],
    pub key: &'a [u8],
    pub ca: Option<&'a [u8]>,
    /// Only honored alongside `ca`.
    pub crl: Option<&'a [u8]>,
}

#[derive(Debug)]
pub struct CertificateManager {
    fs: Arc<dyn Filesystem>,
    ssl_dir: PathBuf,
    tracker: SslCertTracker,
}

// === impl CertificateManager ===

impl CertificateManager {
    pub fn new(fs: Arc<dyn Filesystem>, ssl_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            ssl_dir: ssl_dir.into(),
            tracker: SslCertTracker::default(),
        }
    }

    pub fn tracker(&self) -> &SslCertTracker {
        &self.tracker
    }

    pub fn ssl_dir(&self) -> &Path {
        &self.ssl_dir
    }

    /// The bundle path for a key pair owned by `id`.
    pub fn pem_path(&self, id: &ResourceId) -> PathBuf {
        self.ssl_dir.join(format!("{}.pem", id.dashed()))
    }

    /// The bundle path for a CA-only object owned by `id`.
    pub fn ca_path(&self, id: &ResourceId) -> PathBuf {
        self.ssl_dir.join(format!("ca-{}.pem", id.dashed()))
    }

    pub fn crl_path(&self, id: &ResourceId) -> PathBuf {
        self.ssl_dir.join(format!("crl-{}.pem", id.dashed()))
    }

    /// Validates a key pair and writes `<cert>\n<key>[\n<ca>]` to the owner's
    /// bundle path.
    ///
    /// Nothing is written unless every check passes.
    pub fn materialize_from_keypair(
        &self,
        id: &ResourceId,
        uid: &str,
        material: KeyMaterial<'_>,
    ) -> Result<CertificateArtifact, SslError> {
        let leaf = ssl::validate_keypair(material.cert, material.key)?;
        if let Some(ca) = material.ca {
            ssl::verify_chain(material.cert, ca)?;
        }
        let crl = match (material.ca, material.crl) {
            (Some(_), Some(crl)) => {
                ssl::validate_crl(crl)?;
                Some(crl)
            }
            _ => None,
        };

        let mut bundle = Vec::with_capacity(
            material.cert.len() + material.key.len() + material.ca.map_or(0, <[u8]>::len) + 2,
        );
        bundle.extend_from_slice(material.cert);
        bundle.push(b'\n');
        bundle.extend_from_slice(material.key);
        if let Some(ca) = material.ca {
            bundle.push(b'\n');
            bundle.extend_from_slice(ca);
        }

        let pem_path = self.pem_path(id);
        self.write(&pem_path, &bundle)?;
        let (crl_path, crl_sha) = self.write_crl(id, crl)?;

        let pem_sha = ssl::sha(&bundle);
        Ok(CertificateArtifact {
            uid: uid.to_string(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            subject_names: leaf.subject_names,
            ca_path: material.ca.map(|_| pem_path.clone()),
            ca_sha: material.ca.map(ssl::sha),
            crl_path,
            crl_sha,
            pem_path,
            pem_sha,
            pem_bundle: String::from_utf8_lossy(&bundle).into_owned(),
            expires_at: leaf.expires_at,
        })
    }

    /// Validates a CA bundle used to verify client certificates and writes it
    /// to `ca-<namespace>-<name>.pem`, with an optional CRL beside it.
    pub fn materialize_from_ca_only(
        &self,
        id: &ResourceId,
        uid: &str,
        ca: &[u8],
        crl: Option<&[u8]>,
    ) -> Result<CertificateArtifact, SslError> {
        let info = ssl::validate_ca(ca)?;
        if let Some(crl) = crl {
            ssl::validate_crl(crl)?;
        }

        let ca_path = self.ca_path(id);
        self.write(&ca_path, ca)?;
        let (crl_path, crl_sha) = self.write_crl(id, crl)?;

        let sha = ssl::sha(ca);
        Ok(CertificateArtifact {
            uid: uid.to_string(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            subject_names: info.subject_names,
            pem_path: ca_path.clone(),
            pem_sha: sha.clone(),
            pem_bundle: String::from_utf8_lossy(ca).into_owned(),
            ca_path: Some(ca_path),
            ca_sha: Some(sha),
            crl_path,
            crl_sha,
            expires_at: info.expires_at,
        })
    }

    /// Re-reads an artifact's bundle from disk and checks its chain.
    pub fn check_health(&self, artifact: &CertificateArtifact) -> ChainStatus {
        match self.fs.read_file(&artifact.pem_path) {
            Ok(bundle) => ssl::check_chain(&bundle),
            Err(error) => {
                tracing::debug!(%error, path = %artifact.pem_path.display(), "Failed to read certificate");
                ChainStatus::Unreadable
            }
        }
    }

    fn write_crl(
        &self,
        id: &ResourceId,
        crl: Option<&[u8]>,
    ) -> Result<(Option<PathBuf>, Option<String>), SslError> {
        let Some(crl) = crl else {
            return Ok((None, None));
        };
        let path = self.crl_path(id);
        self.write(&path, crl)?;
        Ok((Some(path), Some(ssl::sha(crl))))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), SslError> {
        write_atomic(&*self.fs, path, contents).map_err(|source| SslError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{Directories, MemFilesystem},
        ssl::testutil::*,
    };

    fn mk_manager() -> (Arc<MemFilesystem>, CertificateManager) {
        let dirs = Directories::from_ssl_dir("/etc/ingress-controller/ssl");
        let fs = Arc::new(MemFilesystem::with_default_assets(&dirs).unwrap());
        let mgr = CertificateManager::new(fs.clone(), dirs.ssl);
        (fs, mgr)
    }

    fn id() -> ResourceId {
        ResourceId::new("default", "echo-tls")
    }

    #[test]
    fn keypair_roundtrip() {
        let (fs, mgr) = mk_manager();
        let leaf = mk_self_signed("echo.example.com", &["echo.example.com"]);
        let artifact = mgr
            .materialize_from_keypair(
                &id(),
                "uid-1",
                KeyMaterial {
                    cert: leaf.cert_pem.as_bytes(),
                    key: leaf.key_pem.as_bytes(),
                    ca: None,
                    crl: None,
                },
            )
            .unwrap();

        assert_eq!(
            artifact.pem_path,
            PathBuf::from("/etc/ingress-controller/ssl/default-echo-tls.pem")
        );
        assert_eq!(artifact.subject_names, vec!["echo.example.com"]);
        assert_eq!(artifact.uid, "uid-1");
        assert_eq!(artifact.ca_path, None);

        let on_disk = fs.read_file(&artifact.pem_path).unwrap();
        assert_eq!(ssl::sha(&on_disk), artifact.pem_sha);
        assert_eq!(
            on_disk,
            format!("{}\n{}", leaf.cert_pem, leaf.key_pem).into_bytes()
        );
        assert_eq!(mgr.check_health(&artifact), ChainStatus::Valid);
    }

    #[test]
    fn keypair_with_ca_and_crl() {
        let (fs, mgr) = mk_manager();
        let ca = mk_ca("Test CA");
        let leaf = ca.issue("echo.example.com", &["echo.example.com"]);
        let artifact = mgr
            .materialize_from_keypair(
                &id(),
                "uid-1",
                KeyMaterial {
                    cert: leaf.cert_pem.as_bytes(),
                    key: leaf.key_pem.as_bytes(),
                    ca: Some(ca.cert_pem.as_bytes()),
                    crl: None,
                },
            )
            .unwrap();
        assert_eq!(artifact.ca_path.as_ref(), Some(&artifact.pem_path));
        assert_eq!(artifact.ca_sha, Some(ssl::sha(ca.cert_pem.as_bytes())));
        let on_disk = String::from_utf8(fs.read_file(&artifact.pem_path).unwrap()).unwrap();
        assert!(on_disk.ends_with(&ca.cert_pem));

        // A malformed CRL aborts the whole materialization.
        let err = mgr
            .materialize_from_keypair(
                &ResourceId::new("default", "other"),
                "uid-2",
                KeyMaterial {
                    cert: leaf.cert_pem.as_bytes(),
                    key: leaf.key_pem.as_bytes(),
                    ca: Some(ca.cert_pem.as_bytes()),
                    crl: Some(b"not a crl"),
                },
            )
            .unwrap_err();
        assert!(matches!(err, SslError::NoPem("CRL")), "{err}");
        assert!(!fs.exists(Path::new("/etc/ingress-controller/ssl/default-other.pem")));
    }

    #[test]
    fn chain_failure_writes_nothing() {
        let (fs, mgr) = mk_manager();
        let ca = mk_ca("Test CA");
        let other = mk_ca("Other CA");
        let leaf = ca.issue("echo.example.com", &[]);
        let path = mgr.pem_path(&id());

        let material = KeyMaterial {
            cert: leaf.cert_pem.as_bytes(),
            key: leaf.key_pem.as_bytes(),
            ca: Some(other.cert_pem.as_bytes()),
            crl: None,
        };
        let err = mgr.materialize_from_keypair(&id(), "uid-1", material);
        assert!(matches!(err, Err(SslError::Chain(_))));
        assert!(!fs.exists(&path));
        assert!(fs.list(mgr.ssl_dir()).is_empty());

        // A previously written bundle is left untouched.
        let good = mgr
            .materialize_from_keypair(
                &id(),
                "uid-1",
                KeyMaterial {
                    ca: Some(ca.cert_pem.as_bytes()),
                    ..material
                },
            )
            .unwrap();
        let before = fs.read_file(&path).unwrap();
        assert!(mgr
            .materialize_from_keypair(&id(), "uid-1", material)
            .is_err());
        assert_eq!(fs.read_file(&path).unwrap(), before);
        assert_eq!(ssl::sha(&before), good.pem_sha);
    }

    #[test]
    fn io_failure_is_reported() {
        let (fs, mgr) = mk_manager();
        let leaf = mk_self_signed("echo.example.com", &[]);
        fs.set_read_only(true);
        let err = mgr
            .materialize_from_keypair(
                &id(),
                "uid-1",
                KeyMaterial {
                    cert: leaf.cert_pem.as_bytes(),
                    key: leaf.key_pem.as_bytes(),
                    ca: None,
                    crl: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, SslError::Io { .. }));
    }

    #[test]
    fn failed_bundle_write_keeps_prior_crl() {
        let (fs, mgr) = mk_manager();
        let ca = mk_ca("Test CA");
        let leaf = ca.issue("echo.example.com", &[]);
        let material = KeyMaterial {
            cert: leaf.cert_pem.as_bytes(),
            key: leaf.key_pem.as_bytes(),
            ca: Some(ca.cert_pem.as_bytes()),
            crl: Some(include_bytes!("testdata/crl-1.pem")),
        };
        let artifact = mgr.materialize_from_keypair(&id(), "uid-1", material).unwrap();
        let crl_path = mgr.crl_path(&id());
        assert_eq!(artifact.crl_path.as_ref(), Some(&crl_path));
        assert_eq!(fs.read_file(&crl_path).unwrap(), include_bytes!("testdata/crl-1.pem"));

        fs.set_path_read_only(mgr.pem_path(&id()), true);
        let err = mgr
            .materialize_from_keypair(
                &id(),
                "uid-1",
                KeyMaterial {
                    crl: Some(include_bytes!("testdata/crl-2.pem")),
                    ..material
                },
            )
            .unwrap_err();
        assert!(matches!(err, SslError::Io { .. }), "{err}");
        assert_eq!(fs.read_file(&crl_path).unwrap(), include_bytes!("testdata/crl-1.pem"));

        // The same holds for CA-only material.
        let ca_id = ResourceId::new("default", "client-ca");
        mgr.materialize_from_ca_only(
            &ca_id,
            "uid-2",
            ca.cert_pem.as_bytes(),
            Some(include_bytes!("testdata/crl-1.pem")),
        )
        .unwrap();
        fs.set_path_read_only(mgr.ca_path(&ca_id), true);
        assert!(mgr
            .materialize_from_ca_only(
                &ca_id,
                "uid-2",
                ca.cert_pem.as_bytes(),
                Some(include_bytes!("testdata/crl-2.pem")),
            )
            .is_err());
        assert_eq!(
            fs.read_file(&mgr.crl_path(&ca_id)).unwrap(),
            include_bytes!("testdata/crl-1.pem")
        );
    }

    #[test]
    fn ca_only() {
        let (fs, mgr) = mk_manager();
        let ca = mk_ca("Client CA");
        let artifact = mgr
            .materialize_from_ca_only(&id(), "uid-1", ca.cert_pem.as_bytes(), None)
            .unwrap();
        assert_eq!(
            artifact.pem_path,
            PathBuf::from("/etc/ingress-controller/ssl/ca-default-echo-tls.pem")
        );
        assert_eq!(artifact.ca_path.as_ref(), Some(&artifact.pem_path));
        assert_eq!(artifact.subject_names, vec!["Client CA"]);
        assert_eq!(artifact.crl_path, None);
        assert_eq!(fs.read_file(&artifact.pem_path).unwrap(), ca.cert_pem.as_bytes());

        assert!(mgr
            .materialize_from_ca_only(&id(), "uid-1", b"junk", None)
            .is_err());
    }
}

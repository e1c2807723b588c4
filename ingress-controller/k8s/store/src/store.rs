use crate::{
    annotations::{tls_secrets, AnnotationExtractor, DefaultExtractor, Resolver},
    certificates::{CertificateManager, KeyMaterial},
    driver::IndexResource,
    events::{Event, EventSender},
    fs::Filesystem,
    handlers::{self, resource_id, Effects, View},
    ssl::{ChainStatus, SslError},
    BackendConfiguration, Cache, ClassConfig, Kind, NotFound, ReferenceIndex,
    DEFAULT_ANNOTATION_PREFIX,
};
use ahash::AHashMap as HashMap;
use ingress_controller_core::{AuthSslCert, CertificateArtifact, ResourceId, RouteAnnotations};
use ingress_controller_k8s_api::{
    ConfigMap, Endpoints, Ingress, IngressClass, Secret, Service, CA_CERT_KEY, CA_CRL_KEY,
    TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use parking_lot::RwLock;
use std::{cmp::Ordering, path::PathBuf, sync::Arc};
use tokio::sync::{watch, Mutex, MutexGuard};

/// Key under which basic-auth secrets carry their htpasswd data.
const AUTH_KEY: &str = "auth";

/// Settings that decide which objects matter and how they are read.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub config_map: Option<ResourceId>,
    pub tcp_config_map: Option<ResourceId>,
    pub udp_config_map: Option<ResourceId>,
    pub default_ssl_certificate: Option<ResourceId>,
    pub class: ClassConfig,
    /// Refuse routes that declare `spec.defaultBackend`.
    pub disable_catch_all: bool,
    pub annotation_prefix: String,
}

/// An admitted route together with its derived annotation record.
#[derive(Clone, Debug)]
pub struct AdmittedRoute {
    pub id: ResourceId,
    /// The route with defaults applied.
    pub ingress: Arc<Ingress>,
    pub annotations: Arc<RouteAnnotations>,
}

/// Result of synchronising one secret into the certificate tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Added,
    Updated,
    Unchanged,
    /// The secret holds no certificate material we use.
    Skipped,
    /// Validation or I/O failed; any previous artifact is kept.
    Failed,
    /// The secret is not cached.
    Missing,
}

/// Aggregates the per-kind caches and the state derived from them.
///
/// Watch pipelines feed objects in through [`IndexResource`]; every change is
/// turned into [`Effects`] by a pure handler and then applied here in a fixed
/// order. Steps 1 to 6 hold the secret-sync lock only when the effects touch
/// certificates; events are emitted after it is released.
///
/// 1. certificates of deleted secrets are forgotten;
/// 2. the backend configuration is reloaded;
/// 3. routes that lost admission are forgotten;
/// 4. admitted routes are re-indexed by the secrets they reference;
/// 5. referenced secrets are materialized;
/// 6. annotation records are derived for the affected routes;
/// 7. events are emitted.
#[derive(Debug)]
pub struct Store {
    config: StoreConfig,

    routes: Cache<Ingress>,
    route_classes: Cache<IngressClass>,
    services: Cache<Service>,
    endpoints: Cache<Endpoints>,
    secrets: Cache<Secret>,
    config_maps: Cache<ConfigMap>,

    /// Admitted routes; `None` until a record derives successfully.
    admitted: RwLock<HashMap<ResourceId, Option<AdmittedRoute>>>,
    secret_refs: ReferenceIndex,
    certificates: CertificateManager,
    backend_config: RwLock<Arc<BackendConfiguration>>,
    extractor: Box<dyn AnnotationExtractor>,

    pub(crate) secret_sync: Mutex<()>,
    events: EventSender,
    ready: watch::Sender<bool>,
}

/// Resolves annotation references against the certificate tracker only.
struct TrackedResolver<'s>(&'s Store);

// === impl StoreConfig ===

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            config_map: None,
            tcp_config_map: None,
            udp_config_map: None,
            default_ssl_certificate: None,
            class: ClassConfig::default(),
            disable_catch_all: false,
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
        }
    }
}

// === impl Store ===

impl Store {
    pub fn new(
        config: StoreConfig,
        fs: Arc<dyn Filesystem>,
        ssl_dir: impl Into<PathBuf>,
        events: EventSender,
    ) -> Self {
        let extractor = Box::new(DefaultExtractor::new(config.annotation_prefix.clone()));
        Self {
            config,
            routes: Cache::new(Kind::Route),
            route_classes: Cache::new(Kind::RouteClass),
            services: Cache::new(Kind::Service),
            endpoints: Cache::new(Kind::Endpoints),
            secrets: Cache::new(Kind::Secret),
            config_maps: Cache::new(Kind::ConfigMap),
            admitted: Default::default(),
            secret_refs: ReferenceIndex::default(),
            certificates: CertificateManager::new(fs, ssl_dir),
            backend_config: Default::default(),
            extractor,
            secret_sync: Mutex::new(()),
            events,
            ready: watch::Sender::new(false),
        }
    }

    pub fn with_extractor(mut self, extractor: impl AnnotationExtractor) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    pub fn secret_references(&self) -> &ReferenceIndex {
        &self.secret_refs
    }

    /// Number of cached objects per kind.
    pub fn cache_sizes(&self) -> [(Kind, usize); 6] {
        [
            (Kind::Route, self.routes.len()),
            (Kind::RouteClass, self.route_classes.len()),
            (Kind::Service, self.services.len()),
            (Kind::Endpoints, self.endpoints.len()),
            (Kind::Secret, self.secrets.len()),
            (Kind::ConfigMap, self.config_maps.len()),
        ]
    }

    pub fn admitted_len(&self) -> usize {
        self.admitted.read().len()
    }

    // --- lookups ---

    /// Returns an admitted route, with defaults applied.
    pub fn get_route(&self, id: &ResourceId) -> Result<Arc<Ingress>, NotFound> {
        self.admitted
            .read()
            .get(id)
            .and_then(|r| r.as_ref())
            .map(|r| r.ingress.clone())
            .ok_or_else(|| NotFound::new(Kind::Route, id))
    }

    pub fn route_annotations(&self, id: &ResourceId) -> Result<Arc<RouteAnnotations>, NotFound> {
        self.admitted
            .read()
            .get(id)
            .and_then(|r| r.as_ref())
            .map(|r| r.annotations.clone())
            .ok_or_else(|| NotFound::new(Kind::Annotations, id))
    }

    /// Admitted routes with a derived record, oldest first. Routes created in
    /// the same second are ordered by key, descending.
    pub fn list_routes(&self) -> Vec<AdmittedRoute> {
        let mut routes = self
            .admitted
            .read()
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        routes.sort_by(|a, b| {
            let by_ts = match (
                &a.ingress.metadata.creation_timestamp,
                &b.ingress.metadata.creation_timestamp,
            ) {
                (Some(a_ts), Some(b_ts)) => a_ts.cmp(b_ts),
                (None, None) => Ordering::Equal,
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
            };
            by_ts.then_with(|| a.id.cmp(&b.id).reverse())
        });
        routes
    }

    pub fn get_route_class(&self, name: &str) -> Result<Arc<IngressClass>, NotFound> {
        self.route_classes.get(&ResourceId::cluster(name))
    }

    pub fn get_service(&self, id: &ResourceId) -> Result<Arc<Service>, NotFound> {
        self.services.get(id)
    }

    pub fn get_endpoints(&self, id: &ResourceId) -> Result<Arc<Endpoints>, NotFound> {
        self.endpoints.get(id)
    }

    pub fn get_secret(&self, id: &ResourceId) -> Result<Arc<Secret>, NotFound> {
        self.secrets.get(id)
    }

    pub fn get_config_map(&self, id: &ResourceId) -> Result<Arc<ConfigMap>, NotFound> {
        self.config_maps.get(id)
    }

    pub fn local_certificate(
        &self,
        id: &ResourceId,
    ) -> Result<Arc<CertificateArtifact>, NotFound> {
        self.certificates.tracker().get(&id.to_string())
    }

    pub fn list_local_certificates(&self) -> Vec<Arc<CertificateArtifact>> {
        self.certificates
            .tracker()
            .list()
            .into_iter()
            .map(|(_, cert)| cert)
            .collect()
    }

    pub fn default_certificate(&self) -> Option<Arc<CertificateArtifact>> {
        let id = self.config.default_ssl_certificate.as_ref()?;
        self.local_certificate(id).ok()
    }

    pub fn backend_configuration(&self) -> Arc<BackendConfiguration> {
        self.backend_config.read().clone()
    }

    /// Resolves client verification material, synchronising the secret
    /// first when it is not tracked yet.
    pub async fn auth_certificate(&self, id: &ResourceId) -> Result<AuthSslCert, NotFound> {
        if !self.certificates.tracker().contains(&id.to_string()) {
            let guard = self.secret_sync.lock().await;
            self.sync_secret_locked(&guard, id);
        }
        TrackedResolver(self).auth_certificate(id)
    }

    // --- readiness ---

    /// Marks the store ready once every watch has completed its initial list.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    // --- certificates ---

    /// Materializes one secret.
    pub async fn sync_secret(&self, id: &ResourceId) -> SyncOutcome {
        let guard = self.secret_sync.lock().await;
        self.sync_secret_locked(&guard, id)
    }

    /// Materializes the configured default certificate, if any.
    pub async fn prime_default_certificate(&self) -> Option<SyncOutcome> {
        let id = self.config.default_ssl_certificate.clone()?;
        let guard = self.secret_sync.lock().await;
        let outcome = self.sync_secret_locked(&guard, &id);
        drop(guard);
        match outcome {
            SyncOutcome::Added | SyncOutcome::Updated => {
                tracing::info!(secret = %id, "Loaded default certificate");
                self.events
                    .send(Event::configuration(
                        format!("default certificate {id} loaded"),
                        Vec::new(),
                    ))
                    .await;
            }
            SyncOutcome::Unchanged => {}
            _ => tracing::warn!(secret = %id, ?outcome, "Default certificate unavailable"),
        }
        Some(outcome)
    }

    /// Re-materializes certificates referenced by admitted routes but absent
    /// from the tracker. Returns the number of certificates restored.
    pub async fn sync_missing_certificates(&self) -> usize {
        let guard = self.secret_sync.lock().await;
        let tracker = self.certificates.tracker();

        let mut missing = self
            .admitted_routes()
            .into_iter()
            .flat_map(|(route, ingress)| {
                tls_secrets(&ingress)
                    .into_iter()
                    .map(move |secret| (secret, route.clone()))
            })
            .filter(|(secret, _)| !tracker.contains(&secret.to_string()))
            .collect::<Vec<_>>();
        missing.sort();

        let mut restored = 0;
        let mut affected = Vec::new();
        let mut last = None;
        for (secret, route) in missing {
            if last.as_ref() != Some(&secret) {
                let outcome = self.sync_secret_locked(&guard, &secret);
                if outcome == SyncOutcome::Added {
                    restored += 1;
                }
                last = Some(secret.clone());
            }
            if tracker.contains(&secret.to_string()) {
                affected.push(route);
            }
        }

        drop(guard);
        if restored > 0 {
            affected.sort();
            affected.dedup();
            tracing::info!(restored, "Restored missing certificates");
            self.events
                .send(Event::configuration(
                    format!("restored {restored} missing certificates"),
                    affected,
                ))
                .await;
        }
        restored
    }

    /// Re-checks every tracked artifact's chain on disk. Failures are logged
    /// and returned; artifacts are never evicted.
    pub async fn check_certificate_health(&self) -> Vec<(String, ChainStatus)> {
        let _guard = self.secret_sync.lock().await;
        let mut unhealthy = Vec::new();
        for (key, cert) in self.certificates.tracker().list() {
            let status = self.certificates.check_health(&cert);
            if status != ChainStatus::Valid {
                tracing::warn!(secret = %key, ?status, expires_at = %cert.expires_at, "Certificate chain is not valid");
                unhealthy.push((key, status));
            }
        }
        unhealthy
    }

    fn sync_secret_locked(&self, _guard: &MutexGuard<'_, ()>, id: &ResourceId) -> SyncOutcome {
        let Ok(secret) = self.secrets.get(id) else {
            tracing::debug!(secret = %id, "Secret not cached");
            return SyncOutcome::Missing;
        };

        let artifact = match self.materialize(id, &secret) {
            Ok(artifact) => artifact,
            Err(SslError::AuthOnly) => {
                tracing::trace!(secret = %id, "Ignoring basic authentication secret");
                return SyncOutcome::Skipped;
            }
            Err(error) => {
                tracing::warn!(secret = %id, %error, "Failed to materialize certificate");
                return SyncOutcome::Failed;
            }
        };

        let key = id.to_string();
        let tracker = self.certificates.tracker();
        match tracker.get(&key) {
            Ok(prev) if *prev == artifact => SyncOutcome::Unchanged,
            Ok(_) => {
                tracing::info!(secret = %id, expires_at = %artifact.expires_at, "Updated certificate");
                tracker.upsert(key, Arc::new(artifact));
                SyncOutcome::Updated
            }
            Err(_) => {
                tracing::info!(secret = %id, expires_at = %artifact.expires_at, "Added certificate");
                tracker.upsert(key, Arc::new(artifact));
                SyncOutcome::Added
            }
        }
    }

    fn materialize(&self, id: &ResourceId, secret: &Secret) -> Result<CertificateArtifact, SslError> {
        let uid = secret.metadata.uid.as_deref().unwrap_or_default();
        let crl = field(secret, CA_CRL_KEY);
        match (
            field(secret, TLS_CERT_KEY),
            field(secret, TLS_PRIVATE_KEY_KEY),
            field(secret, CA_CERT_KEY),
        ) {
            (Some(cert), Some(key), ca) => self.certificates.materialize_from_keypair(
                id,
                uid,
                KeyMaterial { cert, key, ca, crl },
            ),
            (_, _, Some(ca)) => self.certificates.materialize_from_ca_only(id, uid, ca, crl),
            _ if field(secret, AUTH_KEY).is_some() => Err(SslError::AuthOnly),
            _ => Err(SslError::NoMaterial),
        }
    }

    // --- sequencing ---

    async fn commit(&self, fx: Effects) {
        let Effects {
            forget_certificates,
            reload_backend_configuration,
            forget_routes,
            index_routes,
            mut sync_secrets,
            mut rederive,
            events,
        } = fx;

        let tracker = self.certificates.tracker();
        let touches_certificates = !forget_certificates.is_empty()
            || !sync_secrets.is_empty()
            || index_routes
                .iter()
                .flat_map(|(_, secrets)| secrets)
                .any(|s| !tracker.contains(&s.to_string()));

        // Only certificate work is serialized; other kinds never wait on it.
        let guard = if touches_certificates {
            Some(self.secret_sync.lock().await)
        } else {
            None
        };

        for id in &forget_certificates {
            if tracker.delete(&id.to_string()).is_some() {
                tracing::info!(secret = %id, "Removed certificate");
            }
        }

        if reload_backend_configuration {
            self.reload_backend_configuration();
        }

        for id in &forget_routes {
            self.admitted.write().remove(id);
            self.secret_refs.delete(&id.to_string());
        }

        for (route, secrets) in index_routes {
            self.secret_refs
                .replace(&route.to_string(), secrets.iter().map(ToString::to_string));
            self.admitted.write().entry(route.clone()).or_insert(None);
            sync_secrets.extend(
                secrets
                    .into_iter()
                    .filter(|s| !tracker.contains(&s.to_string())),
            );
            rederive.push(route);
        }

        if let Some(guard) = &guard {
            sync_secrets.sort();
            sync_secrets.dedup();
            for id in &sync_secrets {
                self.sync_secret_locked(guard, id);
            }
        }

        rederive.sort();
        rederive.dedup();
        for id in &rederive {
            self.derive(id);
        }
        drop(guard);

        for event in events {
            self.events.send(event).await;
        }
    }

    fn reload_backend_configuration(&self) {
        let config = match &self.config.config_map {
            Some(id) => self
                .config_maps
                .get(id)
                .map(|cm| BackendConfiguration::from_config_map(&cm))
                .unwrap_or_default(),
            None => BackendConfiguration::default(),
        };
        tracing::debug!(blocklist = ?config.annotation_value_word_blocklist, "Reloaded backend configuration");
        *self.backend_config.write() = Arc::new(config);
    }

    /// Derives the annotation record of an admitted route. A failure keeps
    /// the previous record.
    fn derive(&self, id: &ResourceId) {
        if !self.admitted.read().contains_key(id) {
            return;
        }
        let Ok(route) = self.routes.get(id) else {
            return;
        };
        let ingress = Arc::new(with_defaults((*route).clone()));

        match self.extractor.extract(&ingress, &TrackedResolver(self)) {
            Ok(annotations) => {
                if let Some(slot) = self.admitted.write().get_mut(id) {
                    *slot = Some(AdmittedRoute {
                        id: id.clone(),
                        ingress,
                        annotations: Arc::new(annotations),
                    });
                }
            }
            Err(error) => {
                tracing::warn!(route = %id, %error, "Failed to derive route annotations");
            }
        }
    }
}

fn field<'s>(secret: &'s Secret, key: &str) -> Option<&'s [u8]> {
    secret
        .data
        .as_ref()?
        .get(key)
        .map(|bytes| bytes.0.as_slice())
}

/// Empty HTTP paths become `/` and a missing path type becomes `Prefix`.
fn with_defaults(mut route: Ingress) -> Ingress {
    let rules = route.spec.iter_mut().flat_map(|s| s.rules.iter_mut().flatten());
    for http in rules.filter_map(|r| r.http.as_mut()) {
        for path in &mut http.paths {
            if path.path.as_deref().map_or(true, str::is_empty) {
                path.path = Some("/".to_string());
            }
            if path.path_type.is_empty() {
                path.path_type = "Prefix".to_string();
            }
        }
    }
    route
}

impl View for Store {
    fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn class_known(&self, name: &str) -> bool {
        self.route_classes.contains(&ResourceId::cluster(name))
    }

    fn is_admitted(&self, route: &ResourceId) -> bool {
        self.admitted.read().contains_key(route)
    }

    fn admitted_routes(&self) -> Vec<(ResourceId, Arc<Ingress>)> {
        let mut ids = self.admitted.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids.into_iter()
            .filter_map(|id| {
                let route = self.routes.get(&id).ok()?;
                Some((id, route))
            })
            .collect()
    }

    fn consumers_of(&self, secret: &ResourceId) -> Vec<ResourceId> {
        self.secret_refs
            .consumers_of(&secret.to_string())
            .into_iter()
            .filter_map(|key| key.parse().ok())
            .collect()
    }

    fn is_tracked(&self, secret: &ResourceId) -> bool {
        self.certificates.tracker().contains(&secret.to_string())
    }
}

// === impl TrackedResolver ===

impl Resolver for TrackedResolver<'_> {
    fn auth_certificate(&self, secret: &ResourceId) -> Result<AuthSslCert, NotFound> {
        self.0
            .local_certificate(secret)?
            .auth_ssl_cert()
            .ok_or_else(|| NotFound::new(Kind::Certificate, secret))
    }

    fn backend_configuration(&self) -> Arc<BackendConfiguration> {
        self.0.backend_configuration()
    }
}

// === impl IndexResource ===

#[async_trait::async_trait]
impl IndexResource<Ingress> for Store {
    async fn apply(&self, route: Ingress) {
        let id = resource_id(&route);
        let prev = self.routes.insert(id, route.clone());
        let fx = handlers::route_applied(self, prev.as_deref(), &route);
        self.commit(fx).await;
    }

    async fn delete(&self, id: ResourceId) {
        let Some(prev) = self.routes.remove(&id) else {
            return;
        };
        let fx = handlers::route_deleted(self, &prev);
        self.commit(fx).await;
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.routes.ids()
    }
}

#[async_trait::async_trait]
impl IndexResource<IngressClass> for Store {
    async fn apply(&self, class: IngressClass) {
        let id = resource_id(&class);
        let prev = self.route_classes.get(&id).ok();
        let fx = handlers::route_class_applied(&self.config, prev.as_deref(), &class);
        if self.config.class.accepts_class(&class) {
            self.route_classes.insert(id, class);
        } else {
            self.route_classes.remove(&id);
        }
        self.commit(fx).await;
    }

    async fn delete(&self, id: ResourceId) {
        if self.route_classes.remove(&id).is_some() {
            self.commit(Effects {
                events: vec![Event::Delete {
                    kind: Kind::RouteClass,
                    id,
                }],
                ..Default::default()
            })
            .await;
        }
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.route_classes.ids()
    }
}

#[async_trait::async_trait]
impl IndexResource<Service> for Store {
    async fn apply(&self, service: Service) {
        let prev = self.services.insert(resource_id(&service), service.clone());
        self.commit(handlers::service_applied(prev.as_deref(), &service))
            .await;
    }

    async fn delete(&self, id: ResourceId) {
        if let Some(prev) = self.services.remove(&id) {
            self.commit(handlers::service_deleted(&prev)).await;
        }
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.services.ids()
    }
}

#[async_trait::async_trait]
impl IndexResource<Endpoints> for Store {
    async fn apply(&self, endpoints: Endpoints) {
        let prev = self
            .endpoints
            .insert(resource_id(&endpoints), endpoints.clone());
        self.commit(handlers::endpoints_applied(prev.as_deref(), &endpoints))
            .await;
    }

    async fn delete(&self, id: ResourceId) {
        if let Some(prev) = self.endpoints.remove(&id) {
            self.commit(handlers::endpoints_deleted(&prev)).await;
        }
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.endpoints.ids()
    }
}

#[async_trait::async_trait]
impl IndexResource<Secret> for Store {
    async fn apply(&self, secret: Secret) {
        let prev = self.secrets.insert(resource_id(&secret), secret.clone());
        let fx = handlers::secret_applied(self, prev.as_deref(), &secret);
        self.commit(fx).await;
    }

    async fn delete(&self, id: ResourceId) {
        if let Some(prev) = self.secrets.remove(&id) {
            let fx = handlers::secret_deleted(self, &prev);
            self.commit(fx).await;
        }
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.secrets.ids()
    }
}

#[async_trait::async_trait]
impl IndexResource<ConfigMap> for Store {
    async fn apply(&self, cm: ConfigMap) {
        let prev = self.config_maps.insert(resource_id(&cm), cm.clone());
        let fx = handlers::config_map_applied(self, prev.as_deref(), &cm);
        self.commit(fx).await;
    }

    async fn delete(&self, id: ResourceId) {
        if let Some(prev) = self.config_maps.remove(&id) {
            let fx = handlers::config_map_deleted(self, &prev);
            self.commit(fx).await;
        }
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.config_maps.ids()
    }
}

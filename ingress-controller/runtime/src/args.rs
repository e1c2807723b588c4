use crate::{
    core::ResourceId,
    dynamic::{LocalProxy, Reconciler},
    k8s::{
        watcher, Api, Client, ConfigMap, Endpoints, Ingress, IngressClass, NamespaceResourceScope,
        Resource, Secret, Service,
    },
    store::{
        driver,
        events,
        fs::{Directories, OsFilesystem},
        metrics::{self, IndexMetrics},
        sweep, ClassConfig, Kind, Store, StoreConfig, SyncBarrier,
    },
    LogReload, SnapshotBuilder,
};
use anyhow::{bail, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "ingress", about = "An ingress controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ingress=info,warn",
        env = "INGRESS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespace to watch. All namespaces are watched when unset.
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// The ConfigMap holding the controller's configuration.
    #[clap(long)]
    configmap: Option<ResourceId>,

    /// The ConfigMap mapping exposed TCP ports to services.
    #[clap(long)]
    tcp_services_configmap: Option<ResourceId>,

    /// The ConfigMap mapping exposed UDP ports to services.
    #[clap(long)]
    udp_services_configmap: Option<ResourceId>,

    /// The Secret served for hosts without a certificate of their own.
    #[clap(long)]
    default_ssl_certificate: Option<ResourceId>,

    #[clap(long, default_value = "k8s.io/ingress-nginx")]
    controller_class: String,

    #[clap(long, default_value = "nginx")]
    ingress_class: String,

    /// Admits routes that declare no class.
    #[clap(long)]
    watch_ingress_without_class: bool,

    /// Accepts IngressClasses named like `--ingress-class`, whatever their
    /// controller.
    #[clap(long)]
    ingress_class_by_name: bool,

    /// Admits every route regardless of class.
    #[clap(long)]
    ignore_ingress_class: bool,

    /// Refuses routes that declare a default backend.
    #[clap(long)]
    disable_catch_all: bool,

    #[clap(long, default_value = "nginx.ingress.kubernetes.io")]
    annotations_prefix: String,

    #[clap(long, default_value = "/etc/ingress-controller/ssl")]
    ssl_directory: PathBuf,

    #[clap(long, default_value = "60s", value_parser = parse_duration)]
    missing_certificate_sweep_interval: Duration,

    /// Interval of the certificate chain health sweep. `0` disables it.
    #[clap(long, default_value = "600s", value_parser = parse_duration)]
    certificate_health_interval: Duration,

    /// Time allowed for the initial listing of every watched kind.
    #[clap(long, default_value = "120s", value_parser = parse_duration)]
    sync_timeout: Duration,

    #[clap(long, default_value = "10246")]
    status_port: u16,

    #[clap(long, default_value = "10247")]
    stream_port: u16,

    #[clap(long, default_value = "1024")]
    event_queue_size: usize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            watch_namespace,
            configmap,
            tcp_services_configmap,
            udp_services_configmap,
            default_ssl_certificate,
            controller_class,
            ingress_class,
            watch_ingress_without_class,
            ingress_class_by_name,
            ignore_ingress_class,
            disable_catch_all,
            annotations_prefix,
            ssl_directory,
            missing_certificate_sweep_interval,
            certificate_health_interval,
            sync_timeout,
            status_port,
            stream_port,
            event_queue_size,
        } = self;

        let dirs = Directories::from_ssl_dir(ssl_directory);
        let fs = Arc::new(OsFilesystem::default());
        dirs.create(&*fs)?;

        let config = StoreConfig {
            config_map: configmap,
            tcp_config_map: tcp_services_configmap,
            udp_config_map: udp_services_configmap,
            default_ssl_certificate,
            class: ClassConfig {
                controller: controller_class,
                annotation_value: ingress_class,
                watch_without_class: watch_ingress_without_class,
                by_name: ingress_class_by_name,
                ignore_class: ignore_ingress_class,
            },
            disable_catch_all,
            annotation_prefix: annotations_prefix,
        };
        let (events_tx, mut events_rx) = events::channel(event_queue_size);
        let store = Store::new(config, fs, dirs.ssl.clone(), events_tx).shared();

        let mut prom = <Registry>::default();
        let index_metrics = prom.sub_registry_with_prefix("ingress_index");
        metrics::register(index_metrics, store.clone());
        let index = IndexMetrics::register(store.clone(), index_metrics).shared();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Store events are consumed from the start so that watches never
        // block on a full queue. Until the store is ready they are dropped;
        // the reconciler's initial pass covers them.
        let reconciler = Reconciler::new(
            SnapshotBuilder::new(store.clone()),
            LogReload::default(),
            LocalProxy::new(status_port, stream_port),
        );
        let ready = store.ready();
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(
            async move {
                if until_ready(&mut events_rx, ready).await {
                    reconciler.run(events_rx, shutdown).await;
                }
            }
            .instrument(info_span!("reconcile")),
        );

        // Spawn the auxiliary watches. Routes are derived against their
        // caches, so they must be listed before the route watch starts.
        let ns = watch_namespace.as_deref();
        let client = runtime.client();
        let aux = SyncBarrier::default();

        let services = runtime.watch(api::<Service>(&client, ns), watcher::Config::default());
        tokio::spawn(
            driver::index(
                index.clone(),
                services,
                aux.register(Kind::Service),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("services")),
        );

        let endpoints = runtime.watch(api::<Endpoints>(&client, ns), watcher::Config::default());
        tokio::spawn(
            driver::index(
                index.clone(),
                endpoints,
                aux.register(Kind::Endpoints),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("endpoints")),
        );

        // Helm release records are large and never carry certificates.
        let secrets = runtime.watch(
            api::<Secret>(&client, ns),
            watcher::Config::default().fields("type!=helm.sh/release.v1"),
        );
        tokio::spawn(
            driver::index(
                index.clone(),
                secrets,
                aux.register(Kind::Secret),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("secrets")),
        );

        let config_maps = runtime.watch(api::<ConfigMap>(&client, ns), watcher::Config::default());
        tokio::spawn(
            driver::index(
                index.clone(),
                config_maps,
                aux.register(Kind::ConfigMap),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("configmaps")),
        );

        let classes = runtime.watch_all::<IngressClass>(watcher::Config::default());
        tokio::spawn(
            driver::index(
                index.clone(),
                classes,
                aux.register(Kind::RouteClass),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("ingressclasses")),
        );

        aux.wait(sync_timeout).await?;
        info!("Auxiliary caches synced");

        if let Some(outcome) = store.prime_default_certificate().await {
            info!(?outcome, "Primed default certificate");
        }

        let routes_synced = SyncBarrier::default();
        let routes = runtime.watch(api::<Ingress>(&client, ns), watcher::Config::default());
        tokio::spawn(
            driver::index(
                index,
                routes,
                routes_synced.register(Kind::Route),
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("ingresses")),
        );
        routes_synced.wait(sync_timeout).await?;
        store.mark_ready();
        info!(routes = store.admitted_len(), "Store ready");

        if missing_certificate_sweep_interval.is_zero() {
            info!("Missing certificate sweep disabled");
        } else {
            tokio::spawn(
                sweep::missing_certificates(
                    store.clone(),
                    missing_certificate_sweep_interval,
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("missing_certificates")),
            );
        }
        if certificate_health_interval.is_zero() {
            info!("Certificate health sweep disabled");
        } else {
            tokio::spawn(
                sweep::certificate_health(
                    store,
                    certificate_health_interval,
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("certificate_health")),
            );
        }

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn api<K>(client: &Client, ns: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Discards events until the store is ready. Returns false if either side
/// closes first.
async fn until_ready<E>(events: &mut mpsc::Receiver<E>, mut ready: watch::Receiver<bool>) -> bool {
    loop {
        tokio::select! {
            biased;
            res = ready.wait_for(|ready| *ready) => return res.is_ok(),
            event = events.recv() => if event.is_none() {
                return false;
            },
        }
    }
}

/// Parses durations such as `500ms`, `60s`, `10m` or `1h`. A bare `0` is
/// accepted.
fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let offset = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| anyhow::anyhow!("{s} does not contain a duration value"))?;
    let (magnitude, unit) = s.split_at(offset + 1);
    let magnitude = magnitude.parse::<u64>()?;

    let mul = match unit {
        "" if magnitude == 0 => 0,
        "ms" => 1,
        "s" => 1000,
        "m" => 1000 * 60,
        "h" => 1000 * 60 * 60,
        _ => bail!("invalid duration unit {unit:?} (expected one of 'ms', 's', 'm' or 'h')"),
    };

    let ms = magnitude
        .checked_mul(mul)
        .ok_or_else(|| anyhow::anyhow!("duration {s} overflows"))?;
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::Event;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn events_are_discarded_until_ready() {
        let (tx, mut rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = watch::channel(false);
        let mut wait = task::spawn(until_ready(&mut rx, ready_rx));
        assert_pending!(wait.poll());

        tx.try_send(Event::configuration("startup", vec![])).unwrap();
        assert_pending!(wait.poll());
        // The first event was consumed, so the queue has room again.
        tx.try_send(Event::configuration("startup", vec![])).unwrap();

        ready_tx.send(true).unwrap();
        assert_ready_eq!(wait.poll(), true);
    }

    #[test]
    fn closed_events_stop_the_wait() {
        let (tx, mut rx) = mpsc::channel::<Event>(1);
        let (_ready_tx, ready_rx) = watch::channel(false);
        drop(tx);
        let mut wait = task::spawn(until_ready(&mut rx, ready_rx));
        assert_ready_eq!(wait.poll(), false);
    }

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "ingress",
            "--configmap=ingress/config",
            "--default-ssl-certificate=ingress/default-tls",
            "--certificate-health-interval=0",
        ])
        .unwrap();
        assert_eq!(args.configmap, Some(ResourceId::new("ingress", "config")));
        assert_eq!(
            args.default_ssl_certificate,
            Some(ResourceId::new("ingress", "default-tls"))
        );
        assert!(args.certificate_health_interval.is_zero());
        assert_eq!(args.missing_certificate_sweep_interval, Duration::from_secs(60));
        assert_eq!(args.status_port, 10246);

        assert!(Args::try_parse_from(["ingress", "--configmap=/config"]).is_err());
    }
}

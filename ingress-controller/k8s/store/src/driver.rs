//! Feeds watch streams into an index.

use crate::{handlers::resource_id, Synced};
use futures::prelude::*;
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::{watcher, Resource};
use std::{collections::BTreeSet, sync::Arc};

/// An index over one watched kind.
#[async_trait::async_trait]
pub trait IndexResource<K>: Send + Sync
where
    K: Resource + Send + 'static,
{
    async fn apply(&self, obj: K);

    async fn delete(&self, id: ResourceId);

    /// Ids of the objects currently indexed.
    fn cached_ids(&self) -> Vec<ResourceId>;

    /// Replaces the indexed objects with a complete listing.
    ///
    /// The default implementation applies every listed object and then
    /// deletes the indexed objects the listing no longer contains.
    async fn reset(&self, objs: Vec<K>) {
        let mut stale = self.cached_ids().into_iter().collect::<BTreeSet<_>>();
        for obj in objs {
            stale.remove(&resource_id(&obj));
            self.apply(obj).await;
        }
        for id in stale {
            self.delete(id).await;
        }
    }
}

/// Drives `events` into `index` until the stream ends or shutdown is
/// signaled. `synced` is released once the first complete listing has been
/// indexed.
pub async fn index<K, I, S>(index: Arc<I>, events: S, synced: Synced, shutdown: drain::Watch)
where
    K: Resource + Send + 'static,
    I: IndexResource<K> + ?Sized,
    S: Stream<Item = watcher::Event<K>>,
{
    tokio::pin!(events);
    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    let mut initial = None::<Vec<K>>;
    loop {
        let event = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::debug!("Shutdown");
                return;
            }
            event = events.next() => match event {
                Some(event) => event,
                None => {
                    tracing::debug!("Watch ended");
                    return;
                }
            },
        };

        match event {
            watcher::Event::Init => {
                initial = Some(Vec::new());
            }
            watcher::Event::InitApply(obj) => match initial.as_mut() {
                Some(objs) => objs.push(obj),
                None => index.apply(obj).await,
            },
            watcher::Event::InitDone => {
                let objs = initial.take().unwrap_or_default();
                tracing::debug!(objects = objs.len(), "Indexing listing");
                index.reset(objs).await;
                synced.ready();
            }
            watcher::Event::Apply(obj) => index.apply(obj).await,
            watcher::Event::Delete(obj) => index.delete(resource_id(&obj)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, SyncBarrier};
    use ingress_controller_k8s_api::{ObjectMeta, Service};
    use parking_lot::Mutex;
    use std::{collections::BTreeMap, time::Duration};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[derive(Default)]
    struct Recorder {
        objects: Mutex<BTreeMap<ResourceId, Service>>,
        deletes: Mutex<Vec<ResourceId>>,
    }

    #[async_trait::async_trait]
    impl IndexResource<Service> for Recorder {
        async fn apply(&self, obj: Service) {
            self.objects.lock().insert(resource_id(&obj), obj);
        }

        async fn delete(&self, id: ResourceId) {
            self.objects.lock().remove(&id);
            self.deletes.lock().push(id);
        }

        fn cached_ids(&self) -> Vec<ResourceId> {
            self.objects.lock().keys().cloned().collect()
        }
    }

    fn mk_service(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn relist_removes_stale_objects() {
        let recorder = Arc::new(Recorder::default());
        let barrier = SyncBarrier::default();
        let synced = barrier.register(Kind::Service);
        let (_signal, shutdown) = drain::channel();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(index(
            recorder.clone(),
            ReceiverStream::new(rx),
            synced,
            shutdown,
        ));

        tx.send(watcher::Event::Apply(mk_service("stale")))
            .await
            .unwrap();
        tx.send(watcher::Event::Init).await.unwrap();
        tx.send(watcher::Event::InitApply(mk_service("a")))
            .await
            .unwrap();
        tx.send(watcher::Event::InitApply(mk_service("b")))
            .await
            .unwrap();
        assert!(!barrier.is_ready());
        tx.send(watcher::Event::InitDone).await.unwrap();

        barrier.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            recorder.cached_ids(),
            vec![ResourceId::new("ns", "a"), ResourceId::new("ns", "b")]
        );
        assert_eq!(
            *recorder.deletes.lock(),
            vec![ResourceId::new("ns", "stale")]
        );

        tx.send(watcher::Event::Delete(mk_service("a")))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(recorder.cached_ids(), vec![ResourceId::new("ns", "b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let barrier = SyncBarrier::default();
        let (signal, shutdown) = drain::channel();
        let (_tx, rx) = mpsc::channel::<watcher::Event<Service>>(1);
        let task = tokio::spawn(index(
            recorder,
            ReceiverStream::new(rx),
            barrier.register(Kind::Service),
            shutdown,
        ));
        signal.drain().await;
        task.await.unwrap();
    }
}

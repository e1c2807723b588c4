use crate::{driver::IndexResource, Store};
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::Resource;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::Arc;

/// Counts the changes a watch feeds into an index.
#[derive(Debug)]
pub struct IndexMetrics<T> {
    inner: T,

    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

#[derive(Debug)]
struct Instrumented(Arc<Store>);

/// Registers gauges reporting the sizes of the store's caches, the secret
/// reference index and the certificate tracker.
pub fn register(reg: &mut Registry, store: Arc<Store>) {
    reg.register_collector(Box::new(Instrumented(store)));
}

// === impl IndexMetrics ===

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn labels<K: Resource<DynamicType = ()>>() -> IndexLabels {
        IndexLabels {
            kind: K::kind(&()).to_string(),
        }
    }
}

#[async_trait::async_trait]
impl<K, T> IndexResource<K> for IndexMetrics<Arc<T>>
where
    K: Resource<DynamicType = ()> + Send + 'static,
    T: IndexResource<K> + ?Sized,
{
    async fn apply(&self, obj: K) {
        self.index_applies.get_or_create(&Self::labels::<K>()).inc();
        self.inner.apply(obj).await;
    }

    async fn delete(&self, id: ResourceId) {
        self.index_deletes.get_or_create(&Self::labels::<K>()).inc();
        self.inner.delete(id).await;
    }

    fn cached_ids(&self) -> Vec<ResourceId> {
        self.inner.cached_ids()
    }

    async fn reset(&self, objs: Vec<K>) {
        self.index_resets.get_or_create(&Self::labels::<K>()).inc();
        self.inner.reset(objs).await;
    }
}

// === impl Instrumented ===

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let store = &self.0;

        let mut cache_encoder = encoder.encode_descriptor(
            "cache_size",
            "The number of objects in each watched kind's cache",
            None,
            MetricType::Gauge,
        )?;
        for (kind, size) in store.cache_sizes() {
            let labels = vec![("kind", kind.as_str())];
            let gauge = ConstGauge::new(size as u32);
            gauge.encode(cache_encoder.encode_family(&labels)?)?;
        }

        let admitted_encoder = encoder.encode_descriptor(
            "admitted_routes",
            "The number of routes admitted by this controller",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(store.admitted_len() as u32).encode(admitted_encoder)?;

        let refs_encoder = encoder.encode_descriptor(
            "secret_reference_index_size",
            "The number of secrets referenced by admitted routes",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(store.secret_references().len() as u32).encode(refs_encoder)?;

        let certs_encoder = encoder.encode_descriptor(
            "certificate_tracker_size",
            "The number of certificates currently materialized",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(store.certificates().tracker().len() as u32).encode(certs_encoder)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{events, fs::MemFilesystem, StoreConfig};
    use prometheus_client::encoding::text::encode;

    #[test]
    fn encodes_store_sizes() {
        let (tx, _rx) = events::channel(1);
        let store = Store::new(
            StoreConfig::default(),
            Arc::new(MemFilesystem::default()),
            "/ssl",
            tx,
        )
        .shared();

        let mut prom = Registry::default();
        register(prom.sub_registry_with_prefix("ingress_index"), store);

        let mut out = String::new();
        encode(&mut out, &prom).unwrap();
        assert!(out.contains("ingress_index_cache_size{kind=\"secret\"} 0"));
        assert!(out.contains("ingress_index_certificate_tracker_size 0"));
    }
}

use ahash::AHashMap as HashMap;
use ingress_controller_core::ResourceId;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};

/// The kinds of objects the store knows about.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Route,
    RouteClass,
    Service,
    Endpoints,
    Secret,
    ConfigMap,
    Certificate,
    Annotations,
}

/// A key is absent from a local cache.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind} {key} not found in local store")]
pub struct NotFound {
    pub kind: Kind,
    pub key: String,
}

/// A per-kind object cache mirrored from a watch.
#[derive(Debug)]
pub struct Cache<K> {
    kind: Kind,
    objects: RwLock<HashMap<ResourceId, Arc<K>>>,
}

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::RouteClass => "route class",
            Self::Service => "service",
            Self::Endpoints => "endpoints",
            Self::Secret => "secret",
            Self::ConfigMap => "config map",
            Self::Certificate => "certificate",
            Self::Annotations => "route annotations",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl NotFound ===

impl NotFound {
    pub fn new(kind: Kind, key: impl ToString) -> Self {
        Self {
            kind,
            key: key.to_string(),
        }
    }
}

// === impl Cache ===

impl<K> Cache<K> {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &ResourceId) -> Result<Arc<K>, NotFound> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NotFound::new(self.kind, id))
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Stores `obj`, returning the object it replaced.
    pub fn insert(&self, id: ResourceId, obj: K) -> Option<Arc<K>> {
        self.objects.write().insert(id, Arc::new(obj))
    }

    pub fn remove(&self, id: &ResourceId) -> Option<Arc<K>> {
        self.objects.write().remove(id)
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        let mut ids = self.objects.read().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<(ResourceId, Arc<K>)> {
        let mut objs = self
            .objects
            .read()
            .iter()
            .map(|(id, obj)| (id.clone(), obj.clone()))
            .collect::<Vec<_>>();
        objs.sort_by(|(a, _), (b, _)| a.cmp(b));
        objs
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_typed() {
        let cache = Cache::<String>::new(Kind::Service);
        let id = ResourceId::new("ns", "svc");
        let err = cache.get(&id).unwrap_err();
        assert_eq!(err, NotFound::new(Kind::Service, "ns/svc"));
        assert_eq!(err.to_string(), "service ns/svc not found in local store");

        assert!(cache.insert(id.clone(), "a".to_string()).is_none());
        assert_eq!(*cache.insert(id.clone(), "b".to_string()).unwrap(), "a");
        assert_eq!(*cache.get(&id).unwrap(), "b");
        assert_eq!(cache.ids(), vec![id.clone()]);
        assert!(cache.remove(&id).is_some());
        assert!(cache.is_empty());
    }
}

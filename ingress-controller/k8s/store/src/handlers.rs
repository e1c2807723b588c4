//! Watch event transitions.
//!
//! Each handler maps the previous cached object and the new payload to the
//! effects the store must apply. Handlers only read store state, so they can
//! be exercised without a watch or a filesystem.

use crate::{
    annotations::{referenced_secrets, references_config_map},
    Event, Kind, StoreConfig,
};
use ingress_controller_core::ResourceId;
use ingress_controller_k8s_api::{
    ConfigMap, Endpoints, Ingress, IngressClass, Resource, Secret, Service, CA_CERT_KEY,
    TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use std::sync::Arc;

/// Read-only store state consulted by the handlers.
pub(crate) trait View {
    fn config(&self) -> &StoreConfig;

    /// True when an accepted route class with this name is cached.
    fn class_known(&self, name: &str) -> bool;

    fn is_admitted(&self, route: &ResourceId) -> bool;

    fn admitted_routes(&self) -> Vec<(ResourceId, Arc<Ingress>)>;

    fn consumers_of(&self, secret: &ResourceId) -> Vec<ResourceId>;

    fn is_tracked(&self, secret: &ResourceId) -> bool;
}

/// Side effects produced by a transition, applied in order by the store.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Effects {
    /// Certificates to drop from the tracker.
    pub(crate) forget_certificates: Vec<ResourceId>,
    /// Re-read the main ConfigMap.
    pub(crate) reload_backend_configuration: bool,
    /// Routes that stop being admitted.
    pub(crate) forget_routes: Vec<ResourceId>,
    /// Admitted routes with the secrets they reference.
    pub(crate) index_routes: Vec<(ResourceId, Vec<ResourceId>)>,
    /// Secrets to materialize.
    pub(crate) sync_secrets: Vec<ResourceId>,
    /// Routes whose annotation records must be derived again.
    pub(crate) rederive: Vec<ResourceId>,
    pub(crate) events: Vec<Event>,
}

pub(crate) fn resource_id<K: Resource>(obj: &K) -> ResourceId {
    let meta = obj.meta();
    ResourceId::new(
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// Returns the class a route is admitted under.
pub(crate) fn admission(view: &dyn View, route: &Ingress) -> Option<String> {
    let config = view.config();
    let catch_all = route
        .spec
        .as_ref()
        .is_some_and(|s| s.default_backend.is_some());
    if config.disable_catch_all && catch_all {
        return None;
    }
    config.class.resolve(route, |name| view.class_known(name))
}

fn removed(id: ResourceId) -> Effects {
    Effects {
        forget_routes: vec![id.clone()],
        events: vec![Event::Delete {
            kind: Kind::Route,
            id,
        }],
        ..Default::default()
    }
}

pub(crate) fn route_applied(view: &dyn View, prev: Option<&Ingress>, route: &Ingress) -> Effects {
    let id = resource_id(route);
    let admitted = view.is_admitted(&id);
    let Some(class) = admission(view, route) else {
        if admitted {
            tracing::info!(route = %id, "Removing route that is no longer admitted");
            return removed(id);
        }
        tracing::debug!(route = %id, "Ignoring route for another class");
        return Effects::default();
    };

    let event = if !admitted {
        tracing::info!(route = %id, %class, "Admitting route");
        Event::Create {
            kind: Kind::Route,
            id: id.clone(),
        }
    } else if prev == Some(route) {
        tracing::trace!(route = %id, "Route unchanged");
        return Effects::default();
    } else {
        Event::Update {
            kind: Kind::Route,
            id: id.clone(),
        }
    };

    let secrets = referenced_secrets(route, &view.config().annotation_prefix);
    Effects {
        index_routes: vec![(id, secrets)],
        events: vec![event],
        ..Default::default()
    }
}

pub(crate) fn route_deleted(view: &dyn View, route: &Ingress) -> Effects {
    let id = resource_id(route);
    if !view.is_admitted(&id) {
        return Effects::default();
    }
    tracing::info!(route = %id, "Removing deleted route");
    removed(id)
}

pub(crate) fn route_class_applied(
    config: &StoreConfig,
    prev: Option<&IngressClass>,
    class: &IngressClass,
) -> Effects {
    let id = resource_id(class);
    if !config.class.accepts_class(class) {
        if prev.is_some() {
            return Effects {
                events: vec![Event::Delete {
                    kind: Kind::RouteClass,
                    id,
                }],
                ..Default::default()
            };
        }
        return Effects::default();
    }

    let params = |c: &IngressClass| c.spec.as_ref().and_then(|s| s.parameters.clone());
    let event = match prev {
        None => Event::Create {
            kind: Kind::RouteClass,
            id,
        },
        Some(prev) if params(prev) != params(class) => Event::Update {
            kind: Kind::RouteClass,
            id,
        },
        Some(_) => return Effects::default(),
    };
    Effects {
        events: vec![event],
        ..Default::default()
    }
}

/// True when a secret holds a certificate/key pair or a CA bundle.
pub(crate) fn carries_certificate(secret: &Secret) -> bool {
    let Some(data) = secret.data.as_ref() else {
        return false;
    };
    (data.contains_key(TLS_CERT_KEY) && data.contains_key(TLS_PRIVATE_KEY_KEY))
        || data.contains_key(CA_CERT_KEY)
}

pub(crate) fn secret_applied(view: &dyn View, prev: Option<&Secret>, secret: &Secret) -> Effects {
    if prev == Some(secret) {
        return Effects::default();
    }

    let id = resource_id(secret);
    let consumers = view.consumers_of(&id);
    let is_default = view.config().default_ssl_certificate.as_ref() == Some(&id);
    let tracked = view.is_tracked(&id);

    let mut fx = Effects::default();
    if carries_certificate(secret) {
        if is_default || tracked || !consumers.is_empty() {
            fx.sync_secrets.push(id.clone());
        }
    } else if tracked {
        fx.forget_certificates.push(id.clone());
    }

    if is_default || !consumers.is_empty() {
        fx.events.push(Event::configuration(
            format!("secret {id} changed, {} routes affected", consumers.len()),
            consumers.clone(),
        ));
        fx.rederive = consumers;
    }
    fx
}

pub(crate) fn secret_deleted(view: &dyn View, secret: &Secret) -> Effects {
    let id = resource_id(secret);
    let consumers = view.consumers_of(&id);
    let tracked = view.is_tracked(&id);

    let mut fx = Effects::default();
    if tracked {
        fx.forget_certificates.push(id.clone());
    }
    if tracked || !consumers.is_empty() {
        fx.events.push(Event::configuration(
            format!("secret {id} deleted, {} routes affected", consumers.len()),
            consumers.clone(),
        ));
        fx.rederive = consumers;
    }
    fx
}

pub(crate) fn endpoints_applied(prev: Option<&Endpoints>, endpoints: &Endpoints) -> Effects {
    let id = resource_id(endpoints);
    let event = match prev {
        None => Event::Create {
            kind: Kind::Endpoints,
            id,
        },
        Some(prev) if prev.subsets != endpoints.subsets => Event::Update {
            kind: Kind::Endpoints,
            id,
        },
        Some(_) => return Effects::default(),
    };
    Effects {
        events: vec![event],
        ..Default::default()
    }
}

pub(crate) fn endpoints_deleted(endpoints: &Endpoints) -> Effects {
    Effects {
        events: vec![Event::Delete {
            kind: Kind::Endpoints,
            id: resource_id(endpoints),
        }],
        ..Default::default()
    }
}

fn is_external_name(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "ExternalName")
}

/// Only ExternalName services affect configuration by appearing or
/// disappearing; the others are reached through their endpoints.
pub(crate) fn service_applied(prev: Option<&Service>, service: &Service) -> Effects {
    let id = resource_id(service);
    let event = match prev {
        None if is_external_name(service) => Event::Create {
            kind: Kind::Service,
            id,
        },
        Some(prev) if prev != service => Event::Update {
            kind: Kind::Service,
            id,
        },
        _ => return Effects::default(),
    };
    Effects {
        events: vec![event],
        ..Default::default()
    }
}

pub(crate) fn service_deleted(service: &Service) -> Effects {
    if !is_external_name(service) {
        return Effects::default();
    }
    Effects {
        events: vec![Event::Delete {
            kind: Kind::Service,
            id: resource_id(service),
        }],
        ..Default::default()
    }
}

fn is_controller_config_map(config: &StoreConfig, id: &ResourceId) -> bool {
    [
        &config.config_map,
        &config.tcp_config_map,
        &config.udp_config_map,
    ]
    .into_iter()
    .any(|key| key.as_ref() == Some(id))
}

pub(crate) fn config_map_applied(
    view: &dyn View,
    prev: Option<&ConfigMap>,
    cm: &ConfigMap,
) -> Effects {
    if prev == Some(cm) {
        return Effects::default();
    }
    let id = resource_id(cm);
    let config = view.config();

    if is_controller_config_map(config, &id) {
        let routes = view
            .admitted_routes()
            .into_iter()
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        return Effects {
            reload_backend_configuration: config.config_map.as_ref() == Some(&id),
            events: vec![Event::configuration(
                format!("config map {id} changed"),
                routes.clone(),
            )],
            rederive: routes,
            ..Default::default()
        };
    }

    let routes = view
        .admitted_routes()
        .into_iter()
        .filter(|(_, route)| references_config_map(route, &config.annotation_prefix))
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    if routes.is_empty() {
        return Effects::default();
    }
    Effects {
        events: vec![Event::configuration(
            format!("config map {id} changed, {} routes affected", routes.len()),
            routes.clone(),
        )],
        rederive: routes,
        ..Default::default()
    }
}

pub(crate) fn config_map_deleted(view: &dyn View, cm: &ConfigMap) -> Effects {
    let id = resource_id(cm);
    if view.config().config_map.as_ref() != Some(&id) {
        return Effects::default();
    }
    let routes = view
        .admitted_routes()
        .into_iter()
        .map(|(id, _)| id)
        .collect::<Vec<_>>();
    Effects {
        reload_backend_configuration: true,
        events: vec![Event::configuration(
            format!("config map {id} deleted"),
            routes.clone(),
        )],
        rederive: routes,
        ..Default::default()
    }
}

//! Ingress controller cluster state store
//!
//! The store mirrors the cluster objects an ingress controller depends on and
//! keeps the state derived from them consistent:
//!
//! - `Ingress` routes are admitted when they belong to this controller's class.
//!   Each admitted route gets an annotation record, derived from its
//!   annotations and the secrets they reference.
//! - `Secret`s carrying TLS or CA material are validated and written to disk
//!   as certificate artifacts. A reference index maps each secret to the routes
//!   that use it, so a secret change only re-derives its consumers.
//! - `Service`, `Endpoints`, `ConfigMap` and `IngressClass` objects are
//!   cached for lookups.
//!
//! ```text
//! [ Secret ] -> [ Certificate ] <- [ Route ] -> [ Annotations ]
//!      ^                              |
//!      +------ [ Reference Index ] <--+
//! ```
//!
//! Every applied change is announced on a single ordered event stream.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
mod cache;
pub mod certificates;
mod class;
mod config;
pub mod driver;
pub mod events;
pub mod fs;
mod handlers;
pub mod metrics;
mod readiness;
mod reference;
pub mod ssl;
mod store;
pub mod sweep;
mod tracker;


pub use self::{
    annotations::{
        AnnotationError, AnnotationExtractor, DefaultExtractor, Resolver,
        DEFAULT_ANNOTATION_PREFIX,
    },
    cache::{Cache, Kind, NotFound},
    certificates::{CertificateManager, KeyMaterial},
    class::{ClassConfig, WITHOUT_CLASS},
    config::BackendConfiguration,
    driver::IndexResource,
    events::{Event, EventSender},
    readiness::{SyncBarrier, SyncTimeout, Synced},
    reference::ReferenceIndex,
    ssl::{ChainStatus, SslError},
    store::{AdmittedRoute, Store, StoreConfig, SyncOutcome},
    tracker::SslCertTracker,
};

//! Applies configuration snapshots to a running proxy.
//!
//! Each reconciliation pass compares a freshly built candidate snapshot with
//! the one last applied. Backends, L4 streams and servers that changed are
//! pushed to the proxy over a local side channel; a reload is requested only
//! when the change cannot be expressed by those pushes alone.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
mod configurer;
pub mod diff;
pub mod payload;
mod reconcile;

pub use self::{
    client::{LocalProxy, PushError, SideChannel, BACKENDS_PATH, SERVERS_PATH},
    configurer::Configurer,
    diff::{is_incremental_sufficient, Changes},
    reconcile::{Backoff, BuildConfiguration, Outcome, Reconciler, Reload},
};

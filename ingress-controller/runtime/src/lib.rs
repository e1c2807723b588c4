#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ingress_controller_core as core;
pub use ingress_controller_dynamic as dynamic;
pub use ingress_controller_k8s_api as k8s;
pub use ingress_controller_k8s_store as store;

mod args;
mod reload;
mod snapshot;

pub use self::{args::Args, reload::LogReload, snapshot::SnapshotBuilder};

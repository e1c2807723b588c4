#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod annotations;
mod certificate;
pub mod configuration;
mod resource_id;

pub use self::{
    annotations::RouteAnnotations,
    certificate::{AuthSslCert, CertificateArtifact},
    configuration::Configuration,
    resource_id::{InvalidKey, ResourceId},
};

/// Stands in for a certificate identity when a server has no certificate.
pub const NO_CERTIFICATE: &str = "-1";

/// Hostname of the catch-all server.
pub const CATCH_ALL_HOSTNAME: &str = "_";

/// Name of the backend that serves requests no route matches.
pub const DEFAULT_BACKEND_NAME: &str = "upstream-default-backend";

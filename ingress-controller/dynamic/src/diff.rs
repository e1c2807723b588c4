//! Structural comparison of configuration snapshots.

use ingress_controller_core::{
    configuration::{set_eq, L4Service, Server},
    Configuration,
};

/// The snapshot categories that differ between two snapshots.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    pub backends: bool,
    pub streams: bool,
    pub servers: bool,
}

// === impl Changes ===

impl Changes {
    pub fn between(running: &Configuration, candidate: &Configuration) -> Self {
        Self {
            backends: backends_changed(running, candidate),
            streams: streams_changed(running, candidate),
            servers: servers_changed(running, candidate),
        }
    }

    pub fn any(&self) -> bool {
        self.backends || self.streams || self.servers
    }
}

pub fn backends_changed(running: &Configuration, candidate: &Configuration) -> bool {
    !set_eq(&running.backends, &candidate.backends)
}

pub fn streams_changed(running: &Configuration, candidate: &Configuration) -> bool {
    !set_eq(&running.tcp_endpoints, &candidate.tcp_endpoints)
        || !set_eq(&running.udp_endpoints, &candidate.udp_endpoints)
}

pub fn servers_changed(running: &Configuration, candidate: &Configuration) -> bool {
    running.servers != candidate.servers
}

/// Returns true when `candidate` differs from `running` only in what the side
/// channel can deliver: backends, L4 endpoints and server certificates.
///
/// Certificate bindings are cleared before comparing, so a server that swaps
/// its certificate never requires a reload.
pub fn is_incremental_sufficient(candidate: &Configuration, running: &Configuration) -> bool {
    without_volatile(candidate) == without_volatile(running)
}

fn without_volatile(config: &Configuration) -> Configuration {
    fn stream(svc: &L4Service) -> L4Service {
        L4Service {
            endpoints: Vec::new(),
            service: None,
            ..svc.clone()
        }
    }

    Configuration {
        backends: Vec::new(),
        servers: config
            .servers
            .iter()
            .map(|srv| Server {
                certificate: None,
                ..srv.clone()
            })
            .collect(),
        tcp_endpoints: config.tcp_endpoints.iter().map(stream).collect(),
        udp_endpoints: config.udp_endpoints.iter().map(stream).collect(),
    }
}

use crate::{
    client::{PushError, SideChannel, BACKENDS_PATH, SERVERS_PATH},
    diff::Changes,
    payload,
};
use http::StatusCode;
use ingress_controller_core::Configuration;
use serde::Serialize;

/// Pushes snapshot changes to the proxy and remembers the last snapshot that
/// was fully applied.
#[derive(Debug)]
pub struct Configurer<C> {
    channel: C,
    running: Option<Configuration>,
}

// === impl Configurer ===

impl<C: SideChannel> Configurer<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            running: None,
        }
    }

    /// The last snapshot applied, if any.
    pub fn running(&self) -> Option<&Configuration> {
        self.running.as_ref()
    }

    /// Pushes each category of `candidate` that differs from the running
    /// snapshot: backends, then streams, then servers.
    ///
    /// The first failure aborts the pass and the running snapshot is left
    /// unchanged, so a retry pushes every category again.
    pub async fn configure_dynamically(
        &mut self,
        candidate: &Configuration,
    ) -> Result<Changes, PushError> {
        let changes = match self.running.as_ref() {
            Some(running) => Changes::between(running, candidate),
            None => Changes::between(&Configuration::default(), candidate),
        };

        if changes.backends {
            let backends = payload::backends(candidate);
            tracing::debug!(backends = backends.len(), "Pushing backends");
            self.post(BACKENDS_PATH, encode("backends", &backends)?)
                .await?;
        }

        if changes.streams {
            let streams = payload::streams(candidate);
            tracing::debug!(streams = streams.len(), "Pushing streams");
            self.channel.stream(encode("streams", &streams)?).await?;
        }

        if changes.servers {
            let ssl = payload::ssl_configuration(candidate);
            tracing::debug!(
                certificates = ssl.certificates.len(),
                servers = ssl.servers.len(),
                "Pushing servers"
            );
            self.post(SERVERS_PATH, encode("servers", &ssl)?).await?;
        }

        self.running = Some(candidate.clone());
        Ok(changes)
    }

    async fn post(&self, path: &'static str, body: Vec<u8>) -> Result<(), PushError> {
        let status = self.channel.post(path, body).await?;
        if status != StatusCode::CREATED {
            return Err(PushError::Status { path, status });
        }
        Ok(())
    }
}

fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, PushError> {
    serde_json::to_vec(value).map_err(|source| PushError::Encode { what, source })
}

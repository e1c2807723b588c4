use crate::{core::Configuration, dynamic::Reload};

/// Reports reloads without acting on them, for deployments where the proxy
/// configuration is rendered by a separate process.
#[derive(Clone, Debug, Default)]
pub struct LogReload(());

#[async_trait::async_trait]
impl Reload for LogReload {
    async fn reload(&self, config: &Configuration) -> anyhow::Result<()> {
        let locations = config.servers.iter().map(|s| s.locations.len()).sum::<usize>();
        tracing::info!(
            servers = config.servers.len(),
            locations,
            tcp = config.tcp_endpoints.len(),
            udp = config.udp_endpoints.len(),
            "Reload required"
        );
        Ok(())
    }
}

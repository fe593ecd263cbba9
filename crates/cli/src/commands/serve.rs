//! `modelrelay serve` — start the gateway HTTP server.

use anyhow::Result;
use tracing::info;

use modelrelay_config::AppConfig;

pub async fn run(mut config: AppConfig, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if config.api_keys.is_empty() {
        tracing::warn!("no client API keys configured; every request will be rejected");
    }
    info!(routes = config.routes.len(), "starting gateway");

    modelrelay_gateway::start(config)
        .await
        .map_err(|e| anyhow::anyhow!("gateway failed: {e}"))
}

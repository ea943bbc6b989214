// ABOUTME: Platform adapters and the factory that picks one from config
// ABOUTME: "gateway" is the production WebSocket link; "mock" is for tests and local dev

pub mod gateway;
pub mod mock;

pub use gateway::GatewayPlatform;
pub use mock::MockPlatform;

use anyhow::Result;
use std::sync::Arc;
use troupe_core::config::Config;
use troupe_core::traits::MessagingPlatform;

/// Connect the configured platform. Returns only once the connection is
/// ready (identity resolved), which is what gates control-surface startup.
pub async fn connect(config: &Config) -> Result<Arc<dyn MessagingPlatform>> {
    match config.platform.kind.as_str() {
        "gateway" => {
            // validate() has already required these for the gateway kind
            let url = config.platform.gateway_url.as_deref().unwrap_or_default();
            let token = config.platform.token.as_deref().unwrap_or_default();
            let platform = GatewayPlatform::connect(url, token).await?;
            Ok(Arc::new(platform))
        }
        "mock" => Ok(Arc::new(MockPlatform::new(config.persona.handle))),
        other => anyhow::bail!("Unknown platform kind: {}", other),
    }
}

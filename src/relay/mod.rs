pub mod hub;
pub mod server;

pub use hub::{ConnectionId, EchoPolicy, Frame, HubStats, RelayHub};

use anyhow::Result;

use crate::config::RelayConfig;

pub async fn start(config: &RelayConfig) -> Result<()> {
    server::serve(config).await
}

//! SSH client side of the gateway.
//!
//! Host keys are accepted without pinning: every connection is made on
//! behalf of a browser user who supplied the target, and there is no
//! known-hosts store to check against. This is a trust boundary, logged
//! on every handshake.

pub mod auth;
pub mod config;
pub mod tunnel;

use russh::client;
use tracing::{debug, warn};

pub use auth::{ClientPrompter, InteractiveResponder, Prompter, authenticate};
pub use config::{AuthMethod, HostChain, HostConfig, NoOverrides, Overrides, host_chain};
pub use tunnel::{Connector, RusshConnector, Tunnel, TunnelBuilder};

/// russh event handler for gateway connections.
pub struct GatewayHandler {
    host: String,
}

impl GatewayHandler {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait::async_trait]
impl client::Handler for GatewayHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        warn!(
            host = %self.host,
            key_type = server_public_key.name(),
            "accepting host key without verification"
        );
        Ok(true)
    }
}

/// An authenticated SSH connection, plus the jump connection it was
/// tunnelled through.
pub struct SshClient {
    pub handle: client::Handle<GatewayHandler>,
    pub jump: Option<client::Handle<GatewayHandler>>,
}

impl From<Tunnel<client::Handle<GatewayHandler>>> for SshClient {
    fn from(tunnel: Tunnel<client::Handle<GatewayHandler>>) -> Self {
        Self {
            handle: tunnel.end,
            jump: tunnel.jump,
        }
    }
}

impl SshClient {
    /// Disconnect the end host, then the jump host.
    pub async fn disconnect(self) {
        disconnect(self.handle).await;
        if let Some(jump) = self.jump {
            disconnect(jump).await;
        }
    }
}

pub(crate) async fn disconnect(handle: client::Handle<GatewayHandler>) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "English")
        .await
    {
        debug!(error = %e, "disconnect failed");
    }
}

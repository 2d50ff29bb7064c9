//! SSH tunnel builder.
//!
//! Produces an authenticated connection to the end host, directly or
//! through one jump host. Each dial stage runs under its own timeout;
//! authentication does not, since it may be waiting on the user. Any
//! failure closes whatever was already opened and reports the stage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use tracing::{debug, info};

use termgate_core::{DialStage, DialTarget, Error, Result};

use super::auth::{Prompter, authenticate};
use super::config::HostConfig;
use super::{GatewayHandler, disconnect};

/// The network operations the builder is made of.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Send;

    /// Open a transport-level connection to `host`.
    async fn dial(&self, host: &HostConfig) -> Result<Self::Conn>;

    /// Open a connection to `target` from inside `via`.
    async fn tunnel(&self, via: &mut Self::Conn, target: &HostConfig) -> Result<Self::Conn>;

    async fn authenticate(
        &self,
        conn: &mut Self::Conn,
        host: &HostConfig,
        prompter: &mut dyn Prompter,
    ) -> Result<()>;

    async fn close(&self, conn: Self::Conn);
}

/// A built connection. `jump` must outlive `end`.
pub struct Tunnel<C> {
    pub end: C,
    pub jump: Option<C>,
}

pub struct TunnelBuilder<C> {
    connector: C,
    dial_timeout: Duration,
}

impl<C: Connector> TunnelBuilder<C> {
    pub fn new(connector: C, dial_timeout: Duration) -> Self {
        Self {
            connector,
            dial_timeout,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect and authenticate to `end`, through `jump` when given.
    pub async fn build(
        &self,
        end: &HostConfig,
        jump: Option<&HostConfig>,
        prompter: &mut dyn Prompter,
    ) -> Result<Tunnel<C::Conn>> {
        let Some(jump) = jump else {
            let mut conn = self.dial(end, DialTarget::End).await?;
            if let Err(e) = self.auth(&mut conn, end, DialTarget::End, prompter).await {
                self.connector.close(conn).await;
                return Err(e);
            }
            info!(host = %end.addr(), "connected");
            return Ok(Tunnel { end: conn, jump: None });
        };

        let mut via = self.dial(jump, DialTarget::Jump).await?;
        if let Err(e) = self.auth(&mut via, jump, DialTarget::Jump, prompter).await {
            self.connector.close(via).await;
            return Err(e);
        }
        debug!(jump = %jump.addr(), end = %end.addr(), "jump host ready, tunnelling");

        let tunnelled = tokio::time::timeout(self.dial_timeout, self.connector.tunnel(&mut via, end))
            .await
            .unwrap_or(Err(Error::Timeout));
        let mut conn = match tunnelled {
            Ok(conn) => conn,
            Err(e) => {
                self.connector.close(via).await;
                return Err(stage_error(e, DialTarget::End, DialStage::TunnelOriginate));
            }
        };

        if let Err(e) = self.auth(&mut conn, end, DialTarget::End, prompter).await {
            self.connector.close(conn).await;
            self.connector.close(via).await;
            return Err(e);
        }
        info!(host = %end.addr(), jump = %jump.addr(), "connected through jump host");
        Ok(Tunnel {
            end: conn,
            jump: Some(via),
        })
    }

    async fn dial(&self, host: &HostConfig, target: DialTarget) -> Result<C::Conn> {
        debug!(host = %host.addr(), %target, "dialing");
        tokio::time::timeout(self.dial_timeout, self.connector.dial(host))
            .await
            .unwrap_or(Err(Error::Timeout))
            .map_err(|e| stage_error(e, target, DialStage::Dial))
    }

    async fn auth(
        &self,
        conn: &mut C::Conn,
        host: &HostConfig,
        target: DialTarget,
        prompter: &mut dyn Prompter,
    ) -> Result<()> {
        self.connector
            .authenticate(conn, host, prompter)
            .await
            .map_err(|e| stage_error(e, target, DialStage::Auth))
    }
}

// Errors that already say what went wrong pass through untouched.
fn stage_error(e: Error, target: DialTarget, stage: DialStage) -> Error {
    match e {
        Error::InteractiveLoop { .. } | Error::DialFailed { .. } | Error::ConnectionClosed => e,
        other => Error::DialFailed {
            target,
            stage,
            message: other.to_string(),
        },
    }
}

/// [`Connector`] over russh.
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config {
                keepalive_interval: Some(Duration::from_secs(30)),
                keepalive_max: 3,
                ..Default::default()
            }),
        }
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Conn = client::Handle<GatewayHandler>;

    async fn dial(&self, host: &HostConfig) -> Result<Self::Conn> {
        client::connect(
            self.config.clone(),
            (host.host.as_str(), host.port),
            GatewayHandler::new(host.addr()),
        )
        .await
        .map_err(|e| Error::Transport {
            message: e.to_string(),
        })
    }

    async fn tunnel(&self, via: &mut Self::Conn, target: &HostConfig) -> Result<Self::Conn> {
        let channel = via
            .channel_open_direct_tcpip(target.host.as_str(), u32::from(target.port), "127.0.0.1", 0)
            .await
            .map_err(|e| Error::Transport {
                message: e.to_string(),
            })?;
        client::connect_stream(
            self.config.clone(),
            channel.into_stream(),
            GatewayHandler::new(target.addr()),
        )
        .await
        .map_err(|e| Error::Transport {
            message: e.to_string(),
        })
    }

    async fn authenticate(
        &self,
        conn: &mut Self::Conn,
        host: &HostConfig,
        prompter: &mut dyn Prompter,
    ) -> Result<()> {
        authenticate(conn, host, prompter).await
    }

    async fn close(&self, conn: Self::Conn) {
        disconnect(conn).await;
    }
}

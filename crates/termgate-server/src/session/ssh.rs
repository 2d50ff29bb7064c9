//! SSH channel backend.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Pty};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use termgate_core::constants::{SESSION_CLOSE_GRACE, TERM_SPEED, TERM_TYPE};
use termgate_core::session::{BackendChannels, BackendCommand};
use termgate_core::{Error, Result, SessionBackend, TermSize};

use crate::ssh::SshClient;

/// Session on one SSH channel of an authenticated connection.
pub struct SshBackend {
    client: Option<SshClient>,
    channel: Option<Channel<Msg>>,
}

impl SshBackend {
    /// Open a session channel on `client`.
    pub async fn open(client: SshClient) -> Result<Self> {
        match client.handle.channel_open_session().await {
            Ok(channel) => Ok(Self {
                client: Some(client),
                channel: Some(channel),
            }),
            Err(e) => {
                client.disconnect().await;
                Err(Error::SessionStart {
                    message: format!("cannot open session channel: {}", e),
                })
            }
        }
    }

    fn channel(&self) -> Result<&Channel<Msg>> {
        self.channel.as_ref().ok_or_else(|| Error::InvalidState {
            expected: "unstarted channel".into(),
            actual: "channel already started".into(),
        })
    }
}

#[async_trait]
impl SessionBackend for SshBackend {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn request_pty(&mut self, size: TermSize) -> Result<()> {
        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, TERM_SPEED),
            (Pty::TTY_OP_OSPEED, TERM_SPEED),
        ];
        self.channel()?
            .request_pty(
                true,
                TERM_TYPE,
                u32::from(size.cols),
                u32::from(size.rows),
                0,
                0,
                &modes,
            )
            .await
            .map_err(|e| Error::SessionStart {
                message: e.to_string(),
            })
    }

    async fn start(
        &mut self,
        command: Option<String>,
        channels: BackendChannels,
    ) -> Result<JoinHandle<Result<u32>>> {
        let channel = self.channel()?;
        let started = match &command {
            Some(cmd) => channel.exec(true, cmd.as_str()).await,
            None => channel.request_shell(true).await,
        };
        started.map_err(|e| Error::SessionStart {
            message: e.to_string(),
        })?;

        let channel = self.channel.take().ok_or(Error::ConnectionClosed)?;
        Ok(tokio::spawn(pump(channel, channels)))
    }

    async fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
    }
}

/// The parts of a russh channel the pump drives.
#[async_trait]
trait RemoteChannel: Send {
    /// Next message from the remote side; `None` once the channel is gone.
    /// Cancel-safe.
    async fn next(&mut self) -> Option<ChannelMsg>;

    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    async fn window_change(&mut self, size: TermSize) -> Result<()>;

    async fn shutdown(&mut self);
}

#[async_trait]
impl RemoteChannel for Channel<Msg> {
    async fn next(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.data(data).await.map_err(|e| Error::Transport {
            message: format!("channel write failed: {}", e),
        })
    }

    async fn window_change(&mut self, size: TermSize) -> Result<()> {
        Channel::window_change(self, u32::from(size.cols), u32::from(size.rows), 0, 0)
            .await
            .map_err(|e| Error::Pty {
                message: format!("window change failed: {}", e),
            })
    }

    async fn shutdown(&mut self) {
        let _ = self.eof().await;
        let _ = self.close().await;
    }
}

/// Relay commands into the channel and channel output back out until the
/// remote side closes it.
///
/// Output waits in a single pending slot while the client is slow; the
/// channel is not read again until it is taken, and commands keep being
/// served meanwhile.
async fn pump<C: RemoteChannel>(mut channel: C, channels: BackendChannels) -> Result<u32> {
    let BackendChannels {
        mut commands,
        output,
    } = channels;
    let mut exit_status = None;
    let mut pending: Option<Bytes> = None;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(BackendCommand::Write { data, reply }) => {
                    let _ = reply.send(channel.send_data(&data).await);
                }
                Some(BackendCommand::Resize { size, reply }) => {
                    let result = channel.window_change(size).await;
                    debug!(%size, ok = result.is_ok(), "window change");
                    let _ = reply.send(result);
                }
                Some(BackendCommand::Close) | None => {
                    channel.shutdown().await;
                    return Err(Error::ConnectionClosed);
                }
            },
            permit = output.reserve(), if pending.is_some() => match permit {
                Ok(permit) => {
                    if let Some(chunk) = pending.take() {
                        permit.send(chunk);
                    }
                }
                Err(_) => {
                    debug!("client gone, closing channel");
                    channel.shutdown().await;
                    return Err(Error::ConnectionClosed);
                }
            },
            msg = channel.next(), if pending.is_none() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    trace!(len = data.len(), "channel output");
                    pending = Some(Bytes::copy_from_slice(&data));
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                    debug!(code, "remote exit status");
                    exit_status = Some(code);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(signal = ?signal_name, "remote killed by signal");
                }
                Some(ChannelMsg::Eof) => trace!("channel eof"),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    // Whatever was read before the close still goes out.
    if let Some(chunk) = pending.take() {
        let _ = tokio::time::timeout(SESSION_CLOSE_GRACE, output.send(chunk)).await;
    }
    if exit_status.is_none() {
        debug!("channel closed without exit status");
    }
    Ok(exit_status.unwrap_or(0))
}

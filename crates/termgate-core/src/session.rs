//! Session backend abstraction.
//!
//! A backend (SSH channel, local pty, telnet socket) is driven through a
//! small command protocol: every write and resize for one session travels
//! over a single [`BackendCommand`] queue, so the backend's input stream has
//! exactly one writer no matter how many producers the gateway has.
//! Output flows back over an mpsc of byte chunks.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::constants::FRAME_QUEUE_DEPTH;
use crate::{Error, Result};

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Lifecycle of one terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PtyRequested,
    Running,
    Exited(u32),
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => f.write_str("created"),
            SessionState::PtyRequested => f.write_str("pty-requested"),
            SessionState::Running => f.write_str("running"),
            SessionState::Exited(code) => write!(f, "exited({})", code),
            SessionState::Failed => f.write_str("failed"),
        }
    }
}

/// Request sent to a running backend.
#[derive(Debug)]
pub enum BackendCommand {
    /// Bytes for the backend's input stream.
    Write {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Window-change request.
    Resize {
        size: TermSize,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop the session and release the backend's resources.
    Close,
}

/// Backend half of a session's plumbing.
pub struct BackendChannels {
    pub commands: mpsc::Receiver<BackendCommand>,
    pub output: mpsc::Sender<Bytes>,
}

/// Gateway half of a session's plumbing.
pub struct SessionStreams {
    pub input: SessionInput,
    pub output: mpsc::Receiver<Bytes>,
}

/// Create both halves. `state` gates operations that are only valid while
/// the session runs.
pub fn wire(state: watch::Receiver<SessionState>) -> (SessionStreams, BackendChannels) {
    let (cmd_tx, cmd_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let (out_tx, out_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    (
        SessionStreams {
            input: SessionInput { tx: cmd_tx, state },
            output: out_rx,
        },
        BackendChannels {
            commands: cmd_rx,
            output: out_tx,
        },
    )
}

/// Cloneable input handle onto a session.
#[derive(Clone)]
pub struct SessionInput {
    tx: mpsc::Sender<BackendCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionInput {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Write bytes to the backend's input and wait for the result.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BackendCommand::Write {
                data: data.into(),
                reply,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Change the remote window size. Only valid while running.
    pub async fn resize(&self, size: TermSize) -> Result<()> {
        let state = self.state();
        if state != SessionState::Running {
            return Err(Error::InvalidState {
                expected: SessionState::Running.to_string(),
                actual: state.to_string(),
            });
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BackendCommand::Resize { size, reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Ask the backend to shut down. Never fails; a backend that is already
    /// gone has nothing left to close.
    pub async fn close(&self) {
        let _ = self.tx.send(BackendCommand::Close).await;
    }
}

/// One kind of terminal backend.
///
/// `start` hands the backend its channels and must return a task that
/// pumps commands into the backend and output out of it until the remote
/// side exits (yielding the exit status) or a [`BackendCommand::Close`]
/// arrives.
#[async_trait]
pub trait SessionBackend: Send {
    /// Short name used in logs.
    fn kind(&self) -> &'static str;

    async fn request_pty(&mut self, size: TermSize) -> Result<()>;

    /// Start the login shell (`command == None`) or the given command.
    async fn start(
        &mut self,
        command: Option<String>,
        channels: BackendChannels,
    ) -> Result<JoinHandle<Result<u32>>>;

    /// Release connection-level resources after the pump has stopped.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resize_requires_running_state() {
        let (_state_tx, state_rx) = watch::channel(SessionState::PtyRequested);
        let (streams, _backend) = wire(state_rx);
        let err = streams.input.resize(TermSize::new(80, 24)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn write_round_trips_reply() {
        let (_state_tx, state_rx) = watch::channel(SessionState::Running);
        let (streams, mut backend) = wire(state_rx);

        let responder = tokio::spawn(async move {
            match backend.commands.recv().await {
                Some(BackendCommand::Write { data, reply }) => {
                    let _ = reply.send(Ok(()));
                    data
                }
                other => panic!("unexpected command: {:?}", other),
            }
        });

        streams.input.write(&b"ls\r"[..]).await.unwrap();
        assert_eq!(responder.await.unwrap(), Bytes::from_static(b"ls\r"));
    }

    #[tokio::test]
    async fn write_to_dropped_backend_is_closed() {
        let (_state_tx, state_rx) = watch::channel(SessionState::Running);
        let (streams, backend) = wire(state_rx);
        drop(backend);
        let err = streams.input.write(&b"x"[..]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[test]
    fn state_display() {
        assert_eq!(SessionState::Exited(3).to_string(), "exited(3)");
        assert_eq!(TermSize::new(120, 80).to_string(), "120x80");
    }
}

//! Client transport boundary.
//!
//! The gateway never sees the HTTP upgrade itself. It is handed a
//! [`ClientConnection`]: a source of inbound frames, a sink for outbound
//! frames, and the request parameters that came with the upgrade.
//!
//! All outbound traffic goes through a [`ClientWriter`], a cloneable handle
//! onto a single writer task. Every producer (backend output, error
//! reports, auth prompts) enqueues in order, so nothing is reordered within
//! the client-bound direction and the sink never sees concurrent writes.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::RequestParams;
use crate::constants::FRAME_QUEUE_DEPTH;
use crate::protocol::Message;
use crate::{Error, Result};

/// One transport frame with its binary/text marking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame; carries a JSON control message.
    Text(String),
    /// Binary frame; raw passthrough bytes.
    Binary(Bytes),
}

/// Inbound half of a client connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame from the client, or `None` once it has gone away.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<Frame>>;
}

/// Outbound half of a client connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// A client connection as handed over by the transport-accept layer.
pub struct ClientConnection {
    pub params: RequestParams,
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
}

impl ClientConnection {
    pub fn new(
        params: RequestParams,
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            params,
            source,
            sink,
        }
    }
}

enum Outbound {
    Frame(Frame),
    Close(oneshot::Sender<()>),
}

/// Cloneable, order-preserving handle onto the client sink.
#[derive(Clone)]
pub struct ClientWriter {
    tx: mpsc::Sender<Outbound>,
}

impl ClientWriter {
    /// Start the writer task that owns `sink`.
    pub fn spawn(mut sink: Box<dyn FrameSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Outbound>(FRAME_QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Frame(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            debug!(error = %e, "client sink rejected frame");
                            break;
                        }
                    }
                    Outbound::Close(ack) => {
                        let _ = sink.close().await;
                        let _ = ack.send(());
                        return;
                    }
                }
            }
            // Every handle dropped, or the sink failed.
            let _ = sink.close().await;
        });

        (Self { tx }, task)
    }

    async fn push(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Send raw bytes as a binary frame.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<()> {
        self.push(Frame::Binary(data.into())).await
    }

    /// Send a control message as a text frame.
    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        self.push(Frame::Text(msg.to_json())).await
    }

    /// Send a `stderr` message with the given text.
    pub async fn send_stderr(&self, text: impl Into<Vec<u8>>) -> Result<()> {
        self.send_message(&Message::stderr(text)).await
    }

    /// Flush everything queued so far, then close the sink.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Outbound::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

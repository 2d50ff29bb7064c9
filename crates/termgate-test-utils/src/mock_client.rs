//! In-memory client connection.
//!
//! [`mock_client`] returns the [`ClientConnection`] the gateway consumes and
//! a [`MockClient`] the test drives: push inbound frames, then read back
//! every frame the gateway sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use termgate_core::protocol::{Message, MessageType};
use termgate_core::transport::{ClientConnection, Frame, FrameSink, FrameSource};
use termgate_core::{Error, RequestParams, Result};

struct MockSource {
    rx: mpsc::UnboundedReceiver<Result<Frame>>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.tx.send(frame).map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Test side of an in-memory client connection.
pub struct MockClient {
    inbound: Option<mpsc::UnboundedSender<Result<Frame>>>,
    outbound: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
}

/// Create a connection with the given request parameters.
pub fn mock_client(params: RequestParams) -> (ClientConnection, MockClient) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let conn = ClientConnection::new(
        params,
        Box::new(MockSource { rx: in_rx }),
        Box::new(MockSink {
            tx: out_tx,
            closed: closed.clone(),
        }),
    );
    let client = MockClient {
        inbound: Some(in_tx),
        outbound: out_rx,
        closed,
    };
    (conn, client)
}

impl MockClient {
    fn push(&self, frame: Result<Frame>) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(frame);
        }
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into())));
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) {
        self.push(Ok(Frame::Binary(data.into())));
    }

    pub fn send_message(&self, msg: &Message) {
        self.send_text(msg.to_json());
    }

    /// Simulate a transport failure on the inbound side.
    pub fn send_error(&self, err: Error) {
        self.push(Err(err));
    }

    /// Stop sending; the gateway sees the connection end.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// True once the gateway closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Next frame from the gateway, or `None` on close/timeout (5s).
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Every frame until the gateway drops its sink (5s cap).
    pub async fn frames_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await {
            frames.push(frame);
        }
        frames
    }
}

/// Text of a `stderr` control message, if `frame` is one.
pub fn stderr_text(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Text(text) => match Message::parse(text) {
            Ok(msg) if msg.kind == MessageType::Stderr => {
                Some(String::from_utf8_lossy(&msg.data).into_owned())
            }
            _ => None,
        },
        Frame::Binary(_) => None,
    }
}

/// Concatenated payload of every binary frame.
pub fn binary_payload(frames: &[Frame]) -> Vec<u8> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Binary(b) => Some(b.as_ref()),
            Frame::Text(_) => None,
        })
        .flatten()
        .copied()
        .collect()
}

//! Control/data multiplexer.
//!
//! Routes each inbound client frame to the session:
//! - binary frames go to the backend input verbatim, never parsed
//! - text frames are control messages (`stdin`, `resize`; others ignored)
//!
//! Per-frame failures are reported to the client as `stderr` messages and
//! the loop continues; only errors meaning one side is gone end it.

use std::borrow::Cow;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use termgate_core::protocol::{Message, MessageType};
use termgate_core::transport::{ClientWriter, Frame, FrameSource};
use termgate_core::{Error, InputEncoder, Result, SessionInput, TermSize};

use crate::dump::Transcript;

pub struct Mux {
    input: SessionInput,
    writer: ClientWriter,
    encoder: InputEncoder,
    transcript: Option<Transcript>,
}

impl Mux {
    pub fn new(input: SessionInput, writer: ClientWriter, encoder: InputEncoder) -> Self {
        Self {
            input,
            writer,
            encoder,
            transcript: None,
        }
    }

    /// Copy everything written to the backend into `transcript`.
    pub fn with_transcript(mut self, transcript: Option<Transcript>) -> Self {
        self.transcript = transcript;
        self
    }

    /// Flush the input transcript, if any.
    pub async fn flush_transcript(&mut self) {
        if let Some(t) = self.transcript.as_mut() {
            t.flush().await;
        }
    }

    /// Dispatch frames until the client goes away (`Ok`) or a fatal error.
    pub async fn run(&mut self, source: &mut dyn FrameSource) -> Result<()> {
        loop {
            let frame = match source.recv().await {
                None => {
                    debug!("client closed");
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                Some(Ok(frame)) => frame,
            };
            if let Err(e) = self.dispatch(frame).await {
                if e.is_connection_fatal() {
                    return Err(e);
                }
                debug!(error = %e, "frame rejected");
            }
        }
    }

    pub async fn dispatch(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Binary(data) => {
                trace!(len = data.len(), "binary passthrough");
                self.write_input(data).await
            }
            Frame::Text(text) => {
                let msg = match Message::parse(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        self.report(&format!("{}\r\n", e)).await?;
                        return Err(e);
                    }
                };
                self.handle(msg).await
            }
        }
    }

    async fn handle(&mut self, msg: Message) -> Result<()> {
        match msg.kind {
            MessageType::Stdin => {
                let encoded = match self.encoder.encode(&msg.data) {
                    Cow::Borrowed(_) => None,
                    Cow::Owned(encoded) => Some(encoded),
                };
                let data = Bytes::from(encoded.unwrap_or(msg.data));
                if data.is_empty() {
                    return Ok(());
                }
                self.write_input(data).await
            }
            MessageType::Resize => {
                let size = TermSize::new(msg.cols, msg.rows);
                if let Err(e) = self.input.resize(size).await {
                    warn!(%size, error = %e, "resize failed");
                    self.report("resize error\r\n").await?;
                    return Err(e);
                }
                Ok(())
            }
            MessageType::Stderr | MessageType::Unknown => Ok(()),
        }
    }

    async fn write_input(&mut self, data: Bytes) -> Result<()> {
        if let Some(t) = self.transcript.as_mut() {
            t.write(&data).await;
        }
        if let Err(e) = self.input.write(data).await {
            warn!(error = %e, "write to session input failed");
            self.report("write to stdin error\r\n").await?;
            return Err(e);
        }
        Ok(())
    }

    // A client that cannot take the report is gone.
    async fn report(&self, text: &str) -> Result<()> {
        self.writer.send_stderr(text).await
    }
}

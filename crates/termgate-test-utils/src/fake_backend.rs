//! Fake session backend for testing without a remote host.
//!
//! The backend half is handed to the code under test; the
//! [`FakeBackendHandle`] stays with the test to inject output, end the
//! session and inspect what the gateway did.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use termgate_core::session::{BackendChannels, BackendCommand, SessionBackend, TermSize};
use termgate_core::{Error, Result};

/// Everything the gateway asked of the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendRecord {
    pub pty: Option<TermSize>,
    pub started: bool,
    pub command: Option<String>,
    /// Concatenated input bytes.
    pub input: Vec<u8>,
    /// Number of write commands received.
    pub writes: usize,
    pub resizes: Vec<TermSize>,
    pub close_calls: usize,
}

enum FakeEvent {
    Output(Bytes),
    Exit(u32),
}

/// A scripted [`SessionBackend`].
pub struct FakeBackend {
    record: Arc<Mutex<BackendRecord>>,
    events: Option<mpsc::UnboundedReceiver<FakeEvent>>,
    fail_pty: bool,
    fail_start: bool,
    fail_resize: bool,
    fail_writes: bool,
}

/// Test-side handle for a [`FakeBackend`].
#[derive(Clone)]
pub struct FakeBackendHandle {
    record: Arc<Mutex<BackendRecord>>,
    events: mpsc::UnboundedSender<FakeEvent>,
}

impl FakeBackend {
    pub fn new() -> (Self, FakeBackendHandle) {
        let record = Arc::new(Mutex::new(BackendRecord::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                record: record.clone(),
                events: Some(rx),
                fail_pty: false,
                fail_start: false,
                fail_resize: false,
                fail_writes: false,
            },
            FakeBackendHandle { record, events: tx },
        )
    }

    pub fn failing_pty(mut self) -> Self {
        self.fail_pty = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_resize(mut self) -> Self {
        self.fail_resize = true;
        self
    }

    pub fn failing_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

#[async_trait]
impl SessionBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn request_pty(&mut self, size: TermSize) -> Result<()> {
        if self.fail_pty {
            return Err(Error::SessionStart {
                message: "pty request rejected".into(),
            });
        }
        self.record.lock().unwrap().pty = Some(size);
        Ok(())
    }

    async fn start(
        &mut self,
        command: Option<String>,
        channels: BackendChannels,
    ) -> Result<JoinHandle<Result<u32>>> {
        if self.fail_start {
            return Err(Error::SessionStart {
                message: "shell request rejected".into(),
            });
        }
        {
            let mut record = self.record.lock().unwrap();
            record.started = true;
            record.command = command;
        }

        let record = self.record.clone();
        let mut events = self.events.take().ok_or_else(|| Error::InvalidState {
            expected: "fresh backend".into(),
            actual: "already started".into(),
        })?;
        let fail_resize = self.fail_resize;
        let fail_writes = self.fail_writes;
        let BackendChannels {
            mut commands,
            output,
        } = channels;

        Ok(tokio::spawn(async move {
            let mut events_open = true;
            loop {
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(BackendCommand::Write { data, reply }) => {
                            if fail_writes {
                                let _ = reply.send(Err(Error::Transport {
                                    message: "stdin closed".into(),
                                }));
                                continue;
                            }
                            let mut r = record.lock().unwrap();
                            r.input.extend_from_slice(&data);
                            r.writes += 1;
                            let _ = reply.send(Ok(()));
                        }
                        Some(BackendCommand::Resize { size, reply }) => {
                            if fail_resize {
                                let _ = reply.send(Err(Error::Pty {
                                    message: "window change rejected".into(),
                                }));
                                continue;
                            }
                            record.lock().unwrap().resizes.push(size);
                            let _ = reply.send(Ok(()));
                        }
                        Some(BackendCommand::Close) | None => return Err(Error::ConnectionClosed),
                    },
                    event = events.recv(), if events_open => match event {
                        Some(FakeEvent::Output(data)) => {
                            let _ = output.send(data).await;
                        }
                        Some(FakeEvent::Exit(code)) => return Ok(code),
                        None => events_open = false,
                    },
                }
            }
        }))
    }

    async fn close(&mut self) {
        self.record.lock().unwrap().close_calls += 1;
    }
}

impl FakeBackendHandle {
    /// Make the backend produce output.
    pub fn emit(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(FakeEvent::Output(data.into()));
    }

    /// Make the remote side exit with `code`.
    pub fn exit(&self, code: u32) {
        let _ = self.events.send(FakeEvent::Exit(code));
    }

    /// Snapshot of what the backend has seen so far.
    pub fn record(&self) -> BackendRecord {
        self.record.lock().unwrap().clone()
    }

    /// Wait until at least `len` input bytes arrived (5s cap).
    pub async fn wait_for_input(&self, len: usize) -> BackendRecord {
        self.wait_until(|r| r.input.len() >= len).await
    }

    /// Wait until `pred` holds for the record (5s cap).
    pub async fn wait_until(&self, pred: impl Fn(&BackendRecord) -> bool) -> BackendRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = self.record();
            if pred(&snapshot) || tokio::time::Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

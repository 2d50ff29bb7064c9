//! Terminal session controller.
//!
//! Drives one [`SessionBackend`] through
//! `Created -> PtyRequested -> Running -> Exited | Failed`.

pub mod ssh;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use termgate_core::constants::SESSION_CLOSE_GRACE;
use termgate_core::session::{SessionStreams, wire};
use termgate_core::{Error, Result, SessionBackend, SessionInput, SessionState, TermSize};

pub use self::ssh::SshBackend;

/// Owns one session for the lifetime of a client connection.
pub struct SessionController {
    backend: Box<dyn SessionBackend>,
    state: watch::Sender<SessionState>,
    input: Option<SessionInput>,
    task: Option<JoinHandle<Result<u32>>>,
}

impl SessionController {
    pub fn new(backend: Box<dyn SessionBackend>) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            backend,
            state,
            input: None,
            task: None,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Input handle; present once the session has started.
    pub fn input(&self) -> Option<SessionInput> {
        self.input.clone()
    }

    fn expect(&self, expected: SessionState) -> Result<()> {
        let actual = self.state();
        if actual != expected {
            return Err(Error::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    fn set(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub async fn request_pty(&mut self, size: TermSize) -> Result<()> {
        self.expect(SessionState::Created)?;
        match self.backend.request_pty(size).await {
            Ok(()) => {
                debug!(kind = self.backend.kind(), %size, "pty allocated");
                self.set(SessionState::PtyRequested);
                Ok(())
            }
            Err(e) => {
                self.set(SessionState::Failed);
                Err(Error::SessionStart {
                    message: format!("pty request failed: {}", e),
                })
            }
        }
    }

    /// Start the login shell.
    ///
    /// `init` receives the session's streams before the shell starts, so
    /// nothing the backend prints can be missed.
    pub async fn start_shell<F, T>(&mut self, init: F) -> Result<T>
    where
        F: FnOnce(SessionStreams) -> Result<T> + Send,
    {
        self.start(None, init).await
    }

    /// Start `command` instead of a shell. Same ordering as
    /// [`start_shell`](Self::start_shell).
    pub async fn start_command<F, T>(&mut self, command: impl Into<String>, init: F) -> Result<T>
    where
        F: FnOnce(SessionStreams) -> Result<T> + Send,
    {
        self.start(Some(command.into()), init).await
    }

    async fn start<F, T>(&mut self, command: Option<String>, init: F) -> Result<T>
    where
        F: FnOnce(SessionStreams) -> Result<T> + Send,
    {
        self.expect(SessionState::PtyRequested)?;

        let (streams, channels) = wire(self.state.subscribe());
        let input = streams.input.clone();
        let wired = match init(streams) {
            Ok(wired) => wired,
            Err(e) => {
                self.set(SessionState::Failed);
                return Err(e);
            }
        };

        let what = command.clone().unwrap_or_else(|| "shell".to_string());
        match self.backend.start(command, channels).await {
            Ok(task) => {
                info!(kind = self.backend.kind(), command = %what, "session running");
                self.task = Some(task);
                self.input = Some(input);
                self.set(SessionState::Running);
                Ok(wired)
            }
            Err(e) => {
                self.set(SessionState::Failed);
                Err(match e {
                    Error::SessionStart { .. } => e,
                    other => Error::SessionStart {
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    /// Change the pty size. Only valid while running.
    pub async fn resize(&self, size: TermSize) -> Result<()> {
        self.expect(SessionState::Running)?;
        match &self.input {
            Some(input) => input.resize(size).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Wait for the remote side to exit.
    ///
    /// Cancel-safe: dropping the future leaves the session running.
    pub async fn wait(&mut self) -> Result<u32> {
        let Some(task) = self.task.as_mut() else {
            return match self.state() {
                SessionState::Exited(code) => Ok(code),
                state => Err(Error::InvalidState {
                    expected: SessionState::Running.to_string(),
                    actual: state.to_string(),
                }),
            };
        };

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Transport {
                message: format!("session task failed: {}", e),
            }),
        };
        self.task = None;
        self.finish(&result);
        result
    }

    fn finish(&self, result: &Result<u32>) {
        match result {
            Ok(code) => {
                info!(kind = self.backend.kind(), code, "session exited");
                self.set(SessionState::Exited(*code));
            }
            Err(e) => {
                debug!(kind = self.backend.kind(), error = %e, "session ended with error");
                self.set(SessionState::Failed);
            }
        }
    }

    /// Stop the session and release the backend. Safe to call in any state.
    pub async fn close(&mut self) {
        if let Some(input) = self.input.take() {
            let _ = tokio::time::timeout(SESSION_CLOSE_GRACE, input.close()).await;
        }
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(SESSION_CLOSE_GRACE, &mut task).await {
                Ok(Ok(result)) => self.finish(&result),
                Ok(Err(e)) => {
                    warn!(error = %e, "session task panicked");
                    self.set(SessionState::Failed);
                }
                Err(_) => {
                    warn!(kind = self.backend.kind(), "session did not stop in time, aborting");
                    task.abort();
                    self.set(SessionState::Failed);
                }
            }
        }
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use termgate_test_utils::FakeBackend;

    fn controller() -> (SessionController, termgate_test_utils::FakeBackendHandle) {
        let (backend, handle) = FakeBackend::new();
        (SessionController::new(Box::new(backend)), handle)
    }

    #[tokio::test]
    async fn start_before_pty_is_rejected() {
        let (mut session, handle) = controller();
        let err = session.start_shell(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(!handle.record().started);
        assert_eq!(session.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn resize_before_running_is_rejected() {
        let (mut session, _handle) = controller();
        session.request_pty(TermSize::new(80, 24)).await.unwrap();
        let err = session.resize(TermSize::new(100, 40)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (mut session, handle) = controller();
        session.request_pty(TermSize::new(120, 80)).await.unwrap();
        assert_eq!(session.state(), SessionState::PtyRequested);

        let mut output = session.start_shell(|streams| Ok(streams.output)).await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.resize(TermSize::new(100, 40)).await.unwrap();
        handle.emit(&b"$ "[..]);
        assert_eq!(output.recv().await.unwrap(), Bytes::from_static(b"$ "));

        handle.exit(0);
        assert_eq!(session.wait().await.unwrap(), 0);
        assert_eq!(session.state(), SessionState::Exited(0));

        let record = handle.record();
        assert_eq!(record.pty, Some(TermSize::new(120, 80)));
        assert_eq!(record.resizes, vec![TermSize::new(100, 40)]);
        assert_eq!(record.command, None);
    }

    #[tokio::test]
    async fn init_runs_before_backend_start() {
        let (mut session, handle) = controller();
        session.request_pty(TermSize::new(80, 24)).await.unwrap();

        let observer = handle.clone();
        session
            .start_command("uptime", move |_| {
                assert!(!observer.record().started);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(handle.record().command.as_deref(), Some("uptime"));
    }

    #[tokio::test]
    async fn failed_pty_is_session_start_error() {
        let (backend, _handle) = FakeBackend::new();
        let mut session = SessionController::new(Box::new(backend.failing_pty()));
        let err = session.request_pty(TermSize::new(80, 24)).await.unwrap_err();
        assert!(matches!(err, Error::SessionStart { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn failed_start_marks_failed() {
        let (backend, _handle) = FakeBackend::new();
        let mut session = SessionController::new(Box::new(backend.failing_start()));
        session.request_pty(TermSize::new(80, 24)).await.unwrap();
        let err = session.start_shell(|_| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::SessionStart { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn wait_is_cancel_safe() {
        let (mut session, handle) = controller();
        session.request_pty(TermSize::new(80, 24)).await.unwrap();
        session.start_shell(|_| Ok(())).await.unwrap();

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(20), session.wait()).await;
        assert!(timed_out.is_err());
        assert_eq!(session.state(), SessionState::Running);

        handle.exit(3);
        assert_eq!(session.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn close_stops_pump_and_releases_backend() {
        let (mut session, handle) = controller();
        session.request_pty(TermSize::new(80, 24)).await.unwrap();
        let input = session.start_shell(|streams| Ok(streams.input)).await.unwrap();

        session.close().await;
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(handle.record().close_calls, 1);
        assert!(input.write(&b"x"[..]).await.is_err());
    }
}

//! Connection bridge.
//!
//! One call to [`Gateway::handle`] serves one client connection from start
//! to finish: validate the request, build the backend, run the session
//! with output pumped to the client and client frames routed by the
//! [`Mux`], then tear everything down in reverse order. A request that
//! fails gets a single final stderr message before the connection closes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use termgate_core::constants::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_EXEC_TIMEOUT, DEFAULT_SSH_PORT, DEFAULT_SSH_SIZE,
    DEFAULT_TELNET_PORT, DEFAULT_TELNET_SIZE, FRAME_QUEUE_DEPTH,
};
use termgate_core::session::{SessionStreams, wire};
use termgate_core::transcode::decode_by;
use termgate_core::{
    Charset, ClientConnection, ClientWriter, Error, FrameSource, InputEncoder, OutputFilter,
    RequestParams, Result, SessionBackend, SessionInput, SessionState, TermSize,
};

use crate::dump::{Transcript, Transcripts, command_alias};
use crate::exec::{CommandResolver, ExecRequest, Executor};
use crate::mux::Mux;
use crate::session::{SessionController, SshBackend};
use crate::ssh::{
    ClientPrompter, HostChain, NoOverrides, Overrides, RusshConnector, SshClient, TunnelBuilder,
    host_chain,
};
use crate::telnet::TelnetBackend;

// =============================================================================
// Configuration
// =============================================================================

/// Process-wide gateway settings, built once at startup.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Write transcripts for every connection, not only `debug=true` ones.
    pub debug: bool,
    pub log_dir: PathBuf,
    /// Helper for re-running commands that hit a permission error.
    pub sh_execute: Option<String>,
    pub mibs_dir: Option<String>,
    pub dial_timeout: Duration,
    pub default_exec_timeout: Duration,
    pub allow_local_shell: bool,
    pub local_shell: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_dir: PathBuf::from("."),
            sh_execute: Some("sudo".into()),
            mibs_dir: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            default_exec_timeout: DEFAULT_EXEC_TIMEOUT,
            allow_local_shell: false,
            local_shell: None,
        }
    }
}

// =============================================================================
// Routes
// =============================================================================

/// Entry points, one per kind of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Interactive shell over SSH.
    SshShell,
    /// `cmd` over SSH with a pty.
    SshExec,
    Telnet,
    /// Local command from `exec` and `arg0..argN`.
    Exec,
    /// Local command from a shell-style `exec` command line.
    ExecWords,
    /// Local pty shell.
    LocalShell,
    /// Stream a recorded transcript back to the client.
    Replay,
}

impl Route {
    pub const ALL: [Route; 7] = [
        Route::SshShell,
        Route::SshExec,
        Route::Telnet,
        Route::Exec,
        Route::ExecWords,
        Route::LocalShell,
        Route::Replay,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Route::SshShell => "ssh",
            Route::SshExec => "ssh_exec",
            Route::Telnet => "telnet",
            Route::Exec => "cmd",
            Route::ExecWords => "cmd2",
            Route::LocalShell => "shell",
            Route::Replay => "replay",
        }
    }

    pub fn path(&self) -> String {
        format!("/{}", self.name())
    }
}

// =============================================================================
// Gateway
// =============================================================================

pub struct Gateway {
    config: GatewayConfig,
    executor: Executor,
    tunnel: TunnelBuilder<RusshConnector>,
    overrides: Arc<dyn Overrides>,
}

/// Everything a pty session needs besides its backend.
struct SessionPlan {
    size: TermSize,
    command: Option<String>,
    filter: OutputFilter,
    encoder: InputEncoder,
    transcripts: Transcripts,
}

/// Why a session stopped.
enum SessionExit {
    /// The client went away (or its connection failed).
    Client(Result<()>),
    /// The backend finished.
    Backend(Result<u32>),
}

impl Gateway {
    pub fn new(config: GatewayConfig, resolver: Arc<CommandResolver>) -> Self {
        let executor = Executor::new(resolver)
            .with_sh_execute(config.sh_execute.clone())
            .with_mibs_dir(config.mibs_dir.clone());
        let tunnel = TunnelBuilder::new(RusshConnector::new(), config.dial_timeout);
        Self {
            config,
            executor,
            tunnel,
            overrides: Arc::new(NoOverrides),
        }
    }

    /// Consult `overrides` for account and host configs before the request.
    pub fn with_overrides(mut self, overrides: Arc<dyn Overrides>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Serve one client connection on `route`.
    ///
    /// The error, if any, has already been reported to the client and the
    /// connection closed when this returns.
    pub async fn handle(&self, route: Route, conn: ClientConnection) -> Result<()> {
        let ClientConnection {
            params,
            mut source,
            sink,
        } = conn;
        let (writer, writer_task) = ClientWriter::spawn(sink);
        info!(route = route.name(), host = params.get("hostname"), "connection opened");

        let source = source.as_mut();
        let result = match route {
            Route::SshShell => self.ssh_shell(&params, source, &writer).await,
            Route::SshExec => self.ssh_exec(&params, source, &writer).await,
            Route::Telnet => self.telnet_shell(&params, source, &writer).await,
            Route::Exec => {
                let req = ExecRequest::from_params(&params, self.config.default_exec_timeout);
                self.exec_shell(&params, req, source, &writer).await
            }
            Route::ExecWords => {
                let req = ExecRequest::from_command_line(&params, self.config.default_exec_timeout);
                self.exec_shell(&params, req, source, &writer).await
            }
            Route::LocalShell => self.local_shell(&params, source, &writer).await,
            Route::Replay => self.replay(&params, &writer).await,
        };

        match &result {
            Ok(()) => info!(route = route.name(), "connection finished"),
            Err(e) => {
                warn!(route = route.name(), error = %e, "request failed");
                let _ = writer.send_stderr(e.client_message()).await;
            }
        }
        writer.close().await;
        let _ = writer_task.await;
        result
    }

    // -------------------------------------------------------------------------
    // Routes
    // -------------------------------------------------------------------------

    pub async fn ssh_shell(
        &self,
        params: &RequestParams,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<()> {
        let (filter, encoder) = codecs(params)?;
        let chain = host_chain(params, DEFAULT_SSH_PORT, self.overrides.as_ref())?;
        let client = self.connect_ssh(&chain, source, writer).await?;
        let backend = SshBackend::open(client).await?;
        let transcripts = self.transcripts(params, &chain.end.host, "ssh").await;

        let plan = SessionPlan {
            size: params.term_size(DEFAULT_SSH_SIZE),
            command: None,
            filter,
            encoder,
            transcripts,
        };
        serve_session(Box::new(backend), plan, source, writer).await
    }

    pub async fn ssh_exec(
        &self,
        params: &RequestParams,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<()> {
        let command = params.get("cmd");
        if command.is_empty() {
            return Err(Error::InvalidParam {
                name: "cmd".into(),
                message: "no command given".into(),
            });
        }
        let (filter, encoder) = codecs(params)?;
        let chain = host_chain(params, DEFAULT_SSH_PORT, self.overrides.as_ref())?;
        let client = self.connect_ssh(&chain, source, writer).await?;
        let backend = SshBackend::open(client).await?;
        let name = command_alias(&chain.end.host, params.get("dump_file"), command);
        let transcripts = self.transcripts(params, &name, "ssh").await;

        let plan = SessionPlan {
            size: params.term_size(DEFAULT_SSH_SIZE),
            command: Some(command.to_string()),
            filter,
            encoder,
            transcripts,
        };
        serve_session(Box::new(backend), plan, source, writer).await
    }

    pub async fn telnet_shell(
        &self,
        params: &RequestParams,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<()> {
        let (filter, encoder) = codecs(params)?;
        let host = params.get("hostname");
        if host.is_empty() {
            return Err(Error::InvalidParam {
                name: "hostname".into(),
                message: "missing".into(),
            });
        }
        let port = params.port(DEFAULT_TELNET_PORT)?;
        let backend = TelnetBackend::connect(host, port, self.config.dial_timeout).await?;
        let transcripts = self.transcripts(params, host, "telnet").await;

        let plan = SessionPlan {
            size: params.term_size(DEFAULT_TELNET_SIZE),
            command: None,
            filter,
            encoder,
            transcripts,
        };
        serve_session(Box::new(backend), plan, source, writer).await
    }

    pub async fn local_shell(
        &self,
        params: &RequestParams,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<()> {
        if !self.config.allow_local_shell {
            return Err(Error::SessionStart {
                message: "local shell is disabled".into(),
            });
        }
        let (filter, encoder) = codecs(params)?;
        let backend = local_backend(self.config.local_shell.clone())?;
        let command = Some(params.get("cmd"))
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let transcripts = self.transcripts(params, "localhost", "shell").await;

        let plan = SessionPlan {
            size: params.term_size(DEFAULT_SSH_SIZE),
            command,
            filter,
            encoder,
            transcripts,
        };
        serve_session(backend, plan, source, writer).await
    }

    /// Run a local command. `req` is the parsed request, or why parsing
    /// failed.
    pub async fn exec_shell(
        &self,
        params: &RequestParams,
        req: Result<ExecRequest>,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<()> {
        let (filter, encoder) = codecs(params)?;
        let mut req = req?;
        // Removed when the request ends.
        let _script = if params.has("file") {
            Some(req.attach_script(params.get("file"))?)
        } else {
            None
        };
        let name = command_alias("localhost", params.get("dump_file"), &req.program);
        let Transcripts { output, input } = self.transcripts(params, &name, "exec").await;

        let (_state, state_rx) = watch::channel(SessionState::Running);
        let (streams, channels) = wire(state_rx);
        let pump = tokio::spawn(pump_output(streams.output, filter, output, writer.clone()));
        let mut mux = Mux::new(streams.input.clone(), writer.clone(), encoder).with_transcript(input);

        let timeout = req.timeout;
        let run = self.executor.run(req, channels);
        tokio::pin!(run);
        let report = tokio::select! {
            report = &mut run => report,
            res = mux.run(source) => {
                if let Err(e) = res {
                    debug!(error = %e, "client side ended with error");
                }
                streams.input.close().await;
                run.await
            }
        };
        mux.flush_transcript().await;
        drop(mux);
        let _ = pump.await;

        let report = report?;
        if report.timed_out {
            return Err(Error::TimeoutKill { after: timeout });
        }
        if let Some(code) = report.exit_code.filter(|c| *c != 0) {
            let _ = writer.send_stderr(format!("exit status {}\r\n", code)).await;
        }
        Ok(())
    }

    /// Stream the transcript named by `file` to the client, decoded from
    /// the request charset.
    pub async fn replay(&self, params: &RequestParams, writer: &ClientWriter) -> Result<()> {
        let path = params.get("file");
        if path.is_empty() {
            return Err(Error::InvalidParam {
                name: "file".into(),
                message: "missing".into(),
            });
        }
        let charset = params.charset();
        Charset::from_name(&charset)?;

        let root = self.config.log_dir.clone();
        let path = PathBuf::from(path);
        let (tx, mut rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let copy = tokio::task::spawn_blocking(move || -> Result<u64> {
            let path = transcript_path(&root, &path)?;
            let mut file = std::fs::File::open(&path)?;
            let mut dst = decode_by(&charset, FrameWriter { tx })?;
            let copied = io::copy(&mut file, &mut dst)?;
            dst.finish()?;
            Ok(copied)
        });

        while let Some(chunk) = rx.recv().await {
            writer.send_binary(chunk).await?;
        }
        let copied = copy.await.map_err(|e| Error::Transport {
            message: format!("replay task failed: {}", e),
        })??;
        info!(bytes = copied, "replay finished");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn connect_ssh(
        &self,
        chain: &HostChain,
        source: &mut dyn FrameSource,
        writer: &ClientWriter,
    ) -> Result<SshClient> {
        let mut prompter = ClientPrompter::new(source, writer.clone());
        let tunnel = self
            .tunnel
            .build(&chain.end, chain.jump.as_ref(), &mut prompter)
            .await?;
        Ok(SshClient::from(tunnel))
    }

    async fn transcripts(&self, params: &RequestParams, name: &str, kind: &str) -> Transcripts {
        if params.debug(self.config.debug) {
            Transcripts::open(&self.config.log_dir, name, kind).await
        } else {
            Transcripts::off()
        }
    }
}

/// Resolve a replay request against the transcript directory. Relative
/// paths are taken from `root`; links and `..` may not lead outside it.
fn transcript_path(root: &Path, requested: &Path) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let path = root.join(requested).canonicalize()?;
    if !path.starts_with(&root) {
        return Err(Error::InvalidParam {
            name: "file".into(),
            message: "outside the transcript directory".into(),
        });
    }
    Ok(path)
}

/// Output filter and input encoder for the request charset. Checked
/// before any backend is dialled.
fn codecs(params: &RequestParams) -> Result<(OutputFilter, InputEncoder)> {
    let charset = params.charset();
    let filter = OutputFilter::for_charset(&charset)?;
    let encoder = InputEncoder::new(Charset::from_name(&charset)?);
    Ok((filter, encoder))
}

#[cfg(unix)]
fn local_backend(shell: Option<String>) -> Result<Box<dyn SessionBackend>> {
    Ok(Box::new(crate::pty::LocalPtyBackend::new(shell)))
}

#[cfg(not(unix))]
fn local_backend(_shell: Option<String>) -> Result<Box<dyn SessionBackend>> {
    Err(Error::SessionStart {
        message: "local shell is not supported on this platform".into(),
    })
}

/// Run a pty session until either side finishes, then tear it down.
async fn serve_session(
    backend: Box<dyn SessionBackend>,
    plan: SessionPlan,
    source: &mut dyn FrameSource,
    writer: &ClientWriter,
) -> Result<()> {
    let SessionPlan {
        size,
        command,
        filter,
        encoder,
        transcripts,
    } = plan;
    let Transcripts { output, input } = transcripts;

    let mut session = SessionController::new(backend);
    if let Err(e) = session.request_pty(size).await {
        session.close().await;
        return Err(e);
    }

    // Output is wired before the backend starts so nothing is missed.
    let pump_writer = writer.clone();
    let init = move |streams: SessionStreams| -> Result<(SessionInput, JoinHandle<()>)> {
        let pump = tokio::spawn(pump_output(streams.output, filter, output, pump_writer));
        Ok((streams.input, pump))
    };
    let started = match command {
        Some(command) => session.start_command(command, init).await,
        None => session.start_shell(init).await,
    };
    let (session_input, pump) = match started {
        Ok(wired) => wired,
        Err(e) => {
            session.close().await;
            return Err(e);
        }
    };

    let mut mux = Mux::new(session_input, writer.clone(), encoder).with_transcript(input);
    let exit = tokio::select! {
        res = mux.run(source) => SessionExit::Client(res),
        res = session.wait() => SessionExit::Backend(res),
    };
    mux.flush_transcript().await;
    drop(mux);
    session.close().await;
    let _ = pump.await;

    match exit {
        SessionExit::Client(res) => {
            debug!(ok = res.is_ok(), "client finished first");
            res
        }
        SessionExit::Backend(Ok(0)) => Ok(()),
        SessionExit::Backend(Ok(code)) => {
            let _ = writer.send_stderr(format!("exit status {}\r\n", code)).await;
            Ok(())
        }
        SessionExit::Backend(Err(Error::ConnectionClosed)) => Ok(()),
        SessionExit::Backend(Err(e)) => Err(e),
    }
}

/// Copy backend output to the client: transcript first (raw), then
/// transcoded. Ends when the backend closes its output or the client is
/// gone.
async fn pump_output(
    mut output: mpsc::Receiver<Bytes>,
    mut filter: OutputFilter,
    mut transcript: Option<Transcript>,
    writer: ClientWriter,
) {
    while let Some(chunk) = output.recv().await {
        if let Some(t) = transcript.as_mut() {
            t.write(&chunk).await;
        }
        let sent = match filter.filter(&chunk) {
            Ok(text) if text.is_empty() => continue,
            Ok(std::borrow::Cow::Borrowed(_)) => writer.send_binary(chunk.clone()).await,
            Ok(std::borrow::Cow::Owned(text)) => writer.send_binary(text).await,
            Err(e) => writer.send_stderr(format!("{}\r\n", e)).await,
        };
        if sent.is_err() {
            debug!("client gone, dropping backend output");
            break;
        }
    }

    match filter.finish() {
        Ok(rest) if rest.is_empty() => {}
        Ok(rest) => {
            let _ = writer.send_binary(rest).await;
        }
        Err(e) => {
            let _ = writer.send_stderr(format!("{}\r\n", e)).await;
        }
    }
    if let Some(t) = transcript.as_mut() {
        t.flush().await;
    }
}

/// Blocking writer that hands chunks to an async consumer.
struct FrameWriter {
    tx: mpsc::Sender<Bytes>,
}

impl io::Write for FrameWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::Message;
    use termgate_core::transport::Frame;
    use termgate_test_utils::{FakeBackend, binary_payload, mock_client, stderr_text};

    fn gateway(config: GatewayConfig) -> Gateway {
        Gateway::new(config, Arc::new(CommandResolver::with_roots(Vec::new())))
    }

    fn plan(charset: &str, transcripts: Transcripts) -> SessionPlan {
        let params = RequestParams::from_pairs([("charset", charset)]);
        let (filter, encoder) = codecs(&params).unwrap();
        SessionPlan {
            size: TermSize::new(100, 40),
            command: None,
            filter,
            encoder,
            transcripts,
        }
    }

    #[test]
    fn route_paths() {
        let paths: Vec<String> = Route::ALL.iter().map(Route::path).collect();
        assert_eq!(
            paths,
            ["/ssh", "/ssh_exec", "/telnet", "/cmd", "/cmd2", "/shell", "/replay"]
        );
    }

    #[test]
    fn codecs_reject_unknown_charsets() {
        let params = RequestParams::from_pairs([("charset", "KOI8-R")]);
        assert!(matches!(codecs(&params), Err(Error::UnsupportedCharset(_))));
        assert!(codecs(&RequestParams::new()).is_ok());
    }

    #[tokio::test]
    async fn session_relays_both_directions() {
        let (backend, handle) = FakeBackend::new();
        let (mut conn, mut client) = mock_client(RequestParams::new());
        let (writer, writer_task) = ClientWriter::spawn(conn.sink);

        let serve = tokio::spawn(async move {
            let result = serve_session(
                Box::new(backend),
                plan("UTF-8", Transcripts::off()),
                conn.source.as_mut(),
                &writer,
            )
            .await;
            writer.close().await;
            let _ = writer_task.await;
            result
        });

        handle.emit(&b"banner\r\n"[..]);
        client.send_message(&Message::resize(40, 100));
        client.send_binary(&b"ls\r"[..]);
        let record = handle.wait_for_input(3).await;
        assert_eq!(record.input, b"ls\r");
        let record = handle.wait_until(|r| !r.resizes.is_empty()).await;
        assert_eq!(record.resizes, vec![TermSize::new(100, 40)]);
        assert_eq!(record.pty, Some(TermSize::new(100, 40)));

        handle.exit(0);
        serve.await.unwrap().unwrap();

        let frames = client.frames_until_closed().await;
        assert_eq!(binary_payload(&frames), b"banner\r\n");
        assert!(frames.iter().all(|f| stderr_text(f).is_none()));
        assert!(handle.record().close_calls > 0);
    }

    #[tokio::test]
    async fn session_output_is_transcoded() {
        let (backend, handle) = FakeBackend::new();
        let (mut conn, mut client) = mock_client(RequestParams::new());
        let (writer, writer_task) = ClientWriter::spawn(conn.sink);

        let serve = tokio::spawn(async move {
            let result = serve_session(
                Box::new(backend),
                plan("GB18030", Transcripts::off()),
                conn.source.as_mut(),
                &writer,
            )
            .await;
            writer.close().await;
            let _ = writer_task.await;
            result
        });

        // "中文" in GB18030, split inside the first character.
        handle.emit(&[0xD6u8][..]);
        handle.emit(&[0xD0u8, 0xCE, 0xC4][..]);
        handle.exit(0);
        serve.await.unwrap().unwrap();

        let frames = client.frames_until_closed().await;
        assert_eq!(binary_payload(&frames), "中文".as_bytes());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let (backend, handle) = FakeBackend::new();
        let (mut conn, mut client) = mock_client(RequestParams::new());
        let (writer, _writer_task) = ClientWriter::spawn(conn.sink);

        let serve = tokio::spawn(async move {
            serve_session(
                Box::new(backend),
                plan("UTF-8", Transcripts::off()),
                conn.source.as_mut(),
                &writer,
            )
            .await
        });
        handle.exit(2);
        serve.await.unwrap().unwrap();

        let frame = client.next_frame().await.unwrap();
        assert_eq!(stderr_text(&frame).as_deref(), Some("exit status 2\r\n"));
    }

    #[tokio::test]
    async fn client_hang_up_closes_backend() {
        let (backend, handle) = FakeBackend::new();
        let (mut conn, mut client) = mock_client(RequestParams::new());
        let (writer, _writer_task) = ClientWriter::spawn(conn.sink);

        let serve = tokio::spawn(async move {
            serve_session(
                Box::new(backend),
                plan("UTF-8", Transcripts::off()),
                conn.source.as_mut(),
                &writer,
            )
            .await
        });
        handle.wait_until(|r| r.started).await;
        client.hang_up();
        serve.await.unwrap().unwrap();
        assert!(handle.record().close_calls > 0);
    }

    #[tokio::test]
    async fn failed_pty_closes_backend() {
        let (backend, handle) = FakeBackend::new();
        let (mut conn, _client) = mock_client(RequestParams::new());
        let (writer, _writer_task) = ClientWriter::spawn(conn.sink);

        let err = serve_session(
            Box::new(backend.failing_pty()),
            plan("UTF-8", Transcripts::off()),
            conn.source.as_mut(),
            &writer,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::SessionStart { .. }));
        let record = handle.record();
        assert!(!record.started);
        assert!(record.close_calls > 0);
    }

    #[tokio::test]
    async fn transcripts_capture_raw_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let transcripts = Transcripts::open(dir.path(), "10.0.0.5", "ssh").await;
        let (backend, handle) = FakeBackend::new();
        let (mut conn, client) = mock_client(RequestParams::new());
        let (writer, _writer_task) = ClientWriter::spawn(conn.sink);

        let serve = tokio::spawn(async move {
            serve_session(
                Box::new(backend),
                plan("GB18030", transcripts),
                conn.source.as_mut(),
                &writer,
            )
            .await
        });
        handle.emit(&[0xD6u8, 0xD0][..]);
        client.send_binary(&b"pwd\r"[..]);
        handle.wait_for_input(4).await;
        handle.exit(0);
        serve.await.unwrap().unwrap();

        let out = std::fs::read(dir.path().join("10.0.0.5.dump_ssh_out.txt")).unwrap();
        let input = std::fs::read(dir.path().join("10.0.0.5.dump_ssh_in.txt")).unwrap();
        assert_eq!(out, [0xD6, 0xD0]);
        assert_eq!(input, b"pwd\r");
    }

    #[tokio::test]
    async fn missing_hostname_fails_before_dial() {
        let gw = gateway(GatewayConfig::default());
        let (conn, mut client) = mock_client(RequestParams::from_pairs([("user", "u")]));
        let err = gw.handle(Route::SshShell, conn).await.unwrap_err();
        assert!(matches!(err, Error::InvalidParam { ref name, .. } if name == "hostname"));

        let frame = client.next_frame().await.unwrap();
        assert!(stderr_text(&frame).unwrap().contains("hostname"));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn unsupported_charset_rejects_before_dial() {
        let gw = gateway(GatewayConfig::default());
        let params = RequestParams::from_pairs([
            // Nothing listens here; a dial attempt would fail differently.
            ("hostname", "127.0.0.1"),
            ("port", "1"),
            ("charset", "KOI8-R"),
        ]);
        let (conn, _client) = mock_client(params);
        let err = gw.handle(Route::Telnet, conn).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedCharset(_)));
    }

    #[tokio::test]
    async fn local_shell_is_off_by_default() {
        let gw = gateway(GatewayConfig::default());
        let (conn, _client) = mock_client(RequestParams::new());
        let err = gw.handle(Route::LocalShell, conn).await.unwrap_err();
        assert!(matches!(err, Error::SessionStart { .. }));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn exec_route_streams_output_and_exit_status() {
        let gw = gateway(GatewayConfig::default());
        let params = RequestParams::from_pairs([
            ("exec", "sh"),
            ("arg0", "-c"),
            ("arg1", "echo hello; exit 4"),
        ]);
        let (conn, mut client) = mock_client(params);
        gw.handle(Route::Exec, conn).await.unwrap();

        let frames = client.frames_until_closed().await;
        assert_eq!(binary_payload(&frames), b"hello\n");
        let last = frames.last().and_then(stderr_text);
        assert_eq!(last.as_deref(), Some("exit status 4\r\n"));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn exec_words_runs_inline_script() {
        let gw = gateway(GatewayConfig::default());
        let params = RequestParams::from_pairs([("exec", "sh -e"), ("file", "echo from script\n")]);
        let (conn, mut client) = mock_client(params);
        gw.handle(Route::ExecWords, conn).await.unwrap();

        let frames = client.frames_until_closed().await;
        assert_eq!(binary_payload(&frames), b"from script\n");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn exec_timeout_is_reported() {
        let gw = gateway(GatewayConfig::default());
        let params = RequestParams::from_pairs([
            ("exec", "sleep"),
            ("arg0", "30"),
            ("timeout", "200ms"),
        ]);
        let (conn, mut client) = mock_client(params);
        let err = gw.handle(Route::Exec, conn).await.unwrap_err();
        assert!(matches!(err, Error::TimeoutKill { .. }));

        let frames = client.frames_until_closed().await;
        let text = frames.last().and_then(stderr_text).unwrap();
        assert!(text.starts_with("process killed after"));
    }

    #[tokio::test]
    async fn replay_decodes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.dump_ssh_out.txt");
        std::fs::write(&path, [0xC4u8, 0xE3, 0xBA, 0xC3]).unwrap();

        let gw = gateway(GatewayConfig {
            log_dir: dir.path().to_path_buf(),
            ..GatewayConfig::default()
        });
        let params = RequestParams::from_pairs([
            ("file", "session.dump_ssh_out.txt".to_string()),
            ("charset", "GBK".to_string()),
        ]);
        let (conn, mut client) = mock_client(params);
        gw.handle(Route::Replay, conn).await.unwrap();

        let frames = client.frames_until_closed().await;
        assert_eq!(binary_payload(&frames), "你好".as_bytes());
    }

    #[tokio::test]
    async fn replay_accepts_absolute_path_inside_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"plain").unwrap();

        let gw = gateway(GatewayConfig {
            log_dir: dir.path().to_path_buf(),
            ..GatewayConfig::default()
        });
        let params = RequestParams::from_pairs([("file", path.display().to_string())]);
        let (conn, mut client) = mock_client(params);
        gw.handle(Route::Replay, conn).await.unwrap();
        assert_eq!(binary_payload(&client.frames_until_closed().await), b"plain");
    }

    #[tokio::test]
    async fn replay_stays_inside_log_dir() {
        let outer = tempfile::tempdir().unwrap();
        let logs = outer.path().join("logs");
        std::fs::create_dir(&logs).unwrap();
        let secret = outer.path().join("secret.txt");
        std::fs::write(&secret, b"do not show").unwrap();

        let gw = gateway(GatewayConfig {
            log_dir: logs.clone(),
            ..GatewayConfig::default()
        });
        for file in ["../secret.txt".to_string(), secret.display().to_string()] {
            let (conn, mut client) = mock_client(RequestParams::from_pairs([("file", file)]));
            let err = gw.handle(Route::Replay, conn).await.unwrap_err();
            assert!(matches!(err, Error::InvalidParam { ref name, .. } if name == "file"));
            let frames = client.frames_until_closed().await;
            assert!(binary_payload(&frames).is_empty());
            assert!(frames.iter().any(|f| stderr_text(f).is_some()));
        }
    }

    #[test]
    fn transcript_path_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"").unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(
            transcript_path(dir.path(), Path::new("x.txt")).unwrap(),
            root.join("x.txt")
        );
        assert!(matches!(
            transcript_path(dir.path(), Path::new("missing.txt")),
            Err(Error::Io(_))
        ));
        assert!(matches!(
            transcript_path(dir.path(), Path::new("/")),
            Err(Error::InvalidParam { .. })
        ));
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink("/etc/hostname", dir.path().join("link")).unwrap();
            assert!(matches!(
                transcript_path(dir.path(), Path::new("link")),
                Err(Error::InvalidParam { .. }) | Err(Error::Io(_))
            ));
        }
    }

    #[tokio::test]
    async fn replay_of_missing_file_fails() {
        let gw = gateway(GatewayConfig::default());
        let params = RequestParams::from_pairs([("file", "/nonexistent/termgate.txt")]);
        let (conn, mut client) = mock_client(params);
        let err = gw.handle(Route::Replay, conn).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        let frame = client.next_frame().await.unwrap();
        assert!(stderr_text(&frame).is_some());
        assert!(!matches!(frame, Frame::Binary(_)));
    }
}

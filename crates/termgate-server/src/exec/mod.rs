//! Local process executor.
//!
//! Runs one external command per request, relays its combined stdout and
//! stderr as raw bytes, optionally feeds it client input, and kills it when
//! the request timeout expires or the client goes away.

mod resolver;

pub use resolver::CommandResolver;

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::Permit;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use termgate_core::constants::{
    CONNECTION_ABANDONED_MARKER, OUTPUT_BUFFER_SIZE, OUTPUT_DRAIN_GRACE, SESSION_KEY_TIMEOUT,
};
use termgate_core::session::{BackendChannels, BackendCommand};
use termgate_core::{Error, RequestParams, Result};

// =============================================================================
// Request
// =============================================================================

/// One local command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Wire client input to the child's stdin.
    pub stdin: bool,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            stdin: false,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `exec` names the program, `arg0..argN` its arguments.
    pub fn from_params(params: &RequestParams, default_timeout: Duration) -> Result<Self> {
        let program = params.get("exec");
        if program.is_empty() {
            return Err(missing_exec());
        }
        let mut req = Self::new(program, default_timeout);
        req.args = params.positional_args();
        req.apply_common(params, default_timeout);
        Ok(req)
    }

    /// `exec` is a whole command line split with shell-word rules; any
    /// `argN` values follow the split words.
    pub fn from_command_line(params: &RequestParams, default_timeout: Duration) -> Result<Self> {
        let words = shell_words::split(params.get("exec")).map_err(|e| Error::InvalidParam {
            name: "exec".into(),
            message: e.to_string(),
        })?;
        let mut words = words.into_iter();
        let program = words.next().ok_or_else(missing_exec)?;
        let mut req = Self::new(program, default_timeout);
        req.args = words.collect();
        req.args.extend(params.positional_args());
        req.apply_common(params, default_timeout);
        Ok(req)
    }

    fn apply_common(&mut self, params: &RequestParams, default_timeout: Duration) {
        let wd = params.get("wd");
        if !wd.is_empty() {
            self.dir = Some(PathBuf::from(wd));
        }
        self.stdin = params.stdin_enabled();
        self.timeout = params.timeout(default_timeout);
    }

    /// Write `content` to a temporary file and append its path as the last
    /// argument. The file is removed when the returned guard drops.
    pub fn attach_script(&mut self, content: &str) -> Result<tempfile::TempPath> {
        let mut file = tempfile::Builder::new().prefix("run").tempfile()?;
        io::Write::write_all(&mut file, content.as_bytes())?;
        let path = file.into_temp_path();
        self.args.push(path.display().to_string());
        Ok(path)
    }
}

fn missing_exec() -> Error {
    Error::InvalidParam {
        name: "exec".into(),
        message: "no command given".into(),
    }
}

// =============================================================================
// Output matching
// =============================================================================

/// Watches a byte stream for a literal pattern, across chunk boundaries.
#[derive(Debug, Clone)]
pub struct OutputMatcher {
    pattern: Vec<u8>,
    tail: Vec<u8>,
    matched: bool,
}

impl OutputMatcher {
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            tail: Vec::new(),
            matched: false,
        }
    }

    /// Feed the next chunk; returns whether the pattern has been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        if self.matched || self.pattern.is_empty() {
            return self.matched;
        }
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(chunk);
        if window
            .windows(self.pattern.len())
            .any(|w| w == self.pattern.as_slice())
        {
            self.matched = true;
            return true;
        }
        let keep = window.len().saturating_sub(self.pattern.len() - 1);
        window.drain(..keep);
        self.tail = window;
        false
    }

    pub fn matched(&self) -> bool {
        self.matched
    }
}

// =============================================================================
// Session key persistence
// =============================================================================

/// When a remote-login client refuses an unknown host key, re-run it once
/// with affirmative answers so the key is cached for the next run.
#[derive(Debug, Clone)]
pub struct SessionKeyPolicy {
    /// Lowercased suffixes of the resolved program path.
    pub program_names: Vec<String>,
    pub marker: String,
    /// Bytes fed to the re-run's stdin.
    pub answers: Vec<u8>,
    pub timeout: Duration,
}

impl Default for SessionKeyPolicy {
    fn default() -> Self {
        Self {
            program_names: vec!["plink".into(), "plink.exe".into()],
            marker: CONNECTION_ABANDONED_MARKER.into(),
            answers: b"y\n".repeat(8),
            timeout: SESSION_KEY_TIMEOUT,
        }
    }
}

impl SessionKeyPolicy {
    pub fn disabled() -> Self {
        Self {
            program_names: Vec::new(),
            ..Self::default()
        }
    }

    pub fn applies_to(&self, program: &str) -> bool {
        let program = program.to_ascii_lowercase();
        self.program_names.iter().any(|n| program.ends_with(n.as_str()))
    }

    pub fn matcher(&self) -> OutputMatcher {
        OutputMatcher::new(self.marker.as_bytes())
    }

    /// Arguments for the re-run: the original ones without `-batch`.
    pub fn rerun_args(args: &[String]) -> Vec<String> {
        args.iter()
            .filter(|a| !a.eq_ignore_ascii_case("-batch"))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Executor
// =============================================================================

/// How a command run ended.
#[derive(Debug, Default)]
pub struct ExecReport {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// The client closed the session before the process exited.
    pub cancelled: bool,
    /// Detached session-key re-run, if one was started.
    pub session_key: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    resolver: Arc<CommandResolver>,
    sh_execute: Option<String>,
    mibs_dir: Option<String>,
    session_key: SessionKeyPolicy,
}

impl Executor {
    pub fn new(resolver: Arc<CommandResolver>) -> Self {
        Self {
            resolver,
            sh_execute: None,
            mibs_dir: None,
            session_key: SessionKeyPolicy::default(),
        }
    }

    /// Helper used to re-run a command that failed with a permission error.
    pub fn with_sh_execute(mut self, helper: Option<String>) -> Self {
        self.sh_execute = helper.filter(|h| !h.is_empty());
        self
    }

    pub fn with_mibs_dir(mut self, dir: Option<String>) -> Self {
        self.mibs_dir = dir.filter(|d| !d.is_empty());
        self
    }

    pub fn with_session_key(mut self, policy: SessionKeyPolicy) -> Self {
        self.session_key = policy;
        self
    }

    /// Resolved program and final argument list.
    pub fn prepare(&self, req: &ExecRequest) -> (String, Vec<String>) {
        let mut args = req.args.clone();
        let name = req.program.as_str();
        if name.starts_with("snmp") {
            if let Some(mibs) = &self.mibs_dir {
                if !args.iter().any(|a| a == "-M") {
                    args.splice(0..0, ["-M".to_string(), mibs.clone()]);
                }
            }
        } else if cfg!(windows) && (name == "tpt" || name == "tpt.exe") {
            args.insert(0, "-gbk=true".into());
        }
        (self.resolver.resolve(name), args)
    }

    /// Run `req` to completion, relaying output into `channels.output` and
    /// serving commands from `channels.commands`.
    ///
    /// Timeouts and client cancellation are outcomes, not errors; only a
    /// failure to start the process is.
    pub async fn run(&self, req: ExecRequest, channels: BackendChannels) -> Result<ExecReport> {
        let (program, args) = self.prepare(&req);
        info!(program, ?args, dir = ?req.dir, timeout = ?req.timeout, "exec");
        let mut child = self.spawn(&program, &args, &req)?;

        let BackendChannels {
            mut commands,
            output,
        } = channels;
        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut out_buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let mut err_buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        let mut matcher = self
            .session_key
            .applies_to(&program)
            .then(|| self.session_key.matcher());

        let kill_at = Instant::now().checked_add(req.timeout);
        let mut report = ExecReport::default();
        let mut commands_open = true;
        // At most one chunk waits for the client; reads pause until it is
        // taken so a stalled client throttles the child, not the timer.
        let mut pending: Option<Bytes> = None;
        let mut output_open = true;

        let status = loop {
            tokio::select! {
                res = child.wait() => break res?,
                permit = output.reserve(), if pending.is_some() => {
                    deliver(permit, &mut pending, &mut output_open);
                }
                n = read_some(&mut stdout, &mut out_buf), if stdout.is_some() && pending.is_none() => match n {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => pending = capture(&mut matcher, &out_buf[..n], output_open),
                },
                n = read_some(&mut stderr, &mut err_buf), if stderr.is_some() && pending.is_none() => match n {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => pending = capture(&mut matcher, &err_buf[..n], output_open),
                },
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(BackendCommand::Write { data, reply }) => {
                        let _ = reply.send(write_stdin(&mut stdin, &data).await);
                    }
                    // Local commands have no pty.
                    Some(BackendCommand::Resize { reply, .. }) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(BackendCommand::Close) | None => {
                        debug!(program, "client closed, killing process");
                        let _ = child.start_kill();
                        report.cancelled = true;
                        commands_open = false;
                    }
                },
                _ = deadline(kill_at), if !report.timed_out => {
                    warn!(program, timeout = ?req.timeout, "timeout, killing process");
                    // The process may already be gone.
                    let _ = child.start_kill();
                    report.timed_out = true;
                }
            }
        };
        drop(stdin);

        // Output may still be buffered in the pipes after exit.
        let drain = async {
            loop {
                tokio::select! {
                    permit = output.reserve(), if pending.is_some() => {
                        deliver(permit, &mut pending, &mut output_open);
                    }
                    n = read_some(&mut stdout, &mut out_buf), if stdout.is_some() && pending.is_none() => match n {
                        Ok(0) | Err(_) => stdout = None,
                        Ok(n) => pending = capture(&mut matcher, &out_buf[..n], output_open),
                    },
                    n = read_some(&mut stderr, &mut err_buf), if stderr.is_some() && pending.is_none() => match n {
                        Ok(0) | Err(_) => stderr = None,
                        Ok(n) => pending = capture(&mut matcher, &err_buf[..n], output_open),
                    },
                    else => break,
                }
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await.is_err() {
            debug!(program, "output still open after exit");
        }

        report.exit_code = status.code();
        info!(program, %status, timed_out = report.timed_out, "exec finished");

        if matcher.as_ref().is_some_and(OutputMatcher::matched) {
            report.session_key = Some(self.persist_session_key(program, args, req.dir));
        }
        Ok(report)
    }

    fn spawn(&self, program: &str, args: &[String], req: &ExecRequest) -> Result<Child> {
        match command(program, args, req).spawn() {
            Ok(child) => Ok(child),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && !cfg!(windows) => {
                let Some(helper) = self.sh_execute.as_deref() else {
                    return Err(start_error(program, e));
                };
                warn!(program, helper, "permission denied, retrying through helper");
                let mut helper_args = Vec::with_capacity(args.len() + 1);
                helper_args.push(program.to_string());
                helper_args.extend_from_slice(args);
                command(helper, &helper_args, req)
                    .spawn()
                    .map_err(|e| start_error(helper, e))
            }
            Err(e) => Err(start_error(program, e)),
        }
    }

    fn persist_session_key(
        &self,
        program: String,
        args: Vec<String>,
        dir: Option<PathBuf>,
    ) -> JoinHandle<()> {
        let policy = self.session_key.clone();
        tokio::spawn(async move {
            let args = SessionKeyPolicy::rerun_args(&args);
            info!(program, ?args, "persisting session key");
            let mut cmd = Command::new(&program);
            cmd.args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = &dir {
                cmd.current_dir(dir);
            }
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!(program, error = %e, "session key re-run failed to start");
                    return;
                }
            };
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(&policy.answers).await;
            }
            match tokio::time::timeout(policy.timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(program, %status, "session key re-run finished"),
                Ok(Err(e)) => warn!(program, error = %e, "session key re-run wait failed"),
                Err(_) => {
                    warn!(program, "session key re-run timed out");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        })
    }
}

fn command(program: &str, args: &[String], req: &ExecRequest) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if req.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = req.dir.as_deref().filter(|d| !d.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    cmd
}

fn start_error(program: &str, e: io::Error) -> Error {
    Error::ProcessStart {
        message: format!("{}: {}", program, e),
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Feed the matcher and copy `chunk` out, unless the client is gone.
fn capture(matcher: &mut Option<OutputMatcher>, chunk: &[u8], output_open: bool) -> Option<Bytes> {
    if let Some(m) = matcher.as_mut() {
        m.feed(chunk);
    }
    output_open.then(|| Bytes::copy_from_slice(chunk))
}

fn deliver(
    permit: std::result::Result<Permit<'_, Bytes>, SendError<()>>,
    pending: &mut Option<Bytes>,
    output_open: &mut bool,
) {
    match permit {
        Ok(permit) => {
            if let Some(chunk) = pending.take() {
                permit.send(chunk);
            }
        }
        Err(_) => {
            debug!("output receiver gone, discarding process output");
            *pending = None;
            *output_open = false;
        }
    }
}

// Input is dropped when stdin is not wired.
async fn write_stdin(stdin: &mut Option<ChildStdin>, data: &[u8]) -> Result<()> {
    let Some(pipe) = stdin.as_mut() else {
        return Ok(());
    };
    pipe.write_all(data).await?;
    pipe.flush().await?;
    Ok(())
}

//! Local pty backend.
//!
//! Runs a shell or `sh -c <command>` on a pseudo-terminal of this host.
//! The master side is driven through `AsyncFd`, so reads and writes wait
//! on the reactor instead of polling.

use std::ffi::CString;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nix::errno::Errno;
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, close, dup2, execvp, fork, setsid};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use termgate_core::constants::{OUTPUT_BUFFER_SIZE, TERM_TYPE};
use termgate_core::session::{BackendChannels, BackendCommand};
use termgate_core::{Error, Result, SessionBackend, TermSize};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

fn pty_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Pty {
        message: format!("{}: {}", what, e),
    }
}

fn winsize(size: TermSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// A child process attached to the slave side of a pty.
pub struct Pty {
    master: AsyncFd<std::fs::File>,
    child: Pid,
}

impl Pty {
    /// Fork `argv` onto a new pty of the given size.
    pub fn spawn(size: TermSize, argv: &[String], env: &[(String, String)]) -> Result<Self> {
        let args = argv
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| pty_error("invalid argument", e))?;
        let Some(program) = args.first().cloned() else {
            return Err(pty_error("spawn", "empty command line"));
        };
        let env = env.to_vec();

        let pair = openpty(&winsize(size), None).map_err(|e| pty_error("openpty", e))?;

        // SAFETY: the child only calls async-signal-safe functions and
        // setenv before exec, and exits without unwinding on any failure.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(pair.slave);
                let master: OwnedFd = pair.master;
                set_nonblocking(master.as_raw_fd())?;
                let master = AsyncFd::new(std::fs::File::from(master))
                    .map_err(|e| pty_error("register pty", e))?;
                info!(pid = child.as_raw(), command = %argv.join(" "), "local pty spawned");
                Ok(Self { master, child })
            }
            Ok(ForkResult::Child) => {
                let slave = pair.slave.as_raw_fd();
                let ok = setsid().is_ok()
                    && unsafe { libc::ioctl(slave, libc::TIOCSCTTY as _, 0) } != -1
                    && dup2(slave, libc::STDIN_FILENO).is_ok()
                    && dup2(slave, libc::STDOUT_FILENO).is_ok()
                    && dup2(slave, libc::STDERR_FILENO).is_ok();
                if !ok {
                    unsafe { libc::_exit(126) };
                }
                if slave > libc::STDERR_FILENO {
                    let _ = close(slave);
                }
                let _ = close(pair.master.as_raw_fd());

                // SAFETY: single-threaded child before exec.
                unsafe { std::env::set_var("TERM", TERM_TYPE) };
                for (key, value) in &env {
                    unsafe { std::env::set_var(key, value) };
                }

                let _ = execvp(&program, &args);
                unsafe { libc::_exit(127) }
            }
            Err(e) => Err(pty_error("fork", e)),
        }
    }

    pub fn pid(&self) -> Pid {
        self.child
    }

    /// Set the window size (TIOCSWINSZ); the child gets SIGWINCH.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        let ws = winsize(size);
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc == -1 {
            return Err(pty_error("resize", std::io::Error::last_os_error()));
        }
        debug!(%size, "pty resized");
        Ok(())
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self
                .master
                .writable()
                .await
                .map_err(|e| pty_error("wait writable", e))?;
            match guard.try_io(|inner| inner.get_ref().write(remaining)) {
                Ok(Ok(n)) => remaining = &remaining[n..],
                Ok(Err(e)) => return Err(pty_error("write", e)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Read output; `None` once the slave side is gone.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            let mut guard = self
                .master
                .readable()
                .await
                .map_err(|e| pty_error("wait readable", e))?;
            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => return Ok(Some(n)),
                // Linux reports EIO once the last slave fd is closed.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(None),
                Ok(Err(e)) => return Err(pty_error("read", e)),
                Err(_would_block) => continue,
            }
        }
    }

    pub fn try_wait(&self) -> Result<Option<u32>> {
        match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(exit_code(status)),
            Err(Errno::ECHILD) => Ok(Some(0)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(pty_error("waitpid", e)),
        }
    }

    /// Poll until the child exits. Dropping the future leaves nothing
    /// behind.
    pub async fn wait(&self) -> Result<u32> {
        loop {
            match self.try_wait()? {
                Some(code) => return Ok(code),
                None => tokio::time::sleep(CHILD_POLL_INTERVAL).await,
            }
        }
    }

    pub fn kill(&self) -> Result<()> {
        kill(self.child, Signal::SIGHUP).map_err(|e| pty_error("kill", e))
    }
}

fn exit_code(status: WaitStatus) -> Option<u32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code as u32),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as u32),
        _ => None,
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if matches!(self.try_wait(), Ok(None)) {
            let _ = self.kill();
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};

    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| pty_error("F_GETFL", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| pty_error("F_SETFL", e))?;
    Ok(())
}

/// [`SessionBackend`] on a local pty.
pub struct LocalPtyBackend {
    shell: String,
    env: Vec<(String, String)>,
    size: Option<TermSize>,
}

impl LocalPtyBackend {
    /// Shell used when no command is given: `shell`, else `$SHELL`, else
    /// `/bin/sh`.
    pub fn new(shell: Option<String>) -> Self {
        let shell = shell
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self {
            shell,
            env: Vec::new(),
            size: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn argv(&self, command: Option<String>) -> Vec<String> {
        match command {
            Some(cmd) => vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
            None if self.shell.ends_with("bash") || self.shell.ends_with("zsh") => {
                vec![self.shell.clone(), "-l".to_string()]
            }
            None => vec![self.shell.clone()],
        }
    }
}

#[async_trait]
impl SessionBackend for LocalPtyBackend {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn request_pty(&mut self, size: TermSize) -> Result<()> {
        self.size = Some(size);
        Ok(())
    }

    async fn start(
        &mut self,
        command: Option<String>,
        channels: BackendChannels,
    ) -> Result<JoinHandle<Result<u32>>> {
        let size = self.size.ok_or_else(|| Error::InvalidState {
            expected: "pty requested".into(),
            actual: "no pty".into(),
        })?;
        let pty = Pty::spawn(size, &self.argv(command), &self.env).map_err(|e| {
            Error::SessionStart {
                message: e.to_string(),
            }
        })?;
        Ok(tokio::spawn(relay(Arc::new(pty), channels)))
    }

    async fn close(&mut self) {}
}

async fn relay(pty: Arc<Pty>, channels: BackendChannels) -> Result<u32> {
    let BackendChannels {
        mut commands,
        output,
    } = channels;

    let reader = pty.clone();
    let mut output_task = tokio::spawn(async move {
        let mut buf = vec![0u8; OUTPUT_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(Some(n)) => {
                    if output.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        debug!("pty output receiver gone");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "pty read failed");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(BackendCommand::Write { data, reply }) => {
                    let _ = reply.send(pty.write(&data).await);
                }
                Some(BackendCommand::Resize { size, reply }) => {
                    let _ = reply.send(pty.resize(size));
                }
                Some(BackendCommand::Close) | None => {
                    let _ = pty.kill();
                    output_task.abort();
                    return Err(Error::ConnectionClosed);
                }
            },
            _ = &mut output_task => break,
        }
    }

    let code = pty.wait().await?;
    info!(pid = pty.pid().as_raw(), code, "local pty exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::SessionState;
    use termgate_core::session::wire;
    use tokio::sync::watch;

    async fn collect(mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[tokio::test]
    async fn command_output_and_exit_code() {
        let mut backend = LocalPtyBackend::new(Some("/bin/sh".into()));
        backend.request_pty(TermSize::new(80, 24)).await.unwrap();

        let (_state_tx, state_rx) = watch::channel(SessionState::Running);
        let (streams, channels) = wire(state_rx);
        let task = match backend
            .start(Some("printf pty-ok; exit 3".into()), channels)
            .await
        {
            Ok(task) => task,
            Err(e) => {
                eprintln!("pty spawn failed (may be expected in CI): {}", e);
                return;
            }
        };

        let output = collect(streams.output).await;
        assert!(String::from_utf8_lossy(&output).contains("pty-ok"));
        assert_eq!(task.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn resize_reaches_the_terminal() {
        let Ok(pty) = Pty::spawn(
            TermSize::new(80, 24),
            &["/bin/sh".into(), "-c".into(), "sleep 5".into()],
            &[],
        ) else {
            return;
        };
        pty.resize(TermSize::new(132, 43)).unwrap();
        pty.kill().unwrap();
        assert_eq!(pty.wait().await.unwrap(), 128 + Signal::SIGHUP as u32);
    }

    #[tokio::test]
    async fn abandoned_wait_leaves_child_reapable() {
        let Ok(pty) = Pty::spawn(
            TermSize::new(80, 24),
            &["/bin/sh".into(), "-c".into(), "sleep 30".into()],
            &[],
        ) else {
            return;
        };
        let waited = tokio::time::timeout(Duration::from_millis(200), pty.wait()).await;
        assert!(waited.is_err());
        assert_eq!(pty.try_wait().unwrap(), None);

        pty.kill().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), pty.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, 128 + Signal::SIGHUP as u32);
    }

    #[test]
    fn argv_for_shell_and_command() {
        let backend = LocalPtyBackend::new(Some("/bin/bash".into()));
        assert_eq!(backend.argv(None), vec!["/bin/bash", "-l"]);
        assert_eq!(
            backend.argv(Some("ls -l".into())),
            vec!["/bin/sh", "-c", "ls -l"]
        );
        assert_eq!(
            LocalPtyBackend::new(Some("/bin/sh".into())).argv(None),
            vec!["/bin/sh"]
        );
    }
}

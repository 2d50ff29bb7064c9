//! Minimal telnet client backend.
//!
//! Line-mode I/O plus window-size signalling (NAWS, RFC 1073). Every other
//! option the server offers is refused.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use termgate_core::constants::OUTPUT_BUFFER_SIZE;
use termgate_core::session::{BackendChannels, BackendCommand};
use termgate_core::{DialStage, DialTarget, Error, Result, SessionBackend, TermSize};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

pub const OPT_ECHO: u8 = 1;
pub const OPT_SGA: u8 = 3;
pub const OPT_NAWS: u8 = 31;

/// What the client must send back after decoding server bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// `IAC <verb> <option>`.
    Option(u8, u8),
    /// `IAC WILL NAWS` followed by the current window size.
    AcceptNaws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

/// Strips telnet commands out of the server stream.
#[derive(Debug)]
pub struct TelnetCodec {
    state: State,
}

impl Default for TelnetCodec {
    fn default() -> Self {
        Self { state: State::Data }
    }
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `input`, appending terminal bytes to `data` and required
    /// answers to `replies`. Commands split across calls are carried over.
    pub fn decode(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<Reply>) {
        for &b in input {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, b) => {
                    data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, DO | DONT | WILL | WONT) => State::Option(b),
                (State::Iac, SB) => State::Sub,
                (State::Iac, _) => State::Data,
                (State::Option(verb), option) => {
                    if let Some(reply) = answer(verb, option) {
                        replies.push(reply);
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
    }
}

fn answer(verb: u8, option: u8) -> Option<Reply> {
    match (verb, option) {
        (DO, OPT_NAWS) => Some(Reply::AcceptNaws),
        (DO, opt) => Some(Reply::Option(WONT, opt)),
        (WILL, OPT_ECHO | OPT_SGA) => Some(Reply::Option(DO, option)),
        (WILL, opt) => Some(Reply::Option(DONT, opt)),
        // DONT/WONT need no answer from a client that offered nothing.
        _ => None,
    }
}

/// `IAC SB NAWS <cols:u16> <rows:u16> IAC SE`, with 0xFF doubled.
pub fn naws(size: TermSize) -> Vec<u8> {
    let mut out = vec![IAC, SB, OPT_NAWS];
    for b in size
        .cols
        .to_be_bytes()
        .into_iter()
        .chain(size.rows.to_be_bytes())
    {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out.extend_from_slice(&[IAC, SE]);
    out
}

/// Double every 0xFF so it is sent as data.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

fn render(reply: Reply, size: TermSize) -> Vec<u8> {
    match reply {
        Reply::Option(verb, opt) => vec![IAC, verb, opt],
        Reply::AcceptNaws => {
            let mut out = vec![IAC, WILL, OPT_NAWS];
            out.extend(naws(size));
            out
        }
    }
}

/// [`SessionBackend`] over a telnet TCP connection.
pub struct TelnetBackend {
    stream: Option<TcpStream>,
    size: TermSize,
}

impl TelnetBackend {
    /// Connect to `host:port` within `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let dial_error = |message: String| Error::DialFailed {
            target: DialTarget::End,
            stage: DialStage::Dial,
            message,
        };
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| dial_error(format!("timed out after {:?}", timeout)))?
            .map_err(|e| dial_error(e.to_string()))?;
        info!(host, port, "telnet connected");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            size: TermSize::new(80, 24),
        }
    }
}

#[async_trait]
impl SessionBackend for TelnetBackend {
    fn kind(&self) -> &'static str {
        "telnet"
    }

    async fn request_pty(&mut self, size: TermSize) -> Result<()> {
        self.size = size;
        Ok(())
    }

    async fn start(
        &mut self,
        command: Option<String>,
        channels: BackendChannels,
    ) -> Result<JoinHandle<Result<u32>>> {
        if command.is_some() {
            return Err(Error::SessionStart {
                message: "telnet sessions cannot run a command".into(),
            });
        }
        let stream = self.stream.take().ok_or(Error::ConnectionClosed)?;
        Ok(tokio::spawn(run(stream, self.size, channels)))
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

async fn run(stream: TcpStream, size: TermSize, channels: BackendChannels) -> Result<u32> {
    let BackendChannels { commands, output } = channels;
    let (mut rd, wr) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel(16);
    let mut writer = tokio::spawn(write_loop(wr, size, commands, reply_rx));

    let mut codec = TelnetCodec::new();
    let mut buf = vec![0u8; OUTPUT_BUFFER_SIZE];
    let mut data = Vec::new();
    let mut replies = Vec::new();

    loop {
        tokio::select! {
            read = rd.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        writer.abort();
                        return Err(e.into());
                    }
                };
                codec.decode(&buf[..n], &mut data, &mut replies);
                for reply in replies.drain(..) {
                    trace!(?reply, "telnet negotiation");
                    let _ = reply_tx.send(reply).await;
                }
                if !data.is_empty() {
                    let _ = output.send(Bytes::from(std::mem::take(&mut data))).await;
                }
            }
            _ = &mut writer => return Err(Error::ConnectionClosed),
        }
    }

    debug!("telnet server closed the connection");
    writer.abort();
    Ok(0)
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut size: TermSize,
    mut commands: mpsc::Receiver<BackendCommand>,
    mut replies: mpsc::Receiver<Reply>,
) {
    loop {
        // Negotiation answers go out before any queued input.
        tokio::select! {
            biased;
            Some(reply) = replies.recv() => {
                if wr.write_all(&render(reply, size)).await.is_err() {
                    return;
                }
            }
            cmd = commands.recv() => match cmd {
                Some(BackendCommand::Write { data, reply }) => {
                    let result = wr.write_all(&escape(&data)).await.map_err(Error::from);
                    let failed = result.is_err();
                    let _ = reply.send(result);
                    if failed {
                        return;
                    }
                }
                Some(BackendCommand::Resize { size: new_size, reply }) => {
                    size = new_size;
                    let _ = reply.send(wr.write_all(&naws(size)).await.map_err(Error::from));
                }
                Some(BackendCommand::Close) | None => {
                    let _ = wr.shutdown().await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::SessionState;
    use termgate_core::session::wire;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    fn decode_all(chunks: &[&[u8]]) -> (Vec<u8>, Vec<Reply>) {
        let mut codec = TelnetCodec::new();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        for chunk in chunks {
            codec.decode(chunk, &mut data, &mut replies);
        }
        (data, replies)
    }

    #[test]
    fn strips_commands_and_unescapes_iac() {
        let (data, replies) = decode_all(&[&[b'a', IAC, IAC, b'b', IAC, 241, b'c']]);
        assert_eq!(data, vec![b'a', 0xFF, b'b', b'c']);
        assert!(replies.is_empty());
    }

    #[test]
    fn negotiation_answers() {
        let (data, replies) = decode_all(&[&[
            IAC, DO, OPT_NAWS, IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA, IAC, DO, 24, IAC, WILL,
            42, IAC, DONT, 1, b'>',
        ]]);
        assert_eq!(data, b">");
        assert_eq!(
            replies,
            vec![
                Reply::AcceptNaws,
                Reply::Option(DO, OPT_ECHO),
                Reply::Option(DO, OPT_SGA),
                Reply::Option(WONT, 24),
                Reply::Option(DONT, 42),
            ]
        );
    }

    #[test]
    fn commands_split_across_reads() {
        let (data, replies) = decode_all(&[&[b'x', IAC], &[DO], &[OPT_NAWS, b'y']]);
        assert_eq!(data, b"xy");
        assert_eq!(replies, vec![Reply::AcceptNaws]);
    }

    #[test]
    fn subnegotiation_is_skipped() {
        let (data, _) = decode_all(&[&[IAC, SB, 24, 1, IAC, IAC, 7], &[IAC, SE, b'z']]);
        assert_eq!(data, b"z");
    }

    #[test]
    fn naws_doubles_iac_bytes() {
        assert_eq!(
            naws(TermSize::new(80, 40)),
            vec![IAC, SB, OPT_NAWS, 0, 80, 0, 40, IAC, SE]
        );
        assert_eq!(
            naws(TermSize::new(255, 24)),
            vec![IAC, SB, OPT_NAWS, 0, 255, 255, 0, 24, IAC, SE]
        );
    }

    #[test]
    fn escape_doubles_iac() {
        assert_eq!(escape(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
    }

    #[tokio::test]
    async fn session_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&[IAC, DO, OPT_NAWS]).await.unwrap();
            sock.write_all(b"login: ").await.unwrap();

            let mut expected = vec![IAC, WILL, OPT_NAWS];
            expected.extend(naws(TermSize::new(80, 40)));
            expected.extend_from_slice(b"root\r\n");
            let mut got = vec![0u8; expected.len()];
            sock.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
            // Server hangs up.
        });

        let mut backend = TelnetBackend::connect("127.0.0.1", addr.port(), Duration::from_secs(5))
            .await
            .unwrap();
        backend.request_pty(TermSize::new(80, 40)).await.unwrap();
        let (_state_tx, state_rx) = watch::channel(SessionState::Running);
        let (mut streams, channels) = wire(state_rx);
        let task = backend.start(None, channels).await.unwrap();

        assert_eq!(streams.output.recv().await.unwrap(), Bytes::from_static(b"login: "));
        streams.input.write(&b"root\r\n"[..]).await.unwrap();

        server.await.unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn refused_connection_is_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TelnetBackend::connect("127.0.0.1", port, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::DialFailed {
                target: DialTarget::End,
                stage: DialStage::Dial,
                ..
            }
        ));
    }
}

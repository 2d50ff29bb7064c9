//! User authentication against an SSH server.
//!
//! Methods from the host's [`AuthMethod`] list are tried in order until
//! one is accepted. Keyboard-interactive prompts that are not password
//! prompts are relayed to the client through a [`Prompter`].

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use tracing::{debug, info, warn};

use termgate_core::constants::MAX_EMPTY_INTERACTIVE_ROUNDS;
use termgate_core::protocol::{Message, MessageType};
use termgate_core::transport::{ClientWriter, Frame, FrameSource};
use termgate_core::{Error, Result};

use super::config::{AuthMethod, HostConfig};

/// Interactive channel to the person behind the connection.
#[async_trait]
pub trait Prompter: Send {
    /// Show prompt text.
    async fn show(&mut self, text: &str) -> Result<()>;

    /// Block for one line of input, without its terminator.
    async fn read_line(&mut self) -> Result<String>;
}

/// Only the bare prompts are answered with the stored password.
fn is_password_prompt(prompt: &str) -> bool {
    matches!(
        prompt.trim().to_ascii_lowercase().as_str(),
        "password:" | "password as"
    )
}

/// Answers keyboard-interactive rounds.
pub struct InteractiveResponder<'a> {
    password: String,
    password_used: bool,
    empty_rounds: u32,
    prompter: &'a mut dyn Prompter,
}

impl<'a> InteractiveResponder<'a> {
    pub fn new(password: impl Into<String>, prompter: &'a mut dyn Prompter) -> Self {
        Self {
            password: password.into(),
            password_used: false,
            empty_rounds: 0,
            prompter,
        }
    }

    /// Answer one round of questions.
    ///
    /// The first password prompt gets the configured password; every other
    /// prompt is shown to the client and answered with one line of its
    /// input. Rounds without questions are answered empty, up to
    /// [`MAX_EMPTY_INTERACTIVE_ROUNDS`] in a row.
    pub async fn respond(&mut self, instructions: &str, questions: &[String]) -> Result<Vec<String>> {
        if questions.is_empty() {
            self.empty_rounds += 1;
            if self.empty_rounds > MAX_EMPTY_INTERACTIVE_ROUNDS {
                return Err(Error::InteractiveLoop {
                    rounds: self.empty_rounds,
                });
            }
            return Ok(Vec::new());
        }
        self.empty_rounds = 0;

        if !instructions.is_empty() {
            self.prompter.show(&format!("{}\r\n", instructions)).await?;
        }

        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            if !self.password_used && !self.password.is_empty() && is_password_prompt(question) {
                self.password_used = true;
                answers.push(self.password.clone());
                continue;
            }
            self.prompter.show(question).await?;
            answers.push(self.prompter.read_line().await?);
        }
        Ok(answers)
    }
}

/// [`Prompter`] backed by the client connection.
///
/// Prompts go out as binary frames, like terminal output. Input may arrive
/// as binary frames, `stdin` messages or bare text; a line ends at CR or
/// LF. Resize messages are ignored while authenticating.
pub struct ClientPrompter<'a> {
    source: &'a mut dyn FrameSource,
    writer: ClientWriter,
    pending: Vec<u8>,
    skip_lf: bool,
}

impl<'a> ClientPrompter<'a> {
    pub fn new(source: &'a mut dyn FrameSource, writer: ClientWriter) -> Self {
        Self {
            source,
            writer,
            pending: Vec::new(),
            skip_lf: false,
        }
    }

    fn take_line(&mut self) -> Option<String> {
        if self.skip_lf && !self.pending.is_empty() {
            if self.pending[0] == b'\n' {
                self.pending.remove(0);
            }
            self.skip_lf = false;
        }
        let end = self.pending.iter().position(|&b| b == b'\r' || b == b'\n')?;
        self.skip_lf = self.pending[end] == b'\r';
        let line: Vec<u8> = self.pending.drain(..=end).take(end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[async_trait]
impl Prompter for ClientPrompter<'_> {
    async fn show(&mut self, text: &str) -> Result<()> {
        self.writer
            .send_binary(Bytes::copy_from_slice(text.as_bytes()))
            .await
    }

    async fn read_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }
            match self.source.recv().await {
                None => return Err(Error::ConnectionClosed),
                Some(Err(e)) => return Err(e),
                Some(Ok(Frame::Binary(data))) => self.pending.extend_from_slice(&data),
                Some(Ok(Frame::Text(text))) => match Message::parse(&text) {
                    Ok(msg) if msg.kind == MessageType::Stdin => {
                        self.pending.extend_from_slice(&msg.data)
                    }
                    Ok(_) => {}
                    Err(_) => self.pending.extend_from_slice(text.as_bytes()),
                },
            }
        }
    }
}

/// Authenticate `handle` as the host's user.
pub async fn authenticate<H: client::Handler>(
    handle: &mut client::Handle<H>,
    host: &HostConfig,
    prompter: &mut dyn Prompter,
) -> Result<()> {
    let user = host.account.user.as_str();
    let mut tried = Vec::new();

    for method in &host.auth {
        tried.push(method.name());
        debug!(host = %host.addr(), method = method.name(), "trying auth method");
        let accepted = match method {
            AuthMethod::PublicKey(key) => handle
                .authenticate_publickey(user, key.clone())
                .await
                .map_err(auth_error)?,
            AuthMethod::Password(password) => handle
                .authenticate_password(user, password)
                .await
                .map_err(auth_error)?,
            AuthMethod::KeyboardInteractive(password) => {
                let mut responder = InteractiveResponder::new(password.as_str(), &mut *prompter);
                keyboard_interactive(handle, user, &mut responder).await?
            }
        };
        if accepted {
            info!(host = %host.addr(), user, method = method.name(), "authenticated");
            return Ok(());
        }
        warn!(host = %host.addr(), method = method.name(), "auth method rejected");
    }

    Err(Error::Transport {
        message: if tried.is_empty() {
            "no credentials supplied".to_string()
        } else {
            format!("authentication rejected ({})", tried.join(", "))
        },
    })
}

async fn keyboard_interactive<H: client::Handler>(
    handle: &mut client::Handle<H>,
    user: &str,
    responder: &mut InteractiveResponder<'_>,
) -> Result<bool> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(auth_error)?;
    loop {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::Failure => return Ok(false),
            KeyboardInteractiveAuthResponse::InfoRequest {
                instructions,
                prompts,
                ..
            } => {
                let questions: Vec<String> = prompts.into_iter().map(|p| p.prompt).collect();
                let answers = responder.respond(&instructions, &questions).await?;
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_error)?;
            }
        }
    }
}

fn auth_error(e: russh::Error) -> Error {
    Error::Transport {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use termgate_core::RequestParams;
    use termgate_test_utils::{binary_payload, mock_client};

    #[derive(Default)]
    struct ScriptedPrompter {
        shown: Vec<String>,
        lines: VecDeque<String>,
        reads: usize,
    }

    #[async_trait]
    impl Prompter for ScriptedPrompter {
        async fn show(&mut self, text: &str) -> Result<()> {
            self.shown.push(text.to_string());
            Ok(())
        }

        async fn read_line(&mut self) -> Result<String> {
            self.reads += 1;
            self.lines.pop_front().ok_or(Error::ConnectionClosed)
        }
    }

    fn q(text: &str) -> Vec<String> {
        vec![text.to_string()]
    }

    #[tokio::test]
    async fn first_password_prompt_gets_password() {
        let mut prompter = ScriptedPrompter {
            lines: VecDeque::from(vec!["123456".to_string()]),
            ..Default::default()
        };
        let mut responder = InteractiveResponder::new("p", &mut prompter);

        let first = responder.respond("", &q("Password: ")).await.unwrap();
        assert_eq!(first, vec!["p"]);

        // Asked again: now it is the user's turn.
        let second = responder.respond("", &q("Password: ")).await.unwrap();
        assert_eq!(second, vec!["123456"]);

        assert_eq!(prompter.reads, 1);
        assert_eq!(prompter.shown, vec!["Password: "]);
    }

    #[tokio::test]
    async fn other_prompts_go_to_client() {
        let mut prompter = ScriptedPrompter {
            lines: VecDeque::from(vec!["42".to_string()]),
            ..Default::default()
        };
        let mut responder = InteractiveResponder::new("p", &mut prompter);
        let answers = responder
            .respond("Two-factor required", &q("Verification code: "))
            .await
            .unwrap();
        assert_eq!(answers, vec!["42"]);
        assert_eq!(
            prompter.shown,
            vec!["Two-factor required\r\n", "Verification code: "]
        );
    }

    #[tokio::test]
    async fn qualified_password_prompts_go_to_client() {
        let mut prompter = ScriptedPrompter {
            lines: VecDeque::from(vec!["typed".to_string()]),
            ..Default::default()
        };
        let mut responder = InteractiveResponder::new("stored", &mut prompter);
        let answers = responder
            .respond("", &q("Enter new sudo password: "))
            .await
            .unwrap();
        assert_eq!(answers, vec!["typed"]);
        assert_eq!(prompter.reads, 1);
    }

    #[tokio::test]
    async fn aborts_after_51_empty_rounds() {
        let mut prompter = ScriptedPrompter::default();
        let mut responder = InteractiveResponder::new("p", &mut prompter);

        for _ in 0..50 {
            assert!(responder.respond("", &[]).await.unwrap().is_empty());
        }
        let err = responder.respond("", &[]).await.unwrap_err();
        assert!(matches!(err, Error::InteractiveLoop { rounds: 51 }));
    }

    #[tokio::test]
    async fn questions_reset_empty_round_count() {
        let mut prompter = ScriptedPrompter::default();
        let mut responder = InteractiveResponder::new("p", &mut prompter);

        for _ in 0..50 {
            responder.respond("", &[]).await.unwrap();
        }
        responder.respond("", &q("password:")).await.unwrap();
        for _ in 0..50 {
            responder.respond("", &[]).await.unwrap();
        }
    }

    #[test]
    fn password_prompt_detection() {
        assert!(is_password_prompt("Password:"));
        assert!(is_password_prompt("  password: "));
        assert!(is_password_prompt("Password As"));
        assert!(!is_password_prompt("Verification code:"));
        assert!(!is_password_prompt("root@db's password:"));
        assert!(!is_password_prompt("Enter new sudo password:"));
    }

    #[tokio::test]
    async fn client_prompter_reads_lines_from_any_frame() {
        let (mut conn, mut client) = mock_client(RequestParams::new());
        let (writer, writer_task) = ClientWriter::spawn(conn.sink);
        let mut prompter = ClientPrompter::new(conn.source.as_mut(), writer.clone());

        prompter.show("Code: ").await.unwrap();
        client.send_binary(&b"12"[..]);
        client.send_message(&Message::resize(40, 100));
        client.send_message(&Message::stdin("34\r\n"));
        client.send_text("next\n");

        assert_eq!(prompter.read_line().await.unwrap(), "1234");
        assert_eq!(prompter.read_line().await.unwrap(), "next");

        client.hang_up();
        assert!(matches!(
            prompter.read_line().await.unwrap_err(),
            Error::ConnectionClosed
        ));

        drop(prompter);
        writer.close().await;
        writer_task.await.unwrap();
        assert_eq!(binary_payload(&client.frames_until_closed().await), b"Code: ");
    }
}

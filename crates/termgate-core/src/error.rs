//! Error types for termgate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which host of a chain a dial failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialTarget {
    /// The intermediate jump host.
    Jump,
    /// The final end host.
    End,
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Jump => f.write_str("jump host"),
            DialTarget::End => f.write_str("end host"),
        }
    }
}

/// Stage of a connection build that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    /// TCP connect (bounded by the dial timeout).
    Dial,
    /// SSH handshake and user authentication.
    Auth,
    /// Opening a forwarded connection from the jump host.
    TunnelOriginate,
}

impl fmt::Display for DialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialStage::Dial => f.write_str("dial"),
            DialStage::Auth => f.write_str("auth"),
            DialStage::TunnelOriginate => f.write_str("tunnel"),
        }
    }
}

/// Main error type for termgate operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Building the backend connection failed at some stage.
    #[error("failed to {stage} {target}: {message}")]
    DialFailed {
        target: DialTarget,
        stage: DialStage,
        message: String,
    },

    /// Private key material could not be parsed.
    #[error("failed to parse private key: {message}")]
    KeyParse { message: String },

    /// The server kept sending empty keyboard-interactive rounds.
    #[error("interactive auth aborted after {rounds} empty prompt rounds")]
    InteractiveLoop { rounds: u32 },

    /// Pty allocation, shell or exec start failed.
    #[error("failed to start session: {message}")]
    SessionStart { message: String },

    /// Operation called in the wrong session state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Text frame that is not a valid control message.
    #[error("malformed control message: {message}")]
    MalformedControlMessage { message: String },

    /// Requested charset is not one of the supported encodings.
    #[error("charset '{0}' is not supported")]
    UnsupportedCharset(String),

    /// Stream ended in the middle of a multi-byte sequence, or similar.
    #[error("transcode error: {message}")]
    Transcode { message: String },

    /// Local process could not be started.
    #[error("failed to start process: {message}")]
    ProcessStart { message: String },

    /// Process was killed after running past its timeout.
    #[error("process killed after {after:?}")]
    TimeoutKill { after: Duration },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// PTY error.
    #[error("pty error: {message}")]
    Pty { message: String },

    /// Request parameter had an invalid value.
    #[error("invalid parameter '{name}': {message}")]
    InvalidParam { name: String, message: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Returns true if the connection cannot continue after this error.
    ///
    /// Per-frame failures (bad control message, failed resize) leave the
    /// connection usable; anything that means one side is gone does not.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            Error::MalformedControlMessage { .. }
                | Error::InvalidState { .. }
                | Error::Pty { .. }
                | Error::Transcode { .. }
        )
    }

    /// Message shown to the client when this error ends a request.
    pub fn client_message(&self) -> String {
        match self {
            Error::DialFailed { .. } => format!("Failed to dial: {}\r\n", self),
            Error::SessionStart { .. } => format!("Unable to execute command: {}\r\n", self),
            _ => format!("{}\r\n", self),
        }
    }
}

/// Convenience result type for termgate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_dial_failed() {
        let err = Error::DialFailed {
            target: DialTarget::End,
            stage: DialStage::Dial,
            message: "connection refused".into(),
        };
        assert_eq!(err.to_string(), "failed to dial end host: connection refused");
    }

    #[test]
    fn error_display_tunnel() {
        let err = Error::DialFailed {
            target: DialTarget::End,
            stage: DialStage::TunnelOriginate,
            message: "administratively prohibited".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to tunnel end host: administratively prohibited"
        );
    }

    #[test]
    fn error_display_charset() {
        let err = Error::UnsupportedCharset("KOI8-R".into());
        assert_eq!(err.to_string(), "charset 'KOI8-R' is not supported");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn per_frame_errors_are_not_fatal() {
        assert!(!Error::MalformedControlMessage {
            message: "bad".into()
        }
        .is_connection_fatal());
        assert!(!Error::Pty {
            message: "resize".into()
        }
        .is_connection_fatal());

        assert!(Error::ConnectionClosed.is_connection_fatal());
        assert!(Error::Io(std::io::Error::other("gone")).is_connection_fatal());
    }

    #[test]
    fn client_message_prefixes_dial_failures() {
        let err = Error::DialFailed {
            target: DialTarget::Jump,
            stage: DialStage::Auth,
            message: "denied".into(),
        };
        assert!(err.client_message().starts_with("Failed to dial: "));
        assert!(err.client_message().ends_with("\r\n"));
    }
}

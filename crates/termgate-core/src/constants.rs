//! Protocol and configuration constants for termgate.

use std::time::Duration;

use crate::session::TermSize;

// =============================================================================
// Ports and terminal defaults
// =============================================================================

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default telnet port.
pub const DEFAULT_TELNET_PORT: u16 = 23;

/// Default pty size for SSH and local sessions.
pub const DEFAULT_SSH_SIZE: TermSize = TermSize::new(120, 80);

/// Default window size for telnet sessions.
pub const DEFAULT_TELNET_SIZE: TermSize = TermSize::new(80, 40);

/// Terminal type announced in pty requests.
pub const TERM_TYPE: &str = "xterm";

/// Terminal speed announced in pty modes (14.4 kbaud).
pub const TERM_SPEED: u32 = 14_400;

// =============================================================================
// Charsets
// =============================================================================

/// Canonical charset; streams in this charset pass through untouched.
pub const CANONICAL_CHARSET: &str = "UTF-8";

/// Default charset on Windows hosts.
pub const WINDOWS_DEFAULT_CHARSET: &str = "GB18030";

/// Largest number of bytes a decoder may hold back between writes.
pub const MAX_ENCODING_UNIT: usize = 8;

// =============================================================================
// Timing
// =============================================================================

/// Connect timeout applied to each dial stage.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Execution timeout for local commands when the request names none.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Safety timeout for the session-key re-run.
pub const SESSION_KEY_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a closing session may take to stop its pump task.
pub const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// How long to keep reading a local command's output after it exited.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

// =============================================================================
// Limits
// =============================================================================

/// Empty keyboard-interactive rounds tolerated before aborting auth.
pub const MAX_EMPTY_INTERACTIVE_ROUNDS: u32 = 50;

/// Highest `argN` index scanned in exec requests.
pub const MAX_EXEC_ARGS: usize = 1000;

/// Read buffer size for backend output.
pub const OUTPUT_BUFFER_SIZE: usize = 8 * 1024;

/// Capacity of the per-connection frame queues.
pub const FRAME_QUEUE_DEPTH: usize = 256;

/// Marker the PuTTY link client prints when it refuses an unknown host key.
pub const CONNECTION_ABANDONED_MARKER: &str = "Connection abandoned.";

/// Charset used on this platform when the request names none.
pub fn platform_default_charset() -> &'static str {
    if cfg!(windows) {
        WINDOWS_DEFAULT_CHARSET
    } else {
        CANONICAL_CHARSET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(windows))]
    fn default_charset_is_utf8_off_windows() {
        assert_eq!(platform_default_charset(), "UTF-8");
    }

    #[test]
    fn carry_fits_the_largest_sequence() {
        // GB18030 four-byte sequences are the longest supported.
        assert!(MAX_ENCODING_UNIT >= 4);
    }
}

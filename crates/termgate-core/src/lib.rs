//! termgate-core: shared library for the termgate terminal gateway.
//!
//! This crate provides:
//! - Error taxonomy and result alias
//! - Control message definitions for text frames
//! - The client transport abstraction and ordered writer
//! - The session backend abstraction shared by every terminal backend
//! - Request parameters and account configuration
//! - Charset transcoding for both stream directions
//! - Logging setup

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transcode;
pub mod transport;

pub use config::{AccountConfig, RequestParams};
pub use error::{DialStage, DialTarget, Error, Result};
pub use logging::{LogFormat, init_logging};
pub use protocol::{Message, MessageType};
pub use session::{SessionBackend, SessionInput, SessionState, TermSize};
pub use transcode::{Charset, InputEncoder, OutputFilter, Transcoder};
pub use transport::{ClientConnection, ClientWriter, Frame, FrameSink, FrameSource};

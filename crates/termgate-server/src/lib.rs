//! termgate-server: the terminal gateway.
//!
//! Provides:
//! - SSH tunnel builder with one optional jump host
//! - Terminal session controller (SSH channel, telnet, local pty)
//! - Control/data multiplexer for client frames
//! - Local process executor with timeout-kill
//! - Per-route connection handlers and the WebSocket front door

pub mod bridge;
pub mod cli;
pub mod dump;
pub mod exec;
pub mod mux;
#[cfg(unix)]
pub mod pty;
pub mod session;
pub mod ssh;
pub mod telnet;
pub mod ws;

pub use bridge::{Gateway, GatewayConfig, Route};
pub use cli::Cli;

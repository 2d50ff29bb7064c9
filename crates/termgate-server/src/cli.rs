//! Server CLI implementation.
//!
//! Provides command-line argument parsing for the termgate server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use termgate_core::config::parse_duration;
use termgate_core::constants::{DEFAULT_DIAL_TIMEOUT, DEFAULT_EXEC_TIMEOUT};

use crate::bridge::GatewayConfig;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for termgate_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => termgate_core::LogFormat::Text,
            CliLogFormat::Json => termgate_core::LogFormat::Json,
        }
    }
}

/// termgate - browser-to-backend terminal gateway.
#[derive(Debug, Parser)]
#[command(
    name = "termgate",
    version,
    about = "termgate - browser-to-backend terminal gateway (SSH, telnet, local commands)"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0", env = "TERMGATE_BIND")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "37079", env = "TERMGATE_PORT")]
    pub port: u16,

    /// Write session transcripts for every connection
    #[arg(long = "debug")]
    pub debug: bool,

    /// Directory for session transcripts
    #[arg(long = "log-dir", default_value = ".", value_name = "DIR")]
    pub log_dir: PathBuf,

    /// Helper used to re-run commands that fail with a permission error
    #[arg(long = "sh-execute", default_value = "sudo", value_name = "PROGRAM")]
    pub sh_execute: String,

    /// MIB directory passed to snmp tools as `-M`
    #[arg(long = "mibs-dir", value_name = "DIR")]
    pub mibs_dir: Option<String>,

    /// Connect timeout for each dial stage (e.g. 10s)
    #[arg(long = "dial-timeout", default_value = "10s", value_parser = parse_duration_arg)]
    pub dial_timeout: Duration,

    /// Timeout for local commands when the request sets none (e.g. 10m)
    #[arg(long = "default-exec-timeout", default_value = "10m", value_parser = parse_duration_arg)]
    pub default_exec_timeout: Duration,

    /// Serve the local pty shell route
    #[arg(long = "allow-local-shell")]
    pub allow_local_shell: bool,

    /// Shell for the local shell route (default: $SHELL)
    #[arg(long = "shell", value_name = "PATH")]
    pub shell: Option<String>,

    /// Serve static files from this directory
    #[arg(long = "static-dir", value_name = "DIR")]
    pub static_dir: Option<PathBuf>,

    /// Directory searched for bundled tools (default: the binary's directory)
    #[arg(long = "tools-dir", value_name = "DIR")]
    pub tools_dir: Option<PathBuf>,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// Get the socket address to bind to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Gateway settings from the parsed flags.
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            debug: self.debug,
            log_dir: self.log_dir.clone(),
            sh_execute: Some(self.sh_execute.clone()).filter(|s| !s.is_empty()),
            mibs_dir: self.mibs_dir.clone(),
            dial_timeout: self.dial_timeout,
            default_exec_timeout: self.default_exec_timeout,
            allow_local_shell: self.allow_local_shell,
            local_shell: self.shell.clone(),
        }
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    let duration = parse_duration(s).map_err(|e| e.to_string())?;
    if duration.is_zero() {
        return Err("duration must be greater than 0".to_string());
    }
    Ok(duration)
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 37079,
            debug: false,
            log_dir: PathBuf::from("."),
            sh_execute: "sudo".to_string(),
            mibs_dir: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            default_exec_timeout: DEFAULT_EXEC_TIMEOUT,
            allow_local_shell: false,
            shell: None,
            static_dir: None,
            tools_dir: None,
            verbose: 0,
            log_file: None,
            log_format: CliLogFormat::Text,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

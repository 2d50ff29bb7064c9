//! Per-request configuration.
//!
//! [`RequestParams`] is the name→values view of the upgrade request;
//! [`AccountConfig`] is the user identity derived from it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::constants::{MAX_EXEC_ARGS, platform_default_charset};
use crate::session::TermSize;
use crate::{Error, Result};

// =============================================================================
// Request parameters
// =============================================================================

/// Request parameters, multi-valued like a URL query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestParams {
    values: HashMap<String, Vec<String>>,
}

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from decoded `(name, value)` pairs, keeping repeats in order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut params = Self::new();
        for (k, v) in pairs {
            params.push(k, v);
        }
        params
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.entry(name.into()).or_default().push(value.into());
    }

    /// First value for `name`, or `""` when absent.
    pub fn get(&self, name: &str) -> &str {
        self.values
            .get(name)
            .and_then(|v| v.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Every value given for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `name` was present at all, even with an empty value.
    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Integer parameter; falls back to `default` when absent or invalid.
    pub fn int_or<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.get(name).parse().unwrap_or(default)
    }

    /// Port parameter with a protocol default. Invalid values are an error.
    pub fn port(&self, default: u16) -> Result<u16> {
        let raw = self.get("port");
        if raw.is_empty() {
            return Ok(default);
        }
        raw.parse::<u16>().map_err(|e| Error::InvalidParam {
            name: "port".into(),
            message: e.to_string(),
        })
    }

    /// Terminal size from `columns`/`rows`, each falling back on its own.
    pub fn term_size(&self, default: TermSize) -> TermSize {
        TermSize {
            cols: self.int_or("columns", default.cols),
            rows: self.int_or("rows", default.rows),
        }
    }

    /// `debug=true` (case-insensitive) forces transcripts on.
    pub fn debug(&self, default: bool) -> bool {
        default || self.get("debug").eq_ignore_ascii_case("true")
    }

    /// Requested charset, or the platform default when unset.
    pub fn charset(&self) -> String {
        resolve_charset(self.get("charset"))
    }

    /// Execution timeout; unparsable values fall back to `default`.
    pub fn timeout(&self, default: Duration) -> Duration {
        let raw = self.get("timeout");
        if raw.is_empty() {
            return default;
        }
        parse_duration(raw).unwrap_or(default)
    }

    /// Positional arguments from `arg0`, `arg1`, ... up to the first gap.
    pub fn positional_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for i in 0..MAX_EXEC_ARGS {
            let Some(values) = self.values.get(&format!("arg{}", i)) else {
                break;
            };
            args.extend(values.iter().cloned());
        }
        args
    }

    /// Whether client input should be wired to a local process.
    pub fn stdin_enabled(&self) -> bool {
        self.get("stdin") == "on"
    }
}

/// Fill in the platform default for an empty charset name.
pub fn resolve_charset(charset: &str) -> String {
    if charset.is_empty() {
        platform_default_charset().to_string()
    } else {
        charset.to_string()
    }
}

/// Parse a duration string such as `90s`, `10m`, `1h30m` or `250ms`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || Error::InvalidParam {
        name: "timeout".into(),
        message: format!("invalid duration '{}'", s),
    };

    let s = s.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if num_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| invalid())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())?;
    }
    Ok(total)
}

// =============================================================================
// Account
// =============================================================================

/// User identity for one connection. Immutable once built.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AccountConfig {
    pub user: String,
    pub password: String,
    pub private_key: Option<Vec<u8>>,
    pub passphrase: Option<Vec<u8>>,
    pub charset: String,
}

impl AccountConfig {
    /// Derive the account from `user`, `password`, `privateKey`,
    /// `passphrase` and `charset`.
    pub fn from_params(params: &RequestParams) -> Self {
        let non_empty = |name: &str| {
            let v = params.get(name);
            (!v.is_empty()).then(|| v.as_bytes().to_vec())
        };
        Self {
            user: params.get("user").to_string(),
            password: params.get("password").to_string(),
            private_key: non_empty("privateKey"),
            passphrase: non_empty("passphrase"),
            charset: params.charset(),
        }
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }
}

// Credentials stay out of logs.
impl fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountConfig")
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "***"))
            .field("charset", &self.charset)
            .finish()
    }
}

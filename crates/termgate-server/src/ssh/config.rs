//! Host chain construction.
//!
//! A connection targets exactly one end host, optionally reached through
//! one jump host. Both are plain [`HostConfig`] values built once per
//! connection. Callers embedding the gateway can supply pre-built values
//! through [`Overrides`]; anything not overridden is derived from the
//! request parameters.

use std::fmt;
use std::sync::Arc;

use russh_keys::key::KeyPair;

use termgate_core::{AccountConfig, Error, RequestParams, Result};

/// One way of proving identity to a server, in the order they are tried.
#[derive(Clone)]
pub enum AuthMethod {
    PublicKey(Arc<KeyPair>),
    Password(String),
    /// Keyboard-interactive; the password answers the first password prompt.
    KeyboardInteractive(String),
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(_) => "publickey",
            AuthMethod::Password(_) => "password",
            AuthMethod::KeyboardInteractive(_) => "keyboard-interactive",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Build the auth method list for an account.
///
/// A private key comes first; a password adds both password and
/// keyboard-interactive auth.
pub fn auth_methods(account: &AccountConfig) -> Result<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(key) = &account.private_key {
        let pem = std::str::from_utf8(key).map_err(|e| Error::KeyParse {
            message: format!("key is not valid text: {}", e),
        })?;
        let passphrase = account
            .passphrase
            .as_deref()
            .map(std::str::from_utf8)
            .transpose()
            .map_err(|e| Error::KeyParse {
                message: format!("passphrase is not valid text: {}", e),
            })?;
        let pair = russh_keys::decode_secret_key(pem, passphrase).map_err(|e| Error::KeyParse {
            message: e.to_string(),
        })?;
        methods.push(AuthMethod::PublicKey(Arc::new(pair)));
    }

    if account.has_password() {
        methods.push(AuthMethod::Password(account.password.clone()));
        methods.push(AuthMethod::KeyboardInteractive(account.password.clone()));
    }

    Ok(methods)
}

/// One network endpoint with its credentials.
#[derive(Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub account: AccountConfig,
    pub auth: Vec<AuthMethod>,
}

impl HostConfig {
    pub fn new(host: impl Into<String>, port: u16, account: AccountConfig) -> Result<Self> {
        let auth = auth_methods(&account)?;
        Ok(Self {
            host: host.into(),
            port,
            account,
            auth,
        })
    }

    /// `host:port` for logs.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.account.user)
            .field("auth", &self.auth)
            .finish()
    }
}

/// End host plus the optional jump host in front of it.
///
/// Only one hop is supported. Longer chains would repeat the tunnel step
/// once per extra hop.
#[derive(Debug, Clone)]
pub struct HostChain {
    pub jump: Option<HostConfig>,
    pub end: HostConfig,
}

/// Pre-supplied configuration consulted before the request parameters.
pub trait Overrides: Send + Sync {
    fn account(&self, _params: &RequestParams) -> Option<AccountConfig> {
        None
    }

    fn end_host(&self, _params: &RequestParams) -> Option<HostConfig> {
        None
    }

    /// Jump hosts are never derived from request parameters.
    fn jump_host(&self, _params: &RequestParams) -> Option<HostConfig> {
        None
    }
}

/// Derive everything from the request.
pub struct NoOverrides;

impl Overrides for NoOverrides {}

/// Account for this request: override, else request parameters.
pub fn account_for(params: &RequestParams, overrides: &dyn Overrides) -> AccountConfig {
    overrides
        .account(params)
        .unwrap_or_else(|| AccountConfig::from_params(params))
}

/// Build the host chain for this request.
pub fn host_chain(
    params: &RequestParams,
    default_port: u16,
    overrides: &dyn Overrides,
) -> Result<HostChain> {
    let end = match overrides.end_host(params) {
        Some(end) => end,
        None => {
            let host = params.get("hostname");
            if host.is_empty() {
                return Err(Error::InvalidParam {
                    name: "hostname".into(),
                    message: "missing".into(),
                });
            }
            let account = account_for(params, overrides);
            HostConfig::new(host, params.port(default_port)?, account)?
        }
    };
    Ok(HostChain {
        jump: overrides.jump_host(params),
        end,
    })
}

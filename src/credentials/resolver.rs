//! Credential resolution
//!
//! Picks exactly one login record for a host from the candidates returned by
//! the vault search, or explains why that is not possible.

use std::fmt;

use thiserror::Error;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use super::record::LoginRecord;

/// URI scheme marking a record as an SSH credential
pub const SSH_SCHEME: &str = "ssh";

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Did not find credentials for host {0} in your vault")]
    NoCredentials(String),

    #[error("Did not find credentials for user '{user}' on host {host}")]
    NoMatchingUser { host: String, user: String },

    #[error(
        "Found multiple users for this host: {}. Choose one with --user (-u)",
        .0.join(", ")
    )]
    AmbiguousCredentials(Vec<String>),
}

/// Everything needed to open one session. Built per connect, never stored.
#[derive(Clone)]
pub struct ConnectionParameters {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: Zeroizing<String>,
    pub host_key_check: bool,
}

impl ConnectionParameters {
    /// `host:port`, with IPv6 literals bracketed
    pub fn target_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("host_key_check", &self.host_key_check)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    /// Port given by the caller, wins over the URI port
    pub port_override: Option<u16>,
    pub host_key_check: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            port_override: None,
            host_key_check: true,
        }
    }
}

/// Host and optional port taken from an `ssh://` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAddress {
    pub host: String,
    pub port: Option<u16>,
}

/// Parse `uri` if it uses the ssh scheme
pub fn parse_ssh_uri(uri: &str) -> Option<SshAddress> {
    let url = Url::parse(uri.trim()).ok()?;
    if url.scheme() != SSH_SCHEME {
        return None;
    }

    let host = url
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if host.is_empty() {
        return None;
    }

    Some(SshAddress {
        host,
        port: url.port(),
    })
}

/// Resolve the credential for `host`.
///
/// Records without an `ssh://` URI are ignored. A non-empty `preferred_user`
/// selects the first record with that username and never falls back to
/// another one. Without a preference, a single candidate is used as is and
/// several candidates are reported back by username, in input order.
pub fn resolve(
    records: &[LoginRecord],
    host: &str,
    preferred_user: Option<&str>,
    options: ResolveOptions,
) -> Result<ConnectionParameters, ResolveError> {
    let candidates: Vec<(&LoginRecord, SshAddress)> = records
        .iter()
        .filter_map(|record| {
            record
                .uris
                .iter()
                .find_map(|uri| parse_ssh_uri(uri))
                .map(|address| (record, address))
        })
        .collect();

    debug!(
        "{} of {} records are SSH candidates for {}",
        candidates.len(),
        records.len(),
        host
    );

    if candidates.is_empty() {
        return Err(ResolveError::NoCredentials(host.to_string()));
    }

    let preferred_user = preferred_user.filter(|user| !user.is_empty());

    let (record, address) = match preferred_user {
        Some(user) => candidates
            .into_iter()
            .find(|(record, _)| record.username == user)
            .ok_or_else(|| ResolveError::NoMatchingUser {
                host: host.to_string(),
                user: user.to_string(),
            })?,
        None if candidates.len() == 1 => candidates
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NoCredentials(host.to_string()))?,
        None => {
            return Err(ResolveError::AmbiguousCredentials(
                candidates
                    .iter()
                    .map(|(record, _)| record.username.clone())
                    .collect(),
            ))
        }
    };

    Ok(ConnectionParameters {
        host: address.host,
        port: options
            .port_override
            .or(address.port)
            .unwrap_or(DEFAULT_SSH_PORT),
        username: record.username.clone(),
        secret: record.secret.clone(),
        host_key_check: options.host_key_check,
    })
}

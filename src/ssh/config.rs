//! SSH session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::external::ExternalClient;

/// Default dial timeout
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default remote terminal type
pub const DEFAULT_TERM: &str = "xterm-256color";

/// How the interactive session is carried to the remote host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportStrategy {
    /// In-process SSH client (russh)
    #[default]
    Native,
    /// Spawn an external SSH client with a typed argument list
    External(ExternalClient),
}

/// Settings handed to the connection manager for one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Bound on the TCP dial
    pub connect_timeout: Duration,
    /// Terminal type for the remote PTY
    pub term: String,
    pub transport: TransportStrategy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            term: DEFAULT_TERM.to_string(),
            transport: TransportStrategy::Native,
        }
    }
}

impl SessionSettings {
    /// russh client configuration
    pub fn to_russh_config(&self) -> russh::client::Config {
        russh::client::Config {
            // Interactive shells may stay idle for hours
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        }
    }
}

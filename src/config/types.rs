//! Settings file types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ssh::{
    KnownHostsStore, SessionSettings, TransportStrategy, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_TERM,
};
use crate::vault::DEFAULT_BW_EXECUTABLE;

/// Current settings file version
pub const CONFIG_VERSION: u32 = 1;

/// Contents of `settings.json`. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    /// TCP dial bound in seconds
    pub connect_timeout_secs: u64,
    /// Terminal type requested for the remote PTY
    pub term: String,
    /// Verify host keys against known_hosts. `--no-host-key-check` overrides.
    pub host_key_check: bool,
    /// Defaults to `~/.ssh/known_hosts`
    pub known_hosts_path: Option<PathBuf>,
    pub bw_executable: String,
    pub transport: TransportStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            term: DEFAULT_TERM.to_string(),
            host_key_check: true,
            known_hosts_path: None,
            bw_executable: DEFAULT_BW_EXECUTABLE.to_string(),
            transport: TransportStrategy::Native,
        }
    }
}

impl Settings {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            term: if self.term.is_empty() {
                DEFAULT_TERM.to_string()
            } else {
                self.term.clone()
            },
            transport: self.transport.clone(),
        }
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.known_hosts_path
            .clone()
            .unwrap_or_else(KnownHostsStore::default_path)
    }
}

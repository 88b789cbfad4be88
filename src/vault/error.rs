//! Vault Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Bitwarden CLI executable '{0}' not found on PATH")]
    NotInstalled(String),

    #[error("Invalid master password")]
    InvalidMasterPassword,

    #[error("Vault session expired or vault is locked: {0}")]
    SessionExpired(String),

    #[error("`bw {command}` failed{}: {stderr}", .status.map(|s| format!(" with status {}", s)).unwrap_or_default())]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("bw unlock returned an empty session key")]
    EmptySessionKey,

    #[error("Failed to decode vault items: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Whether a fresh unlock could fix this error
    pub fn is_session_expired(&self) -> bool {
        matches!(self, VaultError::SessionExpired(_))
    }
}

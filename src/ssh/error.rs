//! SSH Error types

use thiserror::Error;

/// Host identity rejections raised by the trust store during the handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    #[error("Host key for {host} not trusted: {reason}")]
    UntrustedHost { host: String, reason: String },

    #[error(
        "REMOTE HOST IDENTIFICATION HAS CHANGED for {host} ({key_type})! \
         Expected {expected_fingerprint}, got {actual_fingerprint}. \
         Someone could be intercepting this connection. \
         If the new key is legitimate, remove the old entry from your known_hosts file."
    )]
    ConflictingHostKey {
        host: String,
        key_type: String,
        expected_fingerprint: String,
        actual_fingerprint: String,
    },

    #[error("Host key {fingerprint} for {host} is marked as revoked in known_hosts")]
    RevokedHostKey { host: String, fingerprint: String },
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Pseudo-terminal request failed: {0}")]
    PtyFailure(String),

    #[error("Transport error: {0}")]
    TransportFailure(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("External client error: {0}")]
    ExternalClient(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

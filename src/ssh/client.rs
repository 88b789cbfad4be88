//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::SessionSettings;
use super::error::SshError;
use super::trust::{TrustDecision, TrustStore};
use crate::credentials::ConnectionParameters;

/// Dials, handshakes and authenticates one connection
pub struct SshClient {
    params: ConnectionParameters,
    settings: SessionSettings,
    trust: Arc<TrustStore>,
}

impl SshClient {
    pub fn new(
        params: ConnectionParameters,
        settings: SessionSettings,
        trust: Arc<TrustStore>,
    ) -> Self {
        Self {
            params,
            settings,
            trust,
        }
    }

    /// TCP connect bounded by the configured timeout
    pub async fn dial(&self) -> Result<TcpStream, SshError> {
        let addr = self.params.target_address();
        info!("Connecting to SSH server at {}", addr);

        dial_with_timeout(&addr, self.settings.connect_timeout).await
    }

    /// Run the SSH handshake over `stream` and authenticate with the
    /// resolved password.
    pub async fn handshake(
        &self,
        stream: TcpStream,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let handler = ClientHandler::new(
            self.params.host.clone(),
            self.params.port,
            self.trust.clone(),
        );

        let mut handle = client::connect_stream(
            Arc::new(self.settings.to_russh_config()),
            stream,
            handler,
        )
        .await?;

        debug!("SSH handshake completed");

        let auth = handle
            .authenticate_password(&self.params.username, self.params.secret.as_str())
            .await
            .map_err(|e| SshError::AuthFailure(e.to_string()))?;

        if !auth.success() {
            return Err(SshError::AuthFailure(format!(
                "server rejected password for {}",
                self.params.username
            )));
        }

        info!("SSH authentication successful for {}", self.params.username);
        Ok(handle)
    }
}

/// Resolve `addr` and connect to the first address that accepts, all
/// within `timeout`.
pub async fn dial_with_timeout(addr: &str, timeout: Duration) -> Result<TcpStream, SshError> {
    let attempt = async {
        let mut last_err = None;
        let addrs = tokio::net::lookup_host(addr).await.map_err(|e| {
            SshError::ConnectFailed(format!("Failed to resolve {}: {}", addr, e))
        })?;

        for socket_addr in addrs {
            match TcpStream::connect(socket_addr).await {
                Ok(stream) => {
                    debug!("TCP connected to {}", socket_addr);
                    // Interactive traffic is many tiny writes
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed: {}", e);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", socket_addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => SshError::ConnectFailed(format!("{}: {}", addr, e)),
            None => SshError::ConnectFailed(format!("No address found for {}", addr)),
        })
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| SshError::ConnectTimeout(addr.to_string()))?
}

/// Client handler for russh callbacks
///
/// Host key verification is delegated to the [`TrustStore`]; a rejection
/// aborts the handshake with the matching [`SshError::Trust`] error.
pub struct ClientHandler {
    host: String,
    port: u16,
    trust: Arc<TrustStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, trust: Arc<TrustStore>) -> Self {
        Self { host, port, trust }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let trust = self.trust.clone();
        let host = self.host.clone();
        let port = self.port;
        let key = server_public_key.clone();

        // The first-contact prompt blocks on the terminal
        let decision = tokio::task::spawn_blocking(move || trust.verify(&host, port, &key))
            .await
            .map_err(|e| SshError::ProtocolError(format!("host key check aborted: {}", e)))?;

        match decision {
            TrustDecision::Accept | TrustDecision::AcceptAndRemember => {
                info!("Host key accepted for {}:{}", self.host, self.port);
                Ok(true)
            }
            rejected => {
                warn!("Host key rejected for {}:{}", self.host, self.port);
                rejected.into_result(&self.host)?;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = dial_with_timeout(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_dial_refused_is_connect_failed() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = dial_with_timeout(&addr.to_string(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::ConnectFailed(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_dial_unresolvable_is_connect_failed() {
        let err = dial_with_timeout("no-such-host.invalid:22", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(
            matches!(err, SshError::ConnectFailed(_) | SshError::ConnectTimeout(_)),
            "{:?}",
            err
        );
    }
}

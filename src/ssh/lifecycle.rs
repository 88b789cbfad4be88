//! Connection lifecycle
//!
//! Drives one session through
//! `Idle -> Dialing -> Authenticating -> PtyRequested -> Streaming -> Closed`,
//! with `Failed` reachable from every non-terminal state. Every blocking
//! step races the session's [`ShutdownSignal`], and the transport is closed
//! on every exit path.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::client::SshClient;
use super::config::{SessionSettings, TransportStrategy};
use super::error::SshError;
use super::external::ExternalClient;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::session::{stream_session, ChannelShell, LocalIo, PtyRequest};
use super::shutdown::{ShutdownReason, ShutdownSignal};
use super::trust::TrustStore;
use crate::credentials::ConnectionParameters;
use crate::terminal::{self, RawModeGuard};

/// Exit statuses treated as a normal end of session
pub const CLEAN_EXIT_STATUSES: [u32; 2] = [0, 130];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Dialing,
    Authenticating,
    PtyRequested,
    Streaming,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Idle, Dialing)
            | (Dialing, Authenticating)
            | (Authenticating, PtyRequested)
            | (PtyRequested, Streaming) => true,
            // External clients do their own handshake
            (Idle, Streaming) => true,
            // Cancellation may close the session at any point
            (from, Closed) | (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// How a session that got past the handshake ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Remote shell exited with a clean status (or none was reported)
    Closed { exit_status: Option<u32> },
    RemoteFailure { exit_status: u32 },
    /// Remote shell was killed by a signal
    Signalled { signal: String },
    /// Operator interrupt or termination
    Cancelled,
    /// Transport dropped while streaming
    ConnectionLost { reason: String },
}

impl SessionOutcome {
    pub fn from_remote_exit(exit_status: Option<u32>, exit_signal: Option<String>) -> Self {
        match (exit_status, exit_signal) {
            (_, Some(signal)) => Self::Signalled { signal },
            (Some(code), None) if !CLEAN_EXIT_STATUSES.contains(&code) => {
                Self::RemoteFailure { exit_status: code }
            }
            (exit_status, None) => Self::Closed { exit_status },
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Cancelled)
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Closed { exit_status } => exit_status
                .and_then(|code| u8::try_from(code).ok())
                .unwrap_or(0),
            Self::RemoteFailure { exit_status } => u8::try_from(*exit_status)
                .ok()
                .filter(|code| *code != 0)
                .unwrap_or(1),
            Self::Cancelled => 130,
            Self::Signalled { .. } | Self::ConnectionLost { .. } => 1,
        }
    }
}

/// Owns one session from dial to close
pub struct ConnectionManager {
    settings: SessionSettings,
    trust: Arc<TrustStore>,
    shutdown: ShutdownSignal,
    state: Mutex<SessionState>,
    session_id: String,
    /// Replaces the process's stdio for the native shell when set
    local_io: Mutex<Option<LocalIo>>,
}

impl ConnectionManager {
    pub fn new(settings: SessionSettings, trust: Arc<TrustStore>, shutdown: ShutdownSignal) -> Self {
        Self {
            settings,
            trust,
            shutdown,
            state: Mutex::new(SessionState::Idle),
            session_id: uuid::Uuid::new_v4().to_string(),
            local_io: Mutex::new(None),
        }
    }

    /// Stream the native shell to `io` instead of stdin/stdout/stderr
    pub fn with_local_io(self, io: LocalIo) -> Self {
        *self.local_io.lock() = Some(io);
        self
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn advance(&self, next: SessionState) -> Result<(), SshError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(SshError::ProtocolError(format!(
                "invalid session transition {:?} -> {:?}",
                *state, next
            )));
        }
        debug!("Session {}: {:?} -> {:?}", self.session_id, *state, next);
        *state = next;
        Ok(())
    }

    /// Open the session described by `params` and stream it to the local
    /// terminal until it ends. Host keys are checked according to the trust
    /// store's policy. Failures before streaming are errors; anything after
    /// is reported as an outcome.
    pub async fn connect(&self, params: ConnectionParameters) -> Result<SessionOutcome, SshError> {
        info!(
            "Session {} to {}@{}",
            self.session_id,
            params.username,
            params.target_address()
        );

        let result = match &self.settings.transport {
            TransportStrategy::Native => self.connect_native(params).await,
            TransportStrategy::External(client) => self.connect_external(client, &params).await,
        };

        let terminal_state = match &result {
            Ok(outcome) if outcome.is_clean() => SessionState::Closed,
            _ => SessionState::Failed,
        };
        if let Err(e) = self.advance(terminal_state) {
            warn!("{}", e);
        }

        if let Err(e) = &result {
            warn!("Session {} failed: {}", self.session_id, e);
        }
        result
    }

    async fn connect_native(
        &self,
        params: ConnectionParameters,
    ) -> Result<SessionOutcome, SshError> {
        let client = SshClient::new(params, self.settings.clone(), self.trust.clone());

        self.advance(SessionState::Dialing)?;
        let stream = tokio::select! {
            biased;
            _ = self.shutdown.triggered() => return Ok(SessionOutcome::Cancelled),
            stream = client.dial() => stream?,
        };

        self.advance(SessionState::Authenticating)?;
        let handle = tokio::select! {
            biased;
            _ = self.shutdown.triggered() => return Ok(SessionOutcome::Cancelled),
            handle = client.handshake(stream) => handle?,
        };

        let controller = spawn_handle_owner_task(handle, self.session_id.clone());

        // Whoever triggers shutdown first, the transport gets closed
        let closer = {
            let controller = controller.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                shutdown.triggered().await;
                controller.disconnect().await;
            })
        };

        let result = self.run_shell(&controller).await;

        self.shutdown.trigger(ShutdownReason::SessionEnded);
        if let Err(e) = closer.await {
            warn!("Transport closer failed: {}", e);
        }
        result
    }

    async fn run_shell(&self, controller: &HandleController) -> Result<SessionOutcome, SshError> {
        self.advance(SessionState::PtyRequested)?;

        let channel = tokio::select! {
            biased;
            _ = self.shutdown.triggered() => return Ok(SessionOutcome::Cancelled),
            channel = controller.open_session_channel() => channel?,
        };

        let (cols, rows) = terminal::terminal_size();
        let pty = PtyRequest::new(self.settings.term.clone(), cols, rows);
        let shell = tokio::select! {
            biased;
            _ = self.shutdown.triggered() => return Ok(SessionOutcome::Cancelled),
            shell = ChannelShell::open(channel, &pty) => shell?,
        };

        self.advance(SessionState::Streaming)?;

        let injected = self.local_io.lock().take();
        let (io, resize_task) = match injected {
            Some(io) => (io, None),
            None => match terminal::spawn_resize_watcher(self.shutdown.token()) {
                Some((rx, task)) => (LocalIo::process(Some(rx)), Some(task)),
                None => (LocalIo::process(None), None),
            },
        };

        let outcome = {
            let _raw = RawModeGuard::enter()?;
            stream_session(shell, io, &self.shutdown).await
        };

        if let Some(task) = resize_task {
            if let Err(e) = task.await {
                debug!("Resize watcher ended abnormally: {}", e);
            }
        }

        info!("Session {} ended: {:?}", self.session_id, outcome);
        Ok(outcome)
    }

    async fn connect_external(
        &self,
        client: &ExternalClient,
        params: &ConnectionParameters,
    ) -> Result<SessionOutcome, SshError> {
        self.advance(SessionState::Streaming)?;
        let outcome = client.run(params, &self.shutdown).await;
        self.shutdown.trigger(ShutdownReason::SessionEnded);
        outcome
    }
}

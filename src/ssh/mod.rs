//! SSH module - host trust, transport and interactive sessions
//!
//! Uses the russh client library for the protocol itself.
//!
//! # Features
//! - Host key verification via ~/.ssh/known_hosts with trust on first use
//! - Single-owner transport handle with idempotent disconnect
//! - PTY shell streaming with cancellation on SIGINT/SIGTERM
//! - Optional external client (`ssh`, `plink`) instead of the native transport

mod client;
pub mod config;
mod error;
pub mod external;
mod handle_owner;
pub mod known_hosts;
pub mod lifecycle;
pub mod session;
pub mod shutdown;
pub mod trust;

pub use client::{dial_with_timeout, ClientHandler, SshClient};
pub use config::{SessionSettings, TransportStrategy, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_TERM};
pub use error::{SshError, TrustError};
pub use external::{ArgsStyle, ExternalClient};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use lifecycle::{ConnectionManager, SessionOutcome, SessionState};
pub use session::{stream_session, ChannelShell, LocalIo, PtyRequest, RemoteShell, ShellEvent};
pub use shutdown::{ShutdownReason, ShutdownSignal};
pub use trust::{
    ask_yes_no, ConsolePrompter, HostKeyPolicy, HostKeyPrompter, RejectReason, TrustDecision,
    TrustStore,
};

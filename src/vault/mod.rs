//! Vault module - Bitwarden CLI access and the cached session key
//!
//! The cached session is tried first. The master password is only asked for
//! when there is no cached key, or once when the cached key turns out to be
//! stale.

pub mod bitwarden;
mod error;
pub mod session_cache;

use std::io;

use tracing::{info, warn};
use zeroize::Zeroizing;

pub use bitwarden::{classify_failure, Bitwarden, DEFAULT_BW_EXECUTABLE};
pub use error::VaultError;
pub use session_cache::{SessionCache, SESSION_FILE_NAME};

use crate::credentials::LoginRecord;
use crate::terminal;

/// Supplies the master password when the vault has to be unlocked
pub trait MasterPasswordSource {
    fn master_password(&self) -> io::Result<Zeroizing<String>>;
}

/// Hidden prompt on the controlling terminal
pub struct TerminalPasswordPrompt;

impl MasterPasswordSource for TerminalPasswordPrompt {
    fn master_password(&self) -> io::Result<Zeroizing<String>> {
        terminal::read_hidden_line("? Master password: [input is hidden] ")
    }
}

/// Where the active session key came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Cached,
    Unlocked,
}

/// Ask for the master password, unlock, and cache the new key
pub async fn unlock_and_cache(
    bw: &mut Bitwarden,
    cache: &SessionCache,
    prompt: &dyn MasterPasswordSource,
) -> Result<Zeroizing<String>, VaultError> {
    let master = prompt.master_password()?;
    let key = bw.unlock(&master).await?;
    cache.save(&key)?;
    bw.set_session(Some(key.clone()));
    Ok(key)
}

/// Give `bw` a session key: the cached one if present, a fresh one
/// otherwise.
pub async fn ensure_session(
    bw: &mut Bitwarden,
    cache: &SessionCache,
    prompt: &dyn MasterPasswordSource,
) -> Result<SessionSource, VaultError> {
    if let Some(key) = cache.load()? {
        bw.set_session(Some(key));
        return Ok(SessionSource::Cached);
    }

    info!("No cached vault session, unlocking");
    unlock_and_cache(bw, cache, prompt).await?;
    Ok(SessionSource::Unlocked)
}

/// SSH login records for `host`. A cached session rejected as expired is
/// discarded and replaced by one fresh unlock before a single retry.
pub async fn find_ssh_credentials(
    bw: &mut Bitwarden,
    cache: &SessionCache,
    prompt: &dyn MasterPasswordSource,
    host: &str,
) -> Result<Vec<LoginRecord>, VaultError> {
    let source = ensure_session(bw, cache, prompt).await?;

    match bw.find_ssh_credentials(host).await {
        Err(e) if e.is_session_expired() && source == SessionSource::Cached => {
            warn!("Cached vault session rejected ({}), unlocking again", e);
            cache.discard()?;
            unlock_and_cache(bw, cache, prompt).await?;
            bw.find_ssh_credentials(host).await
        }
        result => result,
    }
}

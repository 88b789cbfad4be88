//! Bitwarden CLI boundary
//!
//! Every vault operation is one `bw` child process. The session key travels
//! only in the child's `BW_SESSION` environment variable and the master
//! password only in a dedicated variable read through `--passwordenv`, so
//! neither ever appears in an argument list.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use super::error::VaultError;
use crate::credentials::{parse_bw_items, LoginRecord};

pub const DEFAULT_BW_EXECUTABLE: &str = "bw";

/// Environment variable that carries the master password to `bw unlock`
const MASTER_PASSWORD_ENV: &str = "VAULTSHELL_MASTER_PASSWORD";

const SESSION_ENV: &str = "BW_SESSION";

pub struct Bitwarden {
    executable: String,
    session: Option<Zeroizing<String>>,
}

impl Bitwarden {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            session: None,
        }
    }

    pub fn set_session(&mut self, session: Option<Zeroizing<String>>) {
        self.session = session;
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Locate the executable, either as a path or on `PATH`
    pub fn ensure_installed(&self) -> Result<PathBuf, VaultError> {
        find_executable(&self.executable)
            .ok_or_else(|| VaultError::NotInstalled(self.executable.clone()))
    }

    /// `bw list items --search <search>`
    pub async fn list_items(&self, search: &str) -> Result<Vec<LoginRecord>, VaultError> {
        let mut stdout = self.run(&["list", "items", "--search", search], None).await?;
        let records = parse_bw_items(&stdout);
        stdout.zeroize();

        let records = records?;
        debug!("Vault search {:?} returned {} login records", search, records.len());
        Ok(records)
    }

    /// Login records tagged with `ssh://<host>`
    pub async fn find_ssh_credentials(&self, host: &str) -> Result<Vec<LoginRecord>, VaultError> {
        self.list_items(&format!("ssh://{}", host)).await
    }

    /// `bw unlock --raw`, returning the new session key
    pub async fn unlock(&self, master_password: &str) -> Result<Zeroizing<String>, VaultError> {
        let mut stdout = self
            .run(
                &["unlock", "--raw", "--passwordenv", MASTER_PASSWORD_ENV],
                Some((MASTER_PASSWORD_ENV, master_password)),
            )
            .await?;

        let key = Zeroizing::new(String::from_utf8_lossy(&stdout).trim().to_string());
        stdout.zeroize();

        if key.is_empty() {
            return Err(VaultError::EmptySessionKey);
        }
        info!("Vault unlocked");
        Ok(key)
    }

    pub async fn lock(&self) -> Result<(), VaultError> {
        self.run(&["lock"], None).await?;
        info!("Vault locked");
        Ok(())
    }

    pub async fn sync(&self) -> Result<(), VaultError> {
        self.run(&["sync"], None).await?;
        info!("Vault synced");
        Ok(())
    }

    async fn run(&self, args: &[&str], secret_env: Option<(&str, &str)>) -> Result<Vec<u8>, VaultError> {
        let mut command = Command::new(&self.executable);
        command
            .arg("--nointeraction")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(session) = &self.session {
            command.env(SESSION_ENV, session.as_str());
        }
        if let Some((name, value)) = secret_env {
            command.env(name, value);
        }

        debug!("Running {} {}", self.executable, args.join(" "));
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VaultError::NotInstalled(self.executable.clone())
            } else {
                VaultError::Io(e)
            }
        })?;

        if output.status.success() {
            return Ok(output.stdout);
        }

        let mut stdout = output.stdout;
        stdout.zeroize();
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(
            args.first().copied().unwrap_or_default(),
            output.status.code(),
            &stderr,
        ))
    }
}

/// Map a failed `bw` invocation to an error kind using its stderr
pub fn classify_failure(command: &str, status: Option<i32>, stderr: &str) -> VaultError {
    let message = stderr.trim();
    let lower = message.to_lowercase();

    if lower.contains("invalid master password") {
        VaultError::InvalidMasterPassword
    } else if lower.contains("not logged in")
        || lower.contains("vault is locked")
        || lower.contains("session key is invalid")
    {
        VaultError::SessionExpired(message.to_string())
    } else {
        VaultError::CommandFailed {
            command: command.to_string(),
            status,
            stderr: message.to_string(),
        }
    }
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).find_map(|dir| {
        let full = dir.join(name);
        if is_executable(&full) {
            return Some(full);
        }
        #[cfg(windows)]
        {
            let exe = full.with_extension("exe");
            if is_executable(&exe) {
                return Some(exe);
            }
        }
        None
    })
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = path.metadata() else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

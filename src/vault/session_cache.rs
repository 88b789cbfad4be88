//! Cached vault session key
//!
//! The key printed by `bw unlock --raw` is kept in a private file in the
//! temp directory so consecutive connects do not ask for the master
//! password again. `vaultshell lock` removes it.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use zeroize::Zeroizing;

use super::error::VaultError;

pub const SESSION_FILE_NAME: &str = "vaultshell_session";

#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<tmp>/vaultshell_session`
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(SESSION_FILE_NAME)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached key, `None` when there is no (non-empty) cache file
    pub fn load(&self) -> Result<Option<Zeroizing<String>>, VaultError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No cached session at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let key = contents.trim();
        if key.is_empty() {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(key.to_string())))
    }

    pub fn save(&self, key: &str) -> Result<(), VaultError> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;

        // mode() only applies on creation
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(key.as_bytes())?;
        file.sync_all()?;
        info!("Vault session cached at {:?}", self.path);
        Ok(())
    }

    /// Remove the cache file. A missing file is fine.
    pub fn discard(&self) -> Result<(), VaultError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Discarded cached session {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_cache() {
        let temp = tempdir().unwrap();
        let cache = SessionCache::new(temp.path().join(SESSION_FILE_NAME));

        assert!(cache.load().unwrap().is_none());
        cache.discard().unwrap();
    }

    #[test]
    fn test_save_load_discard() {
        let temp = tempdir().unwrap();
        let cache = SessionCache::new(temp.path().join(SESSION_FILE_NAME));

        cache.save("KEY123").unwrap();
        assert_eq!(cache.load().unwrap().unwrap().as_str(), "KEY123");

        cache.save("KEY456").unwrap();
        assert_eq!(cache.load().unwrap().unwrap().as_str(), "KEY456");

        cache.discard().unwrap();
        assert!(!cache.path().exists());
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn test_whitespace_only_file_is_empty() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(SESSION_FILE_NAME);
        fs::write(&path, "  \n").unwrap();

        assert!(SessionCache::new(path).load().unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let path = temp.path().join(SESSION_FILE_NAME);
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        SessionCache::new(path.clone()).save("KEY").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

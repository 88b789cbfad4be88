//! Command line interface
//!
//! `connect` looks the host up in the vault, picks one login and opens an
//! interactive session. `unlock`, `lock` and `sync` manage the vault session.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::config::{ConfigStorage, Settings, StorageError};
use crate::credentials::{resolve, ResolveError, ResolveOptions};
use crate::ssh::{
    ConnectionManager, ConsolePrompter, HostKeyPolicy, KnownHostsStore, SessionOutcome, SshError,
    ShutdownSignal, TrustStore,
};
use crate::vault::{
    self, Bitwarden, MasterPasswordSource, SessionCache, TerminalPasswordPrompt, VaultError,
};

/// Interactive SSH sessions with credentials from your Bitwarden vault
#[derive(Parser, Debug)]
#[command(name = "vaultshell")]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open an interactive shell on a host stored in the vault
    #[command(visible_alias = "login")]
    Connect {
        /// Host as it appears in the `ssh://` URI of the login
        host: String,

        /// Pick the login with this username
        #[arg(short, long)]
        user: Option<String>,

        /// Port, overrides the one in the URI
        #[arg(short, long)]
        port: Option<u16>,

        /// Accept any host key without checking known_hosts
        #[arg(long)]
        no_host_key_check: bool,
    },

    /// Unlock the vault and cache the session key
    Unlock {
        /// Print only the session key
        #[arg(long)]
        raw: bool,
    },

    /// Lock the vault and forget the cached session key
    Lock,

    /// Pull the latest vault data from the server
    Sync,
}

/// Any error that ends a command
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Settings: {0}")]
    Config(#[from] StorageError),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// Loaded settings plus the vault handles shared by all commands
pub struct App {
    settings: Settings,
    bw: Bitwarden,
    cache: SessionCache,
    prompt: Box<dyn MasterPasswordSource>,
}

impl App {
    pub fn new(settings: Settings, cache: SessionCache, prompt: Box<dyn MasterPasswordSource>) -> Self {
        let bw = Bitwarden::new(settings.bw_executable.clone());
        Self {
            settings,
            bw,
            cache,
            prompt,
        }
    }

    /// Settings from `--config` or the default location, terminal prompt,
    /// cache in the temp directory
    pub async fn load(config: Option<PathBuf>) -> Result<Self, AppError> {
        let storage = match config {
            Some(path) => ConfigStorage::with_path(path),
            None => ConfigStorage::new()?,
        };
        let settings = storage.load().await?;
        debug!("Settings loaded from {:?}", storage.path());

        Ok(Self::new(
            settings,
            SessionCache::new(SessionCache::default_path()),
            Box::new(TerminalPasswordPrompt),
        ))
    }

    /// Run one command, returning the process exit code
    pub async fn execute(&mut self, command: Commands) -> Result<u8, AppError> {
        match command {
            Commands::Connect {
                host,
                user,
                port,
                no_host_key_check,
            } => {
                let outcome = self
                    .connect(&host, user.as_deref(), port, no_host_key_check)
                    .await?;
                report_outcome(&outcome);
                Ok(outcome.exit_code())
            }
            Commands::Unlock { raw } => {
                self.bw.ensure_installed()?;
                let key = vault::unlock_and_cache(&mut self.bw, &self.cache, self.prompt.as_ref())
                    .await?;
                if raw {
                    println!("{}", key.as_str());
                } else {
                    println!("Your vault is now unlocked. The session key is cached for vaultshell.");
                    println!("To use it with bw directly:");
                    println!("  export BW_SESSION=\"{}\"", key.as_str());
                }
                Ok(0)
            }
            Commands::Lock => {
                self.bw.ensure_installed()?;
                self.bw.set_session(self.cache.load()?);
                self.bw.lock().await?;
                self.cache.discard()?;
                println!("Your vault is locked.");
                Ok(0)
            }
            Commands::Sync => {
                self.bw.ensure_installed()?;
                self.bw.set_session(self.cache.load()?);
                self.bw.sync().await?;
                println!("Syncing complete.");
                Ok(0)
            }
        }
    }

    async fn connect(
        &mut self,
        host: &str,
        user: Option<&str>,
        port: Option<u16>,
        no_host_key_check: bool,
    ) -> Result<SessionOutcome, AppError> {
        self.bw.ensure_installed()?;

        let records =
            vault::find_ssh_credentials(&mut self.bw, &self.cache, self.prompt.as_ref(), host)
                .await?;

        let options = ResolveOptions {
            port_override: port,
            host_key_check: self.settings.host_key_check && !no_host_key_check,
        };
        let params = resolve(&records, host, user, options)?;
        info!("Using login {} for {}", params.username, params.target_address());

        let known_hosts = KnownHostsStore::open(self.settings.known_hosts_path())?;
        let trust = Arc::new(TrustStore::new(
            host_key_policy(params.host_key_check, &mut io::stderr()),
            known_hosts,
            Arc::new(ConsolePrompter),
        ));

        let shutdown = ShutdownSignal::new();
        let watcher = shutdown.spawn_signal_watcher();

        let manager = ConnectionManager::new(self.settings.session_settings(), trust, shutdown);
        let result = manager.connect(params).await;
        watcher.abort();

        Ok(result?)
    }
}

/// Policy for this connect. Disabled checking is always announced on
/// `notice`, whatever the log filter.
fn host_key_policy<W: Write>(host_key_check: bool, notice: &mut W) -> HostKeyPolicy {
    let policy = HostKeyPolicy::from_flag(host_key_check);
    if policy == HostKeyPolicy::Insecure {
        if let Err(e) = writeln!(
            notice,
            "WARNING: host key checking is disabled, the server's identity will not be verified"
        ) {
            debug!("Could not write host key notice: {}", e);
        }
    }
    policy
}

fn report_outcome(outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Closed { .. } => {}
        SessionOutcome::RemoteFailure { exit_status } => {
            eprintln!("Remote shell exited with status {}", exit_status)
        }
        SessionOutcome::Signalled { signal } => eprintln!("Remote shell killed by signal {}", signal),
        SessionOutcome::Cancelled => eprintln!("Connection closed"),
        SessionOutcome::ConnectionLost { reason } => eprintln!("Connection lost: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use zeroize::Zeroizing;

    struct FixedPassword(&'static str);

    impl MasterPasswordSource for FixedPassword {
        fn master_password(&self) -> io::Result<Zeroizing<String>> {
            Ok(Zeroizing::new(self.0.to_string()))
        }
    }

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "vaultshell",
            "connect",
            "web01",
            "-u",
            "alice",
            "-p",
            "2222",
            "--no-host-key-check",
        ])
        .unwrap();

        match cli.command {
            Commands::Connect {
                host,
                user,
                port,
                no_host_key_check,
            } => {
                assert_eq!(host, "web01");
                assert_eq!(user.as_deref(), Some("alice"));
                assert_eq!(port, Some(2222));
                assert!(no_host_key_check);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_login_alias_and_globals() {
        let cli =
            Cli::try_parse_from(["vaultshell", "login", "web01", "--verbose", "--config", "/tmp/s.json"])
                .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/s.json")));
        assert!(matches!(cli.command, Commands::Connect { user: None, port: None, .. }));
    }

    #[test]
    fn test_parse_vault_commands() {
        assert!(matches!(
            Cli::try_parse_from(["vaultshell", "unlock", "--raw"]).unwrap().command,
            Commands::Unlock { raw: true }
        ));
        assert!(matches!(
            Cli::try_parse_from(["vaultshell", "lock"]).unwrap().command,
            Commands::Lock
        ));
        assert!(Cli::try_parse_from(["vaultshell", "connect"]).is_err());
        assert!(Cli::try_parse_from(["vaultshell", "connect", "h", "-p", "99999"]).is_err());
    }

    #[test]
    fn test_insecure_policy_is_announced() {
        let mut notice = Vec::new();
        assert_eq!(host_key_policy(true, &mut notice), HostKeyPolicy::Checked);
        assert!(notice.is_empty());

        assert_eq!(host_key_policy(false, &mut notice), HostKeyPolicy::Insecure);
        let text = String::from_utf8(notice).unwrap();
        assert!(text.starts_with("WARNING: host key checking is disabled"));
    }

    #[test]
    fn test_error_exit_code() {
        let err = AppError::from(ResolveError::NoCredentials("h1".to_string()));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "Did not find credentials for host h1 in your vault");
    }

    #[cfg(unix)]
    mod with_fake_bw {
        use super::*;
        use crate::vault::bitwarden::tests::install_fake_bw;
        use crate::vault::SESSION_FILE_NAME;

        fn app(dir: &std::path::Path, password: &'static str) -> App {
            let settings = Settings {
                bw_executable: install_fake_bw(dir),
                known_hosts_path: Some(dir.join("known_hosts")),
                ..Default::default()
            };
            App::new(
                settings,
                SessionCache::new(dir.join(SESSION_FILE_NAME)),
                Box::new(FixedPassword(password)),
            )
        }

        #[tokio::test]
        async fn test_connect_unknown_host() {
            let temp = tempfile::tempdir().unwrap();
            let mut app = app(temp.path(), "right");

            let err = app
                .connect("db01", None, None, false)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Resolve(ResolveError::NoCredentials(ref h)) if h == "db01"));
        }

        #[tokio::test]
        async fn test_connect_user_not_in_vault() {
            let temp = tempfile::tempdir().unwrap();
            let mut app = app(temp.path(), "right");

            // bob's login has no ssh:// URI
            let err = app
                .connect("web01", Some("bob"), None, false)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                AppError::Resolve(ResolveError::NoMatchingUser { ref user, .. }) if user == "bob"
            ));
        }

        #[tokio::test]
        async fn test_connect_wrong_master_password() {
            let temp = tempfile::tempdir().unwrap();
            let mut app = app(temp.path(), "wrong");

            let err = app.connect("web01", None, None, false).await.unwrap_err();
            assert!(matches!(err, AppError::Vault(VaultError::InvalidMasterPassword)));
        }

        #[tokio::test]
        async fn test_unlock_then_lock() {
            let temp = tempfile::tempdir().unwrap();
            let cache = SessionCache::new(temp.path().join(SESSION_FILE_NAME));
            let mut app = app(temp.path(), "right");

            assert_eq!(app.execute(Commands::Unlock { raw: true }).await.unwrap(), 0);
            assert_eq!(cache.load().unwrap().unwrap().as_str(), "KEY123");

            assert_eq!(app.execute(Commands::Sync).await.unwrap(), 0);

            assert_eq!(app.execute(Commands::Lock).await.unwrap(), 0);
            assert!(cache.load().unwrap().is_none());
        }

        #[tokio::test]
        async fn test_missing_bw() {
            let temp = tempfile::tempdir().unwrap();
            let mut app = App::new(
                Settings {
                    bw_executable: temp.path().join("nope").display().to_string(),
                    ..Default::default()
                },
                SessionCache::new(temp.path().join(SESSION_FILE_NAME)),
                Box::new(FixedPassword("right")),
            );

            let err = app.execute(Commands::Sync).await.unwrap_err();
            assert!(matches!(err, AppError::Vault(VaultError::NotInstalled(_))));
        }
    }
}

//! vaultshell - interactive SSH sessions with credentials resolved from a
//! Bitwarden vault
//!
//! The binary is a thin wrapper around [`run`].

pub mod cli;
pub mod config;
pub mod credentials;
pub mod ssh;
pub mod terminal;
pub mod vault;

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{App, AppError, Cli};

/// Initialize logging. The terminal belongs to the remote shell, so only
/// warnings reach stderr unless asked otherwise.
fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_command(cli: Cli) -> Result<u8, AppError> {
    let mut app = App::load(cli.config).await?;
    app.execute(cli.command).await
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run_command(cli));

    // The stdin reader may still be parked in a blocking read
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::debug!("Command failed: {:?}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

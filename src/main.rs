//! wiresocks CLI - WireGuard tunnel exposed as a SOCKS5 proxy
//!
//! Brings up a userspace WireGuard tunnel from a configuration file and
//! serves SOCKS5 on a local address until interrupted.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use wiresocks::app::{self, Options, DEFAULT_LISTEN};
use wiresocks::config::ConfigSource;
use wiresocks::WireSocksError;

/// wiresocks - WireGuard tunnel behind a local SOCKS5 proxy
#[derive(Parser, Debug)]
#[command(name = "wiresocks")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging (tunnel device activity)
    #[arg(short, long)]
    verbose: bool,

    /// SOCKS5 listen address
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Path to WireGuard configuration file, or - for standard input
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let options = Options {
        source: ConfigSource::from_arg(&args.config),
        listen: args.listen,
    };

    match run_with_cleanup(options).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Run until the proxy fails, Ctrl+C or SIGTERM. Dropping the run future
/// stops the listener and the device.
async fn run_with_cleanup(options: Options) -> Result<(), WireSocksError> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = app::run(options) => {
            result
        }
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
            Ok(())
        }
    }
}

//! copilot-relay -- OpenAI-compatible reverse proxy for GitHub Copilot.
//!
//! Entry point. Wires together:
//!   - Configuration loading (TOML file + env overrides)
//!   - Tracing/logging
//!   - Auth service, worker pool, proxy engine, models catalog
//!   - HTTP server with CORS, security headers, panic recovery
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use copilot_relay::config::Config;
use copilot_relay::{build_app, AppState};

/// Deadline for draining the worker pool on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("copilot-relay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
copilot-relay {version} -- OpenAI-compatible reverse proxy for GitHub Copilot

USAGE:
    copilot-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML)
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    COPILOT_PORT           Override the listen port
    GITHUB_TOKEN           Seed the GitHub OAuth token
    COPILOT_TOKEN          Seed the Copilot API token
    AUTOREVIEW_UI_HOST     Credential store host
    LOG_LEVEL              Log level (trace|debug|info|warn|error)
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = parse_args();

    let config = Config::load(cli.config_path.as_deref(), false)
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "Starting copilot-relay"
    );

    let listen_addr = config.listen_addr();
    let state = AppState::from_config(config);
    let pool = state.pool.clone();
    let app = build_app(state);

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  copilot-relay v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  Models:      http://{listen_addr}/v1/models");
    println!("  Chat:        http://{listen_addr}/v1/chat/completions");
    println!("  Completions: http://{listen_addr}/v1/completions");
    println!("  Health:      http://{listen_addr}/health");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping worker pool");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, pool.stop()).await.is_err() {
        tracing::warn!("Worker pool did not drain within the shutdown deadline");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber. `LOG_LEVEL` (or `RUST_LOG` for full
/// filter syntax) takes precedence over the config file.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("copilot_relay={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

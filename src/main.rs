//! fx-executor - on-premise trading executor agent.
//!
//! Sits between the cloud control plane and a local broker terminal
//! bridge: consumes commands from the push channel, evaluates strategies
//! against live market data, submits orders through the bridge sockets and
//! enforces account-wide safety limits. Exposes no listening ports;
//! telemetry is pushed upstream.
//!
//! # Exit codes
//! - `0` normal shutdown
//! - `1` configuration error
//! - `2` authentication failure at registration
//! - `3` fatal supervisor escalation

use clap::Parser;
use fx_executor::application::system::Application;
use fx_executor::config::Config;
use fx_executor::domain::errors::ExecutorError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error, info};
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "fx-executor", about = "On-premise trading executor agent")]
struct Args {
    /// Path to the agent configuration file
    #[arg(long, short, default_value = "executor.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("fx-executor {} starting...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    info!(
        "configuration loaded: control={}, bridge rpc={}, stream={}",
        config.control.base_url, config.bridge.rpc_addr, config.bridge.stream_addr
    );

    let app = match Application::build(config).await {
        Ok(app) => app,
        Err(ExecutorError::Auth(reason)) => {
            error!("authentication failure: {reason}");
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("startup failed: {e}");
            return ExitCode::from(1);
        }
    };

    let code = app.run().await;
    ExitCode::from(code as u8)
}

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use agent_board::app::{AppState, build_router};
use agent_board::config::BoardConfig;
use agent_board::dispatch::{CommandExecutor, spawn_reclaim_sweep};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = BoardConfig::from_env().context("invalid configuration")?;

    eprintln!("Agent Board v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);
    eprintln!("   Events: ws://0.0.0.0:{}/ws/events", config.port);

    // ── Database and dispatch ────────────────────────────────────────────
    let command = match &config.agent_command {
        Some(command) => command.clone(),
        None => {
            warn!("AGENT_BOARD_AGENT_CMD not set; workers will finish every ticket with a no-op");
            "true".to_string()
        }
    };
    let state = AppState::open(&config, Arc::new(CommandExecutor::new(command)))
        .await
        .with_context(|| format!("failed to start with database {}", config.db_path.display()))?;
    let _sweep = spawn_reclaim_sweep(Arc::clone(&state.lease), config.sweep_interval);

    // ── HTTP / WS ────────────────────────────────────────────────────────
    let app = build_router(&state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(port = config.port, "Agent board server started");

    let workers = Arc::clone(&state.workers);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    // In-flight runs are cancelled; their tickets move to Blocked.
    let stopped = workers.stop_all_workers().await;
    info!(count = stopped.len(), "Workers stopped");
    Ok(())
}

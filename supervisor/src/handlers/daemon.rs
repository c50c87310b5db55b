//! Daemon start, ping and shutdown handlers

use std::sync::Arc;

use anyhow::{Context, Result};

use mcp_supervisor::config::McpConfig;
use mcp_supervisor::control::ControlPlane;
use mcp_supervisor::daemon::SupervisorDaemon;
use mcp_supervisor::events::{log_events, EventSink};
use mcp_supervisor::health::HealthMonitor;
use mcp_supervisor::registry::{ProcessRegistry, SqliteStore};
use mcp_supervisor::supervisor::ProcessSupervisor;

use super::CommandContext;

/// Handle the `daemon` command: serve in the foreground until shutdown
pub async fn run_daemon(ctx: &CommandContext, autostart: bool) -> Result<()> {
    let settings = ctx.file_config.supervisor.clone();
    let health_settings = ctx.file_config.health.clone();

    let db_path = settings.database_path()?;
    let store = SqliteStore::open_at(&db_path)
        .with_context(|| format!("Failed to open process store at {:?}", db_path))?;
    let registry = ProcessRegistry::with_memory_cache(store, settings.cache_ttl());

    let (events, event_rx) = EventSink::channel();
    tokio::spawn(log_events(event_rx));

    let supervisor = Arc::new(ProcessSupervisor::new(registry.clone(), events.clone(), settings));
    let reconciled = supervisor.reconcile().await?;
    tracing::info!(
        healed = reconciled.healed,
        adopted = reconciled.adopted,
        terminated = reconciled.terminated,
        "reconciled process records"
    );

    let definitions = match McpConfig::load()? {
        Some(config) => config.mcp_servers,
        None => {
            tracing::info!("no .mcp.json found; only explicitly started processes will run");
            Default::default()
        }
    };
    let control = ControlPlane::new(supervisor.clone()).with_definitions(definitions);

    let daemon = SupervisorDaemon::new(control.clone(), ctx.socket_path.clone());
    let shutdown = daemon.shutdown_signal();

    let monitor = Arc::new(HealthMonitor::new(
        registry,
        supervisor,
        events,
        health_settings,
    ));
    tokio::spawn(monitor.run(shutdown));

    if autostart {
        tokio::spawn(async move {
            let started = control.autostart().await;
            tracing::info!(started, "autostart complete");
        });
    }

    println!("Starting supervisor daemon (foreground)...");
    println!("  Socket: {:?}", ctx.socket_path);
    println!("  Store:  {:?}", db_path);
    println!("  Press Ctrl+C to stop.\n");

    daemon.run().await
}

/// Handle the `ping` command
pub async fn run_ping(ctx: &CommandContext) -> Result<()> {
    ctx.client().ping().await?;
    println!("Daemon is running at {:?}", ctx.socket_path);
    Ok(())
}

/// Handle the `shutdown` command
pub async fn run_shutdown(ctx: &CommandContext) -> Result<()> {
    let client = ctx.client();
    if !client.is_running().await {
        println!("Daemon is not running.");
        return Ok(());
    }
    client.shutdown().await?;
    println!("Daemon shutdown initiated.");
    Ok(())
}

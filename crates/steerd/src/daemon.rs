//! Daemon lifecycle: connect, bind, initialize, serve, clean up.

use std::sync::Arc;

use anyhow::Context;
use steer_api::ApiState;
use steer_bfrt::ConnectionManager;
use steer_core::SwitchConfigSet;
use steer_forwarding::{ForwardingStateManager, ManagerConfig};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::Cli;

pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    info!(config = %cli.config.display(), "steer daemon starting");

    let switches = SwitchConfigSet::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let master = &switches.master;
    info!(name = %master.name, addr = %master.addr, nodes = master.nodes.len(), "master switch");
    for peer in &switches.peers {
        info!(name = %peer.name, addr = %peer.addr, "peer switch configured, not driven");
    }

    // ── Connect and bind ───────────────────────────────────────

    let connection = ConnectionManager::new(cli.connect_options(master))
        .connect()
        .await
        .with_context(|| format!("connecting to {}", master.addr))?;
    let tables = connection
        .bind_program(cli.program(master))
        .await
        .context("binding dataplane program")?;
    info!(program = %tables.program(), "dataplane program bound");

    // ── Install forwarding state ───────────────────────────────

    let config = ManagerConfig::try_from(master)?;
    let mut manager = ForwardingStateManager::new(tables, config);
    manager.initialize().await.context("installing forwarding state")?;
    let manager = Arc::new(Mutex::new(manager));

    // ── Serve admin API ────────────────────────────────────────

    let router = steer_api::build_router(ApiState::shared(Arc::clone(&manager)));
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(addr = %cli.listen, "admin API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── Cleanup ────────────────────────────────────────────────

    info!("clearing forwarding state before exit");
    if let Err(e) = manager.lock().await.cleanup().await {
        error!(error = %e, "cleanup failed");
        return Err(e.into());
    }
    drop(connection);
    info!("steer daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

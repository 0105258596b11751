pub mod app_state;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod http;
pub mod persistence;
pub mod registry;
pub mod routes;
pub mod services;
pub mod storage;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::controller::RolloutController;
use crate::dispatch::{Dispatcher, PendingCommands};
use crate::registry::SessionRegistry;

pub use crate::telemetry::init_tracing;

/// Boot the hub and serve until a shutdown signal arrives.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = telemetry::init_metrics_recorder();

    if app_config.use_tls {
        warn!(
            "use_tls is enabled but TLS termination is not implemented; the gate listener is \
             plaintext. Front it with TLS or unset use_tls."
        );
    }

    let db = if app_config.database_url.trim().is_empty() {
        info!("no database configured, using in-memory node storage");
        None
    } else {
        match persistence::init_pool(&app_config.database_url).await {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(
                    ?err,
                    "failed to open database, falling back to in-memory node storage"
                );
                None
            }
        }
    };

    let repo = storage::open_node_repository(&app_config, db.clone()).await;
    let registry = SessionRegistry::new();
    let dispatcher = Dispatcher::new(
        registry.clone(),
        PendingCommands::default(),
        Duration::from_secs(app_config.command_timeout_secs),
    );

    let state = AppState {
        config: Arc::new(app_config),
        repo,
        registry,
        dispatcher,
        db,
        metrics_handle: metrics_handle.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    gate::serve(state.clone()).await?;

    match &state.db {
        Some(pool) => {
            let controller = RolloutController::new(
                pool.clone(),
                state.repo.clone(),
                state.registry.clone(),
                Duration::from_secs(state.config.canary_task_timeout_secs),
                Duration::from_secs(state.config.canary_hold_secs),
            );
            let tick = Duration::from_secs(state.config.rollout_tick_secs);
            let controller_shutdown = shutdown_rx.clone();
            tokio::spawn(controller.run(tick, controller_shutdown));
        }
        None => {
            warn!("rollout controller disabled without a database");
        }
    }

    let metrics_addr: SocketAddr = format!(
        "{}:{}",
        state.config.metrics_host, state.config.metrics_port
    )
    .parse()
    .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;
    {
        let handle = metrics_handle.clone();
        let mut metrics_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let wait = async move {
                let _ = metrics_shutdown.changed().await;
            };
            if let Err(err) = telemetry::serve_metrics(handle, metrics_addr, wait).await {
                error!(?err, "metrics server exited with error");
            }
        });
    }

    let api_addr = format!("{}:{}", state.config.http_host, state.config.http_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!(%api_addr, "operator api listening");

    let app = routes::build_router().with_state(state);
    let mut api_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = api_shutdown.changed().await;
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}

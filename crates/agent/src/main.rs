use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use quay_agent::executor::CommandExecutor;
use quay_agent::{config, identity, session, telemetry};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = Arc::new(config::load()?);

    let node_id = identity::load_or_create_node_id(&cfg.node_id_path())?;
    let machine_id = identity::machine_id();
    let executor = Arc::new(CommandExecutor::new(PathBuf::from(&cfg.stacks_dir)));

    let metrics_handle = telemetry::init_metrics_recorder();
    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;
    tokio::spawn(async move {
        if let Err(err) = telemetry::serve_metrics(metrics_handle, metrics_addr).await {
            error!(?err, "metrics server exited with error");
        }
    });

    info!(
        %node_id,
        hub = %format!("{}:{}", cfg.hub_host, cfg.hub_port),
        tls = cfg.tls_enabled(),
        version = session::VERSION,
        "agent starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping agent");
        let _ = shutdown_tx.send(true);
    });

    session::session_loop(cfg, node_id, machine_id, executor, shutdown_rx).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

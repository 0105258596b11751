use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{http::StatusCode, routing::get, Router};
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("metrics recorder already installed")
        })
        .clone()
}

pub async fn serve_metrics<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_gate_connect(result: &str) {
    counter!(
        "hub_gate_connect_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_command_dispatch(result: &str) {
    counter!(
        "hub_commands_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_rollout_tick(result: &str) {
    counter!(
        "hub_rollout_ticks_total",
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_node_reaped() {
    counter!("hub_nodes_reaped_total").increment(1);
}

//! The agent's side of the hub session: dial, handshake, then run the
//! stream until it breaks and reconnect with backoff.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use chrono::Utc;
use quay_common::proto::{self, Frame};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time;
use tokio_rustls::rustls::client::danger::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

use crate::config::AgentConfig;
use crate::executor::CommandExecutor;
use crate::telemetry;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const FRAME_CHANNEL_CAPACITY: usize = 128;

trait SessionIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> SessionIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Dial the hub and keep a session alive until shutdown. Every failed or
/// broken session is retried with jittered exponential backoff.
pub async fn session_loop(
    cfg: Arc<AgentConfig>,
    node_id: String,
    machine_id: String,
    executor: Arc<CommandExecutor>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut attempts: u32 = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let result =
            run_session_once(&cfg, &node_id, &machine_id, &executor, &mut shutdown).await;

        if *shutdown.borrow() {
            break;
        }

        match result {
            Ok(()) => {
                attempts = 0;
            }
            Err(err) => {
                telemetry::record_session_connect("failure");
                warn!(error = ?err, "hub session ended, retrying");
                attempts = attempts.saturating_add(1);
                let sleep = backoff_with_jitter(
                    Duration::from_millis(cfg.reconnect_backoff_ms),
                    Duration::from_millis(cfg.reconnect_backoff_max_ms),
                    attempts,
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = time::sleep(sleep) => {}
                }
            }
        }
    }

    Ok(())
}

async fn run_session_once(
    cfg: &AgentConfig,
    node_id: &str,
    machine_id: &str,
    executor: &Arc<CommandExecutor>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let transport = connect_transport(cfg).await?;
    let (mut read_half, mut write_half) = tokio::io::split(transport);
    let mut buffer = BytesMut::new();

    proto::write_frame(
        &mut write_half,
        &Frame::Handshake {
            node_id: node_id.to_string(),
            machine_id: machine_id.to_string(),
            version: VERSION.to_string(),
        },
    )
    .await?;

    // The hub confirms the session with one heartbeat.
    let ack = proto::read_frame(&mut read_half, &mut buffer)
        .await?
        .ok_or_else(|| anyhow!("stream closed before hub acknowledgement"))?;
    let Frame::Heartbeat { .. } = ack else {
        return Err(anyhow!("unexpected frame during handshake: {:?}", ack));
    };

    telemetry::record_session_connect("success");
    info!(%node_id, "connected to hub");

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_commands));

    let mut reader_handle = tokio::spawn({
        let executor = executor.clone();
        let frame_tx = frame_tx.clone();
        let mut shutdown = shutdown.clone();
        async move {
            read_loop(
                read_half,
                buffer,
                executor,
                semaphore,
                frame_tx,
                &mut shutdown,
            )
            .await
        }
    });

    let mut writer_handle = tokio::spawn({
        let mut shutdown = shutdown.clone();
        async move { write_loop(write_half, frame_rx, &mut shutdown).await }
    });

    let mut heartbeat_handle = tokio::spawn({
        let frame_tx = frame_tx.clone();
        let interval = Duration::from_secs(cfg.heartbeat_interval_secs);
        let mut shutdown = shutdown.clone();
        async move { heartbeat_loop(frame_tx, interval, &mut shutdown).await }
    });

    tokio::select! {
        _ = shutdown.changed() => {
            reader_handle.abort();
            writer_handle.abort();
            heartbeat_handle.abort();
            Ok(())
        }
        res = &mut reader_handle => {
            writer_handle.abort();
            heartbeat_handle.abort();
            res?
        }
        res = &mut writer_handle => {
            reader_handle.abort();
            heartbeat_handle.abort();
            res?
        }
        res = &mut heartbeat_handle => {
            reader_handle.abort();
            writer_handle.abort();
            res?
        }
    }
}

async fn read_loop(
    mut recv: ReadHalf<Box<dyn SessionIo>>,
    mut buffer: BytesMut,
    executor: Arc<CommandExecutor>,
    semaphore: Arc<Semaphore>,
    frame_tx: mpsc::Sender<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let frame = proto::read_frame(&mut recv, &mut buffer).await?;
        let Some(frame) = frame else {
            return Err(anyhow!("hub closed the stream"));
        };

        match frame {
            Frame::Command {
                id,
                command_type,
                args,
            } => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        telemetry::record_command_result("busy");
                        frame_tx
                            .send(Frame::command_result(
                                id,
                                1,
                                b"",
                                "too many concurrent commands",
                            ))
                            .await
                            .context("queue busy result")?;
                        continue;
                    }
                };

                let executor = executor.clone();
                let frame_tx = frame_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = executor.execute(&command_type, &args).await;
                    telemetry::record_command_result(if outcome.exit_code == 0 {
                        "ok"
                    } else {
                        "error"
                    });
                    let frame =
                        Frame::command_result(id, outcome.exit_code, &outcome.output, outcome.error);
                    if let Err(err) = frame_tx.send(frame).await {
                        error!(?err, "failed to queue command result");
                    }
                });
            }
            Frame::Heartbeat { .. } => {
                debug!("heartbeat from hub");
            }
            other => {
                warn!(frame = ?other, "unexpected frame from hub");
            }
        }
    }
}

async fn write_loop(
    mut send: WriteHalf<Box<dyn SessionIo>>,
    mut rx: mpsc::Receiver<Frame>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = rx.recv() => match frame {
                Some(frame) => proto::write_frame(&mut send, &frame).await?,
                None => return Ok(()),
            },
        }
    }
}

async fn heartbeat_loop(
    frame_tx: mpsc::Sender<Frame>,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; the handshake already counts as
    // liveness.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = ticker.tick() => {
                frame_tx
                    .send(Frame::Heartbeat { timestamp: Utc::now().timestamp() })
                    .await
                    .context("queue heartbeat frame")?;
            }
        }
    }
}

async fn connect_transport(cfg: &AgentConfig) -> anyhow::Result<Box<dyn SessionIo>> {
    let addr = format!("{}:{}", cfg.hub_host, cfg.hub_port);
    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connect to hub at {addr}"))?;

    if cfg.tls_enabled() {
        let tls_config = build_tls_config(cfg)?;
        let server_name = resolve_server_name(&cfg.hub_host)?;
        let connector = TlsConnector::from(tls_config);
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .context("tls handshake with hub")?;
        Ok(Box::new(tls_stream))
    } else {
        warn!("connecting to hub without TLS");
        Ok(Box::new(stream))
    }
}

fn build_tls_config(cfg: &AgentConfig) -> anyhow::Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(TLS_SERVER_ROOTS.iter().cloned());

    if let Some(ca_path) = cfg.ca_cert_path.as_ref() {
        use rustls::pki_types::pem::PemObject;
        let cert_bytes = std::fs::read(ca_path).context("read ca_cert_path")?;
        for cert in CertificateDer::pem_slice_iter(&cert_bytes) {
            root_store
                .add(cert.context("parse PEM certificate")?)
                .context("add hub CA certificate")?;
        }
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if cfg.tls_insecure_skip_verify {
        warn!("certificate verification is disabled for the hub connection");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(Arc::new(config))
}

fn resolve_server_name(host: &str) -> anyhow::Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned()).map_err(|err| anyhow!("invalid hub host: {}", err))
}

fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
    let mut backoff = base.saturating_mul(exp);
    if backoff > max {
        backoff = max;
    }
    let jitter_max = backoff.as_millis() / 2;
    let jitter_ms: u128 = rand::rng().random_range(0..=jitter_max.max(1));
    backoff + Duration::from_millis(jitter_ms as u64)
}

#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

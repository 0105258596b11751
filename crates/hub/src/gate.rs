//! Agent gate: the listener that accepts agent streams, validates the
//! handshake, and demultiplexes session traffic.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use chrono::Utc;
use quay_common::proto::{self, Frame};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::dispatch::CommandReply;
use crate::registry::AgentSession;
use crate::storage::NodeRecord;
use crate::telemetry;

const FRAME_CHANNEL_CAPACITY: usize = 128;

/// Bind the gate listener and start accepting agent streams. Returns the
/// bound address so callers binding port 0 can find it.
pub async fn serve(state: AppState) -> anyhow::Result<SocketAddr> {
    let addr = format!("{}:{}", state.config.gate_host, state.config.gate_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind agent gate on {addr}"))?;
    let local_addr = listener.local_addr().context("gate local address")?;
    info!(%local_addr, "agent gate listening");

    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(?err, "accept failed on agent gate");
                    continue;
                }
            };

            let state = state.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, state).await {
                    warn!(%peer, error = ?err, "agent stream ended with error");
                }
            });
        }
    });

    Ok(local_addr)
}

fn node_record(session: &AgentSession) -> NodeRecord {
    NodeRecord {
        id: session.node_id.clone(),
        alias: String::new(),
        machine_id: session.machine_id.clone(),
        version: session.version.clone(),
        remote_addr: session.remote_addr.clone(),
        last_seen: Some(Utc::now()),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> anyhow::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let mut buffer = BytesMut::new();

    // The first frame must be a handshake; anything else is a protocol
    // error and closes the stream.
    let first = proto::read_frame(&mut read_half, &mut buffer)
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream closed before handshake"))?;
    let Frame::Handshake {
        node_id,
        machine_id,
        version,
    } = first
    else {
        telemetry::record_gate_connect("protocol_error");
        anyhow::bail!("expected handshake as first frame");
    };
    let node_id = node_id.trim().to_string();
    if node_id.is_empty() {
        telemetry::record_gate_connect("invalid_node_id");
        anyhow::bail!("handshake carried an empty node id");
    }

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let session = Arc::new(AgentSession::new(
        node_id.clone(),
        machine_id,
        version,
        peer.to_string(),
        frame_tx,
    ));
    state.registry.insert(session.clone()).await;
    telemetry::record_gate_connect("accepted");

    if let Err(err) = state.repo.upsert(node_record(&session)).await {
        warn!(?err, %node_id, "failed to persist node on handshake");
    }
    info!(%node_id, remote_addr = %peer, "agent registered");

    let result = drive_session(&state, &session, read_half, write_half, buffer, frame_rx).await;

    // Record the moment the stream went away, then remove the session --
    // but only if it is still ours and not a replacement's entry.
    if let Err(err) = state.repo.upsert(node_record(&session)).await {
        warn!(?err, %node_id, "failed to persist disconnect timestamp");
    }
    if state
        .registry
        .remove_if_current(&node_id, session.session_id)
        .await
    {
        info!(%node_id, "agent disconnected");
    } else {
        debug!(%node_id, "stale session ended");
    }

    result
}

async fn drive_session(
    state: &AppState,
    session: &Arc<AgentSession>,
    mut read_half: OwnedReadHalf,
    mut write_half: OwnedWriteHalf,
    mut buffer: BytesMut,
    mut frame_rx: mpsc::Receiver<Frame>,
) -> anyhow::Result<()> {
    // Confirm the session before the agent starts waiting for commands.
    proto::write_frame(
        &mut write_half,
        &Frame::Heartbeat {
            timestamp: Utc::now().timestamp(),
        },
    )
    .await?;

    loop {
        tokio::select! {
            inbound = proto::read_frame(&mut read_half, &mut buffer) => {
                let Some(frame) = inbound? else {
                    return Ok(());
                };
                match frame {
                    Frame::Heartbeat { .. } => {
                        if let Err(err) = state.repo.upsert(node_record(session)).await {
                            warn!(?err, node_id = %session.node_id, "failed to refresh last_seen");
                        }
                    }
                    Frame::CommandResult {
                        command_id,
                        exit_code,
                        output_b64,
                        error,
                    } => {
                        let output = match proto::decode_output(&output_b64) {
                            Ok(output) => output,
                            Err(err) => {
                                warn!(?err, %command_id, "discarding undecodable result output");
                                Vec::new()
                            }
                        };
                        state.dispatcher.pending().complete(
                            &command_id,
                            CommandReply {
                                exit_code,
                                output,
                                error,
                            },
                        );
                    }
                    other => {
                        warn!(node_id = %session.node_id, frame = ?other, "unexpected frame on session");
                    }
                }
            }
            outbound = frame_rx.recv() => {
                let Some(frame) = outbound else {
                    return Ok(());
                };
                proto::write_frame(&mut write_half, &frame).await?;
            }
        }
    }
}

//! Synchronous command execution on top of the asynchronous agent stream.
//!
//! The dispatcher parks the caller on a one-shot slot keyed by command id;
//! the gate's receive loop delivers the matching result. At-most-once from
//! the caller's perspective: no retries, and a result that arrives after
//! the caller gave up is dropped where it lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use quay_common::proto::Frame;
use tokio::sync::oneshot;
use tracing::warn;

use crate::registry::SessionRegistry;
use crate::telemetry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub exit_code: i32,
    pub output: Vec<u8>,
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("node {0} is not connected")]
    NotConnected(String),
    #[error("failed to push command onto the agent stream")]
    SendFailed,
    #[error("command timed out")]
    DeadlineExceeded,
}

/// Commands in flight, keyed by command id. Writer is the gate receive
/// loop, reader is the parked dispatcher caller; the slot write is
/// non-blocking so a late result can never stall the receive loop.
///
/// A plain mutex on purpose: entries must also disappear when a caller's
/// future is dropped mid-wait, and that cleanup runs in `Drop`.
#[derive(Clone, Default)]
pub struct PendingCommands {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<CommandReply>>>>,
}

impl PendingCommands {
    pub fn register(&self, command_id: &str) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(command_id.to_string(), tx);
        rx
    }

    /// Deliver a result to the waiting caller. Unknown ids (expired or
    /// duplicate) are dropped with a warning.
    pub fn complete(&self, command_id: &str, reply: CommandReply) {
        let slot = {
            let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(command_id)
        };
        match slot {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    warn!(%command_id, "caller gave up before the result arrived");
                }
            }
            None => {
                warn!(%command_id, "dropping result for unknown or expired command");
            }
        }
    }

    pub fn remove(&self, command_id: &str) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(command_id);
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the pending entry on every exit path, including the caller's
/// future being dropped before the wait finishes.
struct PendingGuard {
    pending: PendingCommands,
    command_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.command_id);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: SessionRegistry,
    pending: PendingCommands,
    fallback_timeout: Duration,
    counter: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        registry: SessionRegistry,
        pending: PendingCommands,
        fallback_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            fallback_timeout,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    fn next_command_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("cmd-{nanos}-{seq}")
    }

    /// Route a command to the node's session and wait for its result.
    ///
    /// `timeout` is the caller's deadline; without one the configured
    /// fallback applies. At-most-once: an expired command is not recalled,
    /// the agent's eventual result is simply dropped.
    pub async fn execute(
        &self,
        node_id: &str,
        command_type: &str,
        args: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<CommandReply, DispatchError> {
        let Some(session) = self.registry.get(node_id).await else {
            telemetry::record_command_dispatch("not_connected");
            return Err(DispatchError::NotConnected(node_id.to_string()));
        };

        let command_id = self.next_command_id();
        let rx = self.pending.register(&command_id);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            command_id: command_id.clone(),
        };

        let frame = Frame::Command {
            id: command_id,
            command_type: command_type.to_string(),
            args,
        };
        if session.send(frame).await.is_err() {
            telemetry::record_command_dispatch("send_failed");
            return Err(DispatchError::SendFailed);
        }

        let deadline = timeout.unwrap_or(self.fallback_timeout);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => {
                telemetry::record_command_dispatch("ok");
                Ok(reply)
            }
            // The slot sender vanished without delivering; treat it the
            // same as a timeout, the command outcome is unknown.
            Ok(Err(_)) => {
                telemetry::record_command_dispatch("timeout");
                Err(DispatchError::DeadlineExceeded)
            }
            Err(_elapsed) => {
                telemetry::record_command_dispatch("timeout");
                Err(DispatchError::DeadlineExceeded)
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use quay_common::proto::Frame;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A live agent connection. Held in the registry and by the gate task
/// driving its socket; all lookups key on `node_id`, the session never
/// holds back-pointers into the stream task.
pub struct AgentSession {
    pub node_id: String,
    /// Per-connection nonce; teardown uses it to tell a stale session
    /// from its replacement.
    pub session_id: Uuid,
    pub machine_id: String,
    pub version: String,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    frame_tx: mpsc::Sender<Frame>,
}

impl AgentSession {
    pub fn new(
        node_id: String,
        machine_id: String,
        version: String,
        remote_addr: String,
        frame_tx: mpsc::Sender<Frame>,
    ) -> Self {
        Self {
            node_id,
            session_id: Uuid::new_v4(),
            machine_id,
            version,
            remote_addr,
            connected_at: Utc::now(),
            frame_tx,
        }
    }

    /// Queue a frame on the session's serialized write path. Fails once
    /// the gate task driving the socket has gone away.
    pub async fn send(&self, frame: Frame) -> Result<(), mpsc::error::SendError<Frame>> {
        self.frame_tx.send(frame).await
    }
}

/// Registry of currently connected agent sessions, keyed by node id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<AgentSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, replacing any previous one for the same node.
    pub async fn insert(&self, session: Arc<AgentSession>) {
        let mut guard = self.inner.write().await;
        let replaced = guard
            .insert(session.node_id.clone(), session)
            .is_some();
        if replaced {
            counter!("hub_session_replaced_total").increment(1);
        }
        gauge!("hub_agent_sessions").set(guard.len() as f64);
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<AgentSession>> {
        let guard = self.inner.read().await;
        guard.get(node_id).cloned()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        let guard = self.inner.read().await;
        guard.contains_key(node_id)
    }

    /// One consistent view of every live session. Callers that walk the
    /// node repository read this once instead of polling `contains` per
    /// row.
    pub async fn snapshot(&self) -> HashMap<String, Arc<AgentSession>> {
        let guard = self.inner.read().await;
        guard.clone()
    }

    /// Remove the entry for `node_id` only if it still belongs to the
    /// given connection. Returns whether anything was removed.
    pub async fn remove_if_current(&self, node_id: &str, session_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        let current = match guard.get(node_id) {
            Some(session) => session.session_id == session_id,
            None => false,
        };
        if current {
            guard.remove(node_id);
            counter!(
                "hub_session_disconnect_total",
                "reason" => "closed"
            )
            .increment(1);
            gauge!("hub_agent_sessions").set(guard.len() as f64);
        }
        current
    }

    pub async fn len(&self) -> usize {
        let guard = self.inner.read().await;
        guard.len()
    }
}

//! Per-owner fan-out of job lifecycle events to live connections.
//!
//! The registry is an injectable instance, lock-protected, so every test
//! and every process wires its own. Delivery is best-effort: a write
//! failure on one connection evicts only that connection and never blocks
//! delivery to the rest.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::jobs::model::Job;

/// Event pushed over the real-time channel.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn base(event_type: &'static str) -> Self {
        Self {
            event_type,
            job_id: None,
            status: None,
            progress: None,
            current_step: None,
            error: None,
            result: None,
            owner_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(job: &Job) -> Self {
        Self {
            job_id: Some(job.id),
            status: Some(job.status.clone()),
            progress: Some(job.progress),
            current_step: job.current_step.clone(),
            error: job.error_message.clone(),
            result: job.result.clone(),
            ..Self::base("job_status")
        }
    }

    /// Mid-run checkpoint event; the job row is known to be running.
    pub fn progress(job_id: Uuid, progress: i32, step: &str) -> Self {
        Self {
            job_id: Some(job_id),
            status: Some("running".to_string()),
            progress: Some(progress),
            current_step: Some(step.to_string()),
            ..Self::base("job_status")
        }
    }

    pub fn error(job: &Job) -> Self {
        Self {
            job_id: Some(job.id),
            status: Some(job.status.clone()),
            error: job.error_message.clone(),
            ..Self::base("error")
        }
    }

    pub fn transcript_ready(job: &Job) -> Self {
        Self {
            job_id: Some(job.id),
            result: job.result.clone(),
            ..Self::base("transcript_ready")
        }
    }

    pub fn connected(owner: Uuid) -> Self {
        Self {
            owner_id: Some(owner),
            ..Self::base("connected")
        }
    }

    pub fn ping() -> Self {
        Self::base("ping")
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// One live transport handle. `send` must not block: the WebSocket
/// implementation writes into a per-connection channel and reports failure
/// only when the far side is gone.
pub trait Connection: Send + Sync {
    fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// `Connection` over an unbounded channel drained by the WebSocket task.
pub struct ChannelConnection {
    tx: tokio::sync::mpsc::UnboundedSender<String>,
}

impl ChannelConnection {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Connection for ChannelConnection {
    fn send(&self, text: &str) -> anyhow::Result<()> {
        self.tx
            .send(text.to_string())
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

struct Entry {
    owner: Uuid,
    conn: Arc<dyn Connection>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    #[allow(dead_code)]
    metadata: Value,
}

#[derive(Default)]
struct Registry {
    owners: HashMap<Uuid, HashSet<Uuid>>,
    connections: HashMap<Uuid, Entry>,
}

/// Owner id -> set of live connections; one owner may hold many handles
/// (multi-device).
#[derive(Default)]
pub struct StatusNotifier {
    registry: RwLock<Registry>,
}

impl StatusNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        owner: Uuid,
        conn: Arc<dyn Connection>,
        metadata: Value,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut registry = self.registry.write().await;
        registry.owners.entry(owner).or_default().insert(id);
        registry.connections.insert(
            id,
            Entry {
                owner,
                conn,
                connected_at: now,
                last_activity: now,
                metadata,
            },
        );
        tracing::debug!(%owner, connection = %id, total = registry.connections.len(), "connection registered");
        id
    }

    pub async fn remove(&self, connection_id: Uuid) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.connections.remove(&connection_id) {
            if let Some(set) = registry.owners.get_mut(&entry.owner) {
                set.remove(&connection_id);
                if set.is_empty() {
                    registry.owners.remove(&entry.owner);
                }
            }
            tracing::debug!(owner = %entry.owner, connection = %connection_id, "connection removed");
        }
    }

    /// Record a keep-alive ack from the client.
    pub async fn touch(&self, connection_id: Uuid) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.connections.get_mut(&connection_id) {
            entry.last_activity = Utc::now();
        }
    }

    pub async fn connected_at(&self, connection_id: Uuid) -> Option<DateTime<Utc>> {
        let registry = self.registry.read().await;
        registry
            .connections
            .get(&connection_id)
            .map(|e| e.connected_at)
    }

    pub async fn last_activity(&self, connection_id: Uuid) -> Option<DateTime<Utc>> {
        let registry = self.registry.read().await;
        registry
            .connections
            .get(&connection_id)
            .map(|e| e.last_activity)
    }

    /// Deliver to every connection of one owner. Returns how many
    /// connections received the event.
    pub async fn send_to_owner(&self, owner: Uuid, event: &JobEvent) -> usize {
        let text = event.to_json();
        let targets: Vec<(Uuid, Arc<dyn Connection>)> = {
            let registry = self.registry.read().await;
            let Some(ids) = registry.owners.get(&owner) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| registry.connections.get(id).map(|e| (*id, e.conn.clone())))
                .collect()
        };

        self.deliver(targets, &text).await
    }

    /// Deliver to every connection regardless of owner.
    pub async fn broadcast(&self, event: &JobEvent) -> usize {
        let text = event.to_json();
        let targets: Vec<(Uuid, Arc<dyn Connection>)> = {
            let registry = self.registry.read().await;
            registry
                .connections
                .iter()
                .map(|(id, e)| (*id, e.conn.clone()))
                .collect()
        };

        self.deliver(targets, &text).await
    }

    async fn deliver(&self, targets: Vec<(Uuid, Arc<dyn Connection>)>, text: &str) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<Uuid> = Vec::new();

        for (id, conn) in targets {
            match conn.send(text) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection = %id, error = %e, "write failed, evicting connection");
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.remove(id).await;
        }

        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    pub async fn owner_count(&self) -> usize {
        self.registry.read().await.owners.len()
    }
}

/// Periodic keep-alive probe to every connection. A connection that has
/// gone away is only evicted when its write fails here (or on any other
/// delivery) — there is no proactive idle timeout.
pub fn spawn_keepalive(
    notifier: Arc<StatusNotifier>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let reached = notifier.broadcast(&JobEvent::ping()).await;
            tracing::trace!(reached, "keep-alive probe");
        }
    })
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingConnection;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fan_out_reaches_every_connection_of_the_owner() {
        let notifier = StatusNotifier::new();
        let owner = Uuid::new_v4();

        let conns = [
            RecordingConnection::new(),
            RecordingConnection::new(),
            RecordingConnection::new(),
        ];
        for conn in &conns {
            notifier
                .register(owner, conn.clone(), json!({"transport": "test"}))
                .await;
        }

        let delivered = notifier.broadcast(&JobEvent::ping()).await;
        assert_eq!(delivered, 3);
        for conn in &conns {
            assert_eq!(conn.received().len(), 1);
        }
    }

    #[tokio::test]
    async fn failed_write_evicts_only_that_connection() {
        let notifier = StatusNotifier::new();
        let owner = Uuid::new_v4();

        let good_a = RecordingConnection::new();
        let bad = RecordingConnection::failing();
        let good_b = RecordingConnection::new();
        notifier.register(owner, good_a.clone(), json!({})).await;
        notifier.register(owner, bad.clone(), json!({})).await;
        notifier.register(owner, good_b.clone(), json!({})).await;

        let delivered = notifier.send_to_owner(owner, &JobEvent::ping()).await;
        assert_eq!(delivered, 2);
        assert_eq!(good_a.received().len(), 1);
        assert_eq!(good_b.received().len(), 1);
        assert!(bad.received().is_empty());

        assert_eq!(notifier.connection_count().await, 2);
        assert_eq!(notifier.owner_count().await, 1);

        // subsequent sends no longer try the dead connection
        let delivered = notifier.send_to_owner(owner, &JobEvent::ping()).await;
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn events_stay_within_their_owner() {
        let notifier = StatusNotifier::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let alice_conn = RecordingConnection::new();
        let bob_conn = RecordingConnection::new();
        notifier.register(alice, alice_conn.clone(), json!({})).await;
        notifier.register(bob, bob_conn.clone(), json!({})).await;

        notifier.send_to_owner(alice, &JobEvent::ping()).await;
        assert_eq!(alice_conn.received().len(), 1);
        assert!(bob_conn.received().is_empty());

        // broadcast crosses owners by design
        notifier.broadcast(&JobEvent::ping()).await;
        assert_eq!(alice_conn.received().len(), 2);
        assert_eq!(bob_conn.received().len(), 1);
    }

    #[tokio::test]
    async fn remove_drops_empty_owner_buckets() {
        let notifier = StatusNotifier::new();
        let owner = Uuid::new_v4();
        let conn = RecordingConnection::new();
        let id = notifier.register(owner, conn, json!({})).await;

        assert_eq!(notifier.owner_count().await, 1);
        notifier.remove(id).await;
        assert_eq!(notifier.owner_count().await, 0);
        assert_eq!(notifier.connection_count().await, 0);
    }

    #[tokio::test]
    async fn touch_updates_last_activity() {
        let notifier = StatusNotifier::new();
        let owner = Uuid::new_v4();
        let id = notifier
            .register(owner, RecordingConnection::new(), json!({}))
            .await;

        let before = notifier.last_activity(id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        notifier.touch(id).await;
        let after = notifier.last_activity(id).await.unwrap();
        assert!(after > before);
    }

    #[test]
    fn event_json_shape() {
        let ev = JobEvent::ping();
        let v: serde_json::Value = serde_json::from_str(&ev.to_json()).unwrap();
        assert_eq!(v["type"], "ping");
        assert!(v.get("job_id").is_none());
        assert!(v.get("timestamp").is_some());
    }
}

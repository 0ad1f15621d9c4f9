// src/registry.rs
//! Live status-subscriber registry and broadcast fan-out.
//!
//! Connections are process-local: a socket is either pending (accepted, no
//! session yet) or bound to a session. The shared ConnectionRecord store only
//! answers "is anyone connected anywhere" for diagnostics; it is never
//! authoritative for delivery.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::PipelineError;

pub type ConnectionId = Uuid;

/// Outbound frame channel for one socket.
pub type FrameSender = mpsc::UnboundedSender<String>;

struct BoundConnection {
    session_id: Uuid,
    sender: FrameSender,
}

/// Shared, eventually-consistent record of connections across processes.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn record_connect(&self, conn_id: Uuid, session_id: Option<Uuid>) -> Result<(), PipelineError>;
    async fn record_bind(&self, conn_id: Uuid, session_id: Uuid) -> Result<(), PipelineError>;
    async fn record_disconnect(&self, conn_id: Uuid) -> Result<(), PipelineError>;
    /// Connections for the session not yet marked disconnected, anywhere.
    async fn live_count(&self, session_id: Uuid) -> Result<i64, PipelineError>;
    /// Delete records disconnected longer than `max_age_hours` ago.
    async fn prune_stale(&self, max_age_hours: i64) -> Result<u64, PipelineError>;
}

pub struct PgConnectionStore {
    pool: PgPool,
}

impl PgConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionStore for PgConnectionStore {
    async fn record_connect(&self, conn_id: Uuid, session_id: Option<Uuid>) -> Result<(), PipelineError> {
        sqlx::query("INSERT INTO connection_records (id, session_id) VALUES ($1, $2)")
            .bind(conn_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_bind(&self, conn_id: Uuid, session_id: Uuid) -> Result<(), PipelineError> {
        sqlx::query("UPDATE connection_records SET session_id = $2 WHERE id = $1")
            .bind(conn_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_disconnect(&self, conn_id: Uuid) -> Result<(), PipelineError> {
        // disconnected_at is set exactly once.
        sqlx::query(
            "UPDATE connection_records SET disconnected_at = now() \
             WHERE id = $1 AND disconnected_at IS NULL",
        )
        .bind(conn_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn live_count(&self, session_id: Uuid) -> Result<i64, PipelineError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM connection_records \
             WHERE session_id = $1 AND disconnected_at IS NULL",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn prune_stale(&self, max_age_hours: i64) -> Result<u64, PipelineError> {
        let result = sqlx::query(
            "DELETE FROM connection_records \
             WHERE disconnected_at IS NOT NULL AND disconnected_at < now() - ($1 || ' hours')::interval",
        )
        .bind(max_age_hours.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

pub struct ConnectionRegistry {
    pending: RwLock<HashMap<ConnectionId, FrameSender>>,
    bound: RwLock<HashMap<ConnectionId, BoundConnection>>,
    store: std::sync::Arc<dyn ConnectionStore>,
}

impl ConnectionRegistry {
    pub fn new(store: std::sync::Arc<dyn ConnectionStore>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            bound: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Accept a connection. With a session id it binds immediately; without
    /// one it is held pending until `complete_registration`.
    pub async fn accept(&self, conn_id: ConnectionId, sender: FrameSender, session_id: Option<Uuid>) {
        match session_id {
            Some(session_id) => {
                self.bound
                    .write()
                    .await
                    .insert(conn_id, BoundConnection { session_id, sender });
                tracing::info!("🔌 Connection {} bound to session {}", conn_id, session_id);
            }
            None => {
                self.pending.write().await.insert(conn_id, sender);
                tracing::info!("🔌 Connection {} accepted, awaiting registration", conn_id);
            }
        }

        if let Err(e) = self.store.record_connect(conn_id, session_id).await {
            tracing::warn!("Failed to record connection {}: {}", conn_id, e);
        }
    }

    /// Bind a pending connection to a session once the client registers.
    /// Returns false when the connection is unknown or already bound.
    pub async fn complete_registration(&self, conn_id: ConnectionId, session_id: Uuid) -> bool {
        let sender = match self.pending.write().await.remove(&conn_id) {
            Some(sender) => sender,
            None => {
                tracing::warn!("Registration for unknown connection {}", conn_id);
                return false;
            }
        };

        self.bound
            .write()
            .await
            .insert(conn_id, BoundConnection { session_id, sender });
        tracing::info!("📡 Connection {} registered for session {}", conn_id, session_id);

        if let Err(e) = self.store.record_bind(conn_id, session_id).await {
            tracing::warn!("Failed to record binding for {}: {}", conn_id, e);
        }
        true
    }

    /// Remove a connection and mark its record disconnected.
    pub async fn disconnect(&self, conn_id: ConnectionId) {
        let was_pending = self.pending.write().await.remove(&conn_id).is_some();
        let was_bound = self.bound.write().await.remove(&conn_id).is_some();
        if was_pending || was_bound {
            tracing::info!("🔌 Connection {} disconnected", conn_id);
        }

        if let Err(e) = self.store.record_disconnect(conn_id).await {
            tracing::warn!("Failed to record disconnect for {}: {}", conn_id, e);
        }
    }

    /// Send an event to every bound connection for the session known to this
    /// process. Never raises: an absent audience is logged, with the shared
    /// store consulted only to say whether someone is listening elsewhere.
    pub async fn broadcast<T: Serialize>(&self, session_id: Uuid, event: &T) {
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("Failed to serialize status event: {}", e);
                return;
            }
        };
        if let Some(object) = value.as_object_mut() {
            object.insert("session_id".to_string(), serde_json::json!(session_id));
        }
        let frame = value.to_string();

        let mut delivered = 0usize;
        {
            let bound = self.bound.read().await;
            for connection in bound.values().filter(|c| c.session_id == session_id) {
                if connection.sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        if delivered > 0 {
            tracing::debug!("📤 Delivered status event to {} connection(s) for session {}", delivered, session_id);
            return;
        }

        match self.store.live_count(session_id).await {
            Ok(count) if count > 0 => {
                tracing::debug!(
                    "No local connection for session {}; {} connection(s) live on other workers",
                    session_id,
                    count
                );
            }
            Ok(_) => {
                tracing::warn!("⚠️ No active connection for session {}, status update dropped", session_id);
            }
            Err(e) => {
                tracing::warn!("Connection store lookup failed for session {}: {}", session_id, e);
            }
        }
    }

    pub async fn bound_count(&self, session_id: Uuid) -> usize {
        self.bound
            .read()
            .await
            .values()
            .filter(|c| c.session_id == session_id)
            .count()
    }
}

// ---------------------------------------------------------------------------
// STATUS EVENT SHAPES
// ---------------------------------------------------------------------------

/// One-shot progress ping: `{type, status, progress, details}`.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub progress: u8,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Decimal>,
}

impl ProgressEvent {
    pub fn started(stage: &str) -> Self {
        Self {
            event_type: "stage_progress".to_string(),
            status: format!("{}_started", stage),
            progress: 0,
            details: format!("Stage {} started", stage),
            cost: None,
        }
    }

    pub fn completed(stage: &str, cost: Decimal) -> Self {
        Self {
            event_type: "stage_progress".to_string(),
            status: format!("{}_completed", stage),
            progress: 100,
            details: format!("Stage {} completed", stage),
            cost: Some(cost),
        }
    }
}

/// Error event: exactly one is broadcast per failed stage invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub error: String,
    pub reason: String,
}

impl ErrorEvent {
    pub fn new(stage: &str, error_class: &str, reason: &str) -> Self {
        Self {
            event_type: "error".to_string(),
            status: "error".to_string(),
            error: format!("{}:{}", stage, error_class),
            reason: reason.to_string(),
        }
    }
}

/// Sub-task entry inside a cumulative-items event.
#[derive(Debug, Clone, Serialize)]
pub struct StatusItem {
    pub id: String,
    pub name: String,
    pub status: String,
    #[serde(rename = "type")]
    pub item_type: String,
}

/// Cumulative-items event: a sub-task list whose aggregate drives the
/// progress percentage. Kept separate from `ProgressEvent`: the two
/// reporting conventions are distinct, not a merged representation.
#[derive(Debug, Clone, Serialize)]
pub struct CumulativeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub status: String,
    pub progress: u8,
    pub details: String,
    pub items: Vec<StatusItem>,
}

impl CumulativeEvent {
    pub fn new(event_type: &str, items: Vec<StatusItem>) -> Self {
        let mut event = Self {
            event_type: event_type.to_string(),
            status: "processing".to_string(),
            progress: 0,
            details: String::new(),
            items,
        };
        event.recompute();
        event
    }

    pub fn item(id: &str, name: &str, item_type: &str) -> StatusItem {
        StatusItem {
            id: id.to_string(),
            name: name.to_string(),
            status: "pending".to_string(),
            item_type: item_type.to_string(),
        }
    }

    /// Update one item's status and recompute progress and details.
    pub fn update_item(&mut self, id: &str, status: &str) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.status = status.to_string();
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        let total = self.items.len();
        if total == 0 {
            self.progress = 0;
            self.details = "No items".to_string();
            return;
        }

        let completed = self.items.iter().filter(|i| i.status == "completed").count();
        self.progress = ((completed * 100) / total) as u8;

        let processing: Vec<&str> = self
            .items
            .iter()
            .filter(|i| i.status == "processing")
            .map(|i| i.name.as_str())
            .collect();

        self.details = if !processing.is_empty() {
            format!("Processing: {}", processing.join(", "))
        } else if completed == total {
            format!("All {} items completed", total)
        } else {
            format!("{}/{} items completed", completed, total)
        };
        if completed == total {
            self.status = "completed".to_string();
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory ConnectionStore for registry tests.
    #[derive(Default)]
    pub struct MemoryConnectionStore {
        pub rows: Mutex<HashMap<Uuid, (Option<Uuid>, bool)>>,
    }

    #[async_trait]
    impl ConnectionStore for MemoryConnectionStore {
        async fn record_connect(&self, conn_id: Uuid, session_id: Option<Uuid>) -> Result<(), PipelineError> {
            self.rows.lock().unwrap().insert(conn_id, (session_id, false));
            Ok(())
        }

        async fn record_bind(&self, conn_id: Uuid, session_id: Uuid) -> Result<(), PipelineError> {
            if let Some(row) = self.rows.lock().unwrap().get_mut(&conn_id) {
                row.0 = Some(session_id);
            }
            Ok(())
        }

        async fn record_disconnect(&self, conn_id: Uuid) -> Result<(), PipelineError> {
            if let Some(row) = self.rows.lock().unwrap().get_mut(&conn_id) {
                row.1 = true;
            }
            Ok(())
        }

        async fn live_count(&self, session_id: Uuid) -> Result<i64, PipelineError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .values()
                .filter(|(sid, gone)| *sid == Some(session_id) && !gone)
                .count() as i64)
        }

        async fn prune_stale(&self, _max_age_hours: i64) -> Result<u64, PipelineError> {
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MemoryConnectionStore;
    use super::*;
    use std::sync::Arc;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MemoryConnectionStore::default()))
    }

    #[tokio::test]
    async fn test_bound_connection_receives_broadcast() {
        let registry = registry();
        let session_id = Uuid::new_v4();
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.accept(conn_id, tx, Some(session_id)).await;
        registry
            .broadcast(session_id, &ProgressEvent::started("script"))
            .await;

        let frame = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["session_id"], serde_json::json!(session_id));
        assert_eq!(value["type"], "stage_progress");
        assert_eq!(value["progress"], 0);
    }

    #[tokio::test]
    async fn test_pending_connection_gets_frames_only_after_registration() {
        let registry = registry();
        let session_id = Uuid::new_v4();
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.accept(conn_id, tx, None).await;
        registry
            .broadcast(session_id, &ProgressEvent::started("script"))
            .await;
        assert!(rx.try_recv().is_err(), "pending connections receive nothing");

        assert!(registry.complete_registration(conn_id, session_id).await);
        registry
            .broadcast(session_id, &ProgressEvent::completed("script", Decimal::ONE))
            .await;

        let frame = rx.recv().await.unwrap();
        assert!(frame.contains("script_completed"));
    }

    #[tokio::test]
    async fn test_broadcast_after_disconnect_logs_and_does_not_raise() {
        let registry = registry();
        let session_id = Uuid::new_v4();
        let conn_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.accept(conn_id, tx, Some(session_id)).await;
        registry
            .broadcast(session_id, &ProgressEvent::started("compose"))
            .await;
        assert!(rx.recv().await.is_some());

        registry.disconnect(conn_id).await;
        // Absent audience: logged, never an error.
        registry
            .broadcast(session_id, &ProgressEvent::completed("compose", Decimal::ZERO))
            .await;
        assert_eq!(registry.bound_count(session_id).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_matching_session() {
        let registry = registry();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        registry.accept(Uuid::new_v4(), tx_a, Some(session_a)).await;
        registry.accept(Uuid::new_v4(), tx_b, Some(session_b)).await;

        registry
            .broadcast(session_a, &ProgressEvent::started("clips"))
            .await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_cumulative_items_recompute_progress_and_details() {
        let mut event = CumulativeEvent::new(
            "clip_generation",
            vec![
                CumulativeEvent::item("hook", "Hook clip", "video"),
                CumulativeEvent::item("concept", "Concept clip", "video"),
                CumulativeEvent::item("process", "Process clip", "video"),
            ],
        );
        assert_eq!(event.progress, 0);

        event.update_item("concept", "processing");
        assert_eq!(event.progress, 0);
        assert_eq!(event.details, "Processing: Concept clip");

        event.update_item("concept", "completed");
        // 1 of 3 completed.
        assert_eq!(event.progress, 33);
        assert_eq!(event.details, "1/3 items completed");

        event.update_item("hook", "completed");
        event.update_item("process", "completed");
        assert_eq!(event.progress, 100);
        assert_eq!(event.status, "completed");
    }
}

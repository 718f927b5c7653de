// Append-only asset event log
// Event ids are deterministic so emitting the same event twice is a no-op

use crate::error::Result;
use crate::utils::short_hash;
use chrono::Utc;
use log::debug;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;

/// Event type names used across the pipeline
pub mod event_types {
    pub const RECORDED: &str = "recorded";
    pub const REMUX_COMPLETED: &str = "remux_completed";
    pub const MOVE_COMPLETED: &str = "move_completed";
    pub const COPY_COMPLETED: &str = "copy_completed";
    pub const PROXY_COMPLETED: &str = "proxy_completed";
    pub const THUMBNAIL_COMPLETED: &str = "thumbnail_completed";
    pub const TRANSCODE_COMPLETED: &str = "transcode_completed";
    pub const ERROR: &str = "error";
}

/// One row of an asset's history
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AssetEvent {
    pub id: String,
    pub asset_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub job_id: Option<String>,
    pub created_at: String,
}

impl AssetEvent {
    /// Parsed payload; an empty object when the stored JSON is unreadable
    pub fn payload(&self) -> Value {
        serde_json::from_str(&self.payload_json).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Compute the deterministic id for an event
///
/// `sha256(asset_id:event_type[:job_id])` truncated to 16 hex chars, which
/// makes `emit` idempotent per (asset, event, job) triple.
pub fn event_id(asset_id: &str, event_type: &str, job_id: Option<&str>) -> String {
    let mut material = format!("{}:{}", asset_id, event_type);
    if let Some(job_id) = job_id {
        material.push(':');
        material.push_str(job_id);
    }
    short_hash(&material)
}

/// The authoritative asset timeline, consumed by the admin ports
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Emit an event, inserting only if the deterministic id is absent
    ///
    /// Returns Ok(true) whether the row was inserted now or already present.
    pub async fn emit(
        &self,
        asset_id: &str,
        event_type: &str,
        payload: Value,
        job_id: Option<&str>,
    ) -> Result<bool> {
        let id = event_id(asset_id, event_type, job_id);

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO so_asset_events
                (id, asset_id, event_type, payload_json, job_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(asset_id)
        .bind(event_type)
        .bind(serde_json::to_string(&payload)?)
        .bind(job_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("event {} already present, skipping", id);
        }
        Ok(true)
    }

    /// All events for an asset, oldest first
    pub async fn timeline(&self, asset_id: &str) -> Result<Vec<AssetEvent>> {
        let events = sqlx::query_as::<_, AssetEvent>(
            r#"
            SELECT id, asset_id, event_type, payload_json, job_id, created_at
            FROM so_asset_events
            WHERE asset_id = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_memory_pool};
    use serde_json::json;

    async fn test_log() -> EventLog {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        EventLog::new(pool)
    }

    #[test]
    fn test_event_id_deterministic() {
        let a = event_id("asset1", "recorded", None);
        assert_eq!(a, event_id("asset1", "recorded", None));
        assert_eq!(a.len(), 16);

        // job id participates in the id
        assert_ne!(a, event_id("asset1", "recorded", Some("job1")));
        assert_ne!(
            event_id("asset1", "remux_completed", Some("job1")),
            event_id("asset1", "remux_completed", Some("job2"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_emit_is_idempotent() {
        let log = test_log().await;
        let payload = json!({"path": "/rec/clip.mkv"});

        for _ in 0..3 {
            assert!(log
                .emit("asset1", event_types::RECORDED, payload.clone(), None)
                .await
                .unwrap());
        }

        let timeline = log.timeline("asset1").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, "recorded");
        assert_eq!(timeline[0].payload()["path"], "/rec/clip.mkv");
    }

    #[tokio::test]
    async fn test_timeline_orders_by_creation() {
        let log = test_log().await;
        log.emit("a", event_types::RECORDED, json!({}), None).await.unwrap();
        log.emit("a", event_types::REMUX_COMPLETED, json!({}), Some("j1"))
            .await
            .unwrap();
        log.emit("a", event_types::MOVE_COMPLETED, json!({}), Some("j2"))
            .await
            .unwrap();
        // Another asset's events stay out of this timeline
        log.emit("b", event_types::RECORDED, json!({}), None).await.unwrap();

        let timeline = log.timeline("a").await.unwrap();
        let kinds: Vec<&str> = timeline.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["recorded", "remux_completed", "move_completed"]);
    }
}

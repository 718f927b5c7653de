// Flat key/value configuration store backed by so_configs
// Known keys are typed through their defaults; sensitive values are
// encrypted at rest and a JSON snapshot is kept next to the database

use crate::crypto::SecretCipher;
use crate::error::{CoreError, Result};
use chrono::Utc;
use log::{debug, warn};
use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keys whose string values are encrypted before they touch disk
const SENSITIVE_KEYS: &[&str] = &[
    "discord_webhook_url",
    "email_smtp_pass",
    "twitter_bearer_token",
    "twitter_api_secret",
    "twitter_access_secret",
    "obs_ws_password",
];

/// Defaults for every known key. The JSON type of the default doubles as
/// the key's schema: a `set` with a mismatched type is rejected.
fn default_map() -> BTreeMap<String, Value> {
    let defaults = json!({
        "instance_name": "clipd",

        "gpu_guard_pct": 40.0,
        "cpu_guard_pct": 70.0,
        "pause_when_recording": true,

        "watch_poll_interval": 5,
        "file_quiet_seconds": 45,

        "default_remux_format": "mov",
        "enable_auto_proxy": true,
        "proxy_min_duration_sec": 900,
        "proxy_codec": "dnxhr_lb",

        "default_editing_path": "/mnt/editing",
        "archive_path": "/mnt/archive",

        "enable_hover_scrub": true,
        "thumbnail_sprite_count": 10,
        "thumbnail_poster_time": "00:00:05",

        "obs_ws_url": "",
        "obs_ws_password": "",
        "discord_webhook_url": "",
        "email_smtp_pass": "",
        "twitter_bearer_token": "",
        "twitter_api_secret": "",
        "twitter_access_secret": "",
    });

    match defaults {
        Value::Object(map) => map.into_iter().collect(),
        _ => unreachable!(),
    }
}

/// Configuration store
///
/// Writes are serialized by a single-writer mutex that also covers the
/// JSON snapshot rewrite; reads go straight to the pool.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
    cipher: Arc<SecretCipher>,
    snapshot_path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool, cipher: Arc<SecretCipher>, config_dir: &Path) -> Self {
        Self {
            pool,
            cipher,
            snapshot_path: config_dir.join("config.json"),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Get the effective value for a key (stored value, else default)
    ///
    /// Sensitive values come back decrypted.
    pub async fn get(&self, key: &str) -> Result<Value> {
        let stored: Option<(String,)> =
            sqlx::query_as("SELECT value_json FROM so_configs WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((raw,)) = stored {
            let value: Value = serde_json::from_str(&raw)?;
            return Ok(self.reveal(key, value));
        }

        default_map()
            .remove(key)
            .ok_or_else(|| CoreError::NotFound(format!("config key {}", key)))
    }

    /// Set a single key, validating its type against the known default
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.validate_type(key, &value)?;

        let _guard = self.write_lock.lock().await;
        self.store_unlocked(key, value).await?;
        self.rewrite_snapshot_unlocked().await
    }

    /// Apply several keys in one lock acquisition
    pub async fn bulk_update(&self, entries: BTreeMap<String, Value>) -> Result<usize> {
        for (key, value) in &entries {
            self.validate_type(key, value)?;
        }

        let _guard = self.write_lock.lock().await;
        let count = entries.len();
        for (key, value) in entries {
            self.store_unlocked(&key, value).await?;
        }
        self.rewrite_snapshot_unlocked().await?;
        Ok(count)
    }

    /// The full effective map: defaults overlaid with stored values,
    /// sensitive values decrypted
    pub async fn effective(&self) -> Result<BTreeMap<String, Value>> {
        let mut map = default_map();

        let rows = sqlx::query("SELECT key, value_json FROM so_configs")
            .fetch_all(&self.pool)
            .await?;

        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value_json");
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    let value = self.reveal(&key, value);
                    map.insert(key, value);
                }
                Err(e) => warn!("skipping unreadable config row {}: {}", key, e),
            }
        }

        Ok(map)
    }

    /// Serialize the effective config for export
    ///
    /// The map is a BTreeMap, so the output is byte-stable across
    /// export → import → export round trips.
    pub async fn export_json(&self) -> Result<String> {
        let map = self.effective().await?;
        Ok(serde_json::to_string_pretty(&map)?)
    }

    /// Import a previously exported document
    ///
    /// With `overwrite` the stored rows are cleared first, so the result is
    /// exactly the imported map; otherwise imported keys merge over existing
    /// ones.
    pub async fn import_json(&self, document: &str, overwrite: bool) -> Result<usize> {
        let parsed: Value = serde_json::from_str(document)?;
        let Value::Object(entries) = parsed else {
            return Err(CoreError::Validation("config import must be a JSON object".into()));
        };

        for (key, value) in &entries {
            self.validate_type(key, value)?;
        }

        let _guard = self.write_lock.lock().await;
        if overwrite {
            sqlx::query("DELETE FROM so_configs").execute(&self.pool).await?;
        }

        let count = entries.len();
        for (key, value) in entries {
            self.store_unlocked(&key, value).await?;
        }
        self.rewrite_snapshot_unlocked().await?;
        Ok(count)
    }

    // ---- typed getters used by the pipeline ----

    pub async fn quiet_period_seconds(&self) -> i64 {
        self.get_i64("file_quiet_seconds", crate::constants::defaults::QUIET_PERIOD_SECONDS)
            .await
    }

    pub async fn watch_poll_seconds(&self) -> u64 {
        self.get_i64("watch_poll_interval", crate::constants::defaults::WATCH_POLL_SECONDS as i64)
            .await
            .max(1) as u64
    }

    pub async fn remux_format(&self) -> String {
        match self.get("default_remux_format").await {
            Ok(Value::String(s)) if !s.is_empty() => s,
            _ => crate::constants::defaults::REMUX_FORMAT.to_string(),
        }
    }

    pub async fn proxy_min_duration_sec(&self) -> i64 {
        self.get_i64(
            "proxy_min_duration_sec",
            crate::constants::defaults::PROXY_MIN_DURATION_SECONDS,
        )
        .await
    }

    pub async fn cpu_guard_pct(&self) -> f64 {
        self.get_f64("cpu_guard_pct", crate::constants::defaults::CPU_GUARD_PCT).await
    }

    pub async fn gpu_guard_pct(&self) -> f64 {
        self.get_f64("gpu_guard_pct", crate::constants::defaults::GPU_GUARD_PCT).await
    }

    pub async fn pause_when_recording(&self) -> bool {
        matches!(self.get("pause_when_recording").await, Ok(Value::Bool(true)))
    }

    async fn get_i64(&self, key: &str, fallback: i64) -> i64 {
        match self.get(key).await {
            Ok(value) => value.as_i64().unwrap_or(fallback),
            Err(_) => fallback,
        }
    }

    async fn get_f64(&self, key: &str, fallback: f64) -> f64 {
        match self.get(key).await {
            Ok(value) => value.as_f64().unwrap_or(fallback),
            Err(_) => fallback,
        }
    }

    // ---- internals ----

    fn validate_type(&self, key: &str, value: &Value) -> Result<()> {
        let defaults = default_map();
        let Some(default) = defaults.get(key) else {
            // Unknown keys are allowed; they are user extensions
            return Ok(());
        };

        let same_shape = matches!(
            (default, value),
            (Value::String(_), Value::String(_))
                | (Value::Bool(_), Value::Bool(_))
                | (Value::Number(_), Value::Number(_))
        );
        if same_shape {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "config key {} expects a {} value",
                key,
                type_name(default)
            )))
        }
    }

    /// Decrypt a sensitive value when it is stored as a token
    fn reveal(&self, key: &str, value: Value) -> Value {
        if !SENSITIVE_KEYS.contains(&key) {
            return value;
        }
        match value {
            Value::String(s) if SecretCipher::is_token(&s) => match self.cipher.decrypt(&s) {
                Ok(plain) => Value::String(plain),
                Err(e) => {
                    warn!("could not decrypt config key {}: {}", key, e);
                    Value::String(s)
                }
            },
            other => other,
        }
    }

    /// Encrypt a sensitive value unless it is already a token
    fn conceal(&self, key: &str, value: Value) -> Result<Value> {
        if !SENSITIVE_KEYS.contains(&key) {
            return Ok(value);
        }
        match value {
            Value::String(s) if !s.is_empty() && !SecretCipher::is_token(&s) => {
                Ok(Value::String(self.cipher.encrypt(&s)?))
            }
            other => Ok(other),
        }
    }

    async fn store_unlocked(&self, key: &str, value: Value) -> Result<()> {
        let value = self.conceal(key, value)?;
        let raw = serde_json::to_string(&value)?;
        sqlx::query(
            r#"
            INSERT INTO so_configs (key, value_json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value_json = excluded.value_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(raw)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write the stored (still encrypted) rows to the JSON snapshot file
    async fn rewrite_snapshot_unlocked(&self) -> Result<()> {
        let rows = sqlx::query("SELECT key, value_json FROM so_configs")
            .fetch_all(&self.pool)
            .await?;

        let mut map = BTreeMap::new();
        for row in rows {
            let key: String = row.get("key");
            let raw: String = row.get("value_json");
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                map.insert(key, value);
            }
        }

        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.snapshot_path, serde_json::to_string_pretty(&map)?)?;
        debug!("config snapshot rewritten: {}", self.snapshot_path.display());
        Ok(())
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::String(_) => "string",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Null => "null",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_memory_pool};
    use tempfile::TempDir;

    async fn test_store(dir: &TempDir) -> ConfigStore {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let cipher = Arc::new(SecretCipher::from_key_material("test:clipd-secrets", b"saltsaltsaltsalt"));
        ConfigStore::new(pool, cipher, dir.path())
    }

    #[tokio::test]
    async fn test_defaults_and_overrides() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;

        assert_eq!(store.quiet_period_seconds().await, 45);
        store.set("file_quiet_seconds", json!(10)).await.unwrap();
        assert_eq!(store.quiet_period_seconds().await, 10);

        // Type mismatch is rejected
        let err = store.set("file_quiet_seconds", json!("fast")).await;
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_sensitive_values_encrypted_at_rest() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;

        store
            .set("discord_webhook_url", json!("https://discord/hook"))
            .await
            .unwrap();

        // Raw row holds a token, not the plaintext
        let (raw,): (String,) =
            sqlx::query_as("SELECT value_json FROM so_configs WHERE key = 'discord_webhook_url'")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert!(!raw.contains("discord/hook"));

        // Effective view decrypts
        assert_eq!(
            store.get("discord_webhook_url").await.unwrap(),
            json!("https://discord/hook")
        );

        // The snapshot file never sees the plaintext either
        let snapshot = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!snapshot.contains("discord/hook"));
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir).await;

        store.set("instance_name", json!("studio-a")).await.unwrap();
        store.set("cpu_guard_pct", json!(55.0)).await.unwrap();
        store.set("obs_ws_password", json!("s3cret")).await.unwrap();

        let exported = store.export_json().await.unwrap();
        store.import_json(&exported, true).await.unwrap();
        let exported_again = store.export_json().await.unwrap();

        assert_eq!(exported, exported_again);
    }
}

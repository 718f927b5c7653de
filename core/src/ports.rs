// Admin ports: the interface surface consumed by external collaborators
// (HTTP layer, notifier, UI). Only the operations live here; transport,
// auth and serialization formats belong to the collaborators.

use crate::asset::{Asset, AssetStore};
use crate::config::ConfigStore;
use crate::error::{CoreError, Result};
use crate::events::{AssetEvent, EventLog};
use crate::guardrails::GuardrailMonitor;
use crate::job::{Job, JobState};
use crate::queue::{CancelOutcome, JobQueue};
use crate::roles::{Role, RoleStore};
use crate::rules::{Rule, RuleStore, SharedRules};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Point-in-time system summary for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_pct: f64,
    pub gpu_pct: f64,
    pub recording_active: bool,
    pub queue_paused: bool,
    pub assets_total: i64,
    pub jobs_by_state: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub database: bool,
}

/// One facade over every admin operation
#[derive(Clone)]
pub struct AdminPorts {
    queue: JobQueue,
    assets: AssetStore,
    events: EventLog,
    rule_store: RuleStore,
    rules: SharedRules,
    config: ConfigStore,
    roles: RoleStore,
    guards: GuardrailMonitor,
}

impl AdminPorts {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: JobQueue,
        assets: AssetStore,
        events: EventLog,
        rule_store: RuleStore,
        rules: SharedRules,
        config: ConfigStore,
        roles: RoleStore,
        guards: GuardrailMonitor,
    ) -> Self {
        Self {
            queue,
            assets,
            events,
            rule_store,
            rules,
            config,
            roles,
            guards,
        }
    }

    // ---- jobs ----

    pub async fn list_jobs(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        self.queue.list(state, limit).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.queue
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {}", id)))
    }

    pub async fn get_job_progress(&self, id: &str) -> Result<f64> {
        self.queue.progress(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        self.queue.cancel(id).await
    }

    // ---- assets ----

    pub async fn list_assets(&self, limit: i64, offset: i64) -> Result<Vec<Asset>> {
        self.assets.list(limit, offset).await
    }

    pub async fn get_asset(&self, id: &str) -> Result<Asset> {
        self.assets
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("asset {}", id)))
    }

    pub async fn get_timeline(&self, asset_id: &str) -> Result<Vec<AssetEvent>> {
        self.events.timeline(asset_id).await
    }

    pub async fn search_assets(&self, query: &str) -> Result<Vec<Asset>> {
        self.assets.search(query).await
    }

    // ---- rules ----

    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.rule_store.list_all().await
    }

    /// Upsert and atomically swap the live rule list
    pub async fn upsert_rule(&self, rule: &Rule) -> Result<()> {
        self.rule_store.upsert(rule).await?;
        self.rules.reload(&self.rule_store).await?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<bool> {
        let deleted = self.rule_store.delete(id).await?;
        if deleted {
            self.rules.reload(&self.rule_store).await?;
        }
        Ok(deleted)
    }

    // ---- config ----

    pub async fn get_config(&self, key: &str) -> Result<Value> {
        self.config.get(key).await
    }

    pub async fn set_config(&self, key: &str, value: Value) -> Result<()> {
        self.config.set(key, value).await
    }

    pub async fn bulk_update_config(&self, entries: BTreeMap<String, Value>) -> Result<usize> {
        self.config.bulk_update(entries).await
    }

    pub async fn export_config(&self) -> Result<String> {
        self.config.export_json().await
    }

    pub async fn import_config(&self, document: &str, overwrite: bool) -> Result<usize> {
        self.config.import_json(document, overwrite).await
    }

    // ---- roles ----

    pub async fn get_roles(&self) -> Result<Vec<Role>> {
        self.roles.all().await
    }

    pub async fn set_role(&self, role: &str, abs_path: &Path, watch: bool) -> Result<()> {
        self.roles.set(role, abs_path, watch).await
    }

    // ---- system ----

    pub async fn get_system_stats(&self) -> Result<SystemStats> {
        let snapshot = self.guards.snapshot();
        let jobs_by_state = self.queue.counts_by_state().await?.into_iter().collect();

        Ok(SystemStats {
            cpu_pct: snapshot.cpu_pct,
            gpu_pct: snapshot.gpu_pct,
            recording_active: snapshot.recording_active,
            queue_paused: self.queue.is_paused(),
            assets_total: self.assets.count().await?,
            jobs_by_state,
        })
    }

    pub async fn get_health(&self) -> Health {
        let database = self.queue.counts_by_state().await.is_ok();
        Health {
            healthy: database,
            database,
        }
    }

    /// Pushed by the OBS collaborator when recording starts/stops
    pub fn set_recording_active(&self, active: bool) {
        self.guards.set_recording_active(active);
    }

    pub fn pause_queue(&self) {
        self.queue.pause();
    }

    pub fn resume_queue(&self) {
        self.queue.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretCipher;
    use crate::db::{init_schema, open_memory_pool};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn ports(dir: &TempDir) -> AdminPorts {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let cipher = Arc::new(SecretCipher::from_key_material("t:clipd", b"0123456789abcdef"));

        AdminPorts::new(
            JobQueue::new(pool.clone()),
            AssetStore::new(pool.clone()),
            EventLog::new(pool.clone()),
            RuleStore::new(pool.clone()),
            SharedRules::new(),
            ConfigStore::new(pool.clone(), cipher, dir.path()),
            RoleStore::new(pool),
            GuardrailMonitor::new(),
        )
    }

    #[tokio::test]
    async fn test_missing_lookups_are_not_found() {
        let dir = TempDir::new().unwrap();
        let api = ports(&dir).await;

        assert!(matches!(api.get_job("nope").await, Err(CoreError::NotFound(_))));
        assert!(matches!(api.get_asset("nope").await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_upsert_rule_refreshes_live_list() {
        let dir = TempDir::new().unwrap();
        let api = ports(&dir).await;

        let rule: Rule = serde_json::from_value(json!({
            "id": "r1",
            "name": "rule one",
            "priority": 1,
            "enabled": true,
            "trigger": {"type": "file_closed"},
            "actions": [{"tag": {"tags": ["x"]}}],
        }))
        .unwrap();

        api.upsert_rule(&rule).await.unwrap();
        assert_eq!(api.rules.snapshot().len(), 1);

        assert!(api.delete_rule("r1").await.unwrap());
        assert!(api.rules.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_stats_and_health() {
        let dir = TempDir::new().unwrap();
        let api = ports(&dir).await;

        api.set_recording_active(true);
        api.pause_queue();

        let stats = api.get_system_stats().await.unwrap();
        assert!(stats.recording_active);
        assert!(stats.queue_paused);
        assert_eq!(stats.assets_total, 0);

        let health = api.get_health().await;
        assert!(health.healthy);
        api.resume_queue();
    }
}

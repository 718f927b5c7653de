// Rule model and persistence over so_rules
// The live rule list is swapped atomically on reload

use crate::error::{CoreError, Result};
use crate::rules::matcher::{Condition, Trigger};
use chrono::Utc;
use log::{info, warn};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use std::sync::{Arc, RwLock};

/// One action in a rule's ordered action list
///
/// The stored DSL form is a single-entry map, `{"remux": {...params}}`;
/// the explicit `{"type": ..., "params": ...}` form is also accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub kind: String,
    pub params: Value,
}

impl Serialize for ActionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.kind, &self.params)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ActionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = serde_json::Map::deserialize(deserializer)?;

        if let (Some(kind), params) = (raw.get("type").and_then(|v| v.as_str()), raw.get("params")) {
            return Ok(ActionSpec {
                kind: kind.to_string(),
                params: params.cloned().unwrap_or(Value::Object(Default::default())),
            });
        }

        if raw.len() == 1 {
            let (kind, params) = raw.into_iter().next().unwrap();
            return Ok(ActionSpec {
                kind,
                params: if params.is_object() {
                    params
                } else {
                    Value::Object(Default::default())
                },
            });
        }

        Err(D::Error::custom("action must be {\"<type>\": {params}}"))
    }
}

/// Per-rule guard thresholds; unset fields fall back to the global config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_guard_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_guard_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_when_recording: Option<bool>,
}

/// A loaded automation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub enabled: bool,
    pub trigger: Trigger,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub quiet_period_sec: Option<i64>,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Clone)]
pub struct RuleStore {
    pool: SqlitePool,
}

impl RuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enabled rules, highest priority first, then oldest first
    ///
    /// Rows with unreadable JSON are skipped with a warning rather than
    /// poisoning the whole reload.
    pub async fn load_enabled(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, priority, trigger_json, conditions_json, actions_json,
                   guardrails_json, quiet_period_sec, created_at
            FROM so_rules
            WHERE enabled = 1
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            match parse_rule_row(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!("skipping unreadable rule {}: {}", id, e),
            }
        }
        Ok(rules)
    }

    pub async fn list_all(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, priority, enabled, trigger_json, conditions_json, actions_json,
                   guardrails_json, quiet_period_sec, created_at
            FROM so_rules
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            match parse_rule_row(&row) {
                Ok(mut rule) => {
                    rule.enabled = row.try_get::<bool, _>("enabled").unwrap_or(true);
                    rules.push(rule);
                }
                Err(e) => warn!("skipping unreadable rule {}: {}", id, e),
            }
        }
        Ok(rules)
    }

    pub async fn upsert(&self, rule: &Rule) -> Result<()> {
        if rule.id.is_empty() || rule.name.is_empty() {
            return Err(CoreError::Validation("rule needs an id and a name".into()));
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO so_rules
                (id, name, priority, enabled, trigger_json, conditions_json, actions_json,
                 guardrails_json, quiet_period_sec, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                priority = excluded.priority,
                enabled = excluded.enabled,
                trigger_json = excluded.trigger_json,
                conditions_json = excluded.conditions_json,
                actions_json = excluded.actions_json,
                guardrails_json = excluded.guardrails_json,
                quiet_period_sec = excluded.quiet_period_sec,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(serde_json::to_string(&rule.trigger)?)
        .bind(serde_json::to_string(&rule.conditions)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(serde_json::to_string(&rule.guardrails)?)
        .bind(rule.quiet_period_sec)
        .bind(if rule.created_at.is_empty() { now.clone() } else { rule.created_at.clone() })
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM so_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn parse_rule_row(row: &sqlx::sqlite::SqliteRow) -> Result<Rule> {
    let trigger_json: String = row.get("trigger_json");
    let conditions_json: String = row.get("conditions_json");
    let actions_json: String = row.get("actions_json");
    let guardrails_json: String = row.get("guardrails_json");

    Ok(Rule {
        id: row.get("id"),
        name: row.get("name"),
        priority: row.get("priority"),
        enabled: true,
        trigger: serde_json::from_str(&trigger_json)?,
        conditions: serde_json::from_str(&conditions_json)?,
        actions: serde_json::from_str(&actions_json)?,
        guardrails: serde_json::from_str(&guardrails_json)?,
        quiet_period_sec: row.get("quiet_period_sec"),
        created_at: row.get("created_at"),
    })
}

/// The live rule list
///
/// Reload builds a fresh vector and swaps the shared reference in one
/// step, so readers always see a consistent list.
#[derive(Clone, Default)]
pub struct SharedRules {
    inner: Arc<RwLock<Arc<Vec<Rule>>>>,
}

impl SharedRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.inner.read().expect("rules lock poisoned").clone()
    }

    pub fn replace(&self, rules: Vec<Rule>) {
        *self.inner.write().expect("rules lock poisoned") = Arc::new(rules);
    }

    pub async fn reload(&self, store: &RuleStore) -> Result<usize> {
        let rules = store.load_enabled().await?;
        let count = rules.len();
        self.replace(rules);
        info!("loaded {} active rules", count);
        Ok(count)
    }
}

// Rule executor: runs matching rules against events
// Actions execute strictly in order, sharing one RuleContext; an action
// that produces a primary output shifts the active artifact for everything
// after it. Guardrails defer the whole remainder of a rule.

use crate::asset::AssetStore;
use crate::config::ConfigStore;
use crate::constants::ffmpeg::DEFAULT_TIMEOUT_SECONDS;
use crate::constants::guardrails::{DEFER_DEADLINE_SECONDS, RETRY_INTERVAL_SECONDS};
use crate::error::{CoreError, Result};
use crate::events::{event_types, EventLog};
use crate::guardrails::{tripped, GuardLimits, GuardrailMonitor};
use crate::job::{JobKind, JobState, NewJob};
use crate::queue::JobQueue;
use crate::rules::context::{ActionResult, Artifact, RuleContext};
use crate::rules::matcher::matches_event;
use crate::rules::store::{ActionSpec, Guardrails, Rule, SharedRules};
use crate::rules::template::build_target_path;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// How long an action waits for its job before giving up; a bit past the
/// worker-side timeout so the queue always decides first
const ACTION_WAIT: Duration = Duration::from_secs(DEFAULT_TIMEOUT_SECONDS + 300);

pub struct RuleExecutor {
    rules: SharedRules,
    queue: JobQueue,
    assets: AssetStore,
    events: EventLog,
    config: ConfigStore,
    guards: GuardrailMonitor,
}

impl RuleExecutor {
    pub fn new(
        rules: SharedRules,
        queue: JobQueue,
        assets: AssetStore,
        events: EventLog,
        config: ConfigStore,
        guards: GuardrailMonitor,
    ) -> Self {
        Self {
            rules,
            queue,
            assets,
            events,
            config,
            guards,
        }
    }

    /// Evaluate an event against the live rules, in priority order
    ///
    /// Rules run sequentially so two rules never race filesystem mutations
    /// on the same path. One rule failing does not stop the others.
    pub async fn handle_event(&self, event_type: &str, event: &Value) {
        let rules = self.rules.snapshot();
        debug!("evaluating {} against {} rules", event_type, rules.len());

        for rule in rules.iter() {
            if !matches_event(&rule.trigger, &rule.conditions, event_type, event) {
                continue;
            }
            info!("rule '{}' matched {}", rule.name, event_type);

            match self.execute_rule(rule, event).await {
                Ok(()) => {}
                Err(CoreError::Guarded(reason)) => {
                    warn!("rule '{}' gave up while deferred: {}", rule.name, reason);
                }
                Err(e) => error!("rule '{}' aborted: {}", rule.name, e),
            }
        }
    }

    async fn execute_rule(&self, rule: &Rule, event: &Value) -> Result<()> {
        let path = event
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Validation("event has no path".into()))?;

        let mut ctx = RuleContext::new(Artifact::new(path));
        if let Value::Object(fields) = event {
            for (key, value) in fields {
                ctx.vars.insert(key.clone(), value.clone());
            }
        }

        let deadline = Instant::now() + Duration::from_secs(DEFER_DEADLINE_SECONDS);

        for action in &rule.actions {
            self.wait_for_guardrails(&rule.guardrails, deadline).await?;

            match self.run_action(action, &mut ctx).await {
                Ok(result) => {
                    if let Some(output) = result.primary_output_path {
                        ctx.update_active(Artifact::new(output));
                    }
                    for (key, value) in result.updated_vars {
                        ctx.vars.insert(key, value);
                    }
                }
                Err(e) => {
                    // Abort the remaining actions of this rule instance
                    error!(
                        "action {} of rule '{}' failed: {}",
                        action.kind, rule.name, e
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Block until every guard clears, or the rule's wall-clock budget runs out
    async fn wait_for_guardrails(&self, rails: &Guardrails, deadline: Instant) -> Result<()> {
        loop {
            let limits = GuardLimits {
                cpu_pct: match rails.cpu_guard_pct {
                    Some(pct) => pct,
                    None => self.config.cpu_guard_pct().await,
                },
                gpu_pct: match rails.gpu_guard_pct {
                    Some(pct) => pct,
                    None => self.config.gpu_guard_pct().await,
                },
                pause_when_recording: match rails.pause_when_recording {
                    Some(pause) => pause,
                    None => self.config.pause_when_recording().await,
                },
                queue_paused: self.queue.is_paused(),
            };

            match tripped(&self.guards.snapshot(), &limits) {
                None => return Ok(()),
                Some(reason) => {
                    if Instant::now() >= deadline {
                        return Err(CoreError::Guarded(reason));
                    }
                    debug!("action deferred: {}", reason);
                    sleep(Duration::from_secs(RETRY_INTERVAL_SECONDS)).await;
                }
            }
        }
    }

    async fn run_action(&self, spec: &ActionSpec, ctx: &mut RuleContext) -> Result<ActionResult> {
        match spec.kind.as_str() {
            "remux" | "ffmpeg_remux" => self.action_remux(&spec.params, ctx).await,
            "move" => self.action_move(&spec.params, ctx).await,
            "copy" => self.action_copy(&spec.params, ctx).await,
            "proxy" | "make_proxies_if" => self.action_proxy(&spec.params, ctx).await,
            "thumbnail" | "thumbs" => self.action_thumbnail(&spec.params, ctx).await,
            "transcode" | "transcode_preset" => self.action_transcode(&spec.params, ctx).await,
            "index" | "index_asset" => self.action_index(&spec.params, ctx).await,
            "tag" => self.action_tag(&spec.params, ctx).await,
            other => {
                warn!("unknown action type: {}", other);
                Ok(ActionResult::default())
            }
        }
    }

    /// Enqueue a job and wait for its terminal state
    async fn run_job_action(&self, job: NewJob) -> Result<crate::job::Job> {
        let job = self.queue.enqueue(job).await?;
        let done = self.queue.await_terminal(&job.id, ACTION_WAIT).await?;
        match done.state() {
            JobState::Completed => Ok(done),
            JobState::Cancelled => Err(CoreError::Cancelled),
            _ => Err(CoreError::ExternalTool(
                done.error_message
                    .clone()
                    .unwrap_or_else(|| format!("job {} failed", done.id)),
            )),
        }
    }

    // ---- actions ----

    async fn action_remux(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let container = match params.get("container").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => self.config.remux_format().await,
        };
        let payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
            "container": container,
            "faststart": params.get("faststart").and_then(|v| v.as_bool()).unwrap_or(true),
            "remove_original": params.get("remove_original").and_then(|v| v.as_bool()).unwrap_or(true),
            "use_gpu": params.get("use_gpu").and_then(|v| v.as_bool()).unwrap_or(true),
        });

        let mut job = NewJob::new(JobKind::Remux, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let done = self.run_job_action(job).await?;

        let output = done
            .result()
            .and_then(|r| r.get("output_path").and_then(|p| p.as_str()).map(String::from))
            .ok_or_else(|| CoreError::Internal("remux job returned no output path".into()))?;
        Ok(ActionResult::with_primary(output))
    }

    async fn action_move(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let template = params
            .get("target")
            .or_else(|| params.get("dest"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Validation("move action requires a target".into()))?;
        let target = build_target_path(template, ctx);

        let payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
            "target_path": target.to_string_lossy(),
        });
        let mut job = NewJob::new(JobKind::Move, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let done = self.run_job_action(job).await?;

        let output = done
            .result()
            .and_then(|r| r.get("output_path").and_then(|p| p.as_str()).map(String::from))
            .ok_or_else(|| CoreError::Internal("move job returned no output path".into()))?;
        Ok(ActionResult::with_primary(output))
    }

    async fn action_copy(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let template = params
            .get("target")
            .or_else(|| params.get("dest"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Validation("copy action requires a target".into()))?;
        let target = build_target_path(template, ctx);

        let payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
            "target_path": target.to_string_lossy(),
        });
        let mut job = NewJob::new(JobKind::Copy, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let done = self.run_job_action(job).await?;

        // The copy never becomes the active artifact
        let mut result = ActionResult::default();
        if let Some(output) = done
            .result()
            .and_then(|r| r.get("output_path").and_then(|p| p.as_str()).map(String::from))
        {
            result.outputs.insert("copy".into(), output.into());
        }
        Ok(result)
    }

    async fn action_proxy(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let min_duration = match params.get("min_duration_sec").and_then(|v| v.as_i64()) {
            Some(min) => min,
            None => self.config.proxy_min_duration_sec().await,
        };

        // Duration from the indexed asset, else from the event payload
        let mut duration = ctx.vars.get("duration_sec").and_then(|v| v.as_f64());
        if let Some(asset_id) = ctx.asset_id() {
            if let Some(asset) = self.assets.get(asset_id).await? {
                duration = asset.duration_sec.or(duration);
            }
        }

        if duration.unwrap_or(0.0) < min_duration as f64 {
            debug!(
                "skipping proxy: duration {:?}s below threshold {}s",
                duration, min_duration
            );
            return Ok(ActionResult::default());
        }

        let payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
            "profile": params.get("profile").or_else(|| params.get("codec")).cloned()
                .unwrap_or_else(|| json!(crate::constants::defaults::PROXY_PROFILE)),
            "resolution": params.get("resolution").cloned().unwrap_or_else(|| json!("1080")),
            "use_gpu": params.get("use_gpu").and_then(|v| v.as_bool()).unwrap_or(true),
        });
        let mut job = NewJob::new(JobKind::Proxy, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let job = self.queue.enqueue(job).await?;

        let mut result = ActionResult::default();
        result.updated_vars.insert("proxy_job_id".into(), json!(job.id));
        Ok(result)
    }

    async fn action_thumbnail(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let asset_id = ctx
            .asset_id()
            .ok_or_else(|| CoreError::Validation("thumbnail action requires an asset".into()))?
            .to_string();

        let mut payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
        });
        for key in ["poster_time", "sprite_count", "hover_duration"] {
            if let Some(value) = params.get(key) {
                payload[key] = value.clone();
            }
        }

        let job = self
            .queue
            .enqueue(NewJob::new(JobKind::Thumbnail, payload).asset(&asset_id))
            .await?;

        let mut result = ActionResult::default();
        result.updated_vars.insert("thumbnail_job_id".into(), json!(job.id));
        Ok(result)
    }

    async fn action_transcode(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let mut payload = json!({
            "input_path": ctx.active.path.to_string_lossy(),
            "preset": params.get("preset").cloned().unwrap_or_else(|| json!("web_1080p")),
        });
        for key in ["custom_preset", "start_time", "end_time", "use_gpu"] {
            if let Some(value) = params.get(key) {
                payload[key] = value.clone();
            }
        }

        let mut job = NewJob::new(JobKind::Transcode, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let job = self.queue.enqueue(job).await?;

        let mut result = ActionResult::default();
        result.updated_vars.insert("transcode_job_id".into(), json!(job.id));
        Ok(result)
    }

    async fn action_index(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let payload = json!({
            "path": ctx.active.path.to_string_lossy(),
            "force_reindex": params.get("force_reindex").and_then(|v| v.as_bool()).unwrap_or(false),
        });
        let mut job = NewJob::new(JobKind::Index, payload);
        if let Some(asset_id) = ctx.asset_id() {
            job = job.asset(asset_id);
        }
        let job = self.queue.enqueue(job).await?;

        let mut result = ActionResult::default();
        result.updated_vars.insert("index_job_id".into(), json!(job.id));
        Ok(result)
    }

    async fn action_tag(&self, params: &Value, ctx: &mut RuleContext) -> Result<ActionResult> {
        let asset_id = ctx
            .asset_id()
            .ok_or_else(|| CoreError::Validation("tag action requires an asset".into()))?
            .to_string();
        let tags: Vec<String> = params
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        if tags.is_empty() {
            return Ok(ActionResult::default());
        }

        match self.assets.add_tags(&asset_id, &tags).await {
            Ok(merged) => {
                debug!("asset {} tags now {:?}", asset_id, merged);
                Ok(ActionResult::default())
            }
            Err(e) => {
                self.events
                    .emit(
                        &asset_id,
                        event_types::ERROR,
                        json!({"action": "tag", "message": e.to_string(), "stage": "action"}),
                        None,
                    )
                    .await
                    .ok();
                Err(e)
            }
        }
    }
}

// Typed job workers and the dispatcher that feeds them
// One handler per JobKind; the dispatcher claims queued jobs, supervises
// timeouts and cancellation, and converts worker errors into failed jobs

pub mod copy_file;
pub mod index;
pub mod move_file;
pub mod proxy;
pub mod remux;
pub mod thumbnail;
pub mod transcode;

use crate::asset::{AssetStatus, AssetStore};
use crate::cancel::CancelFlag;
use crate::constants::ffmpeg::DEFAULT_TIMEOUT_SECONDS;
use crate::constants::jobs::DISPATCH_IDLE_MS;
use crate::error::{CoreError, Result};
use crate::events::{event_types, EventLog};
use crate::job::{Job, JobKind, JobState};
use crate::media::{GpuProbe, MediaRunner};
use crate::queue::JobQueue;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;

/// Everything a worker needs to do its job
///
/// Cloned per job by the dispatcher with a fresh cancel flag.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub assets: AssetStore,
    pub events: EventLog,
    pub runner: MediaRunner,
    pub gpu: Arc<GpuProbe>,
    pub thumbs_dir: PathBuf,
    pub cancel: CancelFlag,
}

impl WorkerContext {
    fn for_job(&self) -> WorkerContext {
        let mut ctx = self.clone();
        ctx.cancel = CancelFlag::new();
        ctx
    }
}

/// A typed worker for one job kind
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Process the job; the returned value is stored as the job result.
    /// Errors never propagate past the dispatcher: they become failed jobs.
    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value>;
}

/// Handlers by kind
#[derive(Default)]
pub struct WorkerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in worker registered
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(index::IndexHandler));
        registry.register(Arc::new(remux::RemuxHandler));
        registry.register(Arc::new(move_file::MoveHandler));
        registry.register(Arc::new(copy_file::CopyHandler));
        registry.register(Arc::new(proxy::ProxyHandler));
        registry.register(Arc::new(thumbnail::ThumbnailHandler));
        registry.register(Arc::new(transcode::TranscodeHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.handlers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Dispatcher: claims queued jobs and runs them on a bounded pool
pub struct Dispatcher {
    registry: Arc<WorkerRegistry>,
    ctx: WorkerContext,
    parallelism: usize,
}

impl Dispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, ctx: WorkerContext, parallelism: usize) -> Self {
        Self {
            registry,
            ctx,
            parallelism: parallelism.max(1),
        }
    }

    /// Main dispatch loop; returns once `shutdown` is set and the pool drained
    pub async fn run(&self, shutdown: CancelFlag) {
        let kinds = self.registry.kinds();
        let mut pool: JoinSet<()> = JoinSet::new();
        info!("dispatcher started ({} workers, kinds: {:?})", self.parallelism, kinds);

        loop {
            while pool.try_join_next().is_some() {}

            if shutdown.is_cancelled() {
                break;
            }

            if pool.len() >= self.parallelism {
                let _ = pool.join_next().await;
                continue;
            }

            match self.ctx.queue.claim_next(&kinds).await {
                Ok(Some(job)) => {
                    let Some(handler) = job.kind().and_then(|k| self.registry.get(k)) else {
                        warn!("claimed job {} with unknown type {}", job.id, job.kind);
                        let _ = self.ctx.queue.fail_terminal(&job.id, "no worker for job type").await;
                        continue;
                    };
                    let ctx = self.ctx.for_job();
                    pool.spawn(async move {
                        supervise(job, handler, ctx).await;
                    });
                }
                Ok(None) => sleep(Duration::from_millis(DISPATCH_IDLE_MS)).await,
                Err(e) => {
                    error!("dispatcher claim failed: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        while pool.join_next().await.is_some() {}
        info!("dispatcher stopped");
    }
}

/// Run one job to a terminal state, enforcing timeout and cancellation
async fn supervise(job: Job, handler: Arc<dyn JobHandler>, ctx: WorkerContext) {
    let timeout = job
        .timeout_sec
        .map(|s| Duration::from_secs(s.max(1) as u64))
        .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));

    debug!("job {} ({}) started", job.id, job.kind);

    enum Outcome {
        Finished(Result<Value>),
        TimedOut,
        CancelRequested,
    }

    let outcome = tokio::select! {
        result = handler.run(&job, &ctx) => Outcome::Finished(result),
        _ = sleep(timeout) => Outcome::TimedOut,
        _ = watch_for_cancel(&ctx.queue, &job.id) => Outcome::CancelRequested,
    };

    match outcome {
        Outcome::Finished(Ok(result)) => {
            if let Err(e) = ctx.queue.complete(&job.id, &result).await {
                error!("failed to record completion of job {}: {}", job.id, e);
            }
            info!("job {} ({}) completed", job.id, job.kind);
        }
        Outcome::Finished(Err(CoreError::Cancelled)) => {
            let _ = ctx.queue.mark_cancelled(&job.id, "cancelled").await;
            info!("job {} ({}) cancelled", job.id, job.kind);
        }
        Outcome::Finished(Err(e)) => {
            let message = e.to_string();
            let state = if e.is_retryable() {
                ctx.queue.fail(&job.id, &message).await.unwrap_or(JobState::Failed)
            } else {
                let _ = ctx.queue.fail_terminal(&job.id, &message).await;
                JobState::Failed
            };
            if state == JobState::Failed {
                emit_error_event(&job, &ctx, &message).await;
            }
        }
        Outcome::TimedOut => {
            // Kill any running subprocess, then record the failure
            ctx.cancel.cancel();
            warn!("job {} ({}) timed out after {:?}", job.id, job.kind, timeout);
            let state = ctx.queue.fail(&job.id, "timeout").await.unwrap_or(JobState::Failed);
            if state == JobState::Failed {
                emit_error_event(&job, &ctx, "timeout").await;
            }
        }
        Outcome::CancelRequested => {
            ctx.cancel.cancel();
            let _ = ctx.queue.mark_cancelled(&job.id, "cancelled").await;
            info!("job {} ({}) cancelled by request", job.id, job.kind);
        }
    }

    ctx.runner.cleanup_scratch(&job.id);
}

/// Resolves when someone sets cancel_requested on the job row
async fn watch_for_cancel(queue: &JobQueue, job_id: &str) {
    loop {
        sleep(Duration::from_secs(1)).await;
        match queue.cancel_requested(job_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!("cancel poll for job {} failed: {}", job_id, e);
            }
        }
    }
}

async fn emit_error_event(job: &Job, ctx: &WorkerContext, message: &str) {
    let Some(asset_id) = job.asset_id.as_deref() else {
        return;
    };
    let payload = json!({
        "action": job.kind,
        "message": message,
        "stage": "worker",
    });
    if let Err(e) = ctx
        .events
        .emit(asset_id, event_types::ERROR, payload, Some(&job.id))
        .await
    {
        warn!("could not emit error event for job {}: {}", job.id, e);
    }
    if let Err(e) = ctx.assets.set_status(asset_id, AssetStatus::Error).await {
        warn!("could not mark asset {} errored: {}", asset_id, e);
    }
}

/// Forward progress values from a sync stderr parser into so_progress
///
/// Returns a sender usable inside `FnMut(&str)` closures plus the writer
/// task handle; drop the sender and await the handle before completing the
/// job so no stale write lands after the final 100.
pub fn spawn_progress_forwarder(
    queue: JobQueue,
    job_id: String,
) -> (mpsc::UnboundedSender<f64>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<f64>();
    let handle = tokio::spawn(async move {
        let mut last_written = -1.0f64;
        while let Some(pct) = rx.recv().await {
            // Skip sub-percent churn to keep write volume sane
            if pct - last_written >= 1.0 || pct >= 100.0 {
                last_written = pct;
                if let Err(e) = queue.set_progress(&job_id, pct).await {
                    warn!("progress write for job {} failed: {}", job_id, e);
                }
            }
        }
    });
    (tx, handle)
}

/// Input file resolution shared by the media workers
///
/// Prefers the asset's current location (actions earlier in a rule may have
/// moved it), falling back to the payload's `input_path`.
pub(crate) async fn resolve_input_path(job: &Job, ctx: &WorkerContext) -> Result<PathBuf> {
    if let Some(asset_id) = job.asset_id.as_deref() {
        if let Some(asset) = ctx.assets.get(asset_id).await? {
            let current = PathBuf::from(&asset.current_path);
            if current.exists() {
                return Ok(current);
            }
        }
    }

    let payload = job.payload();
    if let Some(input) = payload.get("input_path").and_then(|v| v.as_str()) {
        let path = PathBuf::from(input);
        if path.exists() {
            return Ok(path);
        }
        return Err(CoreError::NotFound(format!("input file {}", path.display())));
    }

    Err(CoreError::Validation("job has no input path".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_schema, open_memory_pool};
    use crate::job::NewJob;
    use tempfile::TempDir;

    pub(crate) async fn test_context(dir: &TempDir) -> WorkerContext {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let runner = MediaRunner::with_programs(
            "/nonexistent/ffmpeg",
            "/nonexistent/ffprobe",
            dir.path().join("cache"),
        );
        WorkerContext {
            queue: JobQueue::new(pool.clone()),
            assets: AssetStore::new(pool.clone()),
            events: EventLog::new(pool),
            runner: runner.clone(),
            gpu: Arc::new(GpuProbe::new(runner)),
            thumbs_dir: dir.path().join("thumbs"),
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn test_default_registry_covers_all_kinds() {
        let registry = WorkerRegistry::with_default_handlers();
        for kind in JobKind::ALL {
            assert!(registry.get(*kind).is_some(), "missing handler for {}", kind);
        }
        assert_eq!(registry.kinds().len(), JobKind::ALL.len());
    }

    #[tokio::test]
    async fn test_resolve_input_prefers_asset_current_path() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let original = dir.path().join("clip.mkv");
        std::fs::write(&original, b"data").unwrap();
        let asset = ctx.assets.create_pending(&original).await.unwrap();

        // Asset moved; payload still names the stale path
        let moved = dir.path().join("clip.mov");
        std::fs::rename(&original, &moved).unwrap();
        ctx.assets.set_current_path(&asset.id, &moved).await.unwrap();

        let job = ctx
            .queue
            .enqueue(
                NewJob::new(JobKind::Remux, json!({"input_path": original.to_string_lossy()}))
                    .asset(&asset.id),
            )
            .await
            .unwrap();

        let resolved = resolve_input_path(&job, &ctx).await.unwrap();
        assert_eq!(resolved, moved);
    }

    #[tokio::test]
    async fn test_resolve_input_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let job = ctx
            .queue
            .enqueue(NewJob::new(JobKind::Remux, json!({"input_path": "/gone/clip.mkv"})))
            .await
            .unwrap();

        let err = resolve_input_path(&job, &ctx).await;
        assert!(matches!(err, Err(CoreError::NotFound(_))));
    }
}

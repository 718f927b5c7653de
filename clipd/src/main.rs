// clipd - automation daemon for a streamer's recording pipeline
// Watches role directories for finished recordings, indexes them, and runs
// user-defined rules (remux, move, proxy, thumbnail, transcode) through a
// durable job queue

mod cli;
mod shutdown;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use clipd_core::constants::defaults::WORKER_PARALLELISM;
use clipd_core::media::{detect_tools, GpuProbe, MediaRunner};
use clipd_core::workers::{Dispatcher, WorkerContext, WorkerRegistry};
use clipd_core::{
    AdminPorts, AssetStore, CancelFlag, ConfigStore, EventLog, GuardrailMonitor, JobQueue,
    RoleStore, RuleExecutor, RuleStore, SecretCipher, SharedRules, StabilityWatcher,
};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("=== clipd ===");
    info!("recording pipeline automation daemon");

    // One cancel flag for the whole daemon; signals and task shutdown
    // share it
    let shutdown_flag = CancelFlag::new();
    shutdown::install_signal_handlers(shutdown_flag.clone());
    info!("signal handlers installed (Ctrl+C for graceful shutdown)");

    // Persistent state layout under the data dir
    let db_path = args.data_dir.join("db").join("clipd.db");
    let config_dir = args.data_dir.join("config");
    let cache_dir = args.data_dir.join("cache");
    let thumbs_dir = args.data_dir.join("thumbs");
    for dir in [&config_dir, &cache_dir, &thumbs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let pool = clipd_core::open_pool(&db_path)
        .await
        .with_context(|| format!("cannot open database {}", db_path.display()))?;
    clipd_core::init_schema(&pool).await.context("schema bootstrap failed")?;
    info!("database ready: {}", db_path.display());

    // External tools
    let runner = match (&args.ffmpeg, &args.ffprobe) {
        (Some(ffmpeg), Some(ffprobe)) => MediaRunner::with_programs(ffmpeg, ffprobe, &cache_dir),
        (Some(ffmpeg), None) => MediaRunner::with_programs(ffmpeg, "ffprobe", &cache_dir),
        (None, Some(ffprobe)) => MediaRunner::with_programs("ffmpeg", ffprobe, &cache_dir),
        (None, None) => MediaRunner::new(&cache_dir),
    };
    match detect_tools(&runner).await {
        Ok(version) => info!("✓ {}", version),
        Err(e) => {
            error!("FFmpeg validation failed: {}", e);
            anyhow::bail!("cannot proceed without a working ffmpeg");
        }
    }

    let gpu = Arc::new(GpuProbe::new(runner.clone()));
    if gpu.nvenc_available().await {
        info!("✓ NVENC hardware encoding available");
    } else {
        info!("no usable GPU encoder; staying on software codecs");
    }

    // Process-wide components, built once here and passed by reference
    let cipher = Arc::new(SecretCipher::initialize(&config_dir).context("cipher init failed")?);
    let config = ConfigStore::new(pool.clone(), cipher, &config_dir);
    let queue = JobQueue::new(pool.clone());
    let assets = AssetStore::new(pool.clone());
    let events = EventLog::new(pool.clone());
    let roles = RoleStore::new(pool.clone());
    let rule_store = RuleStore::new(pool.clone());
    let rules = SharedRules::new();
    let guards = GuardrailMonitor::new();

    rules.reload(&rule_store).await.context("rule load failed")?;

    let executor = Arc::new(RuleExecutor::new(
        rules.clone(),
        queue.clone(),
        assets.clone(),
        events.clone(),
        config.clone(),
        guards.clone(),
    ));

    // The admin facade is handed to the HTTP layer; the daemon itself
    // only keeps it alive
    let _ports = AdminPorts::new(
        queue.clone(),
        assets.clone(),
        events.clone(),
        rule_store.clone(),
        rules.clone(),
        config.clone(),
        roles.clone(),
        guards.clone(),
    );

    let mut tasks = Vec::new();

    // Guardrail sampler
    {
        let guards = guards.clone();
        let flag = shutdown_flag.clone();
        tasks.push(tokio::spawn(async move { guards.run_sampler(flag).await }));
    }

    // Dispatcher over the worker pool
    {
        let registry = Arc::new(WorkerRegistry::with_default_handlers());
        let ctx = WorkerContext {
            queue: queue.clone(),
            assets: assets.clone(),
            events: events.clone(),
            runner: runner.clone(),
            gpu: gpu.clone(),
            thumbs_dir: thumbs_dir.clone(),
            cancel: CancelFlag::new(),
        };
        let parallelism = if args.concurrent == 0 {
            WORKER_PARALLELISM
        } else {
            args.concurrent
        };
        let dispatcher = Dispatcher::new(registry, ctx, parallelism);
        let flag = shutdown_flag.clone();
        tasks.push(tokio::spawn(async move { dispatcher.run(flag).await }));
    }

    // Retry ticker: moves backed-off jobs back into the queue
    {
        let queue = queue.clone();
        let flag = shutdown_flag.clone();
        tasks.push(tokio::spawn(async move {
            while !flag.is_cancelled() {
                sleep(Duration::from_secs(5)).await;
                match queue.requeue_due_retries().await {
                    Ok(0) => {}
                    Ok(n) => info!("requeued {} jobs after backoff", n),
                    Err(e) => warn!("retry ticker failed: {}", e),
                }
            }
        }));
    }

    // File-stability watcher
    {
        let watcher = StabilityWatcher::new(roles, assets, queue, executor, config);
        let flag = shutdown_flag.clone();
        tasks.push(tokio::spawn(async move { watcher.run(flag).await }));
    }

    info!("clipd running (workers: {})", args.concurrent);

    // A signal cancels the shared flag; every task sees it directly, so
    // this loop only has to wait for it and then collect the tasks
    while !shutdown_flag.is_cancelled() {
        sleep(Duration::from_millis(500)).await;
    }

    info!("shutdown requested, stopping tasks...");
    for task in tasks {
        if let Err(e) = task.await {
            warn!("task ended abnormally: {}", e);
        }
    }

    info!("clipd stopped");
    Ok(())
}

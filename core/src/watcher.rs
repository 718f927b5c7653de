// File-stability watcher
// One recursive notify watcher per enabled role. New or modified files are
// tracked until they have been around for the quiet period AND two size
// samples taken a second apart agree; only then does the file count as
// closed and enter the pipeline.

use crate::asset::AssetStore;
use crate::cancel::CancelFlag;
use crate::config::ConfigStore;
use crate::constants::defaults::MEDIA_EXTENSIONS;
use crate::constants::stability::SAMPLE_GAP_MS;
use crate::error::Result;
use crate::job::{JobKind, NewJob};
use crate::queue::JobQueue;
use crate::roles::RoleStore;
use crate::rules::RuleExecutor;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

type PendingMap = Arc<Mutex<HashMap<PathBuf, DateTime<Utc>>>>;

/// Live watcher state for one role
struct RoleWatch {
    // Held to keep the OS watch alive
    _watcher: notify::RecommendedWatcher,
    abs_path: PathBuf,
    pending: PendingMap,
}

/// Whether the watcher cares about this path at all
pub fn is_watched_media(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pull out the tracked paths whose quiet period has elapsed
///
/// Due paths leave the map; callers re-insert the ones that turn out to
/// still be growing.
fn take_due(pending: &PendingMap, now: DateTime<Utc>, quiet_seconds: i64) -> Vec<PathBuf> {
    let mut map = pending.lock().expect("pending lock poisoned");
    let due: Vec<PathBuf> = map
        .iter()
        .filter(|(_, first_seen)| (now - **first_seen).num_seconds() >= quiet_seconds)
        .map(|(path, _)| path.clone())
        .collect();
    for path in &due {
        map.remove(path);
    }
    due
}

/// Two size samples, one second apart
///
/// Ok(true) means stable. IO errors bubble up so the caller can drop the
/// path; the next filesystem event re-tracks it.
pub async fn is_size_stable(path: &Path) -> Result<bool> {
    let first = std::fs::metadata(path)?.len();
    sleep(Duration::from_millis(SAMPLE_GAP_MS)).await;
    let second = std::fs::metadata(path)?.len();
    Ok(first == second)
}

pub struct StabilityWatcher {
    roles: RoleStore,
    assets: AssetStore,
    queue: JobQueue,
    executor: Arc<RuleExecutor>,
    config: ConfigStore,
}

impl StabilityWatcher {
    pub fn new(
        roles: RoleStore,
        assets: AssetStore,
        queue: JobQueue,
        executor: Arc<RuleExecutor>,
        config: ConfigStore,
    ) -> Self {
        Self {
            roles,
            assets,
            queue,
            executor,
            config,
        }
    }

    /// Watch loop: reconcile roles, then check tracked files, every tick
    pub async fn run(&self, shutdown: CancelFlag) {
        let mut watches: HashMap<String, RoleWatch> = HashMap::new();
        info!("file watcher started");

        while !shutdown.is_cancelled() {
            if let Err(e) = self.reconcile_roles(&mut watches).await {
                error!("role reconciliation failed: {}", e);
            }

            let quiet = self.config.quiet_period_seconds().await;
            for (role, watch) in &watches {
                self.process_pending(role, watch, quiet).await;
            }

            let tick = self.config.watch_poll_seconds().await;
            sleep(Duration::from_secs(tick)).await;
        }

        info!("file watcher stopped");
    }

    /// Start watchers for newly enabled roles, stop stale ones
    async fn reconcile_roles(&self, watches: &mut HashMap<String, RoleWatch>) -> Result<()> {
        let wanted = self.roles.watched().await?;

        watches.retain(|role, watch| {
            let keep = wanted
                .iter()
                .any(|r| r.role == *role && Path::new(&r.abs_path) == watch.abs_path);
            if !keep {
                info!("stopping watcher for role {}", role);
            }
            keep
        });

        for role in wanted {
            if watches.contains_key(&role.role) {
                continue;
            }
            let abs_path = PathBuf::from(&role.abs_path);
            match start_role_watch(&abs_path) {
                Ok(watch) => {
                    info!("watching role {}: {}", role.role, abs_path.display());
                    watches.insert(role.role.clone(), watch);
                }
                Err(e) => warn!("cannot watch {} ({}): {}", role.role, abs_path.display(), e),
            }
        }
        Ok(())
    }

    /// Stability-check every due path of one role
    async fn process_pending(&self, role: &str, watch: &RoleWatch, quiet_seconds: i64) {
        let due = take_due(&watch.pending, Utc::now(), quiet_seconds);

        for path in due {
            if !path.exists() {
                // Vanished mid-quiet-period; drop silently
                continue;
            }

            match is_size_stable(&path).await {
                Ok(true) => {
                    debug!("file stable: {}", path.display());
                    if let Err(e) = self.handle_stable_file(role, &path).await {
                        error!("failed to process {}: {}", path.display(), e);
                    }
                }
                Ok(false) => {
                    // Still growing; restart the quiet period
                    watch
                        .pending
                        .lock()
                        .expect("pending lock poisoned")
                        .insert(path, Utc::now());
                }
                Err(e) => {
                    warn!("size check failed for {}: {}", path.display(), e);
                }
            }
        }
    }

    /// A file went quiet: index it and fire the file_closed event
    async fn handle_stable_file(&self, role: &str, path: &Path) -> Result<()> {
        let asset = self.assets.create_pending(path).await?;

        self.queue
            .enqueue(
                NewJob::new(JobKind::Index, json!({"path": path.to_string_lossy()}))
                    .asset(&asset.id),
            )
            .await?;

        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let event = json!({
            "path": path.to_string_lossy(),
            "asset_id": asset.id,
            "role": role,
            "file": {
                "name": path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
                "stem": path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default(),
                "extension": path.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_lowercase())
                    .unwrap_or_default(),
                "size": size,
            },
        });

        info!("file closed: {}", path.display());
        self.executor.handle_event("file_closed", &event).await;
        Ok(())
    }
}

/// Spawn the recursive notify watcher for one root
///
/// The notify callback runs on notify's own thread; it only touches the
/// pending map. Already-tracked paths keep their original first-seen time.
fn start_role_watch(abs_path: &Path) -> notify::Result<RoleWatch> {
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let sink = Arc::clone(&pending);

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!("filesystem watcher error: {}", e);
                return;
            }
        };
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            if is_watched_media(&path) {
                sink.lock()
                    .expect("pending lock poisoned")
                    .entry(path)
                    .or_insert_with(Utc::now);
            }
        }
    })?;

    watcher.watch(abs_path, RecursiveMode::Recursive)?;

    Ok(RoleWatch {
        _watcher: watcher,
        abs_path: abs_path.to_path_buf(),
        pending,
    })
}

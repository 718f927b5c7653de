// Move worker: relocate a file to an already-expanded target path
// Atomic rename first; copy-then-unlink when the target is on another
// filesystem. Source and destination folders are reconciled afterwards.

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::workers::{resolve_input_path, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct MoveParams {
    target_path: String,
}

pub struct MoveHandler;

/// A target that is a directory (or has no suffix) means "into this
/// directory, keep the file name"
pub(crate) fn resolve_target(target: &Path, source: &Path) -> PathBuf {
    if target.is_dir() || target.extension().is_none() {
        match source.file_name() {
            Some(name) => target.join(name),
            None => target.to_path_buf(),
        }
    } else {
        target.to_path_buf()
    }
}

/// Rename, falling back to copy + unlink across devices
///
/// The copy stages into a dotfile next to the target and renames it into
/// place, so readers never observe a partially copied file.
pub(crate) fn move_across(source: &Path, target: &Path) -> Result<()> {
    match std::fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename failed ({}); falling back to copy+unlink", e);

            let staging = target.with_file_name(format!(
                ".{}.part-{}",
                target.file_name().and_then(|n| n.to_str()).unwrap_or("move"),
                Uuid::new_v4()
            ));
            std::fs::copy(source, &staging)?;
            if let Err(e) = std::fs::rename(&staging, target) {
                let _ = std::fs::remove_file(&staging);
                return Err(CoreError::Io(e));
            }
            std::fs::remove_file(source)?;
            Ok(())
        }
    }
}

#[async_trait]
impl JobHandler for MoveHandler {
    fn kind(&self) -> JobKind {
        JobKind::Move
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: MoveParams = serde_json::from_value(job.payload())
            .map_err(|_| CoreError::Validation("move job requires target_path".into()))?;
        let source = resolve_input_path(job, ctx).await?;

        ctx.queue.set_progress(&job.id, 10.0).await?;

        let target = resolve_target(Path::new(&params.target_path), &source);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("moving {} -> {}", source.display(), target.display());
        ctx.queue.set_progress(&job.id, 50.0).await?;

        let src = source.clone();
        let dst = target.clone();
        tokio::task::spawn_blocking(move || move_across(&src, &dst))
            .await
            .map_err(|e| CoreError::Internal(format!("move task panicked: {}", e)))??;

        if !target.exists() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file not found after move: {}", target.display()),
            )));
        }
        let output_size = std::fs::metadata(&target)?.len();

        if let Some(asset_id) = job.asset_id.as_deref() {
            ctx.assets.set_current_path(asset_id, &target).await?;
            ctx.events
                .emit(
                    asset_id,
                    event_types::MOVE_COMPLETED,
                    json!({
                        "from": source.to_string_lossy(),
                        "to": target.to_string_lossy(),
                    }),
                    Some(&job.id),
                )
                .await?;
        }

        // Keep folder views honest on both ends of the move
        if let Some(src_dir) = source.parent() {
            if let Err(e) = ctx.assets.reconcile_folder(src_dir).await {
                warn!("reconcile of {} failed: {}", src_dir.display(), e);
            }
        }
        if let Some(dst_dir) = target.parent() {
            if source.parent() != Some(dst_dir) {
                if let Err(e) = ctx.assets.reconcile_folder(dst_dir).await {
                    warn!("reconcile of {} failed: {}", dst_dir.display(), e);
                }
            }
        }

        Ok(json!({
            "success": true,
            "input_path": source.to_string_lossy(),
            "output_path": target.to_string_lossy(),
            "output_size": output_size,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;
    use crate::workers::tests::test_context;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_target_directory_appends_name() {
        let dir = TempDir::new().unwrap();
        let source = Path::new("/rec/clip.mov");

        // Existing directory
        let resolved = resolve_target(dir.path(), source);
        assert_eq!(resolved, dir.path().join("clip.mov"));

        // Suffix-less path that does not exist yet
        let resolved = resolve_target(&dir.path().join("2025/01"), source);
        assert_eq!(resolved, dir.path().join("2025/01/clip.mov"));

        // Fully qualified file target is kept as-is
        let explicit = dir.path().join("renamed.mov");
        assert_eq!(resolve_target(&explicit, source), explicit);
    }

    #[test]
    fn test_move_across_same_device() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.mov");
        let target = dir.path().join("sub").join("a.mov");
        std::fs::write(&source, b"payload").unwrap();
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();

        move_across(&source, &target).unwrap();

        assert!(!source.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_job_updates_asset_and_emits_event() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let source = dir.path().join("rec").join("clip.mov");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"mov data").unwrap();
        let asset = ctx.assets.create_pending(&source).await.unwrap();

        let target_dir = dir.path().join("editing").join("2025").join("01");
        let job = ctx
            .queue
            .enqueue(
                NewJob::new(
                    JobKind::Move,
                    json!({
                        "input_path": source.to_string_lossy(),
                        "target_path": target_dir.to_string_lossy(),
                    }),
                )
                .asset(&asset.id),
            )
            .await
            .unwrap();

        let result = MoveHandler.run(&job, &ctx).await.unwrap();

        let moved = target_dir.join("clip.mov");
        assert!(moved.exists());
        assert!(!source.exists());
        assert_eq!(result["output_path"].as_str(), moved.to_str());

        let refreshed = ctx.assets.get(&asset.id).await.unwrap().unwrap();
        assert_eq!(refreshed.current_path, moved.to_string_lossy());

        let timeline = ctx.events.timeline(&asset.id).await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, "move_completed");
        assert_eq!(timeline[0].payload()["to"].as_str(), moved.to_str());
    }

    #[tokio::test]
    async fn test_move_job_without_target_is_validation_error() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let source = dir.path().join("clip.mov");
        std::fs::write(&source, b"x").unwrap();
        let job = ctx
            .queue
            .enqueue(NewJob::new(
                JobKind::Move,
                json!({"input_path": source.to_string_lossy()}),
            ))
            .await
            .unwrap();

        let err = MoveHandler.run(&job, &ctx).await;
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }
}

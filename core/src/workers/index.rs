// Index worker: fingerprint, probe and upsert an asset row
// Emits the `recorded` event on a fresh or refreshed index

use crate::asset::IndexAction;
use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::workers::{JobHandler, WorkerContext};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct IndexParams {
    path: String,
    #[serde(default)]
    force_reindex: bool,
}

pub struct IndexHandler;

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "mov" | "mkv" | "avi" | "flv" | "ts" | "m2ts" | "webm" | "wmv" | "m4v" => "video",
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "m4a" => "audio",
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" => "image",
        _ => "unknown",
    }
}

fn quality_category(height: Option<i64>) -> Option<&'static str> {
    match height? {
        2160.. => Some("4k"),
        720..=2159 => Some("hd"),
        _ => Some("sd"),
    }
}

#[async_trait]
impl JobHandler for IndexHandler {
    fn kind(&self) -> JobKind {
        JobKind::Index
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: IndexParams = serde_json::from_value(job.payload())
            .map_err(|_| CoreError::Validation("index job requires a path".into()))?;
        let path = PathBuf::from(&params.path);

        ctx.queue.set_progress(&job.id, 10.0).await?;

        let outcome = ctx.assets.index(&path, params.force_reindex, &ctx.runner).await?;
        ctx.queue.set_progress(&job.id, 80.0).await?;

        if outcome.action != IndexAction::Skipped {
            let media = outcome.media.as_ref();
            // Deterministic event id: re-indexing never duplicates this row
            ctx.events
                .emit(
                    &outcome.asset_id,
                    event_types::RECORDED,
                    json!({
                        "path": params.path,
                        "duration": media.and_then(|m| m.duration_sec).unwrap_or(0.0),
                        "size": std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
                        "container": media.and_then(|m| m.container.clone()).unwrap_or_default(),
                        "video_codec": media.and_then(|m| m.video_codec.clone()).unwrap_or_default(),
                        "audio_codec": media.and_then(|m| m.audio_codec.clone()).unwrap_or_default(),
                    }),
                    None,
                )
                .await?;
        }

        Ok(json!({
            "success": true,
            "asset_id": outcome.asset_id,
            "action": outcome.action.to_string(),
            "path": params.path,
            "content_type": content_type(&path),
            "quality_category": quality_category(outcome.media.as_ref().and_then(|m| m.height)),
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
    fn test_content_type_classification() {
        assert_eq!(content_type(Path::new("/a/clip.MKV")), "video");
        assert_eq!(content_type(Path::new("/a/song.flac")), "audio");
        assert_eq!(content_type(Path::new("/a/poster.jpg")), "image");
        assert_eq!(content_type(Path::new("/a/readme.txt")), "unknown");
    }

    #[test]
    fn test_quality_category() {
        assert_eq!(quality_category(Some(2160)), Some("4k"));
        assert_eq!(quality_category(Some(1080)), Some("hd"));
        assert_eq!(quality_category(Some(720)), Some("hd"));
        assert_eq!(quality_category(Some(480)), Some("sd"));
        assert_eq!(quality_category(None), None);
    }

    #[tokio::test]
    async fn test_index_job_skips_unchanged_file() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let file = dir.path().join("clip.mkv");
        std::fs::write(&file, b"mkv bytes").unwrap();

        let job = ctx
            .queue
            .enqueue(NewJob::new(JobKind::Index, json!({"path": file.to_string_lossy()})))
            .await
            .unwrap();

        let first = IndexHandler.run(&job, &ctx).await.unwrap();
        assert_eq!(first["action"], "created");
        let asset_id = first["asset_id"].as_str().unwrap().to_string();

        // recorded event emitted exactly once, even across reindexes
        let second = IndexHandler.run(&job, &ctx).await.unwrap();
        assert_eq!(second["action"], "skipped");

        let timeline = ctx.events.timeline(&asset_id).await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, "recorded");
    }

    #[tokio::test]
    async fn test_force_reindex_updates() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir).await;

        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"mp4 bytes").unwrap();

        let job = ctx
            .queue
            .enqueue(NewJob::new(
                JobKind::Index,
                json!({"path": file.to_string_lossy(), "force_reindex": true}),
            ))
            .await
            .unwrap();

        let first = IndexHandler.run(&job, &ctx).await.unwrap();
        assert_eq!(first["action"], "created");
        let second = IndexHandler.run(&job, &ctx).await.unwrap();
        assert_eq!(second["action"], "updated");
    }
}

// Copy worker: like move, but the source stays in place
// The copy is a secondary output; it never becomes the asset's current path

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::workers::move_file::resolve_target;
use crate::workers::{resolve_input_path, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CopyParams {
    target_path: String,
}

pub struct CopyHandler;

#[async_trait]
impl JobHandler for CopyHandler {
    fn kind(&self) -> JobKind {
        JobKind::Copy
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: CopyParams = serde_json::from_value(job.payload())
            .map_err(|_| CoreError::Validation("copy job requires target_path".into()))?;
        let source = resolve_input_path(job, ctx).await?;

        ctx.queue.set_progress(&job.id, 10.0).await?;

        let target = resolve_target(Path::new(&params.target_path), &source);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("copying {} -> {}", source.display(), target.display());
        ctx.queue.set_progress(&job.id, 50.0).await?;

        let src = source.clone();
        let dst = target.clone();
        let copied = tokio::task::spawn_blocking(move || std::fs::copy(&src, &dst))
            .await
            .map_err(|e| CoreError::Internal(format!("copy task panicked: {}", e)))??;

        if let Some(asset_id) = job.asset_id.as_deref() {
            ctx.events
                .emit(
                    asset_id,
                    event_types::COPY_COMPLETED,
                    json!({
                        "from": source.to_string_lossy(),
                        "to": target.to_string_lossy(),
                        "size": copied,
                    }),
                    Some(&job.id),
                )
                .await?;
        }

        Ok(json!({
            "success": true,
            "input_path": source.to_string_lossy(),
            "output_path": target.to_string_lossy(),
            "output_size": copied,
        }))
    }
}

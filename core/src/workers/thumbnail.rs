// Thumbnail worker: poster frame, sprite mosaic and a short hover clip
// Outputs land under <thumbs>/<asset_id>/; progress is stepped because the
// three ffmpeg invocations are short

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::media::ffprobe::probe;
use crate::media::Tool;
use crate::workers::{resolve_input_path, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct ThumbnailParams {
    #[serde(default = "default_poster_time")]
    poster_time: String,
    #[serde(default = "default_sprite_count")]
    sprite_count: u32,
    #[serde(default = "default_hover_duration")]
    hover_duration: f64,
}

fn default_poster_time() -> String {
    "00:00:05".to_string()
}

fn default_sprite_count() -> u32 {
    10
}

fn default_hover_duration() -> f64 {
    3.0
}

pub struct ThumbnailHandler;

/// Sprite grids are roughly square: ⌈√n⌉ columns
pub(crate) fn sprite_grid(count: u32) -> (u32, u32) {
    let cols = (count as f64).sqrt().ceil() as u32;
    let rows = ((count as f64) / cols as f64).ceil() as u32;
    (cols.max(1), rows.max(1))
}

fn frame_grab_args(input: &str, at: &str, scale: &str, output: &str) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-ss".into(),
        at.into(),
        "-i".into(),
        input.into(),
        "-vframes".into(),
        "1".into(),
        "-vf".into(),
        format!(
            "scale={scale}:force_original_aspect_ratio=decrease,pad={scale}:(ow-iw)/2:(oh-ih)/2"
        ),
        "-q:v".into(),
        "3".into(),
        "-y".into(),
        output.into(),
    ]
}

#[async_trait]
impl JobHandler for ThumbnailHandler {
    fn kind(&self) -> JobKind {
        JobKind::Thumbnail
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: ThumbnailParams = serde_json::from_value(job.payload())?;
        let asset_id = job
            .asset_id
            .clone()
            .ok_or_else(|| CoreError::Validation("thumbnail job requires an asset_id".into()))?;
        let input = resolve_input_path(job, ctx).await?;

        let out_dir = ctx.thumbs_dir.join(&asset_id);
        std::fs::create_dir_all(&out_dir)?;
        let poster_path = out_dir.join("poster.jpg");
        let sprite_path = out_dir.join("sprite.jpg");
        let hover_path = out_dir.join("hover.mp4");

        ctx.queue.set_progress(&job.id, 10.0).await?;

        let info = probe(&ctx.runner, &input).await?;
        let duration = info
            .duration_sec
            .filter(|d| *d > 0.0)
            .ok_or_else(|| CoreError::ExternalTool("could not determine duration".into()))?;
        let input_str = input.to_string_lossy().to_string();

        // Poster frame
        let run = ctx
            .runner
            .run(
                Tool::Ffmpeg,
                &frame_grab_args(
                    &input_str,
                    &params.poster_time,
                    "320:180",
                    &poster_path.to_string_lossy(),
                ),
                &ctx.cancel,
                |_| {},
            )
            .await?;
        if !run.success() {
            return Err(CoreError::ExternalTool(format!(
                "poster generation failed: {}",
                run.stderr
            )));
        }
        ctx.queue.set_progress(&job.id, 40.0).await?;

        // Sprite sheet: grab frames at equal intervals, then tile them.
        // The +1 keeps the last grab away from the very end of the file.
        let interval = duration / (params.sprite_count as f64 + 1.0);
        let mut grabbed = Vec::new();
        for i in 0..params.sprite_count {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let offset = (i as f64 + 1.0) * interval;
            let frame = ctx.runner.scratch_path(&job.id, &format!("_thumb_{}.jpg", i))?;
            let run = ctx
                .runner
                .run(
                    Tool::Ffmpeg,
                    &frame_grab_args(
                        &input_str,
                        &format!("{:.3}", offset),
                        "160:90",
                        &frame.to_string_lossy(),
                    ),
                    &ctx.cancel,
                    |_| {},
                )
                .await?;
            if run.success() && frame.exists() {
                grabbed.push(frame);
            } else {
                warn!("sprite frame {} of {} failed", i, input.display());
            }
        }

        if !grabbed.is_empty() {
            let (cols, rows) = sprite_grid(grabbed.len() as u32);
            let mut args: Vec<String> =
                vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
            for frame in &grabbed {
                args.extend(["-i".into(), frame.to_string_lossy().to_string()]);
            }
            args.extend([
                "-filter_complex".into(),
                format!("tile={}x{}:margin=2:padding=2", cols, rows),
                "-q:v".into(),
                "3".into(),
                "-y".into(),
                sprite_path.to_string_lossy().to_string(),
            ]);

            let run = ctx.runner.run(Tool::Ffmpeg, &args, &ctx.cancel, |_| {}).await?;
            if !run.success() {
                warn!("sprite sheet tiling failed: {}", run.stderr);
            }
        }
        ctx.queue.set_progress(&job.id, 70.0).await?;

        // Hover preview: a short, silent H.264 clip centered on the midpoint
        let hover_start = (duration / 2.0 - params.hover_duration / 2.0).max(0.0);
        let hover_args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            format!("{:.3}", hover_start),
            "-t".into(),
            format!("{:.3}", params.hover_duration),
            "-i".into(),
            input_str.clone(),
            "-vf".into(),
            "scale=320:180:force_original_aspect_ratio=decrease,pad=320:180:(ow-iw)/2:(oh-ih)/2"
                .into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "fast".into(),
            "-crf".into(),
            "28".into(),
            "-an".into(),
            "-movflags".into(),
            "+faststart".into(),
            "-y".into(),
            hover_path.to_string_lossy().to_string(),
        ];
        let run = ctx.runner.run(Tool::Ffmpeg, &hover_args, &ctx.cancel, |_| {}).await?;
        if !run.success() {
            warn!("hover preview generation failed: {}", run.stderr);
        }

        ctx.runner.cleanup_scratch(&job.id);
        ctx.queue.set_progress(&job.id, 100.0).await?;

        let poster = poster_path.exists().then(|| poster_path.to_string_lossy().to_string());
        let sprite = sprite_path.exists().then(|| sprite_path.to_string_lossy().to_string());
        let hover = hover_path.exists().then(|| hover_path.to_string_lossy().to_string());

        ctx.events
            .emit(
                &asset_id,
                event_types::THUMBNAIL_COMPLETED,
                json!({
                    "poster": poster.clone(),
                    "sprite": sprite.clone(),
                    "hover": hover.clone(),
                }),
                Some(&job.id),
            )
            .await?;

        info!(
            "thumbnails for asset {}: poster={} sprite={} hover={}",
            asset_id,
            poster.is_some(),
            sprite.is_some(),
            hover.is_some()
        );

        Ok(json!({
            "success": true,
            "asset_id": asset_id,
            "poster_path": poster,
            "sprite_path": sprite,
            "hover_path": hover,
            "duration": duration,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sprite_grid_is_roughly_square() {
        assert_eq!(sprite_grid(1), (1, 1));
        assert_eq!(sprite_grid(4), (2, 2));
        assert_eq!(sprite_grid(10), (4, 3));
        assert_eq!(sprite_grid(16), (4, 4));
        assert_eq!(sprite_grid(17), (5, 4));
    }

    #[test]
    fn test_frame_grab_args_shape() {
        let args = frame_grab_args("/rec/a.mov", "00:00:05", "320:180", "/thumbs/poster.jpg");
        assert!(args.contains(&"-vframes".to_string()));
        assert!(args.iter().any(|a| a.contains("scale=320:180")));
        assert_eq!(args.last().unwrap(), "/thumbs/poster.jpg");
    }

    #[test]
    fn test_params_defaults() {
        let params: ThumbnailParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.poster_time, "00:00:05");
        assert_eq!(params.sprite_count, 10);
        assert_eq!(params.hover_duration, 3.0);
    }
}

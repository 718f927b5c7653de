// Remux worker: rewrap streams into a new container without re-encoding
// Output lands next to the input with the new suffix; the original is
// removed on success unless told otherwise

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::media::Tool;
use crate::utils::format_bytes;
use crate::workers::{resolve_input_path, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct RemuxParams {
    #[serde(default = "default_container")]
    container: String,
    #[serde(default = "default_true")]
    faststart: bool,
    #[serde(default = "default_true")]
    remove_original: bool,
}

fn default_container() -> String {
    crate::constants::defaults::REMUX_FORMAT.to_string()
}

fn default_true() -> bool {
    true
}

pub struct RemuxHandler;

/// Build the remux command: copy every stream, fix up timestamps, and add
/// faststart for the QuickTime family so players can stream the result
fn build_remux_args(input: &str, output: &str, container: &str, faststart: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        input.into(),
        "-map".into(),
        "0".into(),
        "-c".into(),
        "copy".into(),
    ];

    if faststart && matches!(container, "mov" | "mp4") {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }

    args.push("-y".into());
    args.push(output.into());
    args
}

#[async_trait]
impl JobHandler for RemuxHandler {
    fn kind(&self) -> JobKind {
        JobKind::Remux
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: RemuxParams = serde_json::from_value(job.payload())?;
        let input = resolve_input_path(job, ctx).await?;

        // Always remux in place: same directory, new suffix
        let output = input.with_extension(&params.container);
        if output == input {
            info!("remux of {} is a no-op; already .{}", input.display(), params.container);
            return Ok(json!({
                "success": true,
                "output_path": output.to_string_lossy(),
                "output_format": params.container,
                "skipped": true,
            }));
        }

        ctx.queue.set_progress(&job.id, 10.0).await?;

        let args = build_remux_args(
            &input.to_string_lossy(),
            &output.to_string_lossy(),
            &params.container,
            params.faststart,
        );

        info!("remuxing {} -> {}", input.display(), output.display());
        ctx.queue.set_progress(&job.id, 20.0).await?;

        let run = ctx.runner.run(Tool::Ffmpeg, &args, &ctx.cancel, |_| {}).await?;
        if !run.success() {
            // Don't leave a half-written container behind
            let _ = std::fs::remove_file(&output);
            return Err(CoreError::ExternalTool(format!(
                "ffmpeg remux failed: {}",
                run.stderr
            )));
        }

        if !output.exists() {
            return Err(CoreError::ExternalTool(format!(
                "remux output not created: {}",
                output.display()
            )));
        }
        let output_size = std::fs::metadata(&output)?.len();

        info!("remuxed to {} ({})", output.display(), format_bytes(output_size));

        let mut original_removed = false;
        if params.remove_original && input != output {
            match std::fs::remove_file(&input) {
                Ok(()) => original_removed = true,
                Err(e) => warn!("could not remove original {}: {}", input.display(), e),
            }
        }

        if let Some(asset_id) = job.asset_id.as_deref() {
            ctx.assets.set_current_path(asset_id, &output).await?;
            ctx.events
                .emit(
                    asset_id,
                    event_types::REMUX_COMPLETED,
                    json!({
                        "from": input.to_string_lossy(),
                        "to": output.to_string_lossy(),
                        "size": output_size,
                    }),
                    Some(&job.id),
                )
                .await?;
        }

        Ok(json!({
            "success": true,
            "input_path": input.to_string_lossy(),
            "output_path": output.to_string_lossy(),
            "output_size": output_size,
            "output_format": params.container,
            "original_removed": original_removed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remux_args_for_mov() {
        let args = build_remux_args("/rec/clip.mkv", "/rec/clip.mov", "mov", true);

        assert!(args.contains(&"-map".to_string()));
        assert!(args.contains(&"0".to_string()));
        assert!(args.contains(&"copy".to_string()));
        assert!(args.contains(&"-movflags".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "/rec/clip.mov");
    }

    #[test]
    fn test_remux_args_skip_faststart_for_mkv() {
        let args = build_remux_args("/rec/clip.mp4", "/rec/clip.mkv", "mkv", true);
        assert!(!args.contains(&"-movflags".to_string()));

        let args = build_remux_args("/rec/clip.mkv", "/rec/clip.mp4", "mp4", false);
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn test_params_defaults() {
        let params: RemuxParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(params.container, "mov");
        assert!(params.faststart);
        assert!(params.remove_original);

        let params: RemuxParams =
            serde_json::from_value(serde_json::json!({"container": "mp4", "remove_original": false}))
                .unwrap();
        assert_eq!(params.container, "mp4");
        assert!(!params.remove_original);
    }
}

// Proxy worker: DNxHR editing proxies with PCM audio
// Optionally decodes and scales on the GPU, handing frames back to the CPU
// for the DNxHR encode

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::media::ffprobe::probe;
use crate::media::runner::parse_frame_number;
use crate::media::Tool;
use crate::workers::{resolve_input_path, spawn_progress_forwarder, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

const PROFILES: &[&str] = &["dnxhr_lb", "dnxhr_sq", "dnxhr_hq"];

#[derive(Debug, Deserialize)]
struct ProxyParams {
    #[serde(default = "default_profile")]
    profile: String,
    #[serde(default = "default_resolution")]
    resolution: String,
    #[serde(default = "default_timecode")]
    timecode_start: String,
    #[serde(default)]
    audio_channels: Option<i64>,
    #[serde(default = "default_true")]
    use_gpu: bool,
}

fn default_profile() -> String {
    crate::constants::defaults::PROXY_PROFILE.to_string()
}

fn default_resolution() -> String {
    "1080".to_string()
}

fn default_timecode() -> String {
    "00:00:00:00".to_string()
}

fn default_true() -> bool {
    true
}

pub struct ProxyHandler;

fn build_proxy_args(
    input: &str,
    output: &str,
    profile: &str,
    target_height: u32,
    timecode: &str,
    audio_channels: Option<i64>,
    has_audio: bool,
    use_cuda: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.push("-stats".into());

    if use_cuda {
        args.extend(["-hwaccel".into(), "cuda".into()]);
        args.extend(["-hwaccel_output_format".into(), "cuda".into()]);
    }

    args.extend(["-i".into(), input.into()]);
    args.extend(["-map".into(), "0:v:0".into()]);
    args.extend(["-c:v".into(), "dnxhd".into()]);
    args.extend(["-profile:v".into(), profile.into()]);

    // Scale on the GPU when possible, then download for the CPU encoder
    let filters = if use_cuda {
        format!(
            "scale_cuda=-2:{}:format=yuv422p10le,hwdownload,format=yuv422p10le",
            target_height
        )
    } else {
        format!("scale=-2:{}", target_height)
    };
    args.extend(["-vf".into(), filters]);

    if has_audio {
        args.extend(["-map".into(), "0:a?".into()]);
        args.extend(["-c:a".into(), "pcm_s16le".into()]);
        if let Some(channels) = audio_channels {
            args.extend(["-ac".into(), channels.to_string()]);
        }
    }

    args.extend(["-timecode".into(), timecode.into()]);
    args.extend(["-vendor".into(), "avc1".into()]);
    args.extend(["-pix_fmt".into(), "yuv422p10le".into()]);
    args.push("-y".into());
    args.push(output.into());
    args
}

#[async_trait]
impl JobHandler for ProxyHandler {
    fn kind(&self) -> JobKind {
        JobKind::Proxy
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: ProxyParams = serde_json::from_value(job.payload())?;
        if !PROFILES.contains(&params.profile.as_str()) {
            return Err(CoreError::Validation(format!(
                "unknown proxy profile: {}",
                params.profile
            )));
        }
        let target_height: u32 = params
            .resolution
            .parse()
            .map_err(|_| CoreError::Validation(format!("bad resolution: {}", params.resolution)))?;

        let input = resolve_input_path(job, ctx).await?;
        ctx.queue.set_progress(&job.id, 10.0).await?;

        let info = probe(&ctx.runner, &input).await?;
        if !info.has_video() {
            return Err(CoreError::Validation(format!(
                "no video stream in {}",
                input.display()
            )));
        }
        ctx.queue.set_progress(&job.id, 20.0).await?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "proxy".into());
        let output = input.with_file_name(format!(
            "{}_proxy_{}_{}p.mov",
            stem, params.profile, target_height
        ));

        let use_cuda = params.use_gpu && ctx.gpu.cuda_filters_available().await;
        let args = build_proxy_args(
            &input.to_string_lossy(),
            &output.to_string_lossy(),
            &params.profile,
            target_height,
            &params.timecode_start,
            params.audio_channels,
            info.audio_stream_count > 0,
            use_cuda,
        );

        info!(
            "creating {} proxy ({}p{}): {} -> {}",
            params.profile,
            target_height,
            if use_cuda { ", cuda" } else { "" },
            input.display(),
            output.display()
        );
        ctx.queue.set_progress(&job.id, 30.0).await?;

        let total_frames = info.estimated_frames();
        let (progress_tx, progress_task) = spawn_progress_forwarder(ctx.queue.clone(), job.id.clone());
        let run = ctx
            .runner
            .run(Tool::Ffmpeg, &args, &ctx.cancel, |line| {
                if let (Some(total), Some(frame)) = (total_frames, parse_frame_number(line)) {
                    let pct = (30.0 + (frame as f64 / total as f64) * 60.0).min(90.0);
                    let _ = progress_tx.send(pct);
                }
            })
            .await;
        drop(progress_tx);
        let _ = progress_task.await;
        let run = run?;

        if !run.success() {
            let _ = std::fs::remove_file(&output);
            return Err(CoreError::ExternalTool(format!(
                "ffmpeg proxy encode failed: {}",
                run.stderr
            )));
        }
        if !output.exists() {
            return Err(CoreError::ExternalTool(format!(
                "proxy output not created: {}",
                output.display()
            )));
        }
        let output_size = std::fs::metadata(&output)?.len();

        if let Some(asset_id) = job.asset_id.as_deref() {
            ctx.events
                .emit(
                    asset_id,
                    event_types::PROXY_COMPLETED,
                    json!({
                        "output": output.to_string_lossy(),
                        "profile": params.profile,
                        "resolution": format!("{}p", target_height),
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
            "profile": params.profile,
            "resolution": format!("{}p", target_height),
            "gpu_used": use_cuda,
        }))
    }
}

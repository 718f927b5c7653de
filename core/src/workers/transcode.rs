// Transcode worker: preset-driven encodes with optional NVENC and clipping
// Progress comes from the time= field of ffmpeg's stats lines measured
// against the known output duration

use crate::error::{CoreError, Result};
use crate::events::event_types;
use crate::job::{Job, JobKind};
use crate::media::ffprobe::probe;
use crate::media::runner::parse_time_progress;
use crate::media::Tool;
use crate::utils::parse_time_to_seconds;
use crate::workers::{resolve_input_path, spawn_progress_forwarder, JobHandler, WorkerContext};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One entry of the preset table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodePreset {
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate: Option<String>,
    pub audio_bitrate: Option<String>,
    pub video_filters: Option<String>,
    pub pixel_format: String,
    pub preset: String,
    pub crf: Option<String>,
    pub container: String,
}

/// Look up a built-in preset by name
pub fn preset(name: &str) -> Option<TranscodePreset> {
    let p = |video_bitrate: Option<&str>,
             audio_bitrate: &str,
             video_filters: Option<&str>,
             pixel_format: &str,
             speed: &str,
             crf: Option<&str>| TranscodePreset {
        video_codec: "libx264".into(),
        audio_codec: "aac".into(),
        video_bitrate: video_bitrate.map(Into::into),
        audio_bitrate: Some(audio_bitrate.into()),
        video_filters: video_filters.map(Into::into),
        pixel_format: pixel_format.into(),
        preset: speed.into(),
        crf: crf.map(Into::into),
        container: "mp4".into(),
    };

    match name {
        "web_720p" => Some(p(Some("2500k"), "128k", Some("scale=-2:720"), "yuv420p", "medium", None)),
        "web_1080p" => Some(p(Some("5000k"), "192k", Some("scale=-2:1080"), "yuv420p", "medium", None)),
        "archive_h265" => Some(TranscodePreset {
            video_codec: "libx265".into(),
            ..p(None, "128k", None, "yuv420p10le", "medium", Some("23"))
        }),
        "streaming_twitch" => {
            Some(p(Some("6000k"), "160k", Some("scale=-2:1080"), "yuv420p", "veryfast", None))
        }
        "mobile_480p" => Some(p(Some("1000k"), "96k", Some("scale=-2:480"), "yuv420p", "medium", None)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct TranscodeParams {
    #[serde(default = "default_preset_name")]
    preset: String,
    #[serde(default)]
    custom_preset: Option<Value>,
    #[serde(default)]
    start_time: Option<String>,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default = "default_true")]
    use_gpu: bool,
}

fn default_preset_name() -> String {
    "web_1080p".to_string()
}

fn default_true() -> bool {
    true
}

pub struct TranscodeHandler;

/// Substitute hardware encoders for their software counterparts
fn hardware_codec(software: &str) -> Option<&'static str> {
    match software {
        "libx264" => Some("h264_nvenc"),
        "libx265" => Some("hevc_nvenc"),
        _ => None,
    }
}

fn build_transcode_args(
    input: &str,
    output: &str,
    preset: &TranscodePreset,
    start_time: Option<&str>,
    end_time: Option<&str>,
    use_nvenc: bool,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-stats".into(),
    ];

    if use_nvenc {
        args.extend(["-hwaccel".into(), "cuda".into()]);
        args.extend(["-hwaccel_output_format".into(), "cuda".into()]);
    }

    if let Some(start) = start_time {
        args.extend(["-ss".into(), start.into()]);
    }
    args.extend(["-i".into(), input.into()]);
    if let Some(end) = end_time {
        args.extend(["-to".into(), end.into()]);
    }

    let video_codec = if use_nvenc {
        hardware_codec(&preset.video_codec).unwrap_or(preset.video_codec.as_str())
    } else {
        preset.video_codec.as_str()
    };
    args.extend(["-c:v".into(), video_codec.into()]);

    if let Some(crf) = &preset.crf {
        args.extend(["-crf".into(), crf.clone()]);
    } else if let Some(bitrate) = &preset.video_bitrate {
        args.extend(["-b:v".into(), bitrate.clone()]);
    }
    args.extend(["-preset".into(), preset.preset.clone()]);
    args.extend(["-pix_fmt".into(), preset.pixel_format.clone()]);
    if let Some(filters) = &preset.video_filters {
        args.extend(["-vf".into(), filters.clone()]);
    }

    args.extend(["-c:a".into(), preset.audio_codec.clone()]);
    if let Some(bitrate) = &preset.audio_bitrate {
        args.extend(["-b:a".into(), bitrate.clone()]);
    }

    if preset.container == "mp4" {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }
    args.extend(["-map".into(), "0".into()]);
    args.push("-y".into());
    args.push(output.into());
    args
}

#[async_trait]
impl JobHandler for TranscodeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Transcode
    }

    async fn run(&self, job: &Job, ctx: &WorkerContext) -> Result<Value> {
        let params: TranscodeParams = serde_json::from_value(job.payload())?;

        let mut chosen = preset(&params.preset)
            .ok_or_else(|| CoreError::Validation(format!("unknown preset: {}", params.preset)))?;
        if let Some(custom) = &params.custom_preset {
            // Overlay custom fields onto the named preset
            let mut merged = serde_json::to_value(&chosen)?;
            if let (Value::Object(base), Value::Object(overlay)) = (&mut merged, custom) {
                for (k, v) in overlay {
                    base.insert(k.clone(), v.clone());
                }
            }
            chosen = serde_json::from_value(merged)
                .map_err(|e| CoreError::Validation(format!("bad custom_preset: {}", e)))?;
        }

        let input = resolve_input_path(job, ctx).await?;
        ctx.queue.set_progress(&job.id, 10.0).await?;

        let info = probe(&ctx.runner, &input).await?;

        // Output duration for progress: clip bounds win over the container
        let duration = match (&params.start_time, &params.end_time) {
            (Some(start), Some(end)) => {
                Some(parse_time_to_seconds(end) - parse_time_to_seconds(start))
            }
            _ => info.duration_sec,
        }
        .filter(|d| *d > 0.0);

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "transcode".into());
        let clip_suffix = if params.start_time.is_some() && params.end_time.is_some() {
            "_clip"
        } else {
            ""
        };
        let output = input.with_file_name(format!(
            "{}_{}{}.{}",
            stem, params.preset, clip_suffix, chosen.container
        ));

        let use_nvenc = params.use_gpu
            && hardware_codec(&chosen.video_codec).is_some()
            && ctx.gpu.nvenc_available().await;

        let args = build_transcode_args(
            &input.to_string_lossy(),
            &output.to_string_lossy(),
            &chosen,
            params.start_time.as_deref(),
            params.end_time.as_deref(),
            use_nvenc,
        );

        info!(
            "transcoding with preset {}{}: {} -> {}",
            params.preset,
            if use_nvenc { " (nvenc)" } else { "" },
            input.display(),
            output.display()
        );
        ctx.queue.set_progress(&job.id, 30.0).await?;

        let (progress_tx, progress_task) = spawn_progress_forwarder(ctx.queue.clone(), job.id.clone());
        let run = ctx
            .runner
            .run(Tool::Ffmpeg, &args, &ctx.cancel, |line| {
                if let (Some(total), Some(done)) = (duration, parse_time_progress(line)) {
                    let pct = (30.0 + (done / total) * 60.0).min(90.0);
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
                "ffmpeg transcode failed: {}",
                run.stderr
            )));
        }
        if !output.exists() {
            return Err(CoreError::ExternalTool(format!(
                "transcode output not created: {}",
                output.display()
            )));
        }

        let input_size = std::fs::metadata(&input)?.len();
        let output_size = std::fs::metadata(&output)?.len();
        let compression_ratio = if input_size > 0 {
            (1.0 - output_size as f64 / input_size as f64) * 100.0
        } else {
            0.0
        };

        if let Some(asset_id) = job.asset_id.as_deref() {
            ctx.events
                .emit(
                    asset_id,
                    event_types::TRANSCODE_COMPLETED,
                    json!({
                        "output": output.to_string_lossy(),
                        "preset": params.preset,
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
            "preset": params.preset,
            "input_size": input_size,
            "output_size": output_size,
            "compression_ratio": compression_ratio,
            "video_codec": chosen.video_codec,
            "audio_codec": chosen.audio_codec,
            "container": chosen.container,
            "gpu_used": use_nvenc,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_table() {
        for name in ["web_720p", "web_1080p", "archive_h265", "streaming_twitch", "mobile_480p"] {
            assert!(preset(name).is_some(), "missing preset {}", name);
        }
        assert!(preset("betamax").is_none());

        let archive = preset("archive_h265").unwrap();
        assert_eq!(archive.video_codec, "libx265");
        assert_eq!(archive.crf.as_deref(), Some("23"));
        assert!(archive.video_bitrate.is_none());
        assert_eq!(archive.pixel_format, "yuv420p10le");

        let twitch = preset("streaming_twitch").unwrap();
        assert_eq!(twitch.preset, "veryfast");
        assert_eq!(twitch.video_bitrate.as_deref(), Some("6000k"));
    }

    #[test]
    fn test_software_args_use_bitrate_or_crf() {
        let web = preset("web_1080p").unwrap();
        let args = build_transcode_args("/in.mkv", "/out.mp4", &web, None, None, false);
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"-b:v".to_string()));
        assert!(args.contains(&"5000k".to_string()));
        assert!(!args.contains(&"-crf".to_string()));
        assert!(args.contains(&"+faststart".to_string()));

        let archive = preset("archive_h265").unwrap();
        let args = build_transcode_args("/in.mkv", "/out.mp4", &archive, None, None, false);
        assert!(args.contains(&"-crf".to_string()));
        assert!(!args.contains(&"-b:v".to_string()));
    }

    #[test]
    fn test_nvenc_substitution() {
        let web = preset("web_1080p").unwrap();
        let args = build_transcode_args("/in.mkv", "/out.mp4", &web, None, None, true);
        assert!(args.contains(&"h264_nvenc".to_string()));
        assert!(!args.contains(&"libx264".to_string()));

        let archive = preset("archive_h265").unwrap();
        let args = build_transcode_args("/in.mkv", "/out.mp4", &archive, None, None, true);
        assert!(args.contains(&"hevc_nvenc".to_string()));
    }

    #[test]
    fn test_clip_bounds_in_args() {
        let web = preset("web_720p").unwrap();
        let args =
            build_transcode_args("/in.mkv", "/out.mp4", &web, Some("00:01:00"), Some("00:02:30"), false);

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss + 1], "00:01:00");
        let to = args.iter().position(|a| a == "-to").unwrap();
        assert_eq!(args[to + 1], "00:02:30");
        // -ss is an input option, -to an output option
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert!(ss < i && i < to);
    }

    #[test]
    fn test_custom_preset_overlay() {
        let base = preset("web_720p").unwrap();
        let mut merged = serde_json::to_value(&base).unwrap();
        let overlay = json!({"video_bitrate": "9000k", "preset": "slow"});
        if let (Value::Object(b), Value::Object(o)) = (&mut merged, &overlay) {
            for (k, v) in o {
                b.insert(k.clone(), v.clone());
            }
        }
        let merged: TranscodePreset = serde_json::from_value(merged).unwrap();
        assert_eq!(merged.video_bitrate.as_deref(), Some("9000k"));
        assert_eq!(merged.preset, "slow");
        // Untouched fields survive
        assert_eq!(merged.audio_bitrate.as_deref(), Some("128k"));
    }
}

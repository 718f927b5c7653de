// FFprobe integration for extracting media file metadata
// Runs ffprobe with JSON output and converts it into MediaInfo

use crate::error::{CoreError, Result};
use crate::media::runner::{MediaRunner, Tool};
use crate::utils::parse_fps;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata extracted from a media file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_sec: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub fps: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub audio_channels: Option<i64>,
    pub audio_stream_count: usize,
    pub bitrate: Option<i64>,
    pub container: Option<String>,
    /// Frame count of the video stream when the container reports it
    pub nb_frames: Option<i64>,
    /// Format tags with lowercased keys (title, comment, creation_time, ...)
    pub tags: BTreeMap<String, String>,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.video_codec.is_some()
    }

    /// Frame total for progress computation, estimated from duration × fps
    /// when the container does not carry nb_frames
    pub fn estimated_frames(&self) -> Option<u64> {
        if let Some(frames) = self.nb_frames {
            if frames > 0 {
                return Some(frames as u64);
            }
        }
        match (self.duration_sec, self.fps) {
            (Some(duration), Some(fps)) if duration > 0.0 && fps > 0.0 => {
                Some((duration * fps) as u64)
            }
            _ => None,
        }
    }
}

/// Helper structs for deserializing ffprobe JSON output
#[derive(Deserialize, Debug, Default)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeStream {
    #[serde(default)]
    codec_type: String,
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    channels: Option<i64>,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
    tags: Option<BTreeMap<String, String>>,
}

/// Run ffprobe on a media file and extract metadata
///
/// # Errors
/// `CoreError::ExternalTool` when ffprobe cannot run or exits nonzero,
/// `CoreError::Validation` when its output is not parseable JSON
pub async fn probe(runner: &MediaRunner, file: &Path) -> Result<MediaInfo> {
    let args = vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        file.to_string_lossy().to_string(),
    ];

    let output = runner.run_simple(Tool::Ffprobe, &args).await?;
    if !output.success() {
        return Err(CoreError::ExternalTool(format!(
            "ffprobe failed for {}: {}",
            file.display(),
            output.stderr
        )));
    }

    let parsed: FfprobeOutput = serde_json::from_str(&output.stdout)
        .map_err(|e| CoreError::Validation(format!("unparseable ffprobe output: {}", e)))?;

    Ok(convert(parsed))
}

fn convert(output: FfprobeOutput) -> MediaInfo {
    let mut info = MediaInfo {
        duration_sec: output.format.duration.as_deref().and_then(|d| d.parse().ok()),
        bitrate: output.format.bit_rate.as_deref().and_then(|b| b.parse().ok()),
        container: output.format.format_name,
        ..Default::default()
    };

    if let Some(tags) = output.format.tags {
        info.tags = tags
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
    }

    for stream in output.streams {
        match stream.codec_type.as_str() {
            "video" if info.video_codec.is_none() => {
                info.video_codec = stream.codec_name;
                info.width = stream.width;
                info.height = stream.height;
                info.fps = stream.r_frame_rate.as_deref().and_then(parse_fps);
                info.nb_frames = stream.nb_frames.as_deref().and_then(|n| n.parse().ok());
            }
            "audio" => {
                if info.audio_codec.is_none() {
                    info.audio_codec = stream.codec_name;
                    info.audio_channels = stream.channels;
                }
                info.audio_stream_count += 1;
            }
            _ => {}
        }
    }

    info
}

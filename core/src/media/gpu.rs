// GPU capability probing
// nvidia-smi tells us whether a GPU is present; ffmpeg's encoder and filter
// listings tell us whether the build can actually use it. Results are
// probed lazily and cached for the life of the process.

use crate::media::runner::{MediaRunner, Tool};
use log::{debug, info};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Cached GPU capability lookups; constructed once at bootstrap
#[derive(Debug)]
pub struct GpuProbe {
    runner: MediaRunner,
    nvenc: OnceCell<bool>,
    cuda_filters: OnceCell<bool>,
}

impl GpuProbe {
    pub fn new(runner: MediaRunner) -> Self {
        Self {
            runner,
            nvenc: OnceCell::new(),
            cuda_filters: OnceCell::new(),
        }
    }

    /// Whether hardware H.264/H.265 encoding is usable
    pub async fn nvenc_available(&self) -> bool {
        *self
            .nvenc
            .get_or_init(|| async {
                if !gpu_present().await {
                    return false;
                }
                match self
                    .runner
                    .run_simple(Tool::Ffmpeg, &["-hide_banner".into(), "-encoders".into()])
                    .await
                {
                    Ok(out) if out.success() => {
                        let found = out.stdout.contains("h264_nvenc") || out.stdout.contains("hevc_nvenc");
                        if found {
                            info!("NVENC hardware encoding available");
                        } else {
                            debug!("GPU present but ffmpeg lacks NVENC encoders");
                        }
                        found
                    }
                    _ => false,
                }
            })
            .await
    }

    /// Whether the CUDA scale filter chain is usable (proxy generation)
    pub async fn cuda_filters_available(&self) -> bool {
        *self
            .cuda_filters
            .get_or_init(|| async {
                if !gpu_present().await {
                    return false;
                }
                match self
                    .runner
                    .run_simple(Tool::Ffmpeg, &["-hide_banner".into(), "-filters".into()])
                    .await
                {
                    Ok(out) if out.success() => {
                        let found = out.stdout.contains("scale_cuda");
                        if found {
                            info!("CUDA scaling available");
                        }
                        found
                    }
                    _ => false,
                }
            })
            .await
    }
}

/// Whether nvidia-smi reports at least one GPU
async fn gpu_present() -> bool {
    let result = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .stdin(Stdio::null())
        .output()
        .await;

    match result {
        Ok(out) if out.status.success() => {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if name.is_empty() {
                false
            } else {
                debug!("GPU detected: {}", name);
                true
            }
        }
        _ => false,
    }
}

/// Current GPU utilization percent, for the guardrail sampler
///
/// Returns None when no GPU or no nvidia-smi is present.
pub async fn utilization_pct() -> Option<f64> {
    let out = Command::new("nvidia-smi")
        .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    if !out.status.success() {
        return None;
    }
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

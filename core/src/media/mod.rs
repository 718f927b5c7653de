// Media tooling: the subprocess runner, ffprobe integration and GPU probing

pub mod ffprobe;
pub mod gpu;
pub mod runner;

pub use gpu::GpuProbe;
pub use runner::{MediaRunner, RunOutput, Tool};

use crate::error::{CoreError, Result};

/// Validate that ffmpeg is reachable and return its version line
///
/// Called once at bootstrap; a missing binary is an init failure for the
/// daemon, while library users (tests) simply never call this.
pub async fn detect_tools(runner: &MediaRunner) -> Result<String> {
    let output = runner.run_simple(Tool::Ffmpeg, &["-version".into()]).await?;
    if !output.success() {
        return Err(CoreError::ExternalTool("ffmpeg -version failed".into()));
    }

    let version = output
        .stdout
        .lines()
        .next()
        .unwrap_or("ffmpeg version unknown")
        .to_string();
    Ok(version)
}

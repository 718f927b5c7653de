// FFmpeg/FFprobe subprocess runner
// Owns every external-tool invocation: spawn, pipe handling, stderr
// line streaming with a caller-supplied parser, cooperative cancellation
// and scratch file cleanup

use crate::cancel::CancelFlag;
use crate::constants::ffmpeg::MAX_STDERR_LINES;
use crate::error::{CoreError, Result};
use crate::utils::parse_time_to_seconds;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Which binary to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

/// Captured outcome of a tool invocation
#[derive(Debug)]
pub struct RunOutput {
    /// Exit code; None when the process died from a signal
    pub exit_code: Option<i32>,

    pub stdout: String,

    /// Stderr output, truncated past MAX_STDERR_LINES
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Single abstraction over ffmpeg/ffprobe execution
#[derive(Debug, Clone)]
pub struct MediaRunner {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    cache_dir: PathBuf,
}

impl MediaRunner {
    /// Runner using binaries from PATH
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_programs("ffmpeg", "ffprobe", cache_dir)
    }

    pub fn with_programs(
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Scratch file path for a job, e.g. `<cache>/<job_id>_thumb_3.jpg`
    pub fn scratch_path(&self, job_id: &str, suffix: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(self.cache_dir.join(format!("{}{}", job_id, suffix)))
    }

    /// Remove every scratch file belonging to a job
    pub fn cleanup_scratch(&self, job_id: &str) {
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(job_id) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!("failed to remove scratch file {:?}: {}", entry.path(), e);
                }
            }
        }
    }

    /// Run a tool without progress parsing or cancellation (probes, listings)
    pub async fn run_simple(&self, tool: Tool, args: &[String]) -> Result<RunOutput> {
        self.run(tool, args, &CancelFlag::new(), |_| {}).await
    }

    /// Run a tool, streaming stderr line-by-line through `on_stderr`
    ///
    /// The cancel flag is checked before the spawn and between lines; a set
    /// flag kills the child and returns `CoreError::Cancelled`.
    pub async fn run<F>(
        &self,
        tool: Tool,
        args: &[String],
        cancel: &CancelFlag,
        mut on_stderr: F,
    ) -> Result<RunOutput>
    where
        F: FnMut(&str),
    {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let program = match tool {
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Ffprobe => &self.ffprobe,
        };
        debug!("running {:?} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::ExternalTool(format!("failed to start {:?}: {}", program, e)))?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::ExternalTool("failed to capture stdout".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| CoreError::ExternalTool("failed to capture stderr".into()))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stderr_pipe).lines();
        let mut stderr_lines: Vec<String> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stdout_task.abort();
                return Err(CoreError::Cancelled);
            }

            // Bounded wait so a silent child stays cancellable
            match tokio::time::timeout(Duration::from_millis(500), lines.next_line()).await {
                Err(_) => continue,
                Ok(Ok(None)) => break,
                Ok(Ok(Some(line))) => {
                    if stderr_lines.len() < MAX_STDERR_LINES {
                        stderr_lines.push(line.clone());
                    } else if stderr_lines.len() == MAX_STDERR_LINES {
                        stderr_lines.push("... (output truncated) ...".to_string());
                    }
                    on_stderr(&line);
                }
                Ok(Err(e)) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(CoreError::ExternalTool(format!("failed to read stderr: {}", e)));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoreError::ExternalTool(format!("failed to wait for child: {}", e)))?;
        let stdout = stdout_task.await.unwrap_or_default();

        Ok(RunOutput {
            exit_code: status.code(),
            stdout,
            stderr: stderr_lines.join("\n"),
        })
    }
}

/// Extract the frame counter from an ffmpeg stats line
///
/// Lines look like `frame= 1234 fps= 45 ... time=00:01:23.45 ... speed=1.5x`.
pub fn parse_frame_number(line: &str) -> Option<u64> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"frame=\s*(\d+)").unwrap());
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Extract the elapsed output time from an ffmpeg stats line
pub fn parse_time_progress(line: &str) -> Option<f64> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"time=(\d{2}:\d{2}:\d{2}\.\d+)").unwrap());
    let value = re.captures(line)?.get(1)?.as_str();
    Some(parse_time_to_seconds(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_frame_number() {
        let line = "frame= 1234 fps= 45 q=-0.0 size=   12345kB time=00:01:23.45 bitrate=1234.5kbits/s speed=1.5x";
        assert_eq!(parse_frame_number(line), Some(1234));
        assert_eq!(parse_frame_number("no progress here"), None);
    }

    #[test]
    fn test_parse_time_progress() {
        let line = "frame=  100 fps= 25 q=28.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=   1x";
        assert_eq!(parse_time_progress(line), Some(4.0));

        let line = "frame= 5000 fps=120 time=01:02:03.50 speed=4.1x";
        assert_eq!(parse_time_progress(line), Some(3723.5));

        assert_eq!(parse_time_progress("size=1024kB"), None);
    }

    #[test]
    fn test_scratch_paths_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let runner = MediaRunner::with_programs("ffmpeg", "ffprobe", dir.path().join("cache"));

        let a = runner.scratch_path("job42", "_thumb_0.jpg").unwrap();
        let b = runner.scratch_path("job42", ".mov").unwrap();
        let other = runner.scratch_path("job99", ".mov").unwrap();
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();
        std::fs::write(&other, b"x").unwrap();

        runner.cleanup_scratch("job42");
        assert!(!a.exists());
        assert!(!b.exists());
        assert!(other.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_external_tool_error() {
        let dir = TempDir::new().unwrap();
        let runner = MediaRunner::with_programs(
            "/nonexistent/ffmpeg",
            "/nonexistent/ffprobe",
            dir.path().join("cache"),
        );

        let err = runner.run_simple(Tool::Ffmpeg, &["-version".into()]).await;
        assert!(matches!(err, Err(CoreError::ExternalTool(_))));
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_never_spawns() {
        let dir = TempDir::new().unwrap();
        let runner = MediaRunner::with_programs(
            "/nonexistent/ffmpeg",
            "/nonexistent/ffprobe",
            dir.path().join("cache"),
        );

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = runner.run(Tool::Ffmpeg, &[], &cancel, |_| {}).await;
        assert!(matches!(err, Err(CoreError::Cancelled)));
    }
}

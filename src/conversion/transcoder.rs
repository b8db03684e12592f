//! # Transcoder
//!
//! Runs ffmpeg as a subprocess to turn one input file into a speech-tuned
//! MP3 (mono, reduced sample rate, moderate bitrate).
//!
//! Every invocation is bounded by a hard timeout. The child is spawned with
//! `kill_on_drop`, so abandoning the wait on timeout kills the process.

use crate::config::ConversionConfig;
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt kept in a failure message.
const STDERR_LIMIT: usize = 2048;

#[derive(Debug)]
pub enum TranscodeError {
    /// The binary could not be started
    Spawn(std::io::Error),
    /// The process ran and exited unsuccessfully, or produced nothing
    Failed { status: Option<i32>, stderr: String },
    /// Killed after running longer than the limit
    Timeout(Duration),
    Io(std::io::Error),
}

impl fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscodeError::Spawn(e) => write!(f, "failed to start transcoder: {}", e),
            TranscodeError::Failed { status, stderr } => match status {
                Some(code) => write!(f, "transcoder exited with status {}: {}", code, stderr),
                None => write!(f, "transcoder terminated by signal: {}", stderr),
            },
            TranscodeError::Timeout(limit) => {
                write!(f, "transcoder timed out after {}s", limit.as_secs())
            }
            TranscodeError::Io(e) => write!(f, "transcoder I/O error: {}", e),
        }
    }
}

impl std::error::Error for TranscodeError {}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeOutput {
    /// Duration of the produced file, when it could be probed
    pub duration_secs: Option<f64>,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<TranscodeOutput, TranscodeError>;
}

#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    sample_rate: u32,
    channels: u8,
    bitrate: String,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(config: &ConversionConfig) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg_path),
            ffprobe: PathBuf::from(&config.ffprobe_path),
            sample_rate: config.sample_rate,
            channels: config.channels,
            bitrate: config.bitrate.clone(),
            timeout: config.timeout(),
        }
    }

    fn args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_owned());
        for arg in [
            "-vn".to_string(),
            "-ac".to_string(),
            self.channels.to_string(),
            "-ar".to_string(),
            self.sample_rate.to_string(),
            "-codec:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            self.bitrate.clone(),
        ] {
            args.push(arg.into());
        }
        args.push(output.as_os_str().to_owned());
        args
    }

    /// Best-effort duration via ffprobe; any failure yields `None`.
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let probe = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(30), probe).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().parse().ok()
            }
            Ok(Ok(output)) => {
                debug!(status = ?output.status.code(), "ffprobe failed");
                None
            }
            Ok(Err(e)) => {
                debug!("ffprobe unavailable: {}", e);
                None
            }
            Err(_) => {
                warn!(path = %path.display(), "ffprobe timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<TranscodeOutput, TranscodeError> {
        let child = Command::new(&self.ffmpeg)
            .args(self.args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(TranscodeError::Io)?,
            // The dropped future owned the child; kill_on_drop reaps it.
            Err(_) => return Err(TranscodeError::Timeout(self.timeout)),
        };

        if !result.status.success() {
            let mut stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            if stderr.len() > STDERR_LIMIT {
                let mut cut = STDERR_LIMIT;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(TranscodeError::Failed {
                status: result.status.code(),
                stderr,
            });
        }

        let produced = tokio::fs::metadata(output).await.map_err(TranscodeError::Io)?;
        if produced.len() == 0 {
            return Err(TranscodeError::Failed {
                status: result.status.code(),
                stderr: "empty output".to_string(),
            });
        }

        Ok(TranscodeOutput {
            duration_secs: self.probe_duration(output).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn transcoder_with(ffmpeg: &Path, timeout: Duration) -> FfmpegTranscoder {
        let mut config = AppConfig::default().conversion;
        config.ffmpeg_path = ffmpeg.display().to_string();
        config.ffprobe_path = "/nonexistent/ffprobe".to_string();
        let mut transcoder = FfmpegTranscoder::new(&config);
        transcoder.timeout = timeout;
        transcoder
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_args_request_speech_profile() {
        let transcoder = FfmpegTranscoder::new(&AppConfig::default().conversion);
        let args: Vec<String> = transcoder
            .args(Path::new("in.amr"), Path::new("out.mp3"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let joined = args.join(" ");
        assert!(joined.contains("-i in.amr"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-ar 22050"));
        assert!(joined.contains("-b:a 64k"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp3"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let transcoder = transcoder_with(Path::new("/nonexistent/ffmpeg"), Duration::from_secs(5));
        let err = transcoder
            .transcode(Path::new("in.amr"), Path::new("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_process_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = script(dir.path(), "sleep 30");
        let transcoder = transcoder_with(&ffmpeg, Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = transcoder
            .transcode(&dir.path().join("in.amr"), &dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = script(dir.path(), "echo 'Invalid data found' >&2\nexit 3");
        let transcoder = transcoder_with(&ffmpeg, Duration::from_secs(10));

        let err = transcoder
            .transcode(&dir.path().join("in.amr"), &dir.path().join("out.mp3"))
            .await
            .unwrap_err();
        match err {
            TranscodeError::Failed { status, stderr } => {
                assert_eq!(status, Some(3));
                assert!(stderr.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        // Writes to the last argument, which is the output path.
        let ffmpeg = script(dir.path(), "for last; do :; done\necho mp3data > \"$last\"");
        let transcoder = transcoder_with(&ffmpeg, Duration::from_secs(10));
        let output = dir.path().join("out.mp3");

        let result = transcoder
            .transcode(&dir.path().join("in.amr"), &output)
            .await
            .unwrap();
        assert_eq!(result.duration_secs, None);
        assert!(std::fs::metadata(&output).unwrap().len() > 0);
    }
}

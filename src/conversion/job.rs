//! # Conversion Jobs
//!
//! A `ConversionJob` is one unit of work: take an uploaded recording in a
//! format browsers cannot play and produce an MP3 next to it.
//!
//! ## Lifecycle:
//! ```text
//!  PENDING ──▶ PROCESSING ──▶ READY
//!     ▲            │
//!     └── retry ───┤ (attempts < 3, after 2^attempts × base)
//!                  ▼
//!               FAILED      (attempts = 3, never re-enqueued)
//! ```
//!
//! Job records are an audit trail and are never deleted. A manual
//! re-conversion creates a new job instead of reviving a terminal one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Attempts before a job is terminally FAILED.
pub const MAX_ATTEMPTS: u8 = 3;

/// Formats every supported browser plays natively.
const PLAYABLE_FORMATS: &[&str] = &[
    "mp3", "m4a", "aac", "mp4", "ogg", "oga", "opus", "wav", "webm", "flac",
];

/// Lower-cases a format or file extension and strips a leading dot.
pub fn normalize_format(format: &str) -> String {
    format.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Whether an upload in `format` has to be transcoded before playback.
pub fn needs_conversion(format: &str) -> bool {
    let format = normalize_format(format);
    !format.is_empty() && !PLAYABLE_FORMATS.contains(&format.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl JobStatus {
    /// READY and FAILED are final; the queue never touches them again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionJob {
    pub id: Uuid,
    pub recording_id: String,
    pub source_key: String,
    pub target_key: String,
    /// Normalised source format, e.g. `amr`
    pub format: String,
    pub status: JobStatus,
    /// Finished attempts, successful or not
    pub attempts: u8,
    pub last_error: Option<String>,
    /// Earliest time the job may run
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
}

impl ConversionJob {
    pub fn new(recording_id: &str, source_key: &str, format: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recording_id: recording_id.to_string(),
            source_key: source_key.to_string(),
            target_key: target_key_for(recording_id, source_key),
            format: normalize_format(format),
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            scheduled_at: now,
            completed_at: None,
            created_at: now,
            duration_secs: None,
            size_bytes: None,
        }
    }

    /// A fresh PENDING job for the same recording.
    pub fn rerun(&self, now: DateTime<Utc>) -> Self {
        let mut job = ConversionJob::new(&self.recording_id, &self.source_key, &self.format, now);
        job.target_key = self.target_key.clone();
        job
    }

    /// Delay before the next attempt: `base * 2^attempts`.
    pub fn retry_delay(&self, base: Duration) -> Duration {
        base.saturating_mul(1u32 << self.attempts.min(16))
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.attempts > MAX_ATTEMPTS {
            return Err(format!("attempts {} exceeds {}", self.attempts, MAX_ATTEMPTS));
        }
        if self.status == JobStatus::Failed && self.attempts < MAX_ATTEMPTS {
            return Err("failed before exhausting attempts".to_string());
        }
        if self.status.is_terminal() != self.completed_at.is_some() {
            return Err("completed_at does not match status".to_string());
        }
        Ok(())
    }
}

/// `converted/{recording}/{source stem}.mp3`
fn target_key_for(recording_id: &str, source_key: &str) -> String {
    let file_name = source_key.rsplit('/').next().unwrap_or(source_key);
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    let stem = if stem.is_empty() { "recording" } else { stem };
    format!("converted/{}/{}.mp3", recording_id, stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_conversion() {
        assert!(needs_conversion("amr"));
        assert!(needs_conversion(".AMR"));
        assert!(needs_conversion("3gp"));
        assert!(needs_conversion("wma"));
        assert!(!needs_conversion("mp3"));
        assert!(!needs_conversion("M4A"));
        assert!(!needs_conversion("ogg"));
        assert!(!needs_conversion(""));
    }

    #[test]
    fn test_new_job_defaults() {
        let now = Utc::now();
        let job = ConversionJob::new("rec-1", "uploads/rec-1/talk.amr", ".AMR", now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.format, "amr");
        assert_eq!(job.target_key, "converted/rec-1/talk.mp3");
        assert_eq!(job.scheduled_at, now);
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_target_key_without_extension() {
        assert_eq!(target_key_for("r", "blob"), "converted/r/blob.mp3");
        assert_eq!(target_key_for("r", "dir/.hidden"), "converted/r/.hidden.mp3");
    }

    #[test]
    fn test_retry_delay_doubles() {
        let base = Duration::from_secs(60);
        let mut job = ConversionJob::new("r", "k.amr", "amr", Utc::now());

        job.attempts = 1;
        assert_eq!(job.retry_delay(base), Duration::from_secs(120));
        job.attempts = 2;
        assert_eq!(job.retry_delay(base), Duration::from_secs(240));
        job.attempts = 3;
        assert_eq!(job.retry_delay(base), Duration::from_secs(480));
    }

    #[test]
    fn test_rerun_is_a_new_job() {
        let now = Utc::now();
        let mut failed = ConversionJob::new("r", "k.amr", "amr", now);
        failed.status = JobStatus::Failed;
        failed.attempts = MAX_ATTEMPTS;
        failed.completed_at = Some(now);

        let rerun = failed.rerun(now);
        assert_ne!(rerun.id, failed.id);
        assert_eq!(rerun.status, JobStatus::Pending);
        assert_eq!(rerun.attempts, 0);
        assert_eq!(rerun.target_key, failed.target_key);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&JobStatus::Processing).unwrap(), "\"PROCESSING\"");
        assert_eq!(JobStatus::Ready.to_string(), "ready");
    }
}

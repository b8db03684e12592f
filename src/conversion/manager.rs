//! # Conversion Queue Manager
//!
//! Owns conversion jobs from enqueue to a terminal state.
//!
//! ## Processing:
//! - One worker drains the queue in FIFO order, one job at a time
//! - A job is downloaded into its own scratch directory, transcoded, uploaded
//!   to its target key, and the scratch directory is always removed
//! - A failure counts one attempt; below `MAX_ATTEMPTS` the job goes back to
//!   PENDING and is re-enqueued at the tail after `base * 2^attempts`
//! - Terminal jobs are skipped if they ever come off the queue again
//!
//! The owning recording's mirrored status follows the job at every step.

use super::job::{needs_conversion, normalize_format, ConversionJob, JobStatus, MAX_ATTEMPTS};
use super::queue::{JobQueue, JobReceiver, RetryTimer, TokioRetryTimer};
use super::store::{ConversionStatus, JobStore, RecordingCatalog};
use super::transcoder::{TranscodeOutput, Transcoder};
use crate::clock::Clock;
use crate::storage::BlobStore;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Body of the conversion trigger.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    #[serde(alias = "recordingId")]
    pub record_id: String,
    pub source_key: String,
    pub format: String,
}

#[derive(Debug)]
pub enum ConversionError {
    /// The format already plays in browsers, or is empty.
    NotConvertible(String),
    NotFound(Uuid),
    /// Only FAILED jobs may be re-run by hand.
    NotRetryable { id: Uuid, status: JobStatus },
    Invalid(String),
    Store(anyhow::Error),
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionError::NotConvertible(format) => {
                write!(f, "Format '{}' does not need conversion", format)
            }
            ConversionError::NotFound(id) => write!(f, "Conversion job {} not found", id),
            ConversionError::NotRetryable { id, status } => {
                write!(f, "Conversion job {} is {} and cannot be retried", id, status)
            }
            ConversionError::Invalid(msg) => write!(f, "{}", msg),
            ConversionError::Store(e) => write!(f, "Conversion store failure: {:#}", e),
        }
    }
}

impl std::error::Error for ConversionError {}

impl From<anyhow::Error> for ConversionError {
    fn from(err: anyhow::Error) -> Self {
        ConversionError::Store(err)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub scratch_dir: PathBuf,
    pub backoff_base: Duration,
}

pub struct ConversionManager {
    jobs: Arc<dyn JobStore>,
    recordings: Arc<dyn RecordingCatalog>,
    blobs: Arc<dyn BlobStore>,
    transcoder: Arc<dyn Transcoder>,
    timer: Arc<dyn RetryTimer>,
    clock: Arc<dyn Clock>,
    queue: JobQueue,
    settings: PipelineSettings,
}

impl ConversionManager {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        recordings: Arc<dyn RecordingCatalog>,
        blobs: Arc<dyn BlobStore>,
        transcoder: Arc<dyn Transcoder>,
        clock: Arc<dyn Clock>,
        queue: JobQueue,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            jobs,
            recordings,
            blobs,
            transcoder,
            timer: Arc::new(TokioRetryTimer),
            clock,
            queue,
            settings,
        }
    }

    pub fn with_timer(mut self, timer: Arc<dyn RetryTimer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<ConversionJob>> {
        self.jobs.get(id).await
    }

    /// Create a PENDING job for a recording that needs conversion and queue it.
    /// A recording that already has an unfinished job gets that job back.
    pub async fn enqueue(&self, request: ConversionRequest) -> Result<ConversionJob, ConversionError> {
        let format = normalize_format(&request.format);
        if request.record_id.trim().is_empty() || request.source_key.trim().is_empty() {
            return Err(ConversionError::Invalid(
                "recordId and sourceKey are required".to_string(),
            ));
        }
        if !needs_conversion(&format) {
            return Err(ConversionError::NotConvertible(format));
        }

        let job = ConversionJob::new(&request.record_id, &request.source_key, &format, self.clock.now());
        self.submit(job).await
    }

    /// Manual re-conversion of a FAILED job, as a brand new job.
    pub async fn retry(&self, id: Uuid) -> Result<ConversionJob, ConversionError> {
        let failed = self.jobs.get(id).await?.ok_or(ConversionError::NotFound(id))?;
        if failed.status != JobStatus::Failed {
            return Err(ConversionError::NotRetryable {
                id,
                status: failed.status,
            });
        }
        let job = failed.rerun(self.clock.now());
        info!(previous = %id, job = %job.id, "manual re-conversion requested");
        self.submit(job).await
    }

    async fn submit(&self, job: ConversionJob) -> Result<ConversionJob, ConversionError> {
        if let Some(existing) = self.jobs.create_if_absent(job.clone()).await? {
            info!(job = %existing.id, recording = %existing.recording_id, "conversion already queued");
            return Ok(existing);
        }
        self.recordings
            .set_status(&job.recording_id, &job.source_key, ConversionStatus::Pending)
            .await?;
        self.queue.push(job.id)?;
        info!(
            job = %job.id,
            recording = %job.recording_id,
            format = %job.format,
            "conversion job created"
        );
        Ok(job)
    }

    /// Re-enqueue unfinished work found in the job store after a restart.
    /// Interrupted PROCESSING jobs go back to PENDING without losing an attempt.
    pub async fn rehydrate(&self) -> Result<usize> {
        let mut unfinished: Vec<ConversionJob> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect();
        unfinished.sort_by_key(|j| j.scheduled_at);

        let now = self.clock.now();
        for job in &mut unfinished {
            if job.status == JobStatus::Processing {
                warn!(job = %job.id, "conversion was interrupted; requeueing");
                job.status = JobStatus::Pending;
                self.jobs.update(job.clone()).await?;
            }
            self.recordings
                .set_status(&job.recording_id, &job.source_key, ConversionStatus::Pending)
                .await?;

            let wait = (job.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
            if wait.is_zero() {
                self.queue.push(job.id)?;
            } else {
                self.timer.schedule(job.id, wait, self.queue.clone());
            }
        }

        if !unfinished.is_empty() {
            info!(count = unfinished.len(), "rehydrated conversion jobs");
        }
        Ok(unfinished.len())
    }

    /// Worker loop. Runs until the queue closes.
    pub async fn run(self: Arc<Self>, mut receiver: JobReceiver) {
        info!("conversion worker started");
        while let Some(id) = receiver.next().await {
            if let Err(e) = self.process(id).await {
                error!(job = %id, "conversion bookkeeping failed: {:#}", e);
            }
        }
        info!("conversion worker stopped");
    }

    /// Run one attempt of one job.
    ///
    /// If recording the outcome fails, the job is queued again after the
    /// backoff base so it cannot be left stranded in PROCESSING or in PENDING
    /// with no timer. The error is still returned for logging.
    pub async fn process(&self, id: Uuid) -> Result<()> {
        let result = self.attempt(id).await;
        if result.is_err() {
            warn!(
                job = %id,
                retry_in_secs = self.settings.backoff_base.as_secs(),
                "conversion bookkeeping failed; job requeued"
            );
            self.timer.schedule(id, self.settings.backoff_base, self.queue.clone());
        }
        result
    }

    async fn attempt(&self, id: Uuid) -> Result<()> {
        let Some(mut job) = self.jobs.get(id).await? else {
            warn!(job = %id, "queued job no longer exists");
            return Ok(());
        };
        if job.status.is_terminal() {
            debug!(job = %id, status = %job.status, "skipping resolved job");
            return self.mirror_outcome(&job).await;
        }

        job.status = JobStatus::Processing;
        self.jobs.update(job.clone()).await?;
        self.recordings
            .set_status(&job.recording_id, &job.source_key, ConversionStatus::Processing)
            .await?;
        info!(job = %id, attempt = job.attempts + 1, source = %job.source_key, "conversion started");

        let scratch = self.settings.scratch_dir.join(id.to_string());
        let result = self.convert(&job, &scratch).await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job = %id, path = %scratch.display(), "failed to clean scratch files: {}", e);
            }
        }

        job.attempts += 1;
        let now = self.clock.now();
        match result {
            Ok((output, size)) => {
                job.status = JobStatus::Ready;
                job.completed_at = Some(now);
                job.last_error = None;
                job.duration_secs = output.duration_secs;
                job.size_bytes = Some(size);
                self.jobs.update(job.clone()).await?;
                self.mirror_outcome(&job).await?;
                info!(
                    job = %id,
                    attempts = job.attempts,
                    target = %job.target_key,
                    size,
                    "conversion ready"
                );
            }
            Err(e) => {
                let message = format!("{:#}", e);
                job.last_error = Some(message.clone());
                if job.attempts >= MAX_ATTEMPTS {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                    self.jobs.update(job.clone()).await?;
                    self.mirror_outcome(&job).await?;
                    error!(job = %id, attempts = job.attempts, error = %message, "conversion failed permanently");
                } else {
                    let delay = job.retry_delay(self.settings.backoff_base);
                    job.status = JobStatus::Pending;
                    job.scheduled_at = now + chrono::Duration::from_std(delay)?;
                    self.jobs.update(job.clone()).await?;
                    self.recordings
                        .set_status(&job.recording_id, &job.source_key, ConversionStatus::Pending)
                        .await?;
                    warn!(
                        job = %id,
                        attempts = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        error = %message,
                        "conversion failed; retry scheduled"
                    );
                    self.timer.schedule(id, delay, self.queue.clone());
                }
            }
        }
        Ok(())
    }

    /// Bring the recording's mirror in line with a finished job. Rewriting
    /// it is harmless, so a terminal job that comes off the queue again repairs
    /// a mirror write that failed the first time.
    async fn mirror_outcome(&self, job: &ConversionJob) -> Result<()> {
        match job.status {
            JobStatus::Ready => {
                self.recordings
                    .mark_ready(
                        &job.recording_id,
                        &job.target_key,
                        job.duration_secs,
                        job.size_bytes.unwrap_or_default(),
                    )
                    .await
            }
            JobStatus::Failed => {
                self.recordings
                    .set_status(&job.recording_id, &job.source_key, ConversionStatus::Failed)
                    .await
            }
            JobStatus::Pending | JobStatus::Processing => Ok(()),
        }
    }

    /// Download, transcode, upload. Returns the transcoder output and the
    /// stored size.
    async fn convert(&self, job: &ConversionJob, scratch: &Path) -> Result<(TranscodeOutput, u64)> {
        tokio::fs::create_dir_all(scratch)
            .await
            .with_context(|| format!("failed to create scratch dir {}", scratch.display()))?;

        let input = scratch.join(format!("source.{}", job.format));
        let output = scratch.join("converted.mp3");

        self.blobs
            .download_to(&job.source_key, &input)
            .await
            .context("download failed")?;
        let transcoded = self.transcoder.transcode(&input, &output).await?;
        let size = self
            .blobs
            .put_file(&job.target_key, &output)
            .await
            .context("upload failed")?;
        Ok((transcoded, size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conversion::queue::job_queue;
    use crate::conversion::store::{InMemoryJobStore, InMemoryRecordingCatalog, RecordingRecord};
    use crate::conversion::transcoder::TranscodeError;
    use async_trait::async_trait;
    use chrono::Utc;
    use dashmap::DashMap;
    use std::collections::VecDeque;
    use std::ops::Range;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryBlobs {
        objects: DashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn put_file(&self, key: &str, source: &Path) -> Result<u64> {
            let bytes = tokio::fs::read(source).await?;
            let len = bytes.len() as u64;
            self.objects.insert(key.to_string(), bytes);
            Ok(len)
        }

        async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Vec<u8>> {
            let object = self.objects.get(key).context("missing")?;
            Ok(object[range.start as usize..range.end as usize].to_vec())
        }

        async fn download_to(&self, key: &str, destination: &Path) -> Result<u64> {
            let bytes = self.objects.get(key).context("missing")?.clone();
            tokio::fs::write(destination, &bytes).await?;
            Ok(bytes.len() as u64)
        }

        fn signed_read_url(&self, key: &str, _ttl: Duration) -> Result<String> {
            Ok(format!("mem://{}", key))
        }
    }

    /// Plays back scripted outcomes and records the mirrored status it saw.
    struct ScriptedTranscoder {
        outcomes: Mutex<VecDeque<bool>>,
        recordings: Arc<InMemoryRecordingCatalog>,
        seen_status: Mutex<Vec<Option<ConversionStatus>>>,
    }

    #[async_trait]
    impl Transcoder for ScriptedTranscoder {
        async fn transcode(&self, input: &Path, output: &Path) -> Result<TranscodeOutput, TranscodeError> {
            assert!(input.exists(), "source should be downloaded first");
            let record = self.recordings.get("rec-1").await.unwrap();
            self.seen_status
                .lock()
                .unwrap()
                .push(record.and_then(|r| r.conversion_status));

            let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            if !succeed {
                return Err(TranscodeError::Failed {
                    status: Some(1),
                    stderr: "Invalid data found when processing input".to_string(),
                });
            }
            tokio::fs::write(output, b"ID3 converted").await.map_err(TranscodeError::Io)?;
            Ok(TranscodeOutput {
                duration_secs: Some(42.0),
            })
        }
    }

    /// Records each requested delay and re-enqueues immediately.
    #[derive(Default)]
    struct InstantTimer {
        delays: Mutex<Vec<Duration>>,
    }

    impl RetryTimer for InstantTimer {
        fn schedule(&self, job_id: Uuid, delay: Duration, queue: JobQueue) {
            self.delays.lock().unwrap().push(delay);
            queue.push(job_id).unwrap();
        }
    }

    /// Job store that keeps every status it was asked to write, and can be
    /// told to fail chosen `update` calls (1-based).
    #[derive(Default)]
    struct HistoryJobStore {
        inner: InMemoryJobStore,
        history: Mutex<Vec<JobStatus>>,
        updates: AtomicUsize,
        failing_updates: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl JobStore for HistoryJobStore {
        async fn create_if_absent(&self, job: ConversionJob) -> Result<Option<ConversionJob>> {
            job.check_invariants().unwrap();
            let existing = self.inner.create_if_absent(job.clone()).await?;
            if existing.is_none() {
                self.history.lock().unwrap().push(job.status);
            }
            Ok(existing)
        }
        async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>> {
            self.inner.get(id).await
        }
        async fn update(&self, job: ConversionJob) -> Result<()> {
            job.check_invariants().unwrap();
            let call = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing_updates.lock().unwrap().contains(&call) {
                anyhow::bail!("job table unavailable");
            }
            self.history.lock().unwrap().push(job.status);
            self.inner.update(job).await
        }
        async fn list(&self) -> Result<Vec<ConversionJob>> {
            self.inner.list().await
        }
    }

    struct Harness {
        manager: ConversionManager,
        receiver: JobReceiver,
        jobs: Arc<HistoryJobStore>,
        recordings: Arc<InMemoryRecordingCatalog>,
        blobs: Arc<MemoryBlobs>,
        transcoder: Arc<ScriptedTranscoder>,
        timer: Arc<InstantTimer>,
        scratch: tempfile::TempDir,
    }

    fn harness(outcomes: &[bool]) -> Harness {
        let jobs = Arc::new(HistoryJobStore::default());
        let recordings = Arc::new(InMemoryRecordingCatalog::new());
        let blobs = Arc::new(MemoryBlobs::default());
        blobs
            .objects
            .insert("uploads/rec-1/talk.amr".to_string(), b"#!AMR\n....".to_vec());
        let transcoder = Arc::new(ScriptedTranscoder {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            recordings: recordings.clone(),
            seen_status: Mutex::new(Vec::new()),
        });
        let timer = Arc::new(InstantTimer::default());
        let scratch = tempfile::tempdir().unwrap();
        let (queue, receiver) = job_queue();

        let manager = ConversionManager::new(
            jobs.clone(),
            recordings.clone(),
            blobs.clone(),
            transcoder.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            queue,
            PipelineSettings {
                scratch_dir: scratch.path().to_path_buf(),
                backoff_base: Duration::from_secs(60),
            },
        )
        .with_timer(timer.clone());

        Harness {
            manager,
            receiver,
            jobs,
            recordings,
            blobs,
            transcoder,
            timer,
            scratch,
        }
    }

    fn amr_request() -> ConversionRequest {
        ConversionRequest {
            record_id: "rec-1".to_string(),
            source_key: "uploads/rec-1/talk.amr".to_string(),
            format: "amr".to_string(),
        }
    }

    async fn drain(h: &mut Harness) {
        while let Some(id) = h.receiver.try_next() {
            h.manager.process(id).await.unwrap();
        }
    }

    async fn mirror(h: &Harness) -> RecordingRecord {
        h.recordings.get("rec-1").await.unwrap().unwrap()
    }

    fn scratch_is_empty(h: &Harness) -> bool {
        std::fs::read_dir(h.scratch.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_amr_upload_becomes_playable() {
        let mut h = harness(&[true]);

        let job = h.manager.enqueue(amr_request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let before = mirror(&h).await;
        assert_eq!(before.conversion_status, Some(ConversionStatus::Pending));
        assert!(before.playback_key.is_none());

        drain(&mut h).await;

        assert_eq!(
            *h.transcoder.seen_status.lock().unwrap(),
            vec![Some(ConversionStatus::Processing)]
        );
        let after = mirror(&h).await;
        assert_eq!(after.conversion_status, Some(ConversionStatus::Ready));
        assert_eq!(after.playback_key.as_deref(), Some("converted/rec-1/talk.mp3"));
        assert_eq!(after.duration_secs, Some(42.0));
        assert!(h.blobs.objects.contains_key("converted/rec-1/talk.mp3"));

        let done = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Ready);
        assert_eq!(done.attempts, 1);
        assert!(done.completed_at.is_some());
        assert!(scratch_is_empty(&h));
    }

    #[tokio::test]
    async fn test_three_failures_end_failed() {
        let mut h = harness(&[false, false, false]);
        let job = h.manager.enqueue(amr_request()).await.unwrap();

        drain(&mut h).await;

        let done = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 3);
        assert!(done.last_error.unwrap().contains("Invalid data found"));
        assert_eq!(
            *h.jobs.history.lock().unwrap(),
            vec![
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Failed,
            ]
        );
        assert_eq!(
            *h.timer.delays.lock().unwrap(),
            vec![Duration::from_secs(120), Duration::from_secs(240)]
        );
        assert_eq!(mirror(&h).await.conversion_status, Some(ConversionStatus::Failed));
        assert_eq!(h.manager.queue_depth(), 0);
        assert!(scratch_is_empty(&h));

        // Nothing requeues a terminal job.
        h.manager.process(job.id).await.unwrap();
        assert_eq!(h.jobs.history.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let mut h = harness(&[false, true]);
        let job = h.manager.enqueue(amr_request()).await.unwrap();

        drain(&mut h).await;

        let done = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Ready);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.target_key, "converted/rec-1/talk.mp3");
        assert!(done.last_error.is_none());
        assert_eq!(*h.timer.delays.lock().unwrap(), vec![Duration::from_secs(120)]);
    }

    #[tokio::test]
    async fn test_missing_source_counts_as_attempt() {
        let mut h = harness(&[]);
        h.blobs.objects.clear();
        let job = h.manager.enqueue(amr_request()).await.unwrap();

        h.manager.process(h.receiver.try_next().unwrap()).await.unwrap();

        let after = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.attempts, 1);
        assert!(after.last_error.unwrap().contains("download failed"));
        assert!(h.transcoder.seen_status.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bookkeeping_requeues_job() {
        let mut h = harness(&[false, true]);
        // Update 1 marks PROCESSING; update 2 records the retry.
        h.jobs.failing_updates.lock().unwrap().push(2);
        let job = h.manager.enqueue(amr_request()).await.unwrap();

        let id = h.receiver.try_next().unwrap();
        assert!(h.manager.process(id).await.is_err());

        let stuck = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(stuck.status, JobStatus::Processing);
        assert_eq!(*h.timer.delays.lock().unwrap(), vec![Duration::from_secs(60)]);
        assert_eq!(h.manager.queue_depth(), 1);
        assert!(scratch_is_empty(&h));

        drain(&mut h).await;

        let done = h.manager.job(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Ready);
        assert_eq!(done.attempts, 1);
        assert_eq!(mirror(&h).await.conversion_status, Some(ConversionStatus::Ready));
        assert_eq!(h.manager.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_playable_format_is_rejected() {
        let h = harness(&[]);
        let mut request = amr_request();
        request.format = "mp3".to_string();

        let err = h.manager.enqueue(request).await.unwrap_err();
        assert!(matches!(err, ConversionError::NotConvertible(_)));
        assert!(h.recordings.get("rec-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_returns_active_job() {
        let h = harness(&[]);
        let first = h.manager.enqueue(amr_request()).await.unwrap();
        let second = h.manager.enqueue(amr_request()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.manager.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_manual_retry_creates_new_job() {
        let mut h = harness(&[false, false, false, true]);
        let failed = h.manager.enqueue(amr_request()).await.unwrap();
        drain(&mut h).await;

        let err = h.manager.retry(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ConversionError::NotFound(_)));

        let rerun = h.manager.retry(failed.id).await.unwrap();
        assert_ne!(rerun.id, failed.id);
        drain(&mut h).await;

        let original = h.manager.job(failed.id).await.unwrap().unwrap();
        assert_eq!(original.status, JobStatus::Failed);
        let rerun = h.manager.job(rerun.id).await.unwrap().unwrap();
        assert_eq!(rerun.status, JobStatus::Ready);
        assert_eq!(rerun.attempts, 1);

        let err = h.manager.retry(rerun.id).await.unwrap_err();
        assert!(matches!(err, ConversionError::NotRetryable { status: JobStatus::Ready, .. }));
    }

    #[tokio::test]
    async fn test_rehydrate_requeues_unfinished_jobs_in_order() {
        let mut h = harness(&[]);
        let now = Utc::now() - chrono::Duration::minutes(10);

        let mut interrupted = ConversionJob::new("rec-1", "uploads/rec-1/talk.amr", "amr", now);
        interrupted.status = JobStatus::Processing;
        interrupted.attempts = 1;
        let waiting = ConversionJob::new(
            "rec-2",
            "uploads/rec-2/b.amr",
            "amr",
            now - chrono::Duration::minutes(1),
        );
        let mut finished = ConversionJob::new("rec-3", "uploads/rec-3/c.amr", "amr", now);
        finished.status = JobStatus::Ready;
        finished.attempts = 1;
        finished.completed_at = Some(now);
        for job in [&interrupted, &waiting, &finished] {
            h.jobs.inner.create_if_absent(job.clone()).await.unwrap();
        }

        assert_eq!(h.manager.rehydrate().await.unwrap(), 2);
        assert_eq!(h.receiver.try_next(), Some(waiting.id));
        assert_eq!(h.receiver.try_next(), Some(interrupted.id));
        assert!(h.receiver.try_next().is_none());

        let reset = h.manager.job(interrupted.id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 1);
    }
}

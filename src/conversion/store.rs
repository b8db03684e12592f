//! Durable job records and the recording catalog that mirrors their status.

use super::job::ConversionJob;
use crate::storage::{read_json, write_json_atomic};
use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless its recording already has an unfinished job, in
    /// which case nothing is written and that job is returned. The check and
    /// the insert are one step, so concurrent triggers cannot both create.
    async fn create_if_absent(&self, job: ConversionJob) -> Result<Option<ConversionJob>>;
    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>>;
    /// Replace an existing job. Unknown ids are an error.
    async fn update(&self, job: ConversionJob) -> Result<()>;
    async fn list(&self) -> Result<Vec<ConversionJob>>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, ConversionJob>,
    /// Recording id to its most recent job
    latest: DashMap<String, Uuid>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_if_absent(&self, job: ConversionJob) -> Result<Option<ConversionJob>> {
        // The entry guard serialises creators for the same recording.
        let mut slot = self.latest.entry(job.recording_id.clone()).or_insert(job.id);
        if *slot != job.id {
            if let Some(active) = self.jobs.get(&*slot).filter(|j| !j.status.is_terminal()) {
                return Ok(Some(active.clone()));
            }
            *slot = job.id;
        }
        self.jobs.insert(job.id, job);
        Ok(None)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn update(&self, job: ConversionJob) -> Result<()> {
        match self.jobs.get_mut(&job.id) {
            Some(mut entry) => {
                *entry = job;
                Ok(())
            }
            None => bail!("unknown conversion job {}", job.id),
        }
    }

    async fn list(&self) -> Result<Vec<ConversionJob>> {
        Ok(self.jobs.iter().map(|j| j.value().clone()).collect())
    }
}

/// All jobs in one JSON array, rewritten atomically on every change. The
/// in-memory table only changes after the document on disk has.
#[derive(Debug)]
pub struct FileJobStore {
    path: PathBuf,
    jobs: Mutex<BTreeMap<Uuid, ConversionJob>>,
}

impl FileJobStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let stored: Vec<ConversionJob> = read_json(&path).await?.unwrap_or_default();
        let jobs = stored.into_iter().map(|j| (j.id, j)).collect();
        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    async fn flush(&self, jobs: &BTreeMap<Uuid, ConversionJob>) -> Result<()> {
        let all: Vec<&ConversionJob> = jobs.values().collect();
        write_json_atomic(&self.path, &all).await
    }

    /// Persist `jobs` with `job` written into it, then adopt the result.
    async fn commit(&self, jobs: &mut BTreeMap<Uuid, ConversionJob>, job: ConversionJob) -> Result<()> {
        let mut next = jobs.clone();
        next.insert(job.id, job);
        self.flush(&next).await?;
        *jobs = next;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create_if_absent(&self, job: ConversionJob) -> Result<Option<ConversionJob>> {
        let mut jobs = self.jobs.lock().await;
        let active = jobs
            .values()
            .find(|j| j.recording_id == job.recording_id && !j.status.is_terminal());
        if let Some(active) = active {
            return Ok(Some(active.clone()));
        }
        self.commit(&mut jobs, job).await?;
        Ok(None)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConversionJob>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn update(&self, job: ConversionJob) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(&job.id) {
            bail!("unknown conversion job {}", job.id);
        }
        self.commit(&mut jobs, job).await
    }

    async fn list(&self) -> Result<Vec<ConversionJob>> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }
}

/// Mirrored conversion status carried on a recording, for cheap lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

/// The companion record of an uploaded recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub id: String,
    pub source_key: Option<String>,
    pub conversion_status: Option<ConversionStatus>,
    /// Set once a playable version exists
    pub playback_key: Option<String>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
}

impl RecordingRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            source_key: None,
            conversion_status: None,
            playback_key: None,
            duration_secs: None,
            size_bytes: None,
        }
    }
}

#[async_trait]
pub trait RecordingCatalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>>;

    /// Set the mirrored status, creating the record if needed.
    async fn set_status(&self, id: &str, source_key: &str, status: ConversionStatus) -> Result<()>;

    /// Record a finished conversion.
    async fn mark_ready(
        &self,
        id: &str,
        playback_key: &str,
        duration_secs: Option<f64>,
        size_bytes: u64,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryRecordingCatalog {
    records: DashMap<String, RecordingRecord>,
}

impl InMemoryRecordingCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordingCatalog for InMemoryRecordingCatalog {
    async fn get(&self, id: &str) -> Result<Option<RecordingRecord>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn set_status(&self, id: &str, source_key: &str, status: ConversionStatus) -> Result<()> {
        let mut record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| RecordingRecord::new(id));
        record.source_key = Some(source_key.to_string());
        record.conversion_status = Some(status);
        Ok(())
    }

    async fn mark_ready(
        &self,
        id: &str,
        playback_key: &str,
        duration_secs: Option<f64>,
        size_bytes: u64,
    ) -> Result<()> {
        let mut record = self
            .records
            .entry(id.to_string())
            .or_insert_with(|| RecordingRecord::new(id));
        record.conversion_status = Some(ConversionStatus::Ready);
        record.playback_key = Some(playback_key.to_string());
        record.duration_secs = duration_secs;
        record.size_bytes = Some(size_bytes);
        Ok(())
    }
}

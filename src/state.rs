//! # Application State
//!
//! Everything request handlers and socket actors share: configuration, the
//! token verifier, the session coordinator, the listener fan-out, the
//! conversion pipeline, and request metrics.
//!
//! ## Ownership:
//! - `AppState` is cloned into every actix worker, so each component sits
//!   behind an `Arc` (or is itself a cheap handle like `Broadcaster`)
//! - The broadcast record is not global state: it is owned by the
//!   `SessionCoordinator`, and everything else reaches it through that handle
//! - Metrics are plain counters under a `RwLock`; they are only ever held for
//!   a few field updates
//!
//! ## Wiring:
//! `AppState::new` takes a `Components` bundle, so production code plugs in
//! file-backed stores and ffmpeg while tests plug in in-memory fakes.

use crate::auth::JwtService;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::conversion::{
    job_queue, ConversionManager, FfmpegTranscoder, FileJobStore, InMemoryRecordingCatalog,
    JobReceiver, JobStore, PipelineSettings, RecordingCatalog, Transcoder,
};
use crate::fanout::Broadcaster;
use crate::session::{CoordinatorPolicy, FileSessionStore, SessionCoordinator, SessionStore};
use crate::storage::{BlobStore, FsBlobStore};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Pluggable backends behind the core components.
pub struct Components {
    pub session_store: Arc<dyn SessionStore>,
    pub job_store: Arc<dyn JobStore>,
    pub recordings: Arc<dyn RecordingCatalog>,
    pub blobs: Arc<dyn BlobStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub clock: Arc<dyn Clock>,
}

impl Components {
    /// File-backed stores and the ffmpeg transcoder, as configured.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let job_store = FileJobStore::open(&config.conversion.job_store_path).await?;
        Ok(Self {
            session_store: Arc::new(FileSessionStore::new(&config.broadcast.session_store_path)),
            job_store: Arc::new(job_store),
            recordings: Arc::new(InMemoryRecordingCatalog::new()),
            blobs: Arc::new(FsBlobStore::new(
                &config.storage.root_dir,
                &config.storage.public_base_url,
                &config.storage.signing_secret,
            )),
            transcoder: Arc::new(FfmpegTranscoder::new(&config.conversion)),
            clock: Arc::new(SystemClock),
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed for the life of the process
    pub config: Arc<AppConfig>,

    /// Request counters, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,

    pub jwt: Arc<JwtService>,
    pub broadcaster: Broadcaster,
    pub coordinator: Arc<SessionCoordinator>,
    pub conversions: Arc<ConversionManager>,
    pub recordings: Arc<dyn RecordingCatalog>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Wire the components together. The returned receiver feeds the
    /// conversion worker, which the caller spawns.
    pub fn new(config: AppConfig, components: Components) -> Result<(Self, JobReceiver)> {
        let broadcaster = Broadcaster::new(config.listeners.channel_buffer);

        let coordinator = SessionCoordinator::new(
            components.session_store,
            broadcaster.clone(),
            components.clock.clone(),
            CoordinatorPolicy {
                stream_url: config.broadcast.stream_url.clone(),
                reclaim_grace: config.broadcast.reclaim_grace()?,
            },
        );

        let (queue, receiver) = job_queue();
        let conversions = ConversionManager::new(
            components.job_store,
            components.recordings.clone(),
            components.blobs.clone(),
            components.transcoder,
            components.clock,
            queue,
            PipelineSettings {
                scratch_dir: config.conversion.scratch_dir.clone(),
                backoff_base: config.conversion.backoff_base(),
            },
        );

        let state = Self {
            jwt: Arc::new(JwtService::new(&config.auth)),
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            broadcaster,
            coordinator: Arc::new(coordinator),
            conversions: Arc::new(conversions),
            recordings: components.recordings,
            blobs: components.blobs,
        };
        Ok((state, receiver))
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn increment_request_count(&self) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.request_count += 1;
        }
    }

    pub fn increment_error_count(&self) {
        if let Ok(mut metrics) = self.metrics.write() {
            metrics.error_count += 1;
        }
    }

    /// Record one finished request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let Ok(mut metrics) = self.metrics.write() else {
            return;
        };
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the counters, so no lock is held while rendering a response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

//! # Conversion Pipeline
//!
//! Background transcoding of uploads that browsers cannot play. Uploads are
//! never blocked on it: the trigger returns a job id and the recording's
//! mirrored status tracks progress.

pub mod job;
pub mod manager;
pub mod queue;
pub mod store;
pub mod transcoder;

pub use job::{needs_conversion, ConversionJob, JobStatus, MAX_ATTEMPTS};
pub use manager::{ConversionError, ConversionManager, ConversionRequest, PipelineSettings};
pub use queue::{job_queue, JobQueue, JobReceiver, RetryTimer, TokioRetryTimer};
pub use store::{
    ConversionStatus, FileJobStore, InMemoryJobStore, InMemoryRecordingCatalog, JobStore,
    RecordingCatalog, RecordingRecord,
};
pub use transcoder::{FfmpegTranscoder, TranscodeError, TranscodeOutput, Transcoder};

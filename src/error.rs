//! Error type definitions for the download engine.
//!
//! Mirrors the error taxonomy of the core design: one top-level error per
//! subsystem boundary, each with `thiserror` messages and a handful of
//! convenience constructors for the call sites that build them most often.

use thiserror::Error;

/// Top-level engine error. Job tasks convert subsystem errors into this at
/// their boundary; it never crosses between jobs.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("helper error: {0}")]
    Helper(#[from] HelperError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Manifest parser errors. Best-effort parsing only escalates to these on
/// the two cases the spec treats as fatal; everything else is absorbed and
/// logged (malformed numeric attributes default to zero, unknown tags are
/// ignored).
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("invalid manifest: {reason}")]
    Invalid { reason: String },

    #[error("DASH template produced zero segment URIs")]
    UnresolvableSegments,
}

impl ManifestError {
    pub fn invalid<S: Into<String>>(reason: S) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Scheduler / job-execution errors. These are the terminal causes surfaced
/// through `DOWNLOAD_ERROR`, except `Aborted` which is reported as a
/// terminal `cancelled` progress event rather than an error event.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("stream is DRM-protected, refusing download")]
    DrmRefused,

    #[error("segment {index} fetch failed after retries: {cause}")]
    SegmentFetchFailed { index: usize, cause: String },

    #[error("download cancelled")]
    Aborted,

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("{0}")]
    Encoder(#[from] EncoderError),

    #[error("{0}")]
    Helper(#[from] HelperError),

    #[error("disk write failed: {0}")]
    DiskWrite(String),

    #[error("job {0} not found")]
    JobNotFound(uuid::Uuid),
}

/// Native-messaging transport errors. Never fatal to the transport itself;
/// the codec logs these and keeps reading frames.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("frame exceeded maximum size of {limit} bytes (was {actual})")]
    FrameTooLarge { limit: usize, actual: usize },

    #[error("malformed JSON in frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("underlying stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encoder (mux) adapter errors.
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("no usable encoder binary found")]
    NotFound,

    #[error("encoder exited with status {status}: {stderr_tail}")]
    MergeFailed { status: i32, stderr_tail: String },

    #[error("io error running encoder: {0}")]
    Io(#[from] std::io::Error),
}

/// External-helper (`ytdlp`) adapter errors.
#[derive(Error, Debug)]
pub enum HelperError {
    #[error("no helper binary configured")]
    NotConfigured,

    #[error("helper exited with status {0}")]
    ExitCode(i32),

    #[error("helper cancelled")]
    Aborted,

    #[error("io error running helper: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

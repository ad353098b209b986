//! Bounded-concurrency download scheduler (spec §4.3, §5).

pub mod execute;
pub mod job_table;
pub mod sanitize;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::encoder::Encoder;
use crate::error::{EngineError, SchedulerError};
use crate::helper::HelperAdapter;
use crate::http::cache::ManifestCache;
use crate::http::fetcher::Fetcher;
use crate::model::{AudioTrack, DetectedStream, DownloadJob, DownloadStatus, Protection, StreamType, VideoQuality};

use self::execute::ExecutionContext;
use self::job_table::JobTable;

pub use self::job_table::{EventReceiver, JobEvent};

/// Tracks cancellation tokens for jobs that haven't reached a terminal
/// state yet, and pending jobs waiting on the concurrency semaphore.
#[derive(Default)]
struct JobHandles {
    tokens: HashMap<Uuid, CancellationToken>,
    pending: std::collections::HashSet<Uuid>,
}

#[derive(Clone)]
pub struct Scheduler {
    jobs: JobTable,
    handles: Arc<Mutex<JobHandles>>,
    semaphore: Arc<Semaphore>,
    ctx: Arc<ExecutionContext>,
}

impl Scheduler {
    pub async fn new(config: &Config) -> Result<Self, EngineError> {
        let fetcher = Fetcher::new(&config.http);
        let manifest_cache = ManifestCache::new(config.http.manifest_cache_capacity);

        let encoder = match Encoder::discover(&config.encoder).await {
            Ok(encoder) => Some(encoder),
            Err(e) => {
                warn!(error = %e, "encoder unavailable, HLS fallback will be used and DASH merges will fail");
                None
            }
        };
        let helper = HelperAdapter::new(&config.helper).ok();

        tokio::fs::create_dir_all(&config.downloads.path).await?;

        Ok(Self {
            jobs: JobTable::new(),
            handles: Arc::new(Mutex::new(JobHandles::default())),
            semaphore: Arc::new(Semaphore::new(config.downloads.max_concurrent)),
            ctx: Arc::new(ExecutionContext {
                fetcher,
                manifest_cache,
                encoder,
                helper,
                download_path: config.downloads.path.clone(),
            }),
        })
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.jobs.subscribe()
    }

    pub fn encoder_available(&self) -> bool {
        self.ctx.encoder.is_some()
    }

    pub fn helper_available(&self) -> bool {
        self.ctx.helper.is_some()
    }

    /// spec §4.3 `startDownload`: allocates a job in `pending`, enqueues it,
    /// returns immediately. DRM-marked streams are refused before any fetch.
    pub async fn start_download(
        &self,
        stream: DetectedStream,
        quality: VideoQuality,
        audio: Option<AudioTrack>,
    ) -> Uuid {
        let job = DownloadJob::new(stream, quality, audio);
        let job_id = job.id;
        let is_drm = job.stream.protection == Protection::Drm;
        self.jobs.insert(job).await;

        if is_drm {
            warn!(job_id = %job_id, "refusing DRM-protected stream");
            self.jobs
                .mark_failed(job_id, SchedulerError::DrmRefused.to_string())
                .await;
            return job_id;
        }

        let token = CancellationToken::new();
        {
            let mut handles = self.handles.lock().await;
            handles.tokens.insert(job_id, token.clone());
            handles.pending.insert(job_id);
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_job(job_id, token).await;
        });

        job_id
    }

    /// spec §4.3 `cancelDownload`: idempotent; immediate if pending, observed
    /// at the next await point if running.
    pub async fn cancel_download(&self, job_id: Uuid) {
        let mut handles = self.handles.lock().await;
        if let Some(token) = handles.tokens.get(&job_id) {
            token.cancel();
        }
        if handles.pending.remove(&job_id) {
            drop(handles);
            self.jobs.mark_cancelled(job_id).await;
        }
    }

    /// spec §4.3 `getDownloads`: snapshot of all known jobs.
    pub async fn get_downloads(&self) -> Vec<DownloadJob> {
        self.jobs.snapshot().await
    }

    async fn run_job(&self, job_id: Uuid, token: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.handles.lock().await.pending.remove(&job_id);
                self.jobs.mark_cancelled(job_id).await;
                return;
            }
            permit = self.semaphore.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            error!(job_id = %job_id, "semaphore closed unexpectedly");
            return;
        };

        {
            let mut handles = self.handles.lock().await;
            handles.pending.remove(&job_id);
        }

        if token.is_cancelled() {
            self.jobs.mark_cancelled(job_id).await;
            return;
        }

        let Some(job) = self.jobs.get(job_id).await else {
            return;
        };
        self.jobs
            .update_progress(job_id, job.progress.clone(), DownloadStatus::Downloading)
            .await;

        info!(job_id = %job_id, stream_type = ?job.stream.stream_type, "job started");

        let result = match job.stream.stream_type {
            StreamType::Hls => execute::run_hls(&self.ctx, &self.jobs, &job, &token).await,
            StreamType::Dash => execute::run_dash(&self.ctx, &self.jobs, &job, &token).await,
            StreamType::Direct => execute::run_direct(&self.ctx, &self.jobs, &job, &token).await,
            StreamType::Ytdlp => execute::run_ytdlp(&self.ctx, &self.jobs, &job, job.audio.as_ref(), &token).await,
            StreamType::Unknown => Err(crate::error::ManifestError::invalid("unknown stream type").into()),
        };

        self.handles.lock().await.tokens.remove(&job_id);

        match result {
            Ok(output_path) => {
                info!(job_id = %job_id, output_path, "job completed");
                self.jobs.mark_completed(job_id, output_path).await;
            }
            Err(SchedulerError::Aborted) => {
                info!(job_id = %job_id, "job cancelled");
                self.jobs.mark_cancelled(job_id).await;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job failed");
                self.jobs.mark_failed(job_id, e.to_string()).await;
            }
        }
    }

    /// Cancels every in-flight job's token. Used for graceful shutdown.
    pub async fn cancel_all(&self) {
        let handles = self.handles.lock().await;
        for token in handles.tokens.values() {
            token.cancel();
        }
    }
}

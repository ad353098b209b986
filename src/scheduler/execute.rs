//! Per-type job execution (spec §4.3 "Execution per type").

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::encoder::{raw_concatenate, Encoder};
use crate::error::SchedulerError;
use crate::helper::{HelperAdapter, HelperEvent};
use crate::http::cache::ManifestCache;
use crate::http::fetcher::Fetcher;
use crate::manifest::{dash, hls};
use crate::model::{AudioTrack, DownloadJob, DownloadProgress, DownloadStatus};

use super::job_table::JobTable;
use super::sanitize::sanitize_title;

pub struct ExecutionContext {
    pub fetcher: Fetcher,
    pub manifest_cache: ManifestCache,
    pub encoder: Option<Encoder>,
    pub helper: Option<HelperAdapter>,
    pub download_path: PathBuf,
}

async fn fetch_manifest(ctx: &ExecutionContext, url: &str) -> Result<String, SchedulerError> {
    if let Some(cached) = ctx.manifest_cache.get(url) {
        return Ok(cached);
    }
    let cancel = CancellationToken::new();
    let bytes = ctx.fetcher.fetch_bytes(url, None, &cancel).await?;
    let body = String::from_utf8_lossy(&bytes).into_owned();
    ctx.manifest_cache.put(url.to_string(), body.clone());
    Ok(body)
}

fn scratch_dir(download_path: &Path, job_id: Uuid) -> PathBuf {
    download_path.join(format!(".scratch-{job_id}"))
}

struct ProgressAccumulator {
    started: Instant,
    downloaded_bytes: u64,
    average_segment_bytes: f64,
    total_segments: usize,
}

impl ProgressAccumulator {
    fn new(total_segments: usize) -> Self {
        Self {
            started: Instant::now(),
            downloaded_bytes: 0,
            average_segment_bytes: 0.0,
            total_segments,
        }
    }

    fn record_segment(&mut self, index: usize, segment_len: usize) -> DownloadProgress {
        self.downloaded_bytes += segment_len as u64;
        let completed = (index + 1) as f64;
        self.average_segment_bytes = self.downloaded_bytes as f64 / completed;
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let speed = self.downloaded_bytes as f64 / elapsed;
        let total_bytes = (self.average_segment_bytes * self.total_segments as f64) as u64;
        let remaining_segments = self.total_segments.saturating_sub(index + 1) as f64;
        let eta_seconds = if speed > 0.0 {
            Some((remaining_segments * self.average_segment_bytes / speed) as u64)
        } else {
            None
        };
        let percentage = 100.0 * completed / self.total_segments.max(1) as f64;

        DownloadProgress {
            downloaded_bytes: self.downloaded_bytes,
            total_bytes,
            speed_bytes_per_sec: speed,
            eta_seconds,
            percentage,
            current_segment: Some(index + 1),
            total_segments: Some(self.total_segments),
        }
        .normalize()
    }
}

async fn fetch_segments_in_order(
    ctx: &ExecutionContext,
    job_id: Uuid,
    segment_urls: &[String],
    scratch: &Path,
    extension: &str,
    cancel: &CancellationToken,
    jobs: &JobTable,
) -> Result<Vec<PathBuf>, SchedulerError> {
    tokio::fs::create_dir_all(scratch)
        .await
        .map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;

    let mut paths = Vec::with_capacity(segment_urls.len());
    let mut accumulator = ProgressAccumulator::new(segment_urls.len());

    for (index, url) in segment_urls.iter().enumerate() {
        if cancel.is_cancelled() {
            cleanup_scratch(scratch, &paths).await;
            return Err(SchedulerError::Aborted);
        }

        let bytes = match ctx.fetcher.fetch_bytes(url, Some(index), cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                cleanup_scratch(scratch, &paths).await;
                return Err(e);
            }
        };

        let path = scratch.join(format!("segment-{index:05}.{extension}"));
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            cleanup_scratch(scratch, &paths).await;
            return Err(SchedulerError::DiskWrite(e.to_string()));
        }

        let progress = accumulator.record_segment(index, bytes.len());
        jobs.update_progress(job_id, progress, DownloadStatus::Downloading).await;
        paths.push(path);
    }

    Ok(paths)
}

async fn cleanup_scratch(scratch: &Path, written: &[PathBuf]) {
    for path in written {
        let _ = tokio::fs::remove_file(path).await;
    }
    let _ = tokio::fs::remove_dir_all(scratch).await;
}

async fn merge_or_fallback(
    ctx: &ExecutionContext,
    segments: &[PathBuf],
    output: &Path,
    allow_raw_fallback: bool,
) -> Result<(), SchedulerError> {
    if let Some(encoder) = &ctx.encoder {
        encoder.merge(segments, output).await?;
        return Ok(());
    }
    if allow_raw_fallback {
        warn!("no encoder configured, falling back to raw segment concatenation");
        raw_concatenate(segments, output)
            .await
            .map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;
        return Ok(());
    }
    Err(SchedulerError::Encoder(crate::error::EncoderError::NotFound))
}

pub async fn run_hls(
    ctx: &ExecutionContext,
    jobs: &JobTable,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> Result<String, SchedulerError> {
    let master_body = fetch_manifest(ctx, &job.stream.url).await?;
    let master = hls::parse(&master_body, &job.stream.url)?;

    let media_url = match &master {
        hls::HlsPlaylist::Master { variants, .. } => {
            let requested_height = job.quality.height;
            let chosen = variants
                .iter()
                .find(|v| v.resolution.map(|(_, h)| h) == requested_height)
                .or_else(|| variants.first())
                .ok_or_else(|| crate::error::ManifestError::invalid("no variants in master playlist"))?;
            chosen.url.clone()
        }
        hls::HlsPlaylist::Media { .. } => job.stream.url.clone(),
    };

    let media_body = fetch_manifest(ctx, &media_url).await?;
    let media = hls::parse(&media_body, &media_url)?;
    let hls::HlsPlaylist::Media { segments, .. } = media else {
        return Err(crate::error::ManifestError::invalid("expected media playlist").into());
    };

    let scratch = scratch_dir(&ctx.download_path, job.id);
    let segment_urls: Vec<String> = segments.iter().map(|s| s.uri.clone()).collect();
    let paths = fetch_segments_in_order(ctx, job.id, &segment_urls, &scratch, "ts", cancel, jobs).await?;

    jobs.update_progress(job.id, job.progress.clone(), DownloadStatus::Merging).await;

    let title = job.stream.page_title.as_deref().unwrap_or("download");
    let sanitized = sanitize_title(title);
    let extension = if ctx.encoder.is_some() { "mp4" } else { "ts" };
    let output = ctx.download_path.join(format!("{sanitized}.{extension}"));

    merge_or_fallback(ctx, &paths, &output, true).await?;
    cleanup_scratch(&scratch, &[]).await;

    Ok(output.to_string_lossy().into_owned())
}

pub async fn run_dash(
    ctx: &ExecutionContext,
    jobs: &JobTable,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> Result<String, SchedulerError> {
    let body = fetch_manifest(ctx, &job.stream.url).await?;
    let manifest = dash::parse(&body, &job.stream.url)?;

    let video_reps = dash::video_representations(&manifest);
    let requested_height = job.quality.height.map(|h| h as u64);
    let chosen = video_reps
        .iter()
        .find(|r| r.height == requested_height)
        .or_else(|| video_reps.first())
        .ok_or_else(|| crate::error::ManifestError::invalid("no video representations in MPD"))?;

    if chosen.segment_uris.is_empty() {
        return Err(crate::error::ManifestError::UnresolvableSegments.into());
    }

    let scratch = scratch_dir(&ctx.download_path, job.id);
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;

    let mut all_paths = Vec::new();
    if let Some(init_url) = &chosen.initialization_uri {
        let bytes = match ctx.fetcher.fetch_bytes(init_url, Some(0), cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                cleanup_scratch(&scratch, &all_paths).await;
                return Err(e);
            }
        };
        let init_path = scratch.join("init.mp4");
        if let Err(e) = tokio::fs::write(&init_path, &bytes).await {
            cleanup_scratch(&scratch, &all_paths).await;
            return Err(SchedulerError::DiskWrite(e.to_string()));
        }
        all_paths.push(init_path);
    }

    let segment_paths =
        match fetch_segments_in_order(ctx, job.id, &chosen.segment_uris, &scratch, "m4s", cancel, jobs).await {
            Ok(paths) => paths,
            Err(e) => {
                // fetch_segments_in_order already cleaned up everything it wrote
                // itself; the init segment (if any) is still sitting in scratch.
                cleanup_scratch(&scratch, &all_paths).await;
                return Err(e);
            }
        };
    all_paths.extend(segment_paths);

    jobs.update_progress(job.id, job.progress.clone(), DownloadStatus::Merging).await;

    let title = job.stream.page_title.as_deref().unwrap_or("download");
    let output = ctx.download_path.join(format!("{}.mp4", sanitize_title(title)));

    merge_or_fallback(ctx, &all_paths, &output, false).await?;
    cleanup_scratch(&scratch, &[]).await;

    Ok(output.to_string_lossy().into_owned())
}

pub async fn run_direct(
    ctx: &ExecutionContext,
    jobs: &JobTable,
    job: &DownloadJob,
    cancel: &CancellationToken,
) -> Result<String, SchedulerError> {
    let title = job.stream.page_title.as_deref().unwrap_or("download");
    let output = ctx.download_path.join(format!("{}.mp4", sanitize_title(title)));
    let job_id = job.id;

    // A single forwarder task applies updates in the order the callback
    // emitted them; the channel's FIFO ordering is what keeps progress
    // monotonic, not the (inherently unordered) `tokio::spawn` per update.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DownloadProgress>();
    let jobs_for_progress = jobs.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            jobs_for_progress.update_progress(job_id, progress, DownloadStatus::Downloading).await;
        }
    });

    let result = ctx
        .fetcher
        .stream_to_file(&job.stream.url, &output, cancel, move |downloaded, total| {
            let percentage = if total > 0 {
                100.0 * downloaded as f64 / total as f64
            } else {
                0.0
            };
            let progress = DownloadProgress {
                downloaded_bytes: downloaded,
                total_bytes: total,
                speed_bytes_per_sec: 0.0,
                eta_seconds: None,
                percentage,
                current_segment: None,
                total_segments: None,
            }
            .normalize();
            let _ = tx.send(progress);
        })
        .await;
    let _ = forwarder.await;
    result?;

    Ok(output.to_string_lossy().into_owned())
}

pub async fn run_ytdlp(
    ctx: &ExecutionContext,
    jobs: &JobTable,
    job: &DownloadJob,
    audio: Option<&AudioTrack>,
    cancel: &CancellationToken,
) -> Result<String, SchedulerError> {
    let _ = audio;
    let helper = ctx.helper.as_ref().ok_or(crate::error::HelperError::NotConfigured)?;
    let title = job.stream.page_title.as_deref().unwrap_or("download");
    let template = ctx
        .download_path
        .join(format!("{}.%(ext)s", sanitize_title(title)))
        .to_string_lossy()
        .into_owned();

    let job_id = job.id;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DownloadProgress>();
    let jobs_for_progress = jobs.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            jobs_for_progress.update_progress(job_id, progress, DownloadStatus::Downloading).await;
        }
    });

    let mut output_path = None;
    let run_result = helper
        .run(&job.stream.url, &template, job.quality.height, cancel, |event| match event {
            HelperEvent::Progress(progress) => {
                let _ = tx.send(progress);
            }
            HelperEvent::OutputPath(path) => {
                output_path = Some(path);
            }
        })
        .await;
    let _ = forwarder.await;

    match run_result {
        Ok(()) => {}
        Err(crate::error::HelperError::Aborted) => return Err(SchedulerError::Aborted),
        Err(e) => return Err(e.into()),
    }

    let resolved = output_path.unwrap_or(template);
    info!(path = %resolved, "ytdlp helper reported output path");
    Ok(resolved)
}

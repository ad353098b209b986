//! Single-writer job table plus progress broadcast, mirroring the shape of
//! the ingestion state manager this scheduler is modelled on: one
//! `Arc<RwLock<HashMap>>` owned by the scheduler, readers see a coherent
//! snapshot, and every mutation also goes out on a broadcast channel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::model::{DownloadJob, DownloadProgress, DownloadStatus};

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: DownloadStatus,
    pub progress: DownloadProgress,
    /// Set only when `status` is `Completed`.
    pub output_path: Option<String>,
    /// Set only when `status` is `Failed`.
    pub error: Option<String>,
}

pub type EventSender = broadcast::Sender<JobEvent>;
pub type EventReceiver = broadcast::Receiver<JobEvent>;

#[derive(Clone)]
pub struct JobTable {
    jobs: Arc<RwLock<HashMap<Uuid, DownloadJob>>>,
    events_tx: EventSender,
}

impl JobTable {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events_tx.subscribe()
    }

    pub async fn insert(&self, job: DownloadJob) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job);
    }

    pub async fn get(&self, id: Uuid) -> Option<DownloadJob> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<DownloadJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Applies a progress update and fans it out. Never re-emits past a
    /// terminal status (spec §4.3's "never re-emits a terminal state").
    pub async fn update_progress(&self, id: Uuid, progress: DownloadProgress, status: DownloadStatus) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else { return };
        if job.is_terminal() {
            return;
        }
        job.progress = progress.clone();
        job.status = status;
        if job.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        let _ = self.events_tx.send(JobEvent {
            job_id: id,
            status,
            progress,
            output_path: None,
            error: None,
        });
    }

    pub async fn mark_failed(&self, id: Uuid, error: String) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else { return };
        if job.is_terminal() {
            return;
        }
        job.status = DownloadStatus::Failed;
        job.error = Some(error.clone());
        job.completed_at = Some(Utc::now());
        let _ = self.events_tx.send(JobEvent {
            job_id: id,
            status: DownloadStatus::Failed,
            progress: job.progress.clone(),
            output_path: None,
            error: Some(error),
        });
    }

    pub async fn mark_completed(&self, id: Uuid, output_path: String) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else { return };
        if job.is_terminal() {
            return;
        }
        job.status = DownloadStatus::Completed;
        job.output_path = Some(output_path.clone());
        job.progress.percentage = 100.0;
        job.completed_at = Some(Utc::now());
        let _ = self.events_tx.send(JobEvent {
            job_id: id,
            status: DownloadStatus::Completed,
            progress: job.progress.clone(),
            output_path: Some(output_path),
            error: None,
        });
    }

    /// Idempotent: returns `true` only the first time a job transitions to
    /// `cancelled` (spec §8 "Idempotence").
    pub async fn mark_cancelled(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else { return false };
        if job.is_terminal() {
            return false;
        }
        job.status = DownloadStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        let _ = self.events_tx.send(JobEvent {
            job_id: id,
            status: DownloadStatus::Cancelled,
            progress: job.progress.clone(),
            output_path: None,
            error: None,
        });
        true
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DetectedStream, DownloadJob, Protection, StreamType, VideoQuality};

    fn sample_job() -> DownloadJob {
        let stream = DetectedStream {
            id: Uuid::new_v4(),
            url: "https://cdn.example.com/master.m3u8".to_string(),
            stream_type: StreamType::Hls,
            protection: Protection::None,
            qualities: vec![],
            audio_tracks: vec![],
            title: None,
            duration: None,
            thumbnail: None,
            page_url: "https://example.com".to_string(),
            page_title: None,
            detected_at: Utc::now(),
        };
        DownloadJob::new(stream, VideoQuality::new(None, Some(1080), Some(5_000_000), None), None)
    }

    #[tokio::test]
    async fn mark_cancelled_is_idempotent() {
        let table = JobTable::new();
        let job = sample_job();
        let id = job.id;
        table.insert(job).await;

        assert!(table.mark_cancelled(id).await);
        assert!(!table.mark_cancelled(id).await);
        assert_eq!(table.get(id).await.unwrap().status, DownloadStatus::Cancelled);
    }

    #[tokio::test]
    async fn no_events_after_terminal_state() {
        let table = JobTable::new();
        let job = sample_job();
        let id = job.id;
        table.insert(job).await;
        let mut rx = table.subscribe();

        table.mark_completed(id, "out.mp4".to_string()).await;
        table.mark_failed(id, "ignored".to_string()).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, DownloadStatus::Completed);
        assert_eq!(table.get(id).await.unwrap().status, DownloadStatus::Completed);
    }
}

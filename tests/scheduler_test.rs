//! End-to-end scheduler behaviour: DRM refusal, bounded concurrency, and
//! cancellation, exercised against the real `Scheduler` with a throwaway
//! local HTTP server standing in for a CDN.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use streamgrab_core::config::Config;
use streamgrab_core::model::{DetectedStream, DownloadStatus, Protection, StreamType, VideoQuality};
use streamgrab_core::Scheduler;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Minimal HTTP/1.0 server that ignores the request and streams back
/// `body` after `delay`. Good enough to stand in for a slow CDN.
async fn spawn_slow_server(body: &'static [u8], delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{addr}/video.mp4")
}

fn test_config(download_path: PathBuf, max_concurrent: usize) -> Config {
    let mut config = Config::default();
    config.downloads.path = download_path;
    config.downloads.max_concurrent = max_concurrent;
    config
}

fn direct_stream(url: String) -> DetectedStream {
    DetectedStream {
        id: Uuid::new_v4(),
        url,
        stream_type: StreamType::Direct,
        protection: Protection::None,
        qualities: vec![],
        audio_tracks: vec![],
        title: None,
        duration: None,
        thumbnail: None,
        page_url: "https://example.com/watch".to_string(),
        page_title: Some("test clip".to_string()),
        detected_at: Utc::now(),
    }
}

#[tokio::test]
async fn drm_protected_stream_is_refused_without_fetching() {
    let dir = std::env::temp_dir().join(format!("streamgrab-test-{}", Uuid::new_v4()));
    let config = test_config(dir, 2);
    let scheduler = Scheduler::new(&config).await.unwrap();

    let mut stream = direct_stream("http://127.0.0.1:1/unreachable".to_string());
    stream.protection = Protection::Drm;
    let quality = VideoQuality::new(None, Some(1080), None, None);

    let job_id = scheduler.start_download(stream, quality, None).await;

    let job = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let downloads = scheduler.get_downloads().await;
            if let Some(job) = downloads.into_iter().find(|j| j.id == job_id) {
                if job.status == DownloadStatus::Failed {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job should fail immediately without ever dialing out");

    assert_eq!(job.status, DownloadStatus::Failed);
    assert!(job.error.unwrap().to_lowercase().contains("drm"));
}

#[tokio::test]
async fn at_most_max_concurrent_jobs_download_simultaneously() {
    let dir = std::env::temp_dir().join(format!("streamgrab-test-{}", Uuid::new_v4()));
    let config = test_config(dir, 2);
    let scheduler = Scheduler::new(&config).await.unwrap();

    let url = spawn_slow_server(b"pretend-video-bytes", Duration::from_millis(300)).await;

    let mut events = scheduler.subscribe();
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let concurrent_watch = concurrent.clone();
    let max_seen_watch = max_seen.clone();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event.status == DownloadStatus::Downloading {
                        let now = concurrent_watch.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen_watch.fetch_max(now, Ordering::SeqCst);
                    }
                }
                Err(_) => break,
            }
        }
    });

    let quality = VideoQuality::new(None, Some(1080), None, None);
    for _ in 0..3 {
        scheduler
            .start_download(direct_stream(url.clone()), quality.clone(), None)
            .await;
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let downloads = scheduler.get_downloads().await;
            if downloads.len() == 3 && downloads.iter().all(|j| j.is_terminal()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("all three jobs should finish");

    watcher.abort();
    assert!(max_seen.load(Ordering::SeqCst) <= 2, "never more than max_concurrent jobs downloading at once");
}

#[tokio::test]
async fn cancelling_a_pending_job_marks_it_cancelled_without_downloading() {
    let dir = std::env::temp_dir().join(format!("streamgrab-test-{}", Uuid::new_v4()));
    let config = test_config(dir, 1);
    let scheduler = Scheduler::new(&config).await.unwrap();

    let url = spawn_slow_server(b"pretend-video-bytes", Duration::from_millis(500)).await;
    let quality = VideoQuality::new(None, Some(1080), None, None);

    // Occupies the single concurrency slot.
    let _busy_job = scheduler.start_download(direct_stream(url.clone()), quality.clone(), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pending_job = scheduler.start_download(direct_stream(url), quality, None).await;
    scheduler.cancel_download(pending_job).await;

    let job = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let downloads = scheduler.get_downloads().await;
            if let Some(job) = downloads.into_iter().find(|j| j.id == pending_job) {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cancelled pending job should reach a terminal state");

    assert_eq!(job.status, DownloadStatus::Cancelled);
}

use anyhow::Result;
use clap::Parser;
use chrono::Utc;
use tokio::io::{stdin, stdout};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgrab_core::config::Config;
use streamgrab_core::model::{DownloadStatus, Message};
use streamgrab_core::scheduler::Scheduler;
use streamgrab_core::transport::{FrameReader, FrameWriter};

#[derive(Parser)]
#[command(name = "streamgrab-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Native-messaging download host for a browser-assisted stream grabber")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Directory downloads are written to (overrides config file)
    #[arg(long)]
    download_path: Option<String>,

    /// Maximum number of concurrent downloads (overrides config file)
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("streamgrab_core={},streamgrab_host={}", cli.log_level, cli.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("starting streamgrab-host v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    if let Some(path) = cli.download_path {
        config.downloads.path = path.into();
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.downloads.max_concurrent = max_concurrent;
    }

    let scheduler = Scheduler::new(&config).await?;
    let max_frame_bytes = config.transport.max_frame_bytes;

    let mut writer = FrameWriter::new(stdout());
    writer
        .send(&Message::AppStatus {
            timestamp: Utc::now().timestamp_millis(),
            connected: true,
            encoder_available: scheduler.encoder_available(),
            helper_available: scheduler.helper_available(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await
        .ok();

    let events_scheduler = scheduler.clone();
    let mut events = events_scheduler.subscribe();
    let event_writer = std::sync::Arc::new(tokio::sync::Mutex::new(writer));
    let event_writer_task = event_writer.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let timestamp = Utc::now().timestamp_millis();
                    // spec §4.3: the final event for a successful job is
                    // DOWNLOAD_COMPLETE, for a failed one DOWNLOAD_ERROR;
                    // every other transition (including cancellation) rides
                    // on DOWNLOAD_PROGRESS.
                    let message = match event.status {
                        DownloadStatus::Completed => Message::DownloadComplete {
                            timestamp,
                            job_id: event.job_id,
                            output_path: event.output_path.unwrap_or_default(),
                        },
                        DownloadStatus::Failed => {
                            let error = event.error.unwrap_or_default();
                            error!(job_id = %event.job_id, error, "job failed");
                            Message::DownloadError {
                                timestamp,
                                job_id: event.job_id,
                                error,
                            }
                        }
                        _ => Message::DownloadProgress {
                            timestamp,
                            job_id: event.job_id,
                            progress: event.progress,
                            status: event.status,
                        },
                    };
                    if let Err(e) = event_writer_task.lock().await.send(&message).await {
                        warn!(error = %e, "failed to write progress frame");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress event receiver lagged, events dropped");
                }
            }
        }
    });

    let mut reader = FrameReader::new(stdin(), max_frame_bytes);
    loop {
        let message = tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, cancelling in-flight jobs");
                scheduler.cancel_all().await;
                break;
            }
            message = reader.next_message() => message,
        };

        match message {
            Ok(Some(message)) => handle_message(&scheduler, &event_writer, message).await,
            Ok(None) => {
                info!("extension closed the pipe, shutting down");
                scheduler.cancel_all().await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "transport error, continuing");
            }
        }
    }

    Ok(())
}

async fn handle_message(
    scheduler: &Scheduler,
    writer: &std::sync::Arc<tokio::sync::Mutex<FrameWriter<tokio::io::Stdout>>>,
    message: Message,
) {
    match message {
        Message::Ping { timestamp } => {
            let reply = Message::Pong {
                timestamp,
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            if let Err(e) = writer.lock().await.send(&reply).await {
                warn!(error = %e, "failed to send pong");
            }
        }
        Message::DownloadRequest {
            stream, quality, audio, ..
        } => {
            let job_id = scheduler.start_download(stream, quality, audio).await;
            info!(job_id = %job_id, "download queued");
        }
        Message::DownloadCancel { job_id, .. } => {
            scheduler.cancel_download(job_id).await;
        }
        Message::GetDownloads { .. } => {
            let downloads = scheduler.get_downloads().await;
            let reply = Message::DownloadsList {
                timestamp: Utc::now().timestamp_millis(),
                downloads,
            };
            if let Err(e) = writer.lock().await.send(&reply).await {
                warn!(error = %e, "failed to send downloads list");
            }
        }
        other => {
            warn!(message = ?other, "no handler for this message type on the host side");
        }
    }
}

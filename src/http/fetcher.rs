//! Ranged/streamed GET with retry, backoff, and cooperative cancellation
//! (spec §4.3 "Retry and failure", §5).

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::HttpConfig;
use crate::error::{EngineError, SchedulerError};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;
const BACKOFF_FACTOR: u32 = 2;
const JITTER_FRACTION: f64 = 0.20;

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(config: &HttpConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("streamgrab-host/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetches `url` as bytes, retrying transport errors with exponential
    /// backoff plus jitter. `index` identifies the segment for error
    /// reporting; pass `None` for manifest fetches.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        index: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<bytes::Bytes, SchedulerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Aborted),
                r = self.try_fetch(url) => r,
            };

            match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) if attempt >= MAX_ATTEMPTS => {
                    return Err(SchedulerError::SegmentFetchFailed {
                        index: index.unwrap_or(0),
                        cause: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = backoff_duration(attempt);
                    warn!(
                        url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "fetch failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SchedulerError::Aborted),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn try_fetch(&self, url: &str) -> Result<bytes::Bytes, EngineError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        debug!(url, bytes = bytes.len(), "fetched");
        Ok(bytes)
    }

    /// Streams a direct download to disk, invoking `on_progress` after each
    /// chunk with `(downloaded, total)`; `total` is `0` when unknown.
    pub async fn stream_to_file(
        &self,
        url: &str,
        destination: &std::path::Path,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<(), SchedulerError> {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(EngineError::from)
            .map_err(|e| SchedulerError::SegmentFetchFailed {
                index: 0,
                cause: e.to_string(),
            })?;
        let total = response.content_length().unwrap_or(0);

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SchedulerError::Aborted),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| SchedulerError::SegmentFetchFailed {
                index: 0,
                cause: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }
        file.flush().await.map_err(|e| SchedulerError::DiskWrite(e.to_string()))?;
        Ok(())
    }
}

fn backoff_duration(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS * BACKOFF_FACTOR.pow(attempt - 1) as u64;
    let jitter_range = (base as f64 * JITTER_FRACTION) as i64;
    let jitter = fastrand::i64(-jitter_range..=jitter_range);
    Duration::from_millis((base as i64 + jitter).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter_bounds() {
        for attempt in 1..=3 {
            let base = BASE_BACKOFF_MS * BACKOFF_FACTOR.pow(attempt - 1) as u64;
            let d = backoff_duration(attempt);
            let lower = (base as f64 * (1.0 - JITTER_FRACTION)) as u64;
            let upper = (base as f64 * (1.0 + JITTER_FRACTION)) as u64;
            assert!(d.as_millis() as u64 >= lower && d.as_millis() as u64 <= upper);
        }
    }
}

//! Encoder (mux) adapter: binary discovery and concat-demuxer merge
//! invocation (spec §4.5).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::config::EncoderConfig;
use crate::error::EncoderError;

#[cfg(unix)]
const STANDARD_PREFIXES: &[&str] = &["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin"];
#[cfg(windows)]
const STANDARD_PREFIXES: &[&str] = &[r"C:\ffmpeg\bin"];

#[cfg(unix)]
const BINARY_NAME: &str = "ffmpeg";
#[cfg(windows)]
const BINARY_NAME: &str = "ffmpeg.exe";

#[derive(Clone)]
pub struct Encoder {
    binary: PathBuf,
}

impl Encoder {
    /// Probes, in order: the configured bundled path, standard install
    /// prefixes, then every entry on `PATH`. The first candidate whose
    /// `--version` exits successfully within the probe timeout wins.
    pub async fn discover(config: &EncoderConfig) -> Result<Self, EncoderError> {
        let timeout = Duration::from_secs(config.probe_timeout_secs);
        let mut candidates: Vec<PathBuf> = Vec::new();

        if let Some(bundled) = &config.binary_path {
            candidates.push(bundled.clone());
        }
        for prefix in STANDARD_PREFIXES {
            candidates.push(Path::new(prefix).join(BINARY_NAME));
        }
        if let Ok(path_var) = std::env::var("PATH") {
            for dir in std::env::split_paths(&path_var) {
                candidates.push(dir.join(BINARY_NAME));
            }
        }

        for candidate in candidates {
            if probe(&candidate, timeout).await {
                info!(binary = %candidate.display(), "encoder binary found");
                return Ok(Self { binary: candidate });
            }
        }

        warn!("no usable encoder binary found during discovery");
        Err(EncoderError::NotFound)
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary
    }

    /// Writes a concat-demuxer list file, invokes the encoder, and returns
    /// once the output file has been produced. The list file is removed
    /// regardless of outcome.
    pub async fn merge(&self, segments: &[PathBuf], output: &Path) -> Result<(), EncoderError> {
        let list_path = output.with_extension("concat.txt");
        let list_contents = segments
            .iter()
            .map(|p| format!("file '{}'", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        tokio::fs::write(&list_path, list_contents).await?;

        let result = self.run_merge(&list_path, output).await;
        let _ = tokio::fs::remove_file(&list_path).await;
        result
    }

    async fn run_merge(&self, list_path: &Path, output: &Path) -> Result<(), EncoderError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let child_output = Command::new(&self.binary)
            .args([
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                list_path.to_string_lossy().as_ref(),
                "-c",
                "copy",
                "-y",
                output.to_string_lossy().as_ref(),
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .output()
            .await?;

        if child_output.status.success() {
            info!(output = %output.display(), "merge completed");
            return Ok(());
        }

        let stderr_tail = tail(&child_output.stderr, 2048);
        Err(EncoderError::MergeFailed {
            status: child_output.status.code().unwrap_or(-1),
            stderr_tail,
        })
    }
}

async fn probe(binary: &Path, timeout: Duration) -> bool {
    let attempt = Command::new(binary)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

fn tail(bytes: &[u8], max_len: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_len {
        text.into_owned()
    } else {
        text[text.len() - max_len..].to_string()
    }
}

/// Concatenates segment files directly, for HLS transport-stream fallback
/// when no encoder is configured (spec §4.3).
pub async fn raw_concatenate(segments: &[PathBuf], output: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out_file = tokio::fs::File::create(output).await?;
    for segment in segments {
        let bytes = tokio::fs::read(segment).await?;
        out_file.write_all(&bytes).await?;
    }
    out_file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_truncates_from_the_end() {
        let long = "x".repeat(5000);
        let tailed = tail(long.as_bytes(), 2048);
        assert_eq!(tailed.len(), 2048);
    }
}

//! External-helper adapter: delegates `ytdlp`-type streams to a configured
//! extractor binary and translates its textual progress into the job
//! model (spec §4.6).

use std::process::Stdio;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HelperConfig;
use crate::error::HelperError;
use crate::model::DownloadProgress;

#[derive(Debug, Clone, PartialEq)]
pub enum HelperEvent {
    Progress(DownloadProgress),
    OutputPath(String),
}

pub struct HelperAdapter {
    binary: std::path::PathBuf,
}

impl HelperAdapter {
    pub fn new(config: &HelperConfig) -> Result<Self, HelperError> {
        let binary = config.binary_path.clone().ok_or(HelperError::NotConfigured)?;
        Ok(Self { binary })
    }

    /// Builds the selector argument for a requested height, per spec §6.
    pub fn format_selector(height: Option<u32>) -> String {
        match height {
            Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
            None => "bestvideo+bestaudio/best".to_string(),
        }
    }

    /// Runs the helper against `url`, invoking `on_event` for every parsed
    /// progress line or discovered output path, until the process exits.
    pub async fn run(
        &self,
        url: &str,
        output_template: &str,
        height: Option<u32>,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(HelperEvent),
    ) -> Result<(), HelperError> {
        let selector = Self::format_selector(height);
        let mut child = Command::new(&self.binary)
            .args([
                "-f",
                &selector,
                "--merge-output-format",
                "mp4",
                "-o",
                output_template,
                "--newline",
                "--no-warnings",
                url,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut reader = BufReader::new(stdout);
        let progress_re = progress_regex();

        let mut raw_line = Vec::new();
        loop {
            raw_line.clear();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut child);
                    return Err(HelperError::Aborted);
                }
                n = reader.read_until(b'\n', &mut raw_line) => n?,
            };
            if read == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&raw_line);
            let line = line.trim_end_matches(['\n', '\r']);
            debug!(line, "helper output");

            if let Some(progress) = parse_progress(&progress_re, line) {
                on_event(HelperEvent::Progress(progress));
            }
            if let Some(path) = parse_output_path(line) {
                on_event(HelperEvent::OutputPath(path));
            }
        }

        let status = child.wait().await?;
        if status.success() {
            info!("helper process completed");
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            warn!(code, "helper process exited non-zero");
            Err(HelperError::ExitCode(code))
        }
    }
}

fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output();
    }
}

fn progress_regex() -> Regex {
    Regex::new(r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?(\S+)\s+at\s+(\S+)/s\s+ETA\s+(\S+)").unwrap()
}

/// Parses a unit-suffixed size/speed token (`12.3MiB`, `500KB`) into bytes.
fn parse_sized_value(raw: &str) -> Option<f64> {
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" => 1000.0,
        "MB" => 1000.0 * 1000.0,
        "GB" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some(value * multiplier)
}

fn parse_eta_seconds(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.split(':').collect();
    match parts.as_slice() {
        [mm, ss] => Some(mm.parse::<u64>().ok()? * 60 + ss.parse::<u64>().ok()?),
        [hh, mm, ss] => {
            Some(hh.parse::<u64>().ok()? * 3600 + mm.parse::<u64>().ok()? * 60 + ss.parse::<u64>().ok()?)
        }
        _ => None,
    }
}

fn parse_progress(re: &Regex, line: &str) -> Option<DownloadProgress> {
    let caps = re.captures(line)?;
    let percentage: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total_bytes = caps.get(2).and_then(|m| parse_sized_value(m.as_str())).unwrap_or(0.0);
    let speed = caps.get(3).and_then(|m| parse_sized_value(m.as_str())).unwrap_or(0.0);
    let eta_seconds = caps.get(4).and_then(|m| parse_eta_seconds(m.as_str()));

    Some(
        DownloadProgress {
            downloaded_bytes: (total_bytes * percentage / 100.0) as u64,
            total_bytes: total_bytes as u64,
            speed_bytes_per_sec: speed,
            eta_seconds,
            percentage,
            current_segment: None,
            total_segments: None,
        }
        .normalize(),
    )
}

fn parse_output_path(line: &str) -> Option<String> {
    if let Some(rest) = line.strip_prefix("[Merger] Merging formats into \"") {
        return rest.strip_suffix('"').map(str::to_string);
    }
    if let Some(rest) = line.strip_prefix("[download] Destination: ") {
        return Some(rest.trim().to_string());
    }
    if let Some(rest) = line.strip_prefix("[download] ") {
        if let Some(path) = rest.strip_suffix(" has already been downloaded") {
            return Some(path.trim().to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_line_with_units() {
        let re = progress_regex();
        let line = "[download]  42.5% of ~123.4MiB at 2.1MiB/s ETA 01:23";
        let progress = parse_progress(&re, line).unwrap();
        assert_eq!(progress.percentage, 42.5);
        assert_eq!(progress.eta_seconds, Some(83));
        assert!(progress.total_bytes > 0);
    }

    #[test]
    fn parses_merger_output_path() {
        let line = r#"[Merger] Merging formats into "video.mp4""#;
        assert_eq!(parse_output_path(line), Some("video.mp4".to_string()));
    }

    #[test]
    fn parses_destination_output_path() {
        let line = "[download] Destination: video.f137.mp4";
        assert_eq!(parse_output_path(line), Some("video.f137.mp4".to_string()));
    }

    #[test]
    fn parses_already_downloaded_path() {
        let line = "[download] video.mp4 has already been downloaded";
        assert_eq!(parse_output_path(line), Some("video.mp4".to_string()));
    }

    #[test]
    fn format_selector_includes_height_cap() {
        assert_eq!(
            HelperAdapter::format_selector(Some(720)),
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
        assert_eq!(HelperAdapter::format_selector(None), "bestvideo+bestaudio/best");
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetch backend that drives the `yt-dlp` executable.
//!
//! Metadata comes from `--dump-single-json`. Progress comes from a custom
//! `--progress-template` that prints one machine-readable line per update.
//! The final path comes from `--print after_move:...`. The child is spawned
//! with `kill_on_drop`, so dropping the fetch future kills the process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{FetchBackend, FetchOutput, FetchRequest, FetchUpdate, HookAction, MediaInfo, ProgressHook};
use crate::error::FetchError;

/// Default executable name, resolved through `PATH`.
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";

/// Prefer formats under the default cap, fall back to the best available.
pub const DEFAULT_FORMAT: &str = "best[filesize<50M]/best";

const PROGRESS_TAG: &str = "vidrelay-progress|";
const FILE_TAG: &str = "vidrelay-file|";
const META_TAG: &str = "vidrelay-meta|";

const PROGRESS_TEMPLATE: &str = "download:vidrelay-progress|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s";
const FILE_PRINT: &str = "after_move:vidrelay-file|%(filepath)s";
const META_PRINT: &str = "after_move:vidrelay-meta|%(duration)s|%(title)s";

/// Lines of stderr kept for error classification.
const STDERR_TAIL: usize = 20;

/// Stderr fragments meaning "there is nothing to download here".
const NOT_FOUND_MARKERS: &[&str] = &[
    "unsupported url",
    "video unavailable",
    "http error 404",
    "http error 410",
    "no video formats",
    "requested format is not available",
    "is not a valid url",
    "private video",
    "has been removed",
    "unable to extract",
];

/// One classified line of yt-dlp output.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Progress(FetchUpdate),
    File(PathBuf),
    Meta {
        duration_secs: Option<f64>,
        title: Option<String>,
    },
    Other,
}

/// Subset of `--dump-single-json` the session cares about.
#[derive(Debug, Default, Deserialize)]
struct ProbeJson {
    title: Option<String>,
    duration: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl From<ProbeJson> for MediaInfo {
    fn from(json: ProbeJson) -> Self {
        let estimated_size = json
            .filesize
            .or(json.filesize_approx)
            .filter(|size| size.is_finite() && *size > 0.0)
            .map(|size| size as u64);

        MediaInfo {
            title: json.title,
            duration_secs: json.duration,
            estimated_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    bin: String,
    format: String,
    probe_timeout: Duration,
}

impl Default for YtDlpBackend {
    fn default() -> Self {
        Self::new(DEFAULT_YTDLP_BIN)
    }
}

impl YtDlpBackend {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            format: DEFAULT_FORMAT.to_string(),
            probe_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// `yt-dlp --version`, if the executable runs at all.
    pub async fn version(&self) -> Result<String, FetchError> {
        let output = Command::new(&self.bin)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.bin, e))?;

        if !output.status.success() {
            return Err(FetchError::Network(format!("{} --version exited with {}", self.bin, output.status)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn probe_args(&self, url: &str) -> Vec<String> {
        vec![
            "--dump-single-json".into(),
            "--skip-download".into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "-f".into(),
            self.format.clone(),
            "--".into(),
            url.to_string(),
        ]
    }

    fn fetch_args(&self, request: &FetchRequest) -> Vec<String> {
        let template = request.output_dir.join(&request.output_template);
        vec![
            "-f".into(),
            self.format.clone(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            "--no-playlist".into(),
            "--no-warnings".into(),
            "--restrict-filenames".into(),
            "--no-simulate".into(),
            "--newline".into(),
            "--progress".into(),
            "--progress-template".into(),
            PROGRESS_TEMPLATE.into(),
            "--print".into(),
            FILE_PRINT.into(),
            "--print".into(),
            META_PRINT.into(),
            "--".into(),
            request.url.clone(),
        ]
    }
}

#[async_trait]
impl FetchBackend for YtDlpBackend {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, FetchError> {
        let run = Command::new(&self.bin)
            .args(self.probe_args(url))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.probe_timeout, run).await {
            Ok(output) => output.map_err(|e| spawn_error(&self.bin, e))?,
            Err(_) => {
                tracing::warn!("metadata probe timed out after {}s", self.probe_timeout.as_secs());
                return Ok(MediaInfo::default());
            }
        };

        if !output.status.success() {
            return Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)));
        }

        let json: ProbeJson = serde_json::from_slice(&output.stdout)
            .map_err(|e| FetchError::NotFound(format!("unreadable metadata: {}", e)))?;
        Ok(json.into())
    }

    async fn fetch(&self, request: &FetchRequest, hook: ProgressHook) -> Result<FetchOutput, FetchError> {
        tracing::debug!(bin = %self.bin, dir = %request.output_dir.display(), "spawning yt-dlp");

        let mut child = Command::new(&self.bin)
            .args(self.fetch_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(&self.bin, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Storage("yt-dlp stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Storage("yt-dlp stderr unavailable".into()))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;

        let mut stderr_tail: Vec<String> = Vec::new();
        let mut artifact: Option<PathBuf> = None;
        let mut info = MediaInfo::default();

        while out_open || err_open {
            let (line, from_stderr) = tokio::select! {
                next = out_lines.next_line(), if out_open => match next {
                    Ok(Some(line)) => (line, false),
                    _ => { out_open = false; continue; }
                },
                next = err_lines.next_line(), if err_open => match next {
                    Ok(Some(line)) => (line, true),
                    _ => { err_open = false; continue; }
                },
            };

            match parse_output_line(&line) {
                OutputLine::Progress(update) => {
                    if hook(update) == HookAction::Abort {
                        tracing::debug!("progress hook aborted yt-dlp");
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(FetchError::Cancelled);
                    }
                }
                OutputLine::File(path) => artifact = Some(path),
                OutputLine::Meta { duration_secs, title } => {
                    info.duration_secs = duration_secs;
                    info.title = title;
                }
                OutputLine::Other if from_stderr => {
                    if stderr_tail.len() == STDERR_TAIL {
                        stderr_tail.remove(0);
                    }
                    stderr_tail.push(line);
                }
                OutputLine::Other => tracing::trace!("yt-dlp: {}", line),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Network(format!("yt-dlp did not exit cleanly: {}", e)))?;

        if !status.success() {
            return Err(classify_stderr(&stderr_tail.join("\n")));
        }

        let path = match artifact {
            Some(path) => path,
            None => find_artifact(&request.output_dir).ok_or_else(|| {
                FetchError::NotFound("yt-dlp finished without producing a file".into())
            })?,
        };

        Ok(FetchOutput { path, info })
    }
}

/// Classify one line of yt-dlp output.
pub fn parse_output_line(line: &str) -> OutputLine {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix(PROGRESS_TAG) {
        let fields: Vec<&str> = rest.split('|').collect();
        if fields.len() < 5 {
            return OutputLine::Other;
        }
        let downloaded = match parse_number(fields[0]) {
            Some(bytes) => bytes as u64,
            None => return OutputLine::Other,
        };
        let total = parse_number(fields[1]).or_else(|| parse_number(fields[2]));
        return OutputLine::Progress(FetchUpdate {
            downloaded_bytes: downloaded,
            total_bytes: total.map(|t| t as u64),
            speed_bytes_per_sec: parse_number(fields[3]),
            eta_seconds: parse_number(fields[4]).map(|e| e as u64),
        });
    }

    if let Some(path) = line.strip_prefix(FILE_TAG) {
        if path.is_empty() || path == "NA" {
            return OutputLine::Other;
        }
        return OutputLine::File(PathBuf::from(path));
    }

    if let Some(rest) = line.strip_prefix(META_TAG) {
        let (duration, title) = rest.split_once('|').unwrap_or((rest, ""));
        let title = match title.trim() {
            "" | "NA" => None,
            t => Some(t.to_string()),
        };
        return OutputLine::Meta {
            duration_secs: parse_number(duration),
            title,
        };
    }

    OutputLine::Other
}

/// yt-dlp prints `NA` (or `None`) for fields it does not know.
fn parse_number(field: &str) -> Option<f64> {
    match field.trim() {
        "" | "NA" | "None" | "null" => None,
        s => s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0),
    }
}

/// Map yt-dlp's stderr to a [`FetchError`].
pub fn classify_stderr(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return FetchError::NotFound(last_error_line(stderr));
    }
    FetchError::Network(last_error_line(stderr))
}

fn last_error_line(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .find(|l| l.contains("ERROR"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("yt-dlp failed without output")
        .trim();
    let line = line.strip_prefix("ERROR: ").unwrap_or(line);
    line.chars().take(200).collect()
}

fn spawn_error(bin: &str, err: std::io::Error) -> FetchError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FetchError::Network(format!("'{}' not found; install yt-dlp or set ytdlp_bin", bin))
    } else {
        FetchError::Network(format!("failed to run {}: {}", bin, err))
    }
}

/// Last resort when yt-dlp did not print the final path.
fn find_artifact(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            !matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("part" | "ytdl" | "temp" | "json")
            )
        })
        .max_by_key(|path| std::fs::metadata(path).map(|m| m.len()).unwrap_or(0))
}

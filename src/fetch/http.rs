// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Fetch backend for direct media links (`https://host/clip.mp4`).
//!
//! No site extraction: the URL must serve the media itself. Useful where
//! yt-dlp is not installed and for hosts that hand out plain file links.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use tokio::io::AsyncWriteExt;

use super::{FetchBackend, FetchOutput, FetchRequest, FetchUpdate, HookAction, MediaInfo, ProgressHook};
use crate::error::FetchError;

const CONNECT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_EXTENSION: &str = "mp4";

#[derive(Debug, Clone)]
pub struct DirectHttpBackend {
    client: Client,
}

impl Default for DirectHttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectHttpBackend {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("vidrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FetchBackend for DirectHttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn probe(&self, url: &str) -> Result<MediaInfo, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl)?;
        let response = self.client.head(parsed.clone()).send().await.map_err(map_reqwest_error)?;
        let estimated_size = if head_refused(response.status()) {
            tracing::debug!("HEAD refused with {}; no size estimate", response.status());
            None
        } else {
            check_status(response.status())?;
            header_length(response.headers())
        };
        Ok(MediaInfo {
            title: file_stem(&parsed),
            duration_secs: None,
            estimated_size,
        })
    }

    async fn fetch(&self, request: &FetchRequest, hook: ProgressHook) -> Result<FetchOutput, FetchError> {
        let url = Url::parse(&request.url).map_err(|_| FetchError::InvalidUrl)?;
        let response = self.client.get(url.clone()).send().await.map_err(map_reqwest_error)?;
        check_status(response.status())?;

        let total = header_length(response.headers());
        if let Some(total) = total {
            if total > request.max_file_size {
                return Err(FetchError::TooLarge {
                    size: total,
                    limit: request.max_file_size,
                });
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let path = request
            .output_dir
            .join(file_name_for(&url, content_type.as_deref()));

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| FetchError::Storage(format!("cannot create {}: {}", path.display(), e)))?;

        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Storage(format!("write to {} failed: {}", path.display(), e)))?;
            downloaded += chunk.len() as u64;

            if hook(progress_update(downloaded, total, started.elapsed())) == HookAction::Abort {
                return Err(FetchError::Cancelled);
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Storage(format!("flush of {} failed: {}", path.display(), e)))?;

        Ok(FetchOutput {
            path,
            info: MediaInfo {
                title: file_stem(&url),
                duration_secs: None,
                estimated_size: Some(downloaded),
            },
        })
    }
}

/// Average speed since the start, and the ETA it implies.
fn progress_update(downloaded: u64, total: Option<u64>, elapsed: Duration) -> FetchUpdate {
    let elapsed = elapsed.as_secs_f64();
    let speed = if elapsed > 0.0 {
        Some(downloaded as f64 / elapsed)
    } else {
        None
    };
    let eta = match (total, speed) {
        (Some(total), Some(speed)) if speed > 0.0 => {
            Some((total.saturating_sub(downloaded) as f64 / speed) as u64)
        }
        _ => None,
    };

    FetchUpdate {
        downloaded_bytes: downloaded,
        total_bytes: total,
        speed_bytes_per_sec: speed,
        eta_seconds: eta,
    }
}

/// Servers that do not implement HEAD; the GET still runs under the cap.
fn head_refused(status: StatusCode) -> bool {
    matches!(status, StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED)
}

fn check_status(status: StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::FORBIDDEN => {
            Err(FetchError::NotFound(format!("server answered HTTP {}", status)))
        }
        _ => Err(FetchError::Network(format!("server answered HTTP {}", status))),
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_connect() {
        FetchError::Network(format!("cannot connect: {}", err))
    } else if err.is_timeout() {
        FetchError::Network("request timed out".to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}

/// Content-Length, read from the header. HEAD responses have no body, so
/// `Response::content_length` cannot be trusted there.
fn header_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .filter(|len| *len > 0)
}

fn file_stem(url: &Url) -> Option<String> {
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let stem = last.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(last);
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Local file name for a download: the URL's last segment, sanitized,
/// with an extension guessed from the content type when it has none.
pub fn file_name_for(url: &Url, content_type: Option<&str>) -> String {
    let last = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("");

    let mut name: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .take(100)
        .collect();
    name = name.trim_start_matches('.').to_string();
    if name.is_empty() {
        name = "video".to_string();
    }

    let has_extension = name
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .unwrap_or(false);
    if !has_extension {
        name.push('.');
        name.push_str(extension_for(content_type));
    }
    name
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("video/webm") => "webm",
        Some("video/x-matroska") => "mkv",
        Some("video/quicktime") => "mov",
        Some("video/x-msvideo") => "avi",
        _ => DEFAULT_EXTENSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_file_name_keeps_url_name() {
        assert_eq!(file_name_for(&url("https://cdn.example/v/4942633.mp4"), None), "4942633.mp4");
        assert_eq!(file_name_for(&url("https://cdn.example/a%20b.webm?x=1"), None), "a_20b.webm");
    }

    #[test]
    fn test_file_name_guesses_extension() {
        assert_eq!(
            file_name_for(&url("https://cdn.example/stream"), Some("video/webm; codecs=vp9")),
            "stream.webm"
        );
        assert_eq!(file_name_for(&url("https://cdn.example/"), None), "video.mp4");
        assert_eq!(file_name_for(&url("https://cdn.example/.hidden"), Some("video/quicktime")), "hidden.mov");
    }

    #[test]
    fn test_progress_update_speed_and_eta() {
        let update = progress_update(1024 * 1024, Some(3 * 1024 * 1024), Duration::from_secs(2));
        assert_eq!(update.speed_bytes_per_sec, Some(524288.0));
        assert_eq!(update.eta_seconds, Some(4));

        let first = progress_update(10, None, Duration::ZERO);
        assert_eq!(first.speed_bytes_per_sec, None);
        assert_eq!(first.eta_seconds, None);
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(check_status(StatusCode::NOT_FOUND), Err(FetchError::NotFound(_))));
        assert!(matches!(check_status(StatusCode::BAD_GATEWAY), Err(FetchError::Network(_))));
    }

    #[test]
    fn test_refused_head_is_not_an_error() {
        assert!(head_refused(StatusCode::METHOD_NOT_ALLOWED));
        assert!(head_refused(StatusCode::NOT_IMPLEMENTED));
        assert!(!head_refused(StatusCode::NOT_FOUND));
        assert!(!head_refused(StatusCode::OK));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem(&url("https://cdn.example/v/clip.mp4")), Some("clip".into()));
        assert_eq!(file_stem(&url("https://cdn.example/")), None);
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Media fetch backends.
//!
//! A backend turns a URL into a file on disk and reports progress through a
//! hook while it works. Sessions own everything else: size policy, working
//! directories, state, and cleanup.
//!
//! Two implementations ship with the crate:
//!
//! - [`YtDlpBackend`] drives the `yt-dlp` executable and supports every site
//!   it does.
//! - [`DirectHttpBackend`] streams a direct media link with `reqwest`.

pub mod http;
pub mod ytdlp;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FetchError;

pub use http::DirectHttpBackend;
pub use ytdlp::YtDlpBackend;

/// One raw progress event from a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FetchUpdate {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
}

/// What the hook wants the backend to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// Stop transferring and return [`FetchError::Cancelled`].
    Abort,
}

/// Progress callback registered with a fetch.
///
/// Backends may call it from any thread, at whatever cadence they like.
pub type ProgressHook = Arc<dyn Fn(FetchUpdate) -> HookAction + Send + Sync>;

/// Metadata a backend can resolve, ideally without downloading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    /// Expected artifact size, if the backend can tell ahead of time
    pub estimated_size: Option<u64>,
}

/// Everything a backend needs to run one download.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Directory the artifact (and any temp files) must be written under
    pub output_dir: PathBuf,
    /// File name template, yt-dlp syntax
    pub output_template: String,
    /// Size cap the backend may enforce natively as well
    pub max_file_size: u64,
}

impl FetchRequest {
    pub const DEFAULT_TEMPLATE: &'static str = "%(title)s.%(ext)s";

    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            url: url.into(),
            output_dir: output_dir.into(),
            output_template: Self::DEFAULT_TEMPLATE.to_string(),
            max_file_size,
        }
    }
}

/// A completed fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub path: PathBuf,
    pub info: MediaInfo,
}

#[async_trait]
pub trait FetchBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Resolve metadata without downloading.
    ///
    /// Backends that cannot pre-resolve return an empty [`MediaInfo`]; the
    /// session then relies on mid-transfer enforcement of the size cap.
    async fn probe(&self, _url: &str) -> Result<MediaInfo, FetchError> {
        Ok(MediaInfo::default())
    }

    /// Download into `request.output_dir`, calling `hook` on progress.
    ///
    /// Must return [`FetchError::Cancelled`] promptly after the hook answers
    /// [`HookAction::Abort`]. Dropping the returned future must stop the
    /// transfer as well.
    async fn fetch(&self, request: &FetchRequest, hook: ProgressHook) -> Result<FetchOutput, FetchError>;
}

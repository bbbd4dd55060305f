// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for sessions and the registry, plus user-facing wording.
//!
//! Every variant here is recoverable: the transport turns it into a message
//! for the user and the process keeps serving other sessions.

use std::fmt;

use crate::format::format_size;
use crate::session::UserKey;

/// Where users are pointed when a report has no better advice.
pub const HELP_HINT: &str = "Run `vidrelay check <url>` to test a link before downloading.";

/// Why a download session did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The URL failed local validation; no network activity happened.
    InvalidUrl,
    /// The media exceeds the size cap, either by estimate or mid-transfer.
    TooLarge { size: u64, limit: u64 },
    /// The backend could not resolve a usable media stream.
    NotFound(String),
    /// Transient transport failure reported by the backend.
    Network(String),
    /// Explicitly cancelled or abandoned by the caller.
    Cancelled,
    /// Local filesystem failure around the session's working directory.
    Storage(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl => write!(f, "Invalid or unsupported URL"),
            Self::TooLarge { size, limit } => write!(
                f,
                "File too large: {} exceeds the {} limit",
                format_size(*size),
                format_size(*limit)
            ),
            Self::NotFound(msg) => write!(f, "Media not found: {}", msg),
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Cancelled => write!(f, "Download cancelled"),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    /// Short message suitable for sending back to the chat user.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidUrl => "❌ Invalid or unsupported link".to_string(),
            Self::TooLarge { limit, .. } => {
                format!("❌ The file is too large (max {})", format_size(*limit))
            }
            Self::NotFound(_) => "❌ Video not found".to_string(),
            Self::Network(_) => {
                "❌ Download failed. Check that the link is valid and reachable.".to_string()
            }
            Self::Cancelled => "⚠️ Download cancelled".to_string(),
            Self::Storage(_) => "❌ Error while processing the video".to_string(),
        }
    }

    /// Whether retrying the same URL later has a reasonable chance to work.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Storage(_))
    }

    /// Multi-line report with likely causes and fixes, for the CLI.
    pub fn report(&self) -> String {
        let report = Report::new(self.to_string());
        let report = match self {
            Self::InvalidUrl => report
                .cause("The link is not an http(s) URL")
                .cause("The host is not a domain, localhost, or IPv4 address")
                .fix("Copy the full link, including https://"),
            Self::TooLarge { .. } => report
                .cause("The source only offers formats above the size cap")
                .fix("Pick a shorter clip or a lower quality source")
                .fix("Raise max_file_size in the config if the transport allows it"),
            Self::NotFound(_) => report
                .cause("The page has no downloadable video")
                .cause("The video is private, removed, or region-locked")
                .fix("Open the link in a browser to confirm it plays"),
            Self::Network(_) => report
                .cause("The site is unreachable or rate-limiting")
                .cause("yt-dlp is missing or outdated")
                .fix("Retry in a few minutes")
                .fix("Update yt-dlp: yt-dlp -U"),
            Self::Cancelled => report,
            Self::Storage(_) => report
                .cause("The download directory is not writable")
                .cause("The disk is full")
                .fix("Check download_dir: vidrelay config show"),
        };
        report.to_string()
    }
}

/// Failure to start a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The key already has an in-flight session.
    AlreadyActive { user_key: UserKey },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive { user_key } => {
                write!(f, "A download is already in progress for {}", user_key)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl RegistryError {
    pub fn user_message(&self) -> String {
        match self {
            Self::AlreadyActive { .. } => {
                "⚠️ You already have a download in progress.\nPlease wait for it to finish."
                    .to_string()
            }
        }
    }
}

/// A failure report for the terminal: headline, likely causes, numbered
/// fixes, then [`HELP_HINT`]. Empty sections are omitted.
#[derive(Debug, Clone, Default)]
pub(crate) struct Report {
    headline: String,
    causes: Vec<&'static str>,
    fixes: Vec<&'static str>,
}

impl Report {
    pub(crate) fn new(headline: impl Into<String>) -> Self {
        Self {
            headline: headline.into(),
            ..Self::default()
        }
    }

    pub(crate) fn cause(mut self, cause: &'static str) -> Self {
        self.causes.push(cause);
        self
    }

    pub(crate) fn fix(mut self, fix: &'static str) -> Self {
        self.fixes.push(fix);
        self
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[✗] {}\n", self.headline)?;
        if !self.causes.is_empty() {
            writeln!(f, "Possible causes:")?;
            for cause in &self.causes {
                writeln!(f, "  - {}", cause)?;
            }
            writeln!(f)?;
        }
        if !self.fixes.is_empty() {
            writeln!(f, "Try these fixes:")?;
            for (n, fix) in self.fixes.iter().enumerate() {
                writeln!(f, "  {}. {}", n + 1, fix)?;
            }
            writeln!(f)?;
        }
        f.write_str(HELP_HINT)
    }
}

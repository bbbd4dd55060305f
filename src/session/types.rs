// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Types shared by download sessions and the registry.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::format::DEFAULT_BAR_WIDTH;

/// Default size cap: 50 MiB, the common chat upload limit.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Default renderer poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Output extensions accepted as a finished artifact.
pub const DEFAULT_SUPPORTED_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv", ".webm"];

/// Opaque caller-supplied identifier; one session per key at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserKey(String);

impl UserKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe rendition, used to name working directories.
    pub fn path_component(&self) -> String {
        let cleaned: String = self
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(32)
            .collect();
        if cleaned.is_empty() {
            "anon".to_string()
        } else {
            cleaned
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for UserKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<i64> for UserKey {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for UserKey {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle of a download session.
///
/// ```text
/// Pending -> Downloading -> Succeeded -> Uploading -> Succeeded
///               |              (ext.)        |
///               +-> Failed                   +-> Failed
/// any non-terminal state -> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, fetch not started
    Pending,
    /// Fetch backend is transferring
    Downloading,
    /// Artifact handed to the transport
    Uploading,
    /// Fetch (or upload) finished
    Succeeded,
    /// Fetch (or upload) failed
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl SessionState {
    /// No further transition occurs from a terminal state, except that an
    /// external actor may move `Succeeded` into `Uploading`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Pending, Downloading | Failed | Cancelled) => true,
            (Downloading, Succeeded | Failed | Cancelled) => true,
            (Succeeded, Uploading) => true,
            (Uploading, Succeeded | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Pending => write!(f, "PENDING"),
            SessionState::Downloading => write!(f, "DOWNLOADING"),
            SessionState::Uploading => write!(f, "UPLOADING"),
            SessionState::Succeeded => write!(f, "SUCCEEDED"),
            SessionState::Failed => write!(f, "FAILED"),
            SessionState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A finished download, owned by its session until cleanup.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
}

impl ArtifactInfo {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }
}

/// Knobs every session in a registry shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Parent of the per-session working directories
    pub download_dir: PathBuf,
    /// Hard cap on artifact size, enforced before and during transfer
    pub max_file_size: u64,
    /// Allow-list of artifact extensions, lowercase with leading dot
    pub supported_extensions: Vec<String>,
    /// How often the renderer publishes
    pub poll_interval: Duration,
    /// Width of the rendered progress bar
    pub bar_width: usize,
    /// Upper bound for the pre-download size probe
    pub probe_timeout: Duration,
}

impl SessionSettings {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            ..Self::default()
        }
    }

    /// Whether `path` carries an allow-listed extension (case-insensitive).
    pub fn is_supported_artifact(&self, path: &std::path::Path) -> bool {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!(".{}", ext.to_ascii_lowercase()),
            None => return false,
        };
        self.supported_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            supported_extensions: DEFAULT_SUPPORTED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            bar_width: DEFAULT_BAR_WIDTH,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

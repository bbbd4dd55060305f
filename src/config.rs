// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration file and environment overrides.
//!
//! Lookup order for the file: `--config`, then `$VIDRELAY_CONFIG`, then
//! `~/.vidrelay/config.json`. A missing file means defaults. Environment
//! variables override individual fields after the file is read.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::fetch::{ytdlp, DirectHttpBackend, FetchBackend, YtDlpBackend};
use crate::format::DEFAULT_BAR_WIDTH;
use crate::session::{SessionSettings, DEFAULT_MAX_FILE_SIZE, DEFAULT_SUPPORTED_EXTENSIONS};

pub const CONFIG_ENV: &str = "VIDRELAY_CONFIG";
pub const DOWNLOAD_DIR_ENV: &str = "VIDRELAY_DOWNLOAD_DIR";
pub const YTDLP_BIN_ENV: &str = "VIDRELAY_YTDLP_BIN";
pub const MAX_FILE_SIZE_ENV: &str = "VIDRELAY_MAX_FILE_SIZE";
pub const LOG_LEVEL_ENV: &str = "VIDRELAY_LOG_LEVEL";

/// Which fetch backend sessions use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    #[serde(rename = "yt-dlp")]
    YtDlp,
    Http,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::YtDlp => write!(f, "yt-dlp"),
            BackendKind::Http => write!(f, "http"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Parent directory for per-session working directories
    pub download_dir: PathBuf,
    /// Artifact size cap in bytes
    pub max_file_size: u64,
    pub supported_extensions: Vec<String>,
    /// Seconds between progress publishes
    pub poll_interval_secs: u64,
    pub bar_width: usize,
    pub backend: BackendKind,
    pub ytdlp_bin: String,
    pub ytdlp_format: String,
    pub probe_timeout_secs: u64,
    /// Sessions older than this are reaped by `relay`
    pub session_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            supported_extensions: DEFAULT_SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            poll_interval_secs: 2,
            bar_width: DEFAULT_BAR_WIDTH,
            backend: BackendKind::YtDlp,
            ytdlp_bin: ytdlp::DEFAULT_YTDLP_BIN.to_string(),
            ytdlp_format: ytdlp::DEFAULT_FORMAT.to_string(),
            probe_timeout_secs: 30,
            session_timeout_secs: 1800,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reject settings the session core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        if self.max_file_size == 0 {
            bail!("max_file_size must be greater than zero");
        }
        if self.bar_width == 0 {
            bail!("bar_width must be greater than zero");
        }
        if self.supported_extensions.is_empty() {
            bail!("supported_extensions must list at least one extension");
        }
        if self.backend == BackendKind::YtDlp && self.ytdlp_bin.trim().is_empty() {
            bail!("ytdlp_bin must not be empty when backend is yt-dlp");
        }
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            download_dir: self.download_dir.clone(),
            max_file_size: self.max_file_size,
            supported_extensions: self.supported_extensions.iter().map(|e| normalize_extension(e)).collect(),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            bar_width: self.bar_width,
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn build_backend(&self) -> Arc<dyn FetchBackend> {
        match self.backend {
            BackendKind::YtDlp => Arc::new(
                YtDlpBackend::new(self.ytdlp_bin.clone())
                    .with_format(self.ytdlp_format.clone())
                    .with_probe_timeout(Duration::from_secs(self.probe_timeout_secs)),
            ),
            BackendKind::Http => Arc::new(DirectHttpBackend::new()),
        }
    }

    /// Apply `VIDRELAY_*` overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(DOWNLOAD_DIR_ENV) {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(bin) = lookup(YTDLP_BIN_ENV) {
            self.ytdlp_bin = bin;
        }
        if let Some(size) = lookup(MAX_FILE_SIZE_ENV) {
            self.max_file_size = size
                .trim()
                .parse()
                .with_context(|| format!("{} must be a byte count, got '{}'", MAX_FILE_SIZE_ENV, size))?;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.log_level = level;
        }
        Ok(())
    }
}

/// `mp4`, `.MP4` and ` .mp4 ` all become `.mp4`.
fn normalize_extension(ext: &str) -> String {
    let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
    format!(".{}", ext)
}

fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".vidrelay"))
}

/// Resolve which file to read: explicit path, `$VIDRELAY_CONFIG`, or the default.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(get_config_dir()?.join("config.json"))
}

/// Read a config file; a missing file yields defaults. No env overrides.
pub fn read_config_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Load, apply environment overrides, and validate.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = config_path(explicit)?;
    let mut config = read_config_file(&path)?;
    config.apply_overrides(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))?;
    config.validate().with_context(|| format!("Invalid configuration ({})", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! vidrelay - per-user video download sessions with live progress
//!
//! A chat front-end hands a user's link to the [`SessionRegistry`]; the
//! registry runs one [`DownloadSession`] per user, publishes a rendered
//! progress message to a [`Sink`] every poll interval, and removes the
//! artifact once the front-end is done with it.
//!
//! **Start** -> **Downloading** (progress -> store -> renderer -> sink) ->
//! **Succeeded** -> upload -> **finish** (cleanup)
//!
//! # Core Modules
//!
//! - [`session`] - Sessions, the renderer, and the per-user registry
//! - [`progress`] - Progress snapshots and the shared store
//! - [`format`] - Pure rendering of sizes, durations, bars, and messages
//! - [`fetch`] - Fetch backends (yt-dlp, direct HTTP)
//! - [`sink`] - Progress message destinations
//! - [`urls`] - URL validation and extraction
//! - [`error`] - Error taxonomy and user-facing reports
//! - [`config`] - Configuration file and environment overrides

pub mod config;
pub mod error;
pub mod fetch;
pub mod format;
pub mod locks;
pub mod logging;
pub mod progress;
pub mod session;
pub mod sink;
pub mod urls;

pub use config::{load_config, BackendKind, Config};
pub use error::{FetchError, RegistryError};
pub use fetch::{
    DirectHttpBackend, FetchBackend, FetchOutput, FetchRequest, FetchUpdate, HookAction, MediaInfo, ProgressHook,
    YtDlpBackend,
};
pub use format::{format_duration, format_size, render_message, render_progress_bar};
pub use progress::{ProgressSnapshot, ProgressStore};
pub use session::{
    ArtifactInfo, DownloadSession, SessionHandle, SessionRegistry, SessionSettings, SessionState, UserKey,
};
pub use sink::{ChannelSink, LineSink, Sink, TerminalSink};
pub use urls::{extract_urls, is_valid_url};

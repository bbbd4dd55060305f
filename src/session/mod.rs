// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download sessions and the per-user registry that supervises them.
//!
//! - [`DownloadSession`]: one fetch, its state machine, and its working directory
//! - [`Renderer`]: periodic progress publisher bound to one session
//! - [`SessionRegistry`]: admission control, stop, and stale-session sweeps

pub mod download;
pub mod registry;
pub mod renderer;
pub mod types;

pub use download::DownloadSession;
pub use registry::{SessionHandle, SessionRegistry};
pub use renderer::Renderer;
pub use types::{
    ArtifactInfo, SessionSettings, SessionState, UserKey, DEFAULT_MAX_FILE_SIZE, DEFAULT_POLL_INTERVAL,
    DEFAULT_SUPPORTED_EXTENSIONS,
};

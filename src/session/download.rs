// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One user's download attempt, from URL check to artifact cleanup.
//!
//! A session owns a private working directory under the configured
//! download directory. The fetch backend writes there and nowhere else, so
//! [`DownloadSession::cleanup`] can remove the artifact, partial files, and
//! temp files in one step, on whichever path ends the session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{ArtifactInfo, SessionSettings, SessionState, UserKey};
use crate::error::FetchError;
use crate::fetch::{FetchBackend, FetchOutput, FetchRequest, FetchUpdate, HookAction, MediaInfo, ProgressHook};
use crate::locks::{resilient_read, resilient_write};
use crate::progress::{ProgressSnapshot, ProgressStore};
use crate::urls::is_valid_url;

pub struct DownloadSession {
    id: String,
    user_key: UserKey,
    url: String,
    created_at: DateTime<Utc>,
    started: Instant,
    work_dir: PathBuf,
    settings: SessionSettings,
    backend: Arc<dyn FetchBackend>,
    store: ProgressStore,
    state: watch::Sender<SessionState>,
    artifact: RwLock<Option<ArtifactInfo>>,
    cleaned: AtomicBool,
    cancel: CancellationToken,
}

impl DownloadSession {
    pub fn new(
        user_key: UserKey,
        url: impl Into<String>,
        settings: SessionSettings,
        backend: Arc<dyn FetchBackend>,
        store: ProgressStore,
    ) -> Self {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}-{:08x}",
            user_key.path_component(),
            created_at.timestamp_millis(),
            rand::random::<u32>()
        );
        let work_dir = settings.download_dir.join(&id);
        let (state, _) = watch::channel(SessionState::Pending);

        Self {
            id,
            user_key,
            url: url.into(),
            created_at,
            started: Instant::now(),
            work_dir,
            settings,
            backend,
            store,
            state,
            artifact: RwLock::new(None),
            cleaned: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Fast local check: `http(s)://` with a plausible host. No network.
    pub fn validate(url: &str) -> bool {
        is_valid_url(url)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_key(&self) -> &UserKey {
        &self.user_key
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Private directory the backend writes into; removed by cleanup.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The finished artifact, until cleanup releases it.
    pub fn artifact(&self) -> Option<ArtifactInfo> {
        resilient_read(&self.artifact).clone()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Drive the fetch to completion.
    ///
    /// Every error path removes the working directory before returning.
    /// On success the artifact stays on disk until [`cleanup`](Self::cleanup).
    pub async fn run(&self) -> Result<ArtifactInfo, FetchError> {
        if !Self::validate(&self.url) {
            tracing::warn!(user = %self.user_key, session = %self.id, url = %self.url, "rejected invalid URL");
            self.transition(SessionState::Failed);
            return Err(FetchError::InvalidUrl);
        }

        if !self.transition(SessionState::Downloading) {
            return Err(match self.state() {
                SessionState::Cancelled => FetchError::Cancelled,
                other => FetchError::Storage(format!("session cannot start from state {}", other)),
            });
        }

        tracing::info!(
            user = %self.user_key,
            session = %self.id,
            backend = self.backend.name(),
            "download started: {}",
            self.url
        );

        let accepting = Arc::new(AtomicBool::new(true));
        let oversize = Arc::new(AtomicU64::new(0));

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            res = self.download(accepting.clone(), oversize) => res,
        };

        // Late callbacks from a backend thread must not touch the store.
        accepting.store(false, Ordering::Release);

        match result {
            Ok(artifact) => {
                *resilient_write(&self.artifact) = Some(artifact.clone());
                if self.transition(SessionState::Succeeded) {
                    tracing::info!(
                        user = %self.user_key,
                        session = %self.id,
                        "download finished: {} ({:.2} MB)",
                        artifact.file_name,
                        artifact.size_mb()
                    );
                    Ok(artifact)
                } else {
                    self.cleanup();
                    Err(FetchError::Cancelled)
                }
            }
            Err(err) => {
                let terminal = if err == FetchError::Cancelled {
                    SessionState::Cancelled
                } else {
                    SessionState::Failed
                };
                self.transition(terminal);
                tracing::warn!(user = %self.user_key, session = %self.id, "download failed: {}", err);
                self.cleanup();
                Err(err)
            }
        }
    }

    async fn download(
        &self,
        accepting: Arc<AtomicBool>,
        oversize: Arc<AtomicU64>,
    ) -> Result<ArtifactInfo, FetchError> {
        let limit = self.settings.max_file_size;

        let probed = match tokio::time::timeout(self.settings.probe_timeout, self.backend.probe(&self.url)).await {
            Ok(Ok(info)) => info,
            Ok(Err(err)) if err.is_transient() => {
                tracing::warn!(
                    user = %self.user_key,
                    session = %self.id,
                    "size probe failed ({}); enforcing the cap during transfer",
                    err
                );
                MediaInfo::default()
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                tracing::warn!(
                    user = %self.user_key,
                    session = %self.id,
                    "size probe timed out after {:?}; enforcing the cap during transfer",
                    self.settings.probe_timeout
                );
                MediaInfo::default()
            }
        };

        if let Some(title) = &probed.title {
            tracing::info!(user = %self.user_key, session = %self.id, "title: {}", title);
        }

        if let Some(size) = probed.estimated_size {
            tracing::info!(
                user = %self.user_key,
                session = %self.id,
                "estimated size: {:.2} MB",
                size as f64 / 1024.0 / 1024.0
            );
            if size > limit {
                return Err(FetchError::TooLarge { size, limit });
            }
        }

        std::fs::create_dir_all(&self.work_dir).map_err(|e| {
            FetchError::Storage(format!("cannot create {}: {}", self.work_dir.display(), e))
        })?;

        let request = FetchRequest::new(&self.url, &self.work_dir, limit);
        let hook = self.progress_hook(accepting, oversize.clone());

        let output = match self.backend.fetch(&request, hook).await {
            Ok(output) => output,
            Err(FetchError::Cancelled) if oversize.load(Ordering::Acquire) > 0 => {
                return Err(FetchError::TooLarge {
                    size: oversize.load(Ordering::Acquire),
                    limit,
                });
            }
            Err(err) => return Err(err),
        };

        self.verify_artifact(output, probed)
    }

    /// Callback bound to this session's key; writes straight into the store.
    fn progress_hook(&self, accepting: Arc<AtomicBool>, oversize: Arc<AtomicU64>) -> ProgressHook {
        let key = self.user_key.clone();
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let limit = self.settings.max_file_size;

        Arc::new(move |update: FetchUpdate| {
            if !accepting.load(Ordering::Acquire) || cancel.is_cancelled() {
                return HookAction::Abort;
            }
            if update.downloaded_bytes > limit {
                oversize.store(update.downloaded_bytes, Ordering::Release);
                return HookAction::Abort;
            }

            let snapshot = ProgressSnapshot::from_update(&update);
            tracing::debug!(
                user = %key,
                "progress: {:.1}% ({} / {} bytes)",
                snapshot.percentage(),
                snapshot.downloaded_bytes,
                snapshot.total_bytes
            );
            store.put(&key, snapshot);
            HookAction::Continue
        })
    }

    fn verify_artifact(&self, output: FetchOutput, probed: MediaInfo) -> Result<ArtifactInfo, FetchError> {
        let path = output.path;
        let metadata = std::fs::metadata(&path).map_err(|e| {
            FetchError::Storage(format!("artifact {} unreadable: {}", path.display(), e))
        })?;

        if !metadata.is_file() {
            return Err(FetchError::NotFound(format!("{} is not a file", path.display())));
        }

        if !self.owns_path(&path) {
            return Err(FetchError::Storage(format!(
                "backend wrote {} outside the session directory",
                path.display()
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !self.settings.is_supported_artifact(&path) {
            return Err(FetchError::NotFound(format!("unsupported output format: {}", file_name)));
        }

        let size = metadata.len();
        if size > self.settings.max_file_size {
            return Err(FetchError::TooLarge {
                size,
                limit: self.settings.max_file_size,
            });
        }

        Ok(ArtifactInfo {
            path,
            file_name,
            size_bytes: size,
            title: output.info.title.or(probed.title),
            duration_secs: output.info.duration_secs.or(probed.duration_secs),
        })
    }

    fn owns_path(&self, path: &Path) -> bool {
        match (std::fs::canonicalize(&self.work_dir), std::fs::canonicalize(path)) {
            (Ok(dir), Ok(file)) => file.starts_with(dir),
            _ => false,
        }
    }

    /// Cancel from any non-terminal state and stop the backend.
    ///
    /// Returns whether the state changed. The token is cancelled either way,
    /// which also stops a renderer bound to this session.
    pub fn cancel(&self) -> bool {
        let changed = self.transition(SessionState::Cancelled);
        self.cancel.cancel();
        if changed {
            tracing::info!(user = %self.user_key, session = %self.id, "download cancelled");
        }
        changed
    }

    /// Hand the artifact to the transport: `Succeeded -> Uploading`.
    pub fn begin_upload(&self) -> bool {
        self.transition_from(SessionState::Succeeded, SessionState::Uploading)
    }

    /// Record the transport's verdict: `Uploading -> Succeeded | Failed`.
    pub fn finish_upload(&self, delivered: bool) -> bool {
        let next = if delivered {
            SessionState::Succeeded
        } else {
            SessionState::Failed
        };
        self.transition_from(SessionState::Uploading, next)
    }

    /// Remove the working directory and release the artifact.
    ///
    /// Only the first call does anything; later calls return `false`.
    /// Call it after [`run`](Self::run) has returned. Failures are logged,
    /// never propagated.
    pub fn cleanup(&self) -> bool {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return false;
        }

        resilient_write(&self.artifact).take();
        self.store.clear(&self.user_key);

        match std::fs::remove_dir_all(&self.work_dir) {
            Ok(()) => {
                tracing::info!(user = %self.user_key, session = %self.id, "removed {}", self.work_dir.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(user = %self.user_key, session = %self.id, "nothing to clean up");
            }
            Err(e) => {
                tracing::error!(
                    user = %self.user_key,
                    session = %self.id,
                    "failed to remove {}: {}",
                    self.work_dir.display(),
                    e
                );
            }
        }
        true
    }

    fn transition(&self, next: SessionState) -> bool {
        self.apply_transition(|current| current.can_transition_to(next), next)
    }

    fn transition_from(&self, expected: SessionState, next: SessionState) -> bool {
        self.apply_transition(|current| current == expected && current.can_transition_to(next), next)
    }

    fn apply_transition(&self, allowed: impl FnOnce(SessionState) -> bool, next: SessionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|current| {
            if allowed(*current) {
                from = Some(*current);
                *current = next;
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                tracing::debug!(user = %self.user_key, session = %self.id, "state {} -> {}", from, next)
            }
            None => tracing::debug!(
                user = %self.user_key,
                session = %self.id,
                "ignored transition {} -> {}",
                self.state(),
                next
            ),
        }
        changed
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.id)
            .field("user_key", &self.user_key)
            .field("url", &self.url)
            .field("state", &self.state())
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Writes `content` as `name` after replaying `updates`.
    struct FileBackend {
        probe_size: Option<u64>,
        probe_error: Option<FetchError>,
        updates: Vec<FetchUpdate>,
        name: &'static str,
        content: Vec<u8>,
        fetch_calls: Mutex<u32>,
    }

    impl FileBackend {
        fn new(name: &'static str, content: Vec<u8>) -> Self {
            Self {
                probe_size: None,
                probe_error: None,
                updates: Vec::new(),
                name,
                content,
                fetch_calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl FetchBackend for FileBackend {
        fn name(&self) -> &str {
            "file"
        }

        async fn probe(&self, _url: &str) -> Result<MediaInfo, FetchError> {
            if let Some(err) = &self.probe_error {
                return Err(err.clone());
            }
            Ok(MediaInfo {
                title: Some("clip".into()),
                duration_secs: Some(12.0),
                estimated_size: self.probe_size,
            })
        }

        async fn fetch(&self, request: &FetchRequest, hook: ProgressHook) -> Result<FetchOutput, FetchError> {
            *self.fetch_calls.lock().unwrap() += 1;
            let path = request.output_dir.join(self.name);
            std::fs::write(path.with_extension("part"), b"partial").unwrap();
            for update in &self.updates {
                if hook(*update) == HookAction::Abort {
                    return Err(FetchError::Cancelled);
                }
            }
            std::fs::write(&path, &self.content).unwrap();
            Ok(FetchOutput {
                path,
                info: MediaInfo::default(),
            })
        }
    }

    fn session_with(backend: FileBackend, dir: &Path, url: &str) -> (DownloadSession, ProgressStore) {
        let store = ProgressStore::new();
        let settings = SessionSettings::new(dir);
        let session = DownloadSession::new(UserKey::from(1_i64), url, settings, Arc::new(backend), store.clone());
        (session, store)
    }

    #[tokio::test]
    async fn test_invalid_url_fails_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _) = session_with(FileBackend::new("v.mp4", vec![1]), dir.path(), "not a url");

        assert_eq!(session.run().await, Err(FetchError::InvalidUrl));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_successful_run_keeps_artifact_until_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new("v.mp4", vec![0u8; 2048]);
        backend.updates = vec![FetchUpdate {
            downloaded_bytes: 2048,
            total_bytes: Some(2048),
            ..Default::default()
        }];
        let (session, store) = session_with(backend, dir.path(), "https://good.example/v.mp4");

        let artifact = session.run().await.unwrap();
        assert_eq!(session.state(), SessionState::Succeeded);
        assert_eq!(artifact.file_name, "v.mp4");
        assert_eq!(artifact.size_bytes, 2048);
        assert_eq!(artifact.title.as_deref(), Some("clip"));
        assert!(artifact.path.exists());
        assert!(store.get(session.user_key()).unwrap().is_complete());

        assert!(session.cleanup());
        assert!(!artifact.path.exists());
        assert!(!session.work_dir().exists());
        assert!(store.get(session.user_key()).is_none());
        assert!(session.artifact().is_none());
    }

    #[tokio::test]
    async fn test_failed_probe_still_fetches_under_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new("v.mp4", vec![1]);
        let limit = SessionSettings::default().max_file_size;
        backend.probe_error = Some(FetchError::Network("server answered HTTP 405".into()));
        backend.updates = vec![FetchUpdate {
            downloaded_bytes: limit + 1,
            ..Default::default()
        }];
        let backend = Arc::new(backend);
        let session = DownloadSession::new(
            UserKey::from("h"),
            "https://nohead.example/v.mp4",
            SessionSettings::new(dir.path()),
            backend.clone(),
            ProgressStore::new(),
        );

        let err = session.run().await.unwrap_err();
        assert_eq!(err, FetchError::TooLarge { size: limit + 1, limit });
        assert_eq!(*backend.fetch_calls.lock().unwrap(), 1);
        assert!(!session.work_dir().exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _) = session_with(FileBackend::new("v.mp4", vec![1]), dir.path(), "https://a.example/v");
        session.run().await.unwrap();

        assert!(session.cleanup());
        assert!(!session.cleanup());
        assert!(session.is_cleaned_up());
    }

    #[tokio::test]
    async fn test_estimated_size_over_cap_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new("v.mp4", vec![1]);
        backend.probe_size = Some(60 * 1024 * 1024);
        let backend = Arc::new(backend);
        let store = ProgressStore::new();
        let session = DownloadSession::new(
            UserKey::from("b"),
            "https://big.example/v.mp4",
            SessionSettings::new(dir.path()),
            backend.clone(),
            store,
        );

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { size, .. } if size == 60 * 1024 * 1024));
        assert_eq!(*backend.fetch_calls.lock().unwrap(), 0);
        assert!(!session.work_dir().exists());
    }

    #[tokio::test]
    async fn test_mid_transfer_cap_aborts_and_removes_partial() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FileBackend::new("v.mp4", vec![1]);
        let limit = SessionSettings::default().max_file_size;
        backend.updates = vec![
            FetchUpdate {
                downloaded_bytes: limit / 2,
                ..Default::default()
            },
            FetchUpdate {
                downloaded_bytes: limit + 1,
                ..Default::default()
            },
        ];
        let (session, store) = session_with(backend, dir.path(), "https://nosize.example/v");

        let err = session.run().await.unwrap_err();
        assert_eq!(err, FetchError::TooLarge { size: limit + 1, limit });
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.work_dir().exists());
        assert!(store.get(session.user_key()).is_none());
    }

    #[tokio::test]
    async fn test_unsupported_extension_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _) = session_with(FileBackend::new("v.flv", vec![1]), dir.path(), "https://a.example/v");

        assert!(matches!(session.run().await, Err(FetchError::NotFound(_))));
        assert!(!session.work_dir().exists());
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _) = session_with(FileBackend::new("v.mp4", vec![1]), dir.path(), "https://a.example/v");

        assert!(session.cancel());
        assert_eq!(session.run().await, Err(FetchError::Cancelled));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_upload_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _) = session_with(FileBackend::new("v.mp4", vec![1]), dir.path(), "https://a.example/v");

        assert!(!session.begin_upload());
        session.run().await.unwrap();
        assert!(!session.finish_upload(true));
        assert!(session.begin_upload());
        assert_eq!(session.state(), SessionState::Uploading);
        assert!(session.finish_upload(false));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.cancel());
    }

    #[test]
    fn test_session_ids_are_unique_and_scoped() {
        let settings = SessionSettings::new("downloads");
        let backend: Arc<dyn FetchBackend> = Arc::new(FileBackend::new("v.mp4", vec![]));
        let a = DownloadSession::new(UserKey::from("u"), "x", settings.clone(), backend.clone(), ProgressStore::new());
        let b = DownloadSession::new(UserKey::from("u"), "x", settings, backend, ProgressStore::new());

        assert_ne!(a.id(), b.id());
        assert!(a.work_dir().starts_with("downloads"));
        assert!(a.id().starts_with("u-"));
    }
}

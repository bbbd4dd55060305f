// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-key admission control and session supervision.
//!
//! The registry enforces one in-flight session per [`UserKey`]. Starting a
//! session spawns two tasks: a driver that runs the download and a renderer
//! that publishes progress. The key stays reserved until teardown completes,
//! whether the caller finishes the handle, stops the key, or drops the handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::download::DownloadSession;
use super::renderer::Renderer;
use super::types::{ArtifactInfo, SessionSettings, UserKey};
use crate::error::{FetchError, RegistryError};
use crate::fetch::FetchBackend;
use crate::format::render_message_with_width;
use crate::locks::{resilient_read, resilient_write};
use crate::progress::{ProgressSnapshot, ProgressStore};
use crate::sink::Sink;

type Outcome = Result<ArtifactInfo, FetchError>;

struct Entry {
    id: u64,
    session: Arc<DownloadSession>,
    /// Flips to `true` once the driver (and its renderer) have exited
    done: watch::Receiver<bool>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<UserKey, Entry>>,
    store: ProgressStore,
    backend: Arc<dyn FetchBackend>,
    settings: SessionSettings,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn FetchBackend>, settings: SessionSettings) -> Self {
        Self::with_store(backend, settings, ProgressStore::new())
    }

    pub fn with_store(backend: Arc<dyn FetchBackend>, settings: SessionSettings, store: ProgressStore) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                backend,
                settings,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn backend(&self) -> &Arc<dyn FetchBackend> {
        &self.inner.backend
    }

    /// Start a download for `user_key`, publishing progress to `sink`.
    ///
    /// Fails with [`RegistryError::AlreadyActive`] while the key has a live
    /// session; check and insert happen under one write lock. Must be called
    /// from within a tokio runtime.
    pub fn start(
        &self,
        user_key: impl Into<UserKey>,
        url: impl Into<String>,
        sink: Arc<dyn Sink>,
    ) -> Result<SessionHandle, RegistryError> {
        let user_key = user_key.into();
        let mut sessions = resilient_write(&self.inner.sessions);

        if sessions.contains_key(&user_key) {
            tracing::info!(user = %user_key, "rejected start: session already active");
            return Err(RegistryError::AlreadyActive { user_key });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let settings = &self.inner.settings;
        let session = Arc::new(DownloadSession::new(
            user_key.clone(),
            url,
            settings.clone(),
            self.inner.backend.clone(),
            self.inner.store.clone(),
        ));

        let render_stop = session.cancel_token().child_token();
        let renderer = Renderer::new(
            user_key.clone(),
            self.inner.store.clone(),
            sink.clone(),
            settings.poll_interval,
            settings.bar_width,
        );
        let render_task = tokio::spawn(renderer.run(session.subscribe(), render_stop.clone()));

        let (done_tx, done_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        tokio::spawn(drive(
            session.clone(),
            render_task,
            render_stop,
            sink,
            self.inner.store.clone(),
            settings.bar_width,
            outcome_tx,
            done_tx,
        ));

        sessions.insert(
            user_key.clone(),
            Entry {
                id,
                session: session.clone(),
                done: done_rx,
            },
        );
        drop(sessions);

        tracing::info!(user = %user_key, session = session.id(), "session started");

        Ok(SessionHandle {
            id,
            session,
            outcome: Some(outcome_rx),
            resolved: None,
            registry: self.clone(),
            released: false,
        })
    }

    /// Cancel the key's session and wait for full teardown.
    ///
    /// Returns `true` if a session was stopped by this call. A no-op for
    /// keys without a session.
    pub async fn stop(&self, user_key: &UserKey) -> bool {
        let (id, session, done) = match self.lookup(user_key) {
            Some(found) => found,
            None => return false,
        };
        self.stop_entry(id, session, done).await
    }

    /// Stop every session older than `max_age`; returns how many.
    pub async fn stop_stale(&self, max_age: Duration) -> usize {
        let stale: Vec<_> = {
            let sessions = resilient_read(&self.inner.sessions);
            sessions
                .values()
                .filter(|entry| entry.session.age() > max_age)
                .map(|entry| (entry.id, entry.session.clone(), entry.done.clone()))
                .collect()
        };

        if !stale.is_empty() {
            tracing::warn!("stopping {} stale session(s) older than {:?}", stale.len(), max_age);
        }
        self.stop_many(stale).await
    }

    /// Stop every session; used at shutdown.
    pub async fn stop_all(&self) -> usize {
        let all: Vec<_> = {
            let sessions = resilient_read(&self.inner.sessions);
            sessions
                .values()
                .map(|entry| (entry.id, entry.session.clone(), entry.done.clone()))
                .collect()
        };
        self.stop_many(all).await
    }

    pub fn is_active(&self, user_key: &UserKey) -> bool {
        resilient_read(&self.inner.sessions).contains_key(user_key)
    }

    pub fn active_count(&self) -> usize {
        resilient_read(&self.inner.sessions).len()
    }

    pub fn active_keys(&self) -> Vec<UserKey> {
        let mut keys: Vec<UserKey> = resilient_read(&self.inner.sessions).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn session(&self, user_key: &UserKey) -> Option<Arc<DownloadSession>> {
        resilient_read(&self.inner.sessions)
            .get(user_key)
            .map(|entry| entry.session.clone())
    }

    /// Latest progress for the key, if any has been reported.
    pub fn progress(&self, user_key: &UserKey) -> Option<ProgressSnapshot> {
        self.inner.store.get(user_key)
    }

    fn lookup(&self, user_key: &UserKey) -> Option<(u64, Arc<DownloadSession>, watch::Receiver<bool>)> {
        resilient_read(&self.inner.sessions)
            .get(user_key)
            .map(|entry| (entry.id, entry.session.clone(), entry.done.clone()))
    }

    /// The entry's done signal, only if the key still maps to session `id`.
    fn done_signal(&self, id: u64, user_key: &UserKey) -> Option<watch::Receiver<bool>> {
        resilient_read(&self.inner.sessions)
            .get(user_key)
            .filter(|entry| entry.id == id)
            .map(|entry| entry.done.clone())
    }

    async fn stop_many(&self, entries: Vec<(u64, Arc<DownloadSession>, watch::Receiver<bool>)>) -> usize {
        let stops = entries
            .into_iter()
            .map(|(id, session, done)| self.stop_entry(id, session, done));
        join_all(stops).await.into_iter().filter(|stopped| *stopped).count()
    }

    async fn stop_entry(&self, id: u64, session: Arc<DownloadSession>, mut done: watch::Receiver<bool>) -> bool {
        session.cancel();
        // A dropped sender means the driver is gone too.
        let _ = done.wait_for(|finished| *finished).await;
        self.finalize(id, &session)
    }

    /// Remove the entry if it still belongs to `id`, then clean up.
    fn finalize(&self, id: u64, session: &DownloadSession) -> bool {
        let key = session.user_key();
        let removed = {
            let mut sessions = resilient_write(&self.inner.sessions);
            match sessions.get(key) {
                Some(entry) if entry.id == id => sessions.remove(key).is_some(),
                _ => false,
            }
        };

        if removed {
            session.cleanup();
            self.inner.store.clear(key);
            tracing::info!(user = %key, session = session.id(), "session released ({})", session.state());
        }
        removed
    }

    /// Teardown for a handle dropped without [`SessionHandle::finish`].
    fn abandon(&self, id: u64, session: Arc<DownloadSession>) {
        let done = match self.done_signal(id, session.user_key()) {
            Some(done) => done,
            None => return,
        };

        tracing::warn!(user = %session.user_key(), session = session.id(), "session handle dropped, cancelling");
        session.cancel();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let registry = self.clone();
                runtime.spawn(async move {
                    registry.stop_entry(id, session, done).await;
                });
            }
            Err(_) => {
                self.finalize(id, &session);
            }
        }
    }
}

/// Run the session, then stop its renderer and flush the final state.
#[allow(clippy::too_many_arguments)]
async fn drive(
    session: Arc<DownloadSession>,
    render_task: JoinHandle<Option<String>>,
    render_stop: CancellationToken,
    sink: Arc<dyn Sink>,
    store: ProgressStore,
    bar_width: usize,
    outcome_tx: oneshot::Sender<Outcome>,
    done_tx: watch::Sender<bool>,
) {
    let outcome = session.run().await;

    render_stop.cancel();
    let last_published = match render_task.await {
        Ok(last) => last,
        Err(e) => {
            tracing::error!(user = %session.user_key(), "renderer task failed: {}", e);
            None
        }
    };

    // Without a final flush a fast download can end on a stale percentage.
    if outcome.is_ok() {
        if let Some(snapshot) = store.get(session.user_key()) {
            let text = render_message_with_width(Some(&snapshot), bar_width);
            if last_published.as_deref() != Some(text.as_str()) {
                tokio::select! {
                    biased;
                    _ = session.cancel_token().cancelled() => {}
                    published = sink.publish(&text) => {
                        if let Err(e) = published {
                            tracing::warn!(user = %session.user_key(), "final progress publish failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    store.clear(session.user_key());

    let _ = outcome_tx.send(outcome);
    done_tx.send_replace(true);
}

/// Owner's view of a started session.
///
/// Call [`finish`](Self::finish) once the artifact has been delivered (or
/// abandoned). Dropping the handle instead cancels the session and releases
/// the key in the background.
pub struct SessionHandle {
    id: u64,
    session: Arc<DownloadSession>,
    outcome: Option<oneshot::Receiver<Outcome>>,
    resolved: Option<Outcome>,
    registry: SessionRegistry,
    released: bool,
}

impl SessionHandle {
    pub fn user_key(&self) -> &UserKey {
        self.session.user_key()
    }

    pub fn session(&self) -> &Arc<DownloadSession> {
        &self.session
    }

    /// Wait for the download to finish; repeat calls return the same result.
    pub async fn wait(&mut self) -> Outcome {
        if let Some(rx) = self.outcome.take() {
            self.resolved = Some(rx.await.unwrap_or(Err(FetchError::Cancelled)));
        }
        self.resolved.clone().unwrap_or(Err(FetchError::Cancelled))
    }

    /// Release the key: cancel if still running, wait, clean up.
    ///
    /// Returns `false` if the session had already been stopped elsewhere.
    pub async fn finish(mut self) -> bool {
        self.released = true;
        match self.registry.done_signal(self.id, self.session.user_key()) {
            Some(done) => {
                self.registry
                    .stop_entry(self.id, self.session.clone(), done)
                    .await
            }
            None => {
                self.session.cleanup();
                false
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released {
            self.registry.abandon(self.id, self.session.clone());
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("session", &self.session)
            .finish()
    }
}

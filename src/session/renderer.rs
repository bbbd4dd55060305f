// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Periodic progress publisher, one task per session.
//!
//! The renderer only reads the progress store; it never talks to the fetch
//! backend. It stops on the first of: the session reaching a terminal state,
//! its stop token firing, or the session's state channel closing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::types::{SessionState, UserKey};
use crate::format::render_message_with_width;
use crate::progress::ProgressStore;
use crate::sink::Sink;

pub struct Renderer {
    key: UserKey,
    store: ProgressStore,
    sink: Arc<dyn Sink>,
    interval: Duration,
    bar_width: usize,
}

impl Renderer {
    pub fn new(key: UserKey, store: ProgressStore, sink: Arc<dyn Sink>, interval: Duration, bar_width: usize) -> Self {
        Self {
            key,
            store,
            sink,
            interval,
            bar_width,
        }
    }

    /// Publish immediately, then once per interval, skipping repeats.
    ///
    /// Returns the last text the sink accepted.
    pub async fn run(self, mut state: watch::Receiver<SessionState>, stop: CancellationToken) -> Option<String> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<String> = None;

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = state.wait_for(SessionState::is_terminal) => break,
                _ = ticker.tick() => {}
            }

            let text = render_message_with_width(self.store.get(&self.key).as_ref(), self.bar_width);
            if last.as_deref() == Some(text.as_str()) {
                continue;
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = state.wait_for(SessionState::is_terminal) => break,
                published = self.sink.publish(&text) => match published {
                    Ok(()) => last = Some(text),
                    Err(e) => tracing::warn!(user = %self.key, "progress publish failed, retrying next tick: {}", e),
                },
            }
        }

        tracing::debug!(user = %self.key, "renderer stopped");
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::INITIALIZING_MESSAGE;
    use crate::progress::ProgressSnapshot;
    use crate::sink::ChannelSink;

    #[tokio::test(start_paused = true)]
    async fn test_publishes_immediately_then_skips_repeats() {
        let store = ProgressStore::new();
        let key = UserKey::from("r");
        let (sink, mut rx) = ChannelSink::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Downloading);
        let stop = CancellationToken::new();

        let renderer = Renderer::new(key.clone(), store.clone(), Arc::new(sink), Duration::from_secs(2), 20);
        let task = tokio::spawn(renderer.run(state_rx, stop.clone()));

        assert_eq!(rx.recv().await.as_deref(), Some(INITIALIZING_MESSAGE));

        // Unchanged store: the next two ticks publish nothing.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());

        store.put(&key, ProgressSnapshot::new(512, Some(1024), Some(1024.0), Some(1)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let text = rx.recv().await.unwrap();
        assert!(text.contains("50.0%"));

        state_tx.send_replace(SessionState::Succeeded);
        let last = task.await.unwrap();
        assert_eq!(last, Some(text));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_token_ends_loop() {
        let (sink, _rx) = ChannelSink::new();
        let (_state_tx, state_rx) = watch::channel(SessionState::Downloading);
        let stop = CancellationToken::new();
        let renderer = Renderer::new(UserKey::from("s"), ProgressStore::new(), Arc::new(sink), Duration::from_secs(2), 20);
        let task = tokio::spawn(renderer.run(state_rx, stop.clone()));

        stop.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), task).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_state_before_start_publishes_nothing() {
        let (sink, mut rx) = ChannelSink::new();
        let (_state_tx, state_rx) = watch::channel(SessionState::Failed);
        let renderer = Renderer::new(UserKey::from("t"), ProgressStore::new(), Arc::new(sink), Duration::from_secs(2), 20);

        assert_eq!(renderer.run(state_rx, CancellationToken::new()).await, None);
        assert!(rx.try_recv().is_err());
    }
}

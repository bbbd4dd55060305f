// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Where rendered progress messages go.
//!
//! A chat transport implements [`Sink`] by editing its status message in
//! place. The crate ships three sinks: a terminal spinner for interactive
//! use, a line printer for the relay loop, and a channel for embedding.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

/// Receives the full text of the latest progress message.
///
/// Each call replaces the previous message. Errors are logged by the
/// renderer and retried on the next tick; they never fail the download.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn publish(&self, text: &str) -> Result<()>;
}

/// Single status line on the terminal, redrawn on every publish.
pub struct TerminalSink {
    bar: ProgressBar,
}

impl TerminalSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner()
            .tick_chars("\u{28FB}\u{28F9}\u{28FC}\u{28F8}\u{28FE}\u{28F6}\u{28F7}\u{28E7}\u{28CF}\u{28DF} ")
            .template("{spinner:.cyan} {msg}")
        {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Remove the status from the terminal.
    pub fn clear(&self) {
        self.bar.finish_and_clear();
    }

    /// Leave `text` behind as the final status.
    pub fn finish_with(&self, text: &str) {
        self.bar.finish_with_message(text.to_string());
    }
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for TerminalSink {
    async fn publish(&self, text: &str) -> Result<()> {
        self.bar.set_message(text.to_string());
        Ok(())
    }
}

/// Prints each message as one prefixed line on stdout.
pub struct LineSink {
    prefix: String,
}

impl LineSink {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl Sink for LineSink {
    async fn publish(&self, text: &str) -> Result<()> {
        println!("[{}] {}", self.prefix, flatten(text));
        Ok(())
    }
}

/// Forwards every message into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn publish(&self, text: &str) -> Result<()> {
        self.tx
            .send(text.to_string())
            .map_err(|_| anyhow!("progress receiver closed"))
    }
}

/// Collapse a multi-line message into one line.
pub fn flatten(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten() {
        assert_eq!(flatten("📥 Downloading...\n\n📊 Progress: 50.0%\n"), "📥 Downloading... | 📊 Progress: 50.0%");
        assert_eq!(flatten(""), "");
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_and_fails_when_closed() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish("one").await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));

        drop(rx);
        assert!(sink.publish("two").await.is_err());
    }
}

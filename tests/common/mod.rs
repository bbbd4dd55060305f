// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use vidrelay::{
    FetchBackend, FetchError, FetchOutput, FetchRequest, FetchUpdate, HookAction, MediaInfo, ProgressHook,
    SessionRegistry, SessionSettings, Sink,
};

pub const MIB: u64 = 1024 * 1024;

/// Replays timed progress updates, then writes a sparse file.
pub struct ScriptedBackend {
    pub estimate: Option<u64>,
    /// How long `probe` takes before answering
    pub probe_delay: Duration,
    pub probe_error: Option<FetchError>,
    /// (delay before the update, update)
    pub steps: Vec<(Duration, FetchUpdate)>,
    /// Never finish after the steps; only cancellation ends the fetch
    pub hang: bool,
    pub file_name: String,
    pub file_size: u64,
    pub probe_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(file_size: u64) -> Self {
        Self {
            estimate: None,
            probe_delay: Duration::ZERO,
            probe_error: None,
            steps: Vec::new(),
            hang: false,
            file_name: "clip.mp4".to_string(),
            file_size,
            probe_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn step(mut self, delay: Duration, downloaded: u64, total: Option<u64>) -> Self {
        self.steps.push((
            delay,
            FetchUpdate {
                downloaded_bytes: downloaded,
                total_bytes: total,
                speed_bytes_per_sec: Some(MIB as f64),
                eta_seconds: total.map(|t| t.saturating_sub(downloaded) / MIB),
            },
        ));
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn with_estimate(mut self, size: u64) -> Self {
        self.estimate = Some(size);
        self
    }

    pub fn slow_probe(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn failing_probe(mut self, err: FetchError) -> Self {
        self.probe_error = Some(err);
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self, _url: &str) -> Result<MediaInfo, FetchError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.probe_delay).await;
        if let Some(err) = &self.probe_error {
            return Err(err.clone());
        }
        Ok(MediaInfo {
            title: Some("Scripted clip".to_string()),
            duration_secs: Some(42.0),
            estimated_size: self.estimate,
        })
    }

    async fn fetch(&self, request: &FetchRequest, hook: ProgressHook) -> Result<FetchOutput, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let path = request.output_dir.join(&self.file_name);
        let partial = request.output_dir.join(format!("{}.part", self.file_name));
        std::fs::write(&partial, b"partial").map_err(|e| FetchError::Storage(e.to_string()))?;

        for (delay, update) in &self.steps {
            tokio::time::sleep(*delay).await;
            if hook(*update) == HookAction::Abort {
                return Err(FetchError::Cancelled);
            }
        }

        if self.hang {
            std::future::pending::<()>().await;
        }

        let file = File::create(&path).map_err(|e| FetchError::Storage(e.to_string()))?;
        file.set_len(self.file_size).map_err(|e| FetchError::Storage(e.to_string()))?;
        std::fs::remove_file(&partial).map_err(|e| FetchError::Storage(e.to_string()))?;

        Ok(FetchOutput {
            path,
            info: MediaInfo::default(),
        })
    }
}

/// Records every published message; can fail the first N publishes.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
    failures_left: AtomicUsize,
}

impl RecordingSink {
    pub fn failing_first(n: usize) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(n),
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn publish(&self, text: &str) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("message edit rejected"));
        }
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

pub fn registry_with(backend: Arc<ScriptedBackend>, dir: &Path) -> SessionRegistry {
    SessionRegistry::new(backend, SessionSettings::new(dir))
}

pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

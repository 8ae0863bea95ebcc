//! Directory-backed frame source.
//!
//! Replays the images in a directory as a camera stream at a fixed cadence.
//! Frames that arrive while the analyzer is busy or not yet ready are skipped,
//! never buffered.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, FrameSource};
use crate::error::AnalyzerError;
use crate::types::{RawFrame, StreamCfg};

/// Frame source endpoint the host attaches the current analyzer to.
#[derive(Clone, Default)]
pub struct AnalyzerSlot {
    current: Arc<Mutex<Option<Arc<Analyzer>>>>,
    attaches: Arc<AtomicUsize>,
}

impl AnalyzerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Analyzer>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn attach_count(&self) -> usize {
        self.attaches.load(Ordering::SeqCst)
    }
}

impl FrameSource for AnalyzerSlot {
    fn attach(&mut self, analyzer: Arc<Analyzer>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(analyzer);
        self.attaches.fetch_add(1, Ordering::SeqCst);
    }

    fn detach(&mut self) {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub delivered: u64,
    pub skipped: u64,
    pub unreadable: u64,
}

pub struct DirectoryReplay {
    frames: Vec<PathBuf>,
    interval: Duration,
    released: Arc<AtomicU64>,
}

impl DirectoryReplay {
    pub fn new(cfg: &StreamCfg) -> Result<Self> {
        let mut frames = list_images(&cfg.frames_dir)?;
        if let Some(max) = cfg.max_frames {
            frames.truncate(max);
        }
        anyhow::ensure!(!frames.is_empty(), "no images in {}", cfg.frames_dir.display());
        Ok(Self {
            frames,
            interval: Duration::from_millis(cfg.interval_ms.max(1)),
            released: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames handed back so far (processed, skipped or dropped).
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn run(&self, slot: &AnalyzerSlot) -> StreamStats {
        let mut stats = StreamStats::default();
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        for path in &self.frames {
            ticker.tick().await;

            let decoded = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || image::open(&path).map(|img| img.to_rgb8())).await
            };
            let image = match decoded {
                Ok(Ok(image)) => image,
                Ok(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "unreadable frame");
                    stats.unreadable += 1;
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "frame decode task failed");
                    stats.unreadable += 1;
                    continue;
                }
            };

            let released = Arc::clone(&self.released);
            let frame = RawFrame::from_rgb(image, 0).with_release(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });

            let outcome = match slot.current() {
                Some(analyzer) => analyzer.analyze_stream(frame),
                None => Err(AnalyzerError::Unavailable),
            };
            match outcome {
                Ok(()) => stats.delivered += 1,
                Err(e) => {
                    debug!(path = %path.display(), reason = %e, "frame skipped");
                    stats.skipped += 1;
                }
            }
        }

        info!(delivered = stats.delivered, skipped = stats.skipped, "stream replay finished");
        stats
    }
}

pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))?;
    let mut frames = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"));
        if is_image {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

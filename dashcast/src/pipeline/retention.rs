//! Background pruning of old local segment files.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::publish::SegmentNamePattern;

/// Configuration for segment retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Segments kept per representation.
    pub keep_segments: usize,
    /// Interval between pruning passes in seconds.
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_segments: 20,
            interval_secs: 5,
        }
    }
}

/// Periodically prunes numbered segments, keeping the newest
/// `keep_segments` per representation.
///
/// Only files matching the media segment naming template are touched: init
/// segments, the manifest, subtitles and pipes never match the pattern.
pub struct SegmentRetentionWorker {
    dir: PathBuf,
    pattern: SegmentNamePattern,
    config: RetentionConfig,
}

impl SegmentRetentionWorker {
    pub fn new(dir: PathBuf, pattern: SegmentNamePattern, config: RetentionConfig) -> Self {
        Self {
            dir,
            pattern,
            config,
        }
    }

    /// Run a single pruning pass. Returns the number of files deleted.
    pub async fn run_once(&self) -> Result<usize> {
        // representation -> (sequence, path), sorted newest-first later.
        let mut per_representation: HashMap<String, Vec<(u64, PathBuf)>> = HashMap::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            // Directory already cleaned up: nothing to prune.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(crate::Error::io_path("listing segments", &self.dir, e)),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some((representation, sequence)) = self.pattern.parse(&name) {
                per_representation
                    .entry(representation)
                    .or_default()
                    .push((sequence, entry.path()));
            }
        }

        let mut deleted = 0usize;
        for (representation, mut segments) in per_representation {
            if segments.len() <= self.config.keep_segments {
                continue;
            }
            segments.sort_by(|a, b| b.0.cmp(&a.0));
            for (sequence, path) in segments.split_off(self.config.keep_segments) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => deleted += 1,
                    // Someone else (cleanup, a concurrent pass) got there first.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(
                            representation,
                            sequence,
                            error = %e,
                            "Failed to prune segment"
                        );
                    }
                }
            }
        }

        if deleted > 0 {
            debug!(deleted, "Pruned old segments");
        }
        Ok(deleted)
    }

    /// Start the background pruning task.
    pub fn start_background_task(self, cancellation_token: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                dir = %self.dir.display(),
                keep = self.config.keep_segments,
                interval_secs = self.config.interval_secs,
                "Segment retention started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Segment retention shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Retention pass failed");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(dir: &std::path::Path, keep: usize) -> SegmentRetentionWorker {
        SegmentRetentionWorker::new(
            dir.to_path_buf(),
            SegmentNamePattern::from_template("chunk-$RepresentationID$-$Number%05d$.m4s").unwrap(),
            RetentionConfig {
                keep_segments: keep,
                interval_secs: 5,
            },
        )
    }

    #[tokio::test]
    async fn test_keeps_newest_per_representation() {
        let dir = tempfile::tempdir().unwrap();
        for rep in 0..2 {
            for seq in 1..=6 {
                std::fs::write(dir.path().join(format!("chunk-{rep}-{seq:05}.m4s")), b"x").unwrap();
            }
        }

        let deleted = worker(dir.path(), 2).run_once().await.unwrap();
        assert_eq!(deleted, 8);

        for rep in 0..2 {
            for seq in 1..=4 {
                assert!(!dir.path().join(format!("chunk-{rep}-{seq:05}.m4s")).exists());
            }
            for seq in 5..=6 {
                assert!(dir.path().join(format!("chunk-{rep}-{seq:05}.m4s")).exists());
            }
        }
    }

    #[tokio::test]
    async fn test_never_touches_init_or_static_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("init-0.m4s"), b"init").unwrap();
        std::fs::write(dir.path().join("manifest.mpd"), b"mpd").unwrap();
        std::fs::write(dir.path().join("subs-eng.vtt"), b"vtt").unwrap();
        for seq in 1..=5 {
            std::fs::write(dir.path().join(format!("chunk-0-{seq:05}.m4s")), b"x").unwrap();
        }

        worker(dir.path(), 1).run_once().await.unwrap();

        assert!(dir.path().join("init-0.m4s").exists());
        assert!(dir.path().join("manifest.mpd").exists());
        assert!(dir.path().join("subs-eng.vtt").exists());
        assert!(dir.path().join("chunk-0-00005.m4s").exists());
        assert!(!dir.path().join("chunk-0-00001.m4s").exists());
    }

    #[tokio::test]
    async fn test_under_threshold_untouched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chunk-0-00001.m4s"), b"x").unwrap();
        let deleted = worker(dir.path(), 5).run_once().await.unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.path().join("chunk-0-00001.m4s").exists());
    }

    #[tokio::test]
    async fn test_missing_dir_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("nope");
        let deleted = worker(&gone, 1).run_once().await.unwrap();
        assert_eq!(deleted, 0);
    }
}

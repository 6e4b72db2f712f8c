//! Manifest/segment publishing.
//!
//! Three interchangeable strategies share one contract: segments are
//! published before any manifest that references them, uploads wait for the
//! file to become non-empty, failures are retried with capped multiplicative
//! backoff, and exhaustion is logged but never fatal to the run.

mod guard;
mod ledger;
mod local;
mod retry;
mod upload_manager;
mod webdav;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

pub use guard::{check_manifest_against_ledger, implied_max_sequences};
pub use ledger::{SegmentLedger, SegmentNamePattern};
pub use local::LocalPublisher;
pub use retry::BackoffPolicy;
pub use upload_manager::{FsEvent, SegmentWatcher, UploadManager, UploadManagerConfig};
pub use webdav::WebDavPublisher;

use crate::{Error, Result};

/// Knobs shared by all publisher strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    /// Retry/backoff policy for individual uploads.
    pub backoff: BackoffPolicy,
    /// Budget for a file to become non-empty before upload, in seconds.
    pub wait_for_nonempty_secs: f64,
    /// Fixed pause between the last segment upload and the manifest PUT, to
    /// absorb edge/CDN caching lag. Zero disables it.
    pub manifest_publish_delay_ms: u64,
    /// Whether remote deletion is performed at all.
    pub enable_delete: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            wait_for_nonempty_secs: 2.0,
            manifest_publish_delay_ms: 0,
            enable_delete: false,
        }
    }
}

/// Publishing destination, selected by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PublishTarget {
    /// Copy-through into a locally mounted directory.
    Local {
        dir: std::path::PathBuf,
        /// Public URL under which the directory is served, if any.
        public_base: Option<Url>,
    },
    /// WebDAV/HTTP-PUT remote.
    WebDav { base: Url },
    /// Discard everything; useful for dry runs and tests.
    NoOp,
}

/// A publishing strategy.
///
/// `relative` paths are forward-slash paths under the publish root (session
/// prefix included by the caller).
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a produced file (segment, init segment, subtitle, ...).
    async fn publish_file(&self, local: &Path, relative: &str) -> Result<()>;

    /// Publish the manifest, subject to the consistency guard.
    async fn publish_manifest(&self, local: &Path, relative: &str) -> Result<()>;

    /// Remove a previously published file. A no-op unless deletion is
    /// enabled; missing remote files are fine.
    async fn remove(&self, relative: &str) -> Result<()>;

    /// Public base URL clients can reach the published artifacts under.
    fn base_url(&self) -> Option<Url>;
}

/// Build a publisher for `target`.
pub fn create_publisher(
    target: &PublishTarget,
    segment_pattern: SegmentNamePattern,
    options: PublishOptions,
) -> Result<Arc<dyn Publisher>> {
    match target {
        PublishTarget::Local { dir, public_base } => Ok(Arc::new(LocalPublisher::new(
            dir.clone(),
            public_base.clone(),
            segment_pattern,
            options,
        ))),
        PublishTarget::WebDav { base } => Ok(Arc::new(WebDavPublisher::new(
            base.clone(),
            segment_pattern,
            options,
        )?)),
        PublishTarget::NoOp => Ok(Arc::new(NoOpPublisher)),
    }
}

/// Publisher that discards everything.
pub struct NoOpPublisher;

#[async_trait]
impl Publisher for NoOpPublisher {
    async fn publish_file(&self, _local: &Path, relative: &str) -> Result<()> {
        debug!(relative, "NoOp publish");
        Ok(())
    }

    async fn publish_manifest(&self, _local: &Path, relative: &str) -> Result<()> {
        debug!(relative, "NoOp manifest publish");
        Ok(())
    }

    async fn remove(&self, _relative: &str) -> Result<()> {
        Ok(())
    }

    fn base_url(&self) -> Option<Url> {
        None
    }
}

/// Poll interval for the readiness wait.
const READINESS_POLL: Duration = Duration::from_millis(100);

/// Wait for `path` to reach non-zero size, bounded by `budget`.
///
/// Returns the observed size. Packagers create segment files before writing
/// into them; publishing an empty file would hand CDNs a poisoned object, so
/// an empty file after the budget is an error.
pub(crate) async fn wait_for_nonempty(path: &Path, budget: Duration) -> Result<u64> {
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => return Ok(meta.len()),
            Ok(_) => {}
            // Not-yet-created counts as empty; anything else is surfaced.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_path("probing upload source", path, e)),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::publish(format!(
                "file still empty after {:.1}s: {}",
                budget.as_secs_f64(),
                path.display()
            )));
        }
        tokio::time::sleep(READINESS_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_wait_for_nonempty_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.m4s");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"data")
            .unwrap();
        let size = wait_for_nonempty(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(size, 4);
    }

    #[tokio::test]
    async fn test_wait_for_nonempty_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.m4s");
        std::fs::File::create(&path).unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            std::fs::write(&writer_path, b"payload").unwrap();
        });

        let size = wait_for_nonempty(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(size, 7);
    }

    #[tokio::test]
    async fn test_wait_for_nonempty_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.m4s");
        std::fs::File::create(&path).unwrap();

        let err = wait_for_nonempty(&path, Duration::from_millis(300)).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_publish_target_serde() {
        let target: PublishTarget = serde_json::from_str(
            r#"{"mode": "web_dav", "base": "https://edge.example.com/live/"}"#,
        )
        .unwrap();
        assert!(matches!(target, PublishTarget::WebDav { .. }));
    }
}

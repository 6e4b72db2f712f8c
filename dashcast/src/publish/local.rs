//! Copy-through publisher for locally mounted storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use super::ledger::{SegmentLedger, SegmentNamePattern};
use super::{PublishOptions, Publisher, guard, wait_for_nonempty};
use crate::util::fs;
use crate::{Error, Result};

/// Publishes by copying into a destination directory.
///
/// Shares the full publisher contract with the WebDAV strategy: readiness
/// wait, segments-before-manifest guard, forward-only ledger. Retries are
/// pointless for local copies, so IO errors surface after a single attempt.
pub struct LocalPublisher {
    dest: PathBuf,
    public_base: Option<Url>,
    options: PublishOptions,
    pattern: SegmentNamePattern,
    ledger: SegmentLedger,
}

impl LocalPublisher {
    pub fn new(
        dest: PathBuf,
        public_base: Option<Url>,
        pattern: SegmentNamePattern,
        options: PublishOptions,
    ) -> Self {
        Self {
            dest,
            public_base,
            options,
            pattern,
            ledger: SegmentLedger::new(),
        }
    }

    /// Confirmed-upload ledger, exposed for the manifest guard and tests.
    pub fn ledger(&self) -> &SegmentLedger {
        &self.ledger
    }

    fn destination(&self, relative: &str) -> PathBuf {
        let mut path = self.dest.clone();
        path.extend(relative.split('/').filter(|c| !c.is_empty()));
        path
    }

    fn wait_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.options.wait_for_nonempty_secs)
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish_file(&self, local: &Path, relative: &str) -> Result<()> {
        wait_for_nonempty(local, self.wait_budget()).await?;

        let dest = self.destination(relative);
        fs::ensure_parent_dir(&dest).await?;
        match tokio::fs::copy(local, &dest).await {
            Ok(bytes) => {
                debug!(relative, bytes, "Copied to local publish target");
            }
            // Source pruned between readiness check and copy: benign.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(relative, "Source disappeared before copy");
                return Ok(());
            }
            Err(e) => return Err(Error::io_path("copying to publish target", local, e)),
        }

        if let Some(file_name) = Path::new(relative).file_name().and_then(|n| n.to_str())
            && let Some((representation, sequence)) = self.pattern.parse(file_name)
        {
            self.ledger.record(&representation, sequence);
        }
        Ok(())
    }

    async fn publish_manifest(&self, local: &Path, relative: &str) -> Result<()> {
        let manifest = tokio::fs::read_to_string(local)
            .await
            .map_err(|e| Error::io_path("reading manifest", local, e))?;
        guard::check_manifest_against_ledger(&manifest, &self.ledger)?;

        if self.options.manifest_publish_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.options.manifest_publish_delay_ms,
            ))
            .await;
        }

        let dest = self.destination(relative);
        fs::ensure_parent_dir(&dest).await?;
        // Write through a temp name so readers never observe a torn manifest.
        let staging = dest.with_extension("mpd.tmp");
        tokio::fs::write(&staging, manifest.as_bytes())
            .await
            .map_err(|e| Error::io_path("writing manifest", &staging, e))?;
        tokio::fs::rename(&staging, &dest)
            .await
            .map_err(|e| Error::io_path("renaming manifest", &dest, e))?;
        debug!(relative, "Published manifest locally");
        Ok(())
    }

    async fn remove(&self, relative: &str) -> Result<()> {
        if !self.options.enable_delete {
            return Ok(());
        }
        let dest = self.destination(relative);
        if let Err(e) = fs::remove_file_quiet(&dest).await {
            warn!(relative, error = %e, "Failed to remove published file");
        }
        Ok(())
    }

    fn base_url(&self) -> Option<Url> {
        self.public_base.clone()
    }
}

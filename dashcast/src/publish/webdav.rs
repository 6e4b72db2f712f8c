//! WebDAV/HTTP-PUT publisher.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::ledger::{SegmentLedger, SegmentNamePattern};
use super::{PublishOptions, Publisher, guard, wait_for_nonempty};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes segments and manifests with `PUT`/`DELETE`/`MKCOL` against a
/// WebDAV base URL.
pub struct WebDavPublisher {
    client: reqwest::Client,
    base: Url,
    options: PublishOptions,
    pattern: SegmentNamePattern,
    ledger: SegmentLedger,
    /// Collections already created (or confirmed existing) this session.
    created_collections: Mutex<HashSet<String>>,
}

impl WebDavPublisher {
    pub fn new(base: Url, pattern: SegmentNamePattern, options: PublishOptions) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(Error::validation(format!("publish base is not a base URL: {base}")));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base,
            options,
            pattern,
            ledger: SegmentLedger::new(),
            created_collections: Mutex::new(HashSet::new()),
        })
    }

    /// Confirmed-upload ledger, exposed for tests.
    pub fn ledger(&self) -> &SegmentLedger {
        &self.ledger
    }

    fn target_url(&self, relative: &str) -> Result<Url> {
        self.base
            .join(relative.trim_start_matches('/'))
            .map_err(|e| Error::publish(format!("bad relative path {relative}: {e}")))
    }

    /// Lazily create the collection hierarchy for `relative`'s parents.
    ///
    /// `405 Method Not Allowed` and `409 Conflict` both mean the collection
    /// is already there on common WebDAV servers, so they count as success.
    async fn ensure_collections(&self, relative: &str) -> Result<()> {
        let components: Vec<&str> = relative
            .split('/')
            .filter(|c| !c.is_empty())
            .collect();
        if components.len() <= 1 {
            return Ok(());
        }

        let mut prefix = String::new();
        for dir in &components[..components.len() - 1] {
            prefix.push_str(dir);
            prefix.push('/');

            if self.created_collections.lock().contains(&prefix) {
                continue;
            }

            let url = self.target_url(&prefix)?;
            let status = self
                .client
                .request(Method::from_bytes(b"MKCOL").expect("valid method"), url.clone())
                .send()
                .await?
                .status();

            if status.is_success()
                || status == StatusCode::METHOD_NOT_ALLOWED
                || status == StatusCode::CONFLICT
            {
                debug!(collection = %prefix, %status, "Collection ready");
                self.created_collections.lock().insert(prefix.clone());
            } else {
                return Err(Error::publish(format!(
                    "MKCOL {url} failed with {status}"
                )));
            }
        }
        Ok(())
    }

    /// PUT `body` at `relative`, retrying per the backoff policy.
    async fn put_with_retry(&self, relative: &str, body: Vec<u8>) -> Result<()> {
        let url = self.target_url(relative)?;
        let mut attempt = 0u32;

        loop {
            let result = self
                .client
                .put(url.clone())
                .body(body.clone())
                .send()
                .await
                .map_err(Error::from)
                .and_then(|response| {
                    let status = response.status();
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(Error::publish(format!("PUT {url} failed with {status}")))
                    }
                });

            match result {
                Ok(()) => return Ok(()),
                Err(e) if self.options.backoff.should_retry(attempt) => {
                    let delay = self.options.backoff.delay_for_attempt(attempt);
                    warn!(
                        relative,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upload failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        relative,
                        attempts = attempt + 1,
                        error = %e,
                        "Upload retries exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn wait_budget(&self) -> Duration {
        Duration::from_secs_f64(self.options.wait_for_nonempty_secs)
    }
}

#[async_trait]
impl Publisher for WebDavPublisher {
    async fn publish_file(&self, local: &Path, relative: &str) -> Result<()> {
        wait_for_nonempty(local, self.wait_budget()).await?;

        let body = match tokio::fs::read(local).await {
            Ok(body) => body,
            // Pruned between readiness check and read: benign.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(relative, "Source disappeared before upload");
                return Ok(());
            }
            Err(e) => return Err(Error::io_path("reading upload source", local, e)),
        };

        self.ensure_collections(relative).await?;
        self.put_with_retry(relative, body).await?;

        if let Some(file_name) = Path::new(relative).file_name().and_then(|n| n.to_str())
            && let Some((representation, sequence)) = self.pattern.parse(file_name)
        {
            self.ledger.record(&representation, sequence);
        }
        debug!(relative, "Uploaded");
        Ok(())
    }

    async fn publish_manifest(&self, local: &Path, relative: &str) -> Result<()> {
        let manifest = tokio::fs::read_to_string(local)
            .await
            .map_err(|e| Error::io_path("reading manifest", local, e))?;
        guard::check_manifest_against_ledger(&manifest, &self.ledger)?;

        if self.options.manifest_publish_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.options.manifest_publish_delay_ms))
                .await;
        }

        self.ensure_collections(relative).await?;
        self.put_with_retry(relative, manifest.into_bytes()).await?;
        debug!(relative, "Published manifest");
        Ok(())
    }

    async fn remove(&self, relative: &str) -> Result<()> {
        if !self.options.enable_delete {
            return Ok(());
        }

        let url = self.target_url(relative)?;
        let status = self.client.delete(url.clone()).send().await?.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(relative, %status, "Removed remote file");
            Ok(())
        } else {
            // Best effort; retried naturally when retention fires again.
            warn!(relative, %status, "DELETE failed");
            Ok(())
        }
    }

    fn base_url(&self) -> Option<Url> {
        Some(self.base.clone())
    }
}

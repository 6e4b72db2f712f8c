//! Event-driven publishing.
//!
//! A bounded worker pool consumes filesystem events for the session output
//! directory and drives the configured [`Publisher`]. The ordering rule lives
//! here: a manifest event waits for every segment-upload token registered
//! before it to finish (or time out) before the manifest itself is published,
//! which combined with the ledger guard keeps the manifest from ever
//! advertising a segment that is not durably available.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Publisher;

/// Filesystem events the upload workers consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file finished being written.
    Closed(PathBuf),
    /// A file was deleted.
    Removed(PathBuf),
    /// A file was renamed within the watched directory.
    Moved { from: PathBuf, to: PathBuf },
}

/// Configuration for the upload manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadManagerConfig {
    /// Maximum concurrent uploads.
    pub workers: usize,
    /// How long a manifest upload waits for earlier segment tokens.
    pub manifest_wait_timeout_secs: f64,
}

impl Default for UploadManagerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            manifest_wait_timeout_secs: 5.0,
        }
    }
}

/// In-flight upload tokens: token id -> relative path.
struct Inflight {
    tokens: parking_lot::Mutex<HashMap<u64, String>>,
    next: AtomicU64,
    notify: Notify,
}

impl Inflight {
    fn new() -> Self {
        Self {
            tokens: parking_lot::Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }

    fn register(&self, relative: &str) -> u64 {
        let token = self.next.fetch_add(1, Ordering::Relaxed);
        self.tokens.lock().insert(token, relative.to_string());
        token
    }

    fn complete(&self, token: u64) {
        self.tokens.lock().remove(&token);
        self.notify.notify_waiters();
    }

    fn outstanding(&self) -> HashSet<u64> {
        self.tokens.lock().keys().copied().collect()
    }

    fn pending_among(&self, watched: &HashSet<u64>) -> usize {
        let tokens = self.tokens.lock();
        watched.iter().filter(|t| tokens.contains_key(t)).count()
    }

    /// Wait until none of `watched` is in flight, bounded by `timeout`.
    /// Returns false when the wait timed out with tokens still pending.
    async fn wait_for(&self, watched: HashSet<u64>, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.pending_among(&watched) == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.pending_among(&watched) == 0;
                }
            }
        }
    }
}

/// Bounded worker pool publishing files as the filesystem produces them.
pub struct UploadManager {
    publisher: Arc<dyn Publisher>,
    /// Watched session output directory.
    root: PathBuf,
    /// Storage prefix prepended to relative paths (session subpath).
    prefix: String,
    manifest_name: String,
    config: UploadManagerConfig,
    inflight: Arc<Inflight>,
    cancel: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UploadManager {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        root: PathBuf,
        prefix: impl Into<String>,
        manifest_name: impl Into<String>,
        config: UploadManagerConfig,
    ) -> Self {
        Self {
            publisher,
            root,
            prefix: into_prefix(prefix.into()),
            manifest_name: manifest_name.into(),
            config,
            inflight: Arc::new(Inflight::new()),
            cancel: CancellationToken::new(),
            dispatcher: parking_lot::Mutex::new(None),
        }
    }

    /// Start consuming events. May only be called once.
    pub fn start(&self, mut events: mpsc::Receiver<FsEvent>) {
        let publisher = self.publisher.clone();
        let root = self.root.clone();
        let prefix = self.prefix.clone();
        let manifest_name = self.manifest_name.clone();
        let inflight = self.inflight.clone();
        let cancel = self.cancel.clone();
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let manifest_wait = Duration::from_secs_f64(self.config.manifest_wait_timeout_secs);

        info!(workers = self.config.workers, root = %root.display(), "Upload manager started");

        let handle = tokio::spawn(async move {
            let mut workers: JoinSet<()> = JoinSet::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Upload manager shutting down");
                        workers.shutdown().await;
                        break;
                    }
                    event = events.recv() => {
                        let Some(event) = event else {
                            // Watcher gone; drain what is already queued.
                            while workers.join_next().await.is_some() {}
                            break;
                        };
                        dispatch(
                            event,
                            &publisher,
                            &root,
                            &prefix,
                            &manifest_name,
                            &inflight,
                            &semaphore,
                            manifest_wait,
                            &mut workers,
                        );
                    }
                    // Reap finished uploads so the set stays small.
                    Some(_) = workers.join_next(), if !workers.is_empty() => {}
                }
            }
        });

        *self.dispatcher.lock() = Some(handle);
    }

    /// Stop the pool; outstanding uploads are aborted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Upload manager stopped");
    }
}

fn into_prefix(prefix: String) -> String {
    let trimmed = prefix.trim_matches('/');
    trimmed.to_string()
}

/// Relative storage path for `path` under `root`, with the session prefix.
fn storage_path(root: &Path, prefix: &str, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_str()?.replace('\\', "/");
    if rel.is_empty() {
        return None;
    }
    if prefix.is_empty() {
        Some(rel)
    } else {
        Some(format!("{prefix}/{rel}"))
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch(
    event: FsEvent,
    publisher: &Arc<dyn Publisher>,
    root: &Path,
    prefix: &str,
    manifest_name: &str,
    inflight: &Arc<Inflight>,
    semaphore: &Arc<Semaphore>,
    manifest_wait: Duration,
    workers: &mut JoinSet<()>,
) {
    match event {
        FsEvent::Closed(path) => {
            let Some(relative) = storage_path(root, prefix, &path) else {
                debug!(path = %path.display(), "Ignoring event outside session root");
                return;
            };

            let is_manifest = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n == manifest_name);

            if is_manifest {
                // Wait for every segment registered before this manifest
                // event, then publish.
                let watched = inflight.outstanding();
                let publisher = publisher.clone();
                let inflight = inflight.clone();
                workers.spawn(async move {
                    if !inflight.wait_for(watched, manifest_wait).await {
                        warn!(relative, "Manifest wait timed out with uploads pending");
                    }
                    if let Err(e) = publisher.publish_manifest(&path, &relative).await {
                        // Guard refusals retry naturally on the next update.
                        warn!(relative, error = %e, "Manifest publish skipped");
                    }
                });
            } else {
                let token = inflight.register(&relative);
                let publisher = publisher.clone();
                let inflight = inflight.clone();
                let semaphore = semaphore.clone();
                workers.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    if let Err(e) = publisher.publish_file(&path, &relative).await {
                        error!(relative, error = %e, "Upload failed");
                    }
                    inflight.complete(token);
                });
            }
        }
        FsEvent::Removed(path) => {
            let Some(relative) = storage_path(root, prefix, &path) else {
                return;
            };
            let publisher = publisher.clone();
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                if let Err(e) = publisher.remove(&relative).await {
                    warn!(relative, error = %e, "Remote removal failed");
                }
            });
        }
        FsEvent::Moved { from, to } => {
            dispatch(
                FsEvent::Removed(from),
                publisher,
                root,
                prefix,
                manifest_name,
                inflight,
                semaphore,
                manifest_wait,
                workers,
            );
            dispatch(
                FsEvent::Closed(to),
                publisher,
                root,
                prefix,
                manifest_name,
                inflight,
                semaphore,
                manifest_wait,
                workers,
            );
        }
    }
}

/// Poll-based watcher synthesizing close/delete events for a directory.
///
/// A file counts as closed once its size and mtime hold still across one
/// poll interval; packagers write segments in one pass, so stability is an
/// adequate close signal without platform notification APIs.
pub struct SegmentWatcher {
    dir: PathBuf,
    interval: Duration,
}

#[derive(Clone, PartialEq, Eq)]
struct FileSig {
    len: u64,
    mtime: Option<std::time::SystemTime>,
}

impl SegmentWatcher {
    pub fn new(dir: PathBuf, interval: Duration) -> Self {
        Self { dir, interval }
    }

    /// Spawn the watch loop; events go to `tx` until cancelled.
    pub fn spawn(self, tx: mpsc::Sender<FsEvent>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // path -> (signature, emitted-at-signature)
            let mut seen: HashMap<PathBuf, (FileSig, Option<FileSig>)> = HashMap::new();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(dir = %self.dir.display(), "Segment watcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if Self::scan(&self.dir, &mut seen, &tx).await.is_err() {
                            // Receiver gone; no point continuing.
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn scan(
        dir: &Path,
        seen: &mut HashMap<PathBuf, (FileSig, Option<FileSig>)>,
        tx: &mpsc::Sender<FsEvent>,
    ) -> std::result::Result<(), ()> {
        let mut current: HashMap<PathBuf, FileSig> = HashMap::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()), // Directory not there yet, or being torn down.
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            // Skip pipes, directories and staging files.
            if !meta.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            current.insert(
                path,
                FileSig {
                    len: meta.len(),
                    mtime: meta.modified().ok(),
                },
            );
        }

        // Deletions.
        let gone: Vec<PathBuf> = seen
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();
        for path in gone {
            seen.remove(&path);
            tx.send(FsEvent::Removed(path)).await.map_err(|_| ())?;
        }

        // Additions and modifications: emit once stable across a tick.
        for (path, sig) in current {
            match seen.get_mut(&path) {
                Some((last, emitted)) => {
                    if *last == sig {
                        if emitted.as_ref() != Some(&sig) && sig.len > 0 {
                            *emitted = Some(sig.clone());
                            tx.send(FsEvent::Closed(path)).await.map_err(|_| ())?;
                        }
                    } else {
                        *last = sig;
                    }
                }
                None => {
                    seen.insert(path, (sig, None));
                }
            }
        }

        Ok(())
    }
}

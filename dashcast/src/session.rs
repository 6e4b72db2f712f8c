//! Session identity and retention-bounded pruning of run directories.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::settings::{EncoderSettings, SessionRequest};
use crate::util::fs;
use crate::{Error, Result};

/// Identity of one live-transcode run.
///
/// Exists only while the run's background unit is alive; `session_prefix` is
/// the storage subpath published artifacts land under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    pub session_prefix: String,
    pub retain_sessions: Vec<String>,
    /// Output directory allocated for this session.
    pub dir: PathBuf,
}

#[derive(Debug, Default)]
struct ManagerState {
    /// Session whose run is currently alive.
    current: Option<String>,
    /// Directories this manager created, by session id. Pruning never
    /// touches anything else.
    created: HashMap<String, PathBuf>,
    /// Most recent session ids, newest first, bounded by the retention count.
    recent: VecDeque<String>,
}

/// Allocates session directories and prunes stale ones.
///
/// The created-directory history is in-memory only: after a process restart
/// the manager re-learns what it creates and leaves unrecognized directories
/// alone, trading missed pruning across restarts for never deleting a
/// directory it does not own.
#[derive(Default)]
pub struct SessionManager {
    state: Mutex<ManagerState>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a session: idempotently create its directory under the settings'
    /// output root and prune stale directories outside the preserve set.
    ///
    /// The preserve set is the new session, the request's explicit `retain`
    /// ids, and the `session_retention` most recent sessions.
    pub async fn begin(
        &self,
        settings: &EncoderSettings,
        request: &SessionRequest,
    ) -> Result<SessionContext> {
        let session_id = match &request.id {
            Some(id) if !id.is_empty() => sanitize_id(id)?,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let session_prefix = request
            .segment_prefix
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| session_id.clone());

        let dir = settings.output_root.join(&session_id);
        fs::ensure_dir_all(&dir).await?;

        let prune_candidates = {
            let mut state = self.state.lock();
            state.created.insert(session_id.clone(), dir.clone());
            state.current = Some(session_id.clone());

            // Refresh the recency history: newest first, no duplicates.
            state.recent.retain(|id| id != &session_id);
            state.recent.push_front(session_id.clone());
            state.recent.truncate(settings.session_retention.max(1));

            let mut preserve: HashSet<&String> = state.recent.iter().collect();
            preserve.insert(&session_id);
            preserve.extend(request.retain.iter());

            let candidates: Vec<(String, PathBuf)> = state
                .created
                .iter()
                .filter(|(id, _)| !preserve.contains(id))
                .map(|(id, path)| (id.clone(), path.clone()))
                .collect();
            candidates
        };

        for (stale_id, path) in prune_candidates {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    info!(session = stale_id, "Pruned stale session directory");
                    self.state.lock().created.remove(&stale_id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.state.lock().created.remove(&stale_id);
                }
                Err(e) => warn!(session = stale_id, error = %e, "Failed to prune session"),
            }
        }

        debug!(session = session_id, dir = %dir.display(), "Session began");

        Ok(SessionContext {
            session_id,
            session_prefix,
            retain_sessions: request.retain.clone(),
            dir,
        })
    }

    /// Clear the "current" pointer, but only when it still belongs to `ctx`:
    /// a stale completion must not clobber a newer session.
    pub fn complete(&self, ctx: &SessionContext) {
        let mut state = self.state.lock();
        if state.current.as_deref() == Some(ctx.session_id.as_str()) {
            state.current = None;
            debug!(session = ctx.session_id, "Session completed");
        } else {
            debug!(session = ctx.session_id, "Stale session completion ignored");
        }
    }

    /// Currently active session id, if any.
    pub fn current(&self) -> Option<String> {
        self.state.lock().current.clone()
    }
}

/// Session ids become directory names; refuse anything that could escape the
/// output root.
fn sanitize_id(id: &str) -> Result<String> {
    if id.contains(['/', '\\']) || id == "." || id == ".." {
        return Err(Error::Session(format!("invalid session id: {id}")));
    }
    Ok(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(root: &std::path::Path, retention: usize) -> EncoderSettings {
        let mut settings = EncoderSettings::default().with_output_root(root);
        settings.session_retention = retention;
        settings
    }

    fn request(id: &str) -> SessionRequest {
        SessionRequest {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_begin_creates_directory_idempotently() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 2);

        let ctx = manager.begin(&settings, &request("a")).await.unwrap();
        assert_eq!(ctx.session_id, "a");
        assert_eq!(ctx.session_prefix, "a");
        assert_eq!(ctx.dir, root.path().join("a"));
        assert!(ctx.dir.is_dir());

        // Same id again is fine.
        manager.begin(&settings, &request("a")).await.unwrap();
        assert!(ctx.dir.is_dir());
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest_created() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 2);

        manager.begin(&settings, &request("a")).await.unwrap();
        manager.begin(&settings, &request("b")).await.unwrap();
        manager.begin(&settings, &request("c")).await.unwrap();

        // Retention 2 keeps the two most recent (b, c); a is pruned.
        assert!(!root.path().join("a").exists());
        assert!(root.path().join("b").is_dir());
        assert!(root.path().join("c").is_dir());
    }

    #[tokio::test]
    async fn test_explicit_retain_survives() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 1);

        manager.begin(&settings, &request("a")).await.unwrap();
        manager.begin(&settings, &request("b")).await.unwrap();
        let mut req = request("c");
        req.retain = vec!["a".to_string()];
        manager.begin(&settings, &req).await.unwrap();

        assert!(root.path().join("a").is_dir(), "explicitly retained");
        assert!(!root.path().join("b").exists());
        assert!(root.path().join("c").is_dir());
    }

    #[tokio::test]
    async fn test_never_deletes_unknown_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("operator-data")).unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 1);

        manager.begin(&settings, &request("a")).await.unwrap();
        manager.begin(&settings, &request("b")).await.unwrap();

        assert!(root.path().join("operator-data").is_dir());
    }

    #[tokio::test]
    async fn test_stale_completion_ignored() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 2);

        let old = manager.begin(&settings, &request("a")).await.unwrap();
        let new = manager.begin(&settings, &request("b")).await.unwrap();

        // Completing the old session must not clear the newer current.
        manager.complete(&old);
        assert_eq!(manager.current().as_deref(), Some("b"));

        manager.complete(&new);
        assert_eq!(manager.current(), None);
    }

    #[tokio::test]
    async fn test_generated_id_and_prefix_override() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 2);

        let req = SessionRequest {
            id: None,
            retain: vec![],
            segment_prefix: Some("live/channel-4".to_string()),
        };
        let ctx = manager.begin(&settings, &req).await.unwrap();
        assert!(!ctx.session_id.is_empty());
        assert_eq!(ctx.session_prefix, "live/channel-4");
    }

    #[tokio::test]
    async fn test_rejects_path_escaping_ids() {
        let root = tempfile::tempdir().unwrap();
        let manager = SessionManager::new();
        let settings = settings(root.path(), 2);
        assert!(manager.begin(&settings, &request("../evil")).await.is_err());
    }
}

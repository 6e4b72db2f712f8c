//! Status snapshots and their broadcast to the keyed store + pub/sub channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::TranscoderState;
use crate::subtitles::SubtitleTrack;
use crate::{Error, Result};

/// Snapshot of the controller, rebuilt fresh on every read and never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderStatus {
    pub state: TranscoderState,
    pub running: bool,
    pub pid: Option<u32>,
    pub packager_pid: Option<u32>,
    pub output_dir: Option<String>,
    pub output_manifest: Option<String>,
    pub last_error: Option<String>,
    pub publish_base_url: Option<String>,
    pub manifest_url: Option<String>,
    pub subtitles: Vec<SubtitleTrack>,
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    pub origin: String,
    pub updated_at: DateTime<Utc>,
}

/// Configuration for the status store + channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusBroadcasterConfig {
    /// Store connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// First key component.
    pub key_prefix: String,
    /// Second key component.
    pub namespace: String,
    /// Final key component, typically the instance name.
    pub key: String,
    /// Channel the payload is additionally published on.
    pub channel: String,
    /// TTL for the stored snapshot; `None` stores without expiry.
    pub ttl_secs: Option<u64>,
}

impl Default for StatusBroadcasterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "dashcast".to_string(),
            namespace: "transcoder".to_string(),
            key: "status".to_string(),
            channel: "dashcast:events".to_string(),
            ttl_secs: Some(60),
        }
    }
}

impl StatusBroadcasterConfig {
    /// Namespaced key the snapshot is stored under.
    pub fn store_key(&self) -> String {
        format!("{}:{}:{}", self.key_prefix, self.namespace, self.key)
    }
}

/// Writes status snapshots to a namespaced key and publishes them on a
/// channel.
///
/// Connections are established lazily and re-established after failures; a
/// failed broadcast degrades to "status unavailable" without ever touching
/// controller state.
pub struct StatusBroadcaster {
    config: StatusBroadcasterConfig,
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
}

impl StatusBroadcaster {
    pub fn new(config: StatusBroadcasterConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::Status(format!("invalid store URL: {e}")))?;
        Ok(Self {
            config,
            client,
            conn: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Status(format!("store connection failed: {e}")))?;
        *cached = Some(conn.clone());
        debug!("Status store connected");
        Ok(conn)
    }

    async fn forget_connection(&self) {
        *self.conn.lock().await = None;
    }

    /// Store and publish one snapshot.
    pub async fn publish(&self, status: &TranscoderStatus) -> Result<()> {
        let payload = serde_json::to_string(status)?;
        let key = self.config.store_key();
        let mut conn = self.connection().await?;

        let store_result: redis::RedisResult<()> = match self.config.ttl_secs {
            Some(ttl) => conn.set_ex(&key, &payload, ttl).await,
            None => conn.set(&key, &payload).await,
        };
        if let Err(e) = store_result {
            self.forget_connection().await;
            return Err(Error::Status(format!("store write failed: {e}")));
        }

        let publish_result: redis::RedisResult<()> =
            conn.publish(&self.config.channel, &payload).await;
        if let Err(e) = publish_result {
            self.forget_connection().await;
            return Err(Error::Status(format!("channel publish failed: {e}")));
        }

        Ok(())
    }

    /// Best-effort broadcast: failures are logged and swallowed.
    pub async fn broadcast(&self, status: &TranscoderStatus) {
        if let Err(e) = self.publish(status).await {
            warn!(error = %e, "Status broadcast unavailable");
        }
    }
}

/// Periodically rebroadcast snapshots while a run is active.
pub fn spawn_heartbeat(
    broadcaster: Arc<StatusBroadcaster>,
    snapshot: impl Fn() -> TranscoderStatus + Send + 'static,
    interval_secs: u64,
    cancellation_token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_secs, "Status heartbeat started");

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!("Status heartbeat shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    broadcaster.broadcast(&snapshot()).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_key_layout() {
        let config = StatusBroadcasterConfig {
            key_prefix: "svc".to_string(),
            namespace: "live".to_string(),
            key: "node-1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.store_key(), "svc:live:node-1");
    }

    #[test]
    fn test_status_json_shape() {
        let status = TranscoderStatus {
            state: TranscoderState::Running,
            running: true,
            pid: Some(41),
            packager_pid: Some(42),
            output_dir: Some("/var/lib/dashcast/s1".to_string()),
            output_manifest: Some("/var/lib/dashcast/s1/manifest.mpd".to_string()),
            last_error: None,
            publish_base_url: Some("https://edge.example.com/live/".to_string()),
            manifest_url: Some("https://edge.example.com/live/s1/manifest.mpd".to_string()),
            subtitles: vec![],
            session_id: Some("s1".to_string()),
            log_file: None,
            origin: "node-1".to_string(),
            updated_at: Utc::now(),
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&status).unwrap()).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["running"], true);
        assert_eq!(json["pid"], 41);
        assert_eq!(json["packager_pid"], 42);
        assert_eq!(json["origin"], "node-1");
        assert!(json.get("log_file").is_none());
        assert!(json.get("updated_at").is_some());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = StatusBroadcasterConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(StatusBroadcaster::new(config).is_err());
    }
}

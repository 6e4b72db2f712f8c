//! Root controller: the state machine driving one live transcode at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::pipeline::DashTranscodePipeline;
use crate::pipeline::retention::{RetentionConfig, SegmentRetentionWorker};
use crate::probe::MediaTrackProbe;
use crate::publish::{
    PublishOptions, PublishTarget, SegmentNamePattern, SegmentWatcher, UploadManager,
    UploadManagerConfig, create_publisher,
};
use crate::runner::{RunOutcome, TranscodeRunner};
use crate::session::{SessionContext, SessionManager};
use crate::settings::{EncoderSettings, SessionRequest};
use crate::status::{StatusBroadcaster, StatusBroadcasterConfig, TranscoderStatus, spawn_heartbeat};
use crate::stop::StopStrategy;
use crate::subtitles::{SubtitlePreferences, SubtitleService, SubtitleTrack};
use crate::{Error, Result};

/// Controller states.
///
/// `PreparingSubtitles` is a side-state disjoint from the run lifecycle and
/// mutually exclusive with `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscoderState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
    PreparingSubtitles,
}

impl TranscoderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::PreparingSubtitles => "preparing_subtitles",
        }
    }

    /// Whether a run occupies the controller.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: TranscoderState) -> bool {
        use TranscoderState::*;

        match (self, target) {
            (from, to) if *from == to => true,
            (Idle, Starting | PreparingSubtitles) => true,
            (Starting, Running | Stopping | Error) => true,
            (Running, Stopping | Idle | Error) => true,
            (Stopping, Idle | Error) => true,
            (Error, Starting | Idle | PreparingSubtitles) => true,
            (PreparingSubtitles, Idle | Error) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TranscoderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Instance identifier reported in status snapshots.
    pub origin: String,
    /// Local media base URL used for `manifest_url` when a run has no
    /// publish base of its own.
    pub media_base_url: Option<Url>,
    /// Default publish destination when `start` is not given a publish URL.
    pub publish: PublishTarget,
    pub publish_options: PublishOptions,
    pub upload: UploadManagerConfig,
    pub stop: StopStrategy,
    /// Status store; `None` disables broadcasting.
    pub status: Option<StatusBroadcasterConfig>,
    /// Heartbeat rebroadcast interval while a run is active.
    pub heartbeat_interval_secs: u64,
    /// Budget for joining the background unit during `stop`.
    pub runner_join_timeout_secs: f64,
    /// Output directory poll interval for the upload watcher.
    pub watcher_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            origin: "dashcast".to_string(),
            media_base_url: None,
            publish: PublishTarget::NoOp,
            publish_options: PublishOptions::default(),
            upload: UploadManagerConfig::default(),
            stop: StopStrategy::default(),
            status: None,
            heartbeat_interval_secs: 10,
            runner_join_timeout_secs: 15.0,
            watcher_interval_ms: 500,
        }
    }
}

/// Controller-internal mutable state; single writer behind one mutex, readers
/// only ever get snapshots.
#[derive(Default)]
struct Inner {
    state: TranscoderState,
    last_error: Option<String>,
    encoder_pid: Option<u32>,
    packager_pid: Option<u32>,
    output_dir: Option<PathBuf>,
    manifest_path: Option<PathBuf>,
    manifest_rel: Option<String>,
    publish_base: Option<Url>,
    subtitle_tracks: Vec<SubtitleTrack>,
    session_id: Option<String>,
}

impl Inner {
    /// Apply a transition, logging (but tolerating) contract violations from
    /// racing completions.
    fn transition(&mut self, target: TranscoderState) {
        if self.state.can_transition_to(target) {
            debug!(from = %self.state, to = %target, "State transition");
            self.state = target;
        } else {
            warn!(from = %self.state, to = %target, "Refused state transition");
        }
    }
}

/// Everything owned by one live run; taking it out of the option is what
/// makes run finalization idempotent.
struct ActiveRun {
    pipeline: Arc<DashTranscodePipeline>,
    session: SessionContext,
    runner: Arc<TranscodeRunner>,
    upload: Arc<UploadManager>,
    /// Cancels the retention loop, the watcher and the status heartbeat.
    loops: CancellationToken,
}

/// State machine exposing start/stop/status/prepare-subtitles.
///
/// At most one live run per controller; all public operations are safe to
/// call concurrently.
pub struct Controller {
    config: ControllerConfig,
    sessions: SessionManager,
    broadcaster: Option<Arc<StatusBroadcaster>>,
    inner: Arc<parking_lot::Mutex<Inner>>,
    active: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Arc<Self>> {
        let broadcaster = match &config.status {
            Some(status_config) => Some(Arc::new(StatusBroadcaster::new(status_config.clone())?)),
            None => None,
        };
        Ok(Arc::new(Self {
            config,
            sessions: SessionManager::new(),
            broadcaster,
            inner: Arc::new(parking_lot::Mutex::new(Inner::default())),
            active: tokio::sync::Mutex::new(None),
        }))
    }

    /// Start a run.
    ///
    /// Returns false with no side effects while a run is active; also returns
    /// false when construction fails before any process is spawned, leaving
    /// the controller in `error` with `last_error` set.
    pub async fn start(
        self: &Arc<Self>,
        settings: EncoderSettings,
        publish_url: Option<Url>,
        subtitle_preferences: Option<SubtitlePreferences>,
        session_request: Option<SessionRequest>,
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_active() || inner.state == TranscoderState::PreparingSubtitles {
                debug!(state = %inner.state, "Start refused: run active");
                return false;
            }
            inner.transition(TranscoderState::Starting);
            inner.last_error = None;
        }
        self.broadcast_status().await;

        match self
            .start_run(settings, publish_url, subtitle_preferences, session_request)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Start failed");
                {
                    let mut inner = self.inner.lock();
                    inner.last_error = Some(e.to_string());
                    inner.transition(TranscoderState::Error);
                }
                self.broadcast_status().await;
                false
            }
        }
    }

    async fn start_run(
        self: &Arc<Self>,
        settings: EncoderSettings,
        publish_url: Option<Url>,
        subtitle_preferences: Option<SubtitlePreferences>,
        session_request: Option<SessionRequest>,
    ) -> Result<()> {
        settings.validate()?;

        let request = session_request.unwrap_or_default();
        let session = self.sessions.begin(&settings, &request).await?;

        match self
            .launch(settings, publish_url, subtitle_preferences, &session)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // No background unit came alive: the session must not linger.
                self.sessions.complete(&session);
                Err(e)
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        settings: EncoderSettings,
        publish_url: Option<Url>,
        subtitle_preferences: Option<SubtitlePreferences>,
        session: &SessionContext,
    ) -> Result<()> {
        let target = match &publish_url {
            Some(base) => PublishTarget::WebDav { base: base.clone() },
            None => self.config.publish.clone(),
        };
        let pattern = SegmentNamePattern::from_template(&settings.media_segment_template)?;
        let publisher = create_publisher(&target, pattern.clone(), self.config.publish_options.clone())?;

        // Subtitle extraction is best-effort and must never block the start.
        if let Some(preferences) = &subtitle_preferences {
            let service = SubtitleService::new(&settings);
            match service
                .prepare(
                    &settings,
                    &session.dir,
                    preferences,
                    publisher.base_url().as_ref(),
                    &session.session_prefix,
                )
                .await
            {
                Ok(tracks) => self.inner.lock().subtitle_tracks = tracks,
                Err(e) => warn!(error = %e, "Subtitle preparation failed, continuing"),
            }
        }

        let probe = MediaTrackProbe::new(&settings.probe_binary);
        let tracks = probe.probe(&settings.input).await?;

        let pipeline = Arc::new(
            DashTranscodePipeline::prepare(settings.clone(), session.dir.clone(), &tracks).await?,
        );

        let manifest_rel = if session.session_prefix.is_empty() {
            settings.manifest_name.clone()
        } else {
            format!("{}/{}", session.session_prefix, settings.manifest_name)
        };
        {
            let mut inner = self.inner.lock();
            inner.output_dir = Some(session.dir.clone());
            inner.manifest_path = Some(pipeline.manifest_path().to_path_buf());
            inner.manifest_rel = Some(manifest_rel);
            inner.publish_base = publisher.base_url();
            inner.session_id = Some(session.session_id.clone());
        }

        // Background loops: retention, watcher + uploads, heartbeat. One
        // token stops them all.
        let loops = CancellationToken::new();

        let retention = SegmentRetentionWorker::new(
            session.dir.clone(),
            pattern,
            RetentionConfig {
                keep_segments: settings.keep_segments,
                interval_secs: settings.retention_interval_secs,
            },
        );
        retention.start_background_task(loops.clone());

        let (event_tx, event_rx) = mpsc::channel(256);
        let watcher = SegmentWatcher::new(
            session.dir.clone(),
            Duration::from_millis(self.config.watcher_interval_ms.max(50)),
        );
        watcher.spawn(event_tx, loops.clone());

        let upload = Arc::new(UploadManager::new(
            publisher,
            session.dir.clone(),
            session.session_prefix.clone(),
            settings.manifest_name.clone(),
            self.config.upload.clone(),
        ));
        upload.start(event_rx);

        if let Some(broadcaster) = &self.broadcaster {
            let controller = Arc::clone(self);
            spawn_heartbeat(
                broadcaster.clone(),
                move || controller.status(None),
                self.config.heartbeat_interval_secs,
                loops.clone(),
            );
        }

        // Wire the processes last; everything before this point is
        // reversible without signals.
        let handles = match pipeline.spawn().await {
            Ok(handles) => handles,
            Err(e) => {
                loops.cancel();
                upload.stop().await;
                pipeline.cleanup_output().await;
                return Err(e);
            }
        };

        let on_started = {
            let controller = Arc::clone(self);
            Box::new(move |ids: crate::runner::ProcessIds| {
                {
                    let mut inner = controller.inner.lock();
                    inner.encoder_pid = ids.encoder;
                    inner.packager_pid = ids.packager;
                    inner.transition(TranscoderState::Running);
                }
                tokio::spawn(async move { controller.broadcast_status().await });
            }) as crate::runner::StartedCallback
        };

        let on_completed = {
            let controller = Arc::clone(self);
            Box::new(move |outcome: RunOutcome| {
                tokio::spawn(async move { controller.finalize_run(Some(outcome)).await });
            }) as crate::runner::CompletedCallback
        };

        let runner = Arc::new(TranscodeRunner::spawn(
            handles,
            self.config.stop.clone(),
            on_started,
            on_completed,
        ));

        *self.active.lock().await = Some(ActiveRun {
            pipeline,
            session: session.clone(),
            runner,
            upload,
            loops,
        });

        info!("Run started");
        Ok(())
    }

    /// Stop the active run.
    ///
    /// Returns false when nothing is running. Otherwise delegates to the stop
    /// ladder, joins the background unit with a bounded timeout, cleans the
    /// output tree and clears the session.
    pub async fn stop(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_active() {
                debug!(state = %inner.state, "Stop refused: nothing running");
                return false;
            }
            inner.transition(TranscoderState::Stopping);
        }
        self.broadcast_status().await;

        let runner = {
            let active = self.active.lock().await;
            active.as_ref().map(|run| {
                run.runner.cancel();
                run.runner.clone()
            })
        };
        if let Some(runner) = runner {
            let joined = runner
                .join(Duration::from_secs_f64(
                    self.config.runner_join_timeout_secs,
                ))
                .await;
            if !joined {
                warn!("Background unit did not finish within the stop budget");
            }
        }

        // Usually a no-op: the runner's completion callback finalizes first.
        self.finalize_run(None).await;

        {
            let mut inner = self.inner.lock();
            if inner.state == TranscoderState::Stopping {
                inner.transition(TranscoderState::Idle);
            }
        }
        self.broadcast_status().await;
        true
    }

    /// Tear down one run: stop the loops and the upload pool, clean the
    /// output tree, clear the session, settle the final state.
    ///
    /// Idempotent: whoever takes the `ActiveRun` does the work.
    async fn finalize_run(&self, outcome: Option<RunOutcome>) {
        let Some(run) = self.active.lock().await.take() else {
            return;
        };

        run.loops.cancel();
        run.upload.stop().await;
        run.pipeline.cleanup_output().await;
        self.sessions.complete(&run.session);

        {
            let mut inner = self.inner.lock();
            inner.encoder_pid = None;
            inner.packager_pid = None;
            inner.output_dir = None;
            inner.manifest_path = None;

            match &outcome {
                Some(outcome) if !outcome.clean() => {
                    let tail = outcome.stderr_tail.join("\n");
                    inner.last_error = Some(format!(
                        "pipeline failed (encoder exit {:?}, packager exit {:?}){}{}",
                        outcome.encoder_exit,
                        outcome.packager_exit,
                        if tail.is_empty() { "" } else { ": " },
                        tail
                    ));
                    inner.transition(TranscoderState::Error);
                }
                _ => {
                    if inner.state != TranscoderState::Error {
                        inner.transition(TranscoderState::Idle);
                    }
                }
            }
        }
        self.broadcast_status().await;
        info!("Run finalized");
    }

    /// Pure status snapshot.
    ///
    /// `manifest_url` prefers the session's publish base, falling back to
    /// `local_base_override` and then the configured local media base.
    pub fn status(&self, local_base_override: Option<&Url>) -> TranscoderStatus {
        let inner = self.inner.lock();

        let manifest_url = inner.manifest_rel.as_ref().and_then(|rel| {
            inner
                .publish_base
                .as_ref()
                .or(local_base_override)
                .or(self.config.media_base_url.as_ref())
                .and_then(|base| base.join(rel).ok())
                .map(|u| u.to_string())
        });

        TranscoderStatus {
            state: inner.state,
            running: inner.state.is_active(),
            pid: inner.encoder_pid,
            packager_pid: inner.packager_pid,
            output_dir: inner
                .output_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            output_manifest: inner
                .manifest_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            last_error: inner.last_error.clone(),
            publish_base_url: inner.publish_base.as_ref().map(|u| u.to_string()),
            manifest_url,
            subtitles: inner.subtitle_tracks.clone(),
            session_id: inner.session_id.clone(),
            log_file: None,
            origin: self.config.origin.clone(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Extract subtitles synchronously and update the shared track list used
    /// by the next `start`.
    ///
    /// Fails when a transcode run is active.
    pub async fn prepare_subtitles(
        &self,
        settings: EncoderSettings,
        publish_url: Option<Url>,
        preferences: SubtitlePreferences,
    ) -> Result<Vec<SubtitleTrack>> {
        {
            let mut inner = self.inner.lock();
            if inner.state.is_active() {
                return Err(Error::InvalidStateTransition {
                    from: inner.state.as_str().to_string(),
                    to: TranscoderState::PreparingSubtitles.as_str().to_string(),
                });
            }
            inner.transition(TranscoderState::PreparingSubtitles);
        }
        self.broadcast_status().await;

        let result = async {
            settings.validate()?;
            let out_dir = settings.output_root.join("subtitles");
            let service = SubtitleService::new(&settings);
            service
                .prepare(
                    &settings,
                    &out_dir,
                    &preferences,
                    publish_url.as_ref(),
                    "subtitles",
                )
                .await
        }
        .await;

        {
            let mut inner = self.inner.lock();
            match &result {
                Ok(tracks) => inner.subtitle_tracks = tracks.clone(),
                Err(e) => inner.last_error = Some(e.to_string()),
            }
            inner.transition(TranscoderState::Idle);
        }
        self.broadcast_status().await;
        result
    }

    async fn broadcast_status(&self) {
        if let Some(broadcaster) = &self.broadcaster {
            let status = self.status(None);
            broadcaster.broadcast(&status).await;
        }
    }
}

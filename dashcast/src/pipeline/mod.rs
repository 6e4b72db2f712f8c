//! Encoder + packager pipeline wiring.
//!
//! The pipeline allocates the session output directory, creates one named
//! pipe per selected track, then launches the encoder writing fragmented
//! media into the pipes while the packager reads them concurrently and emits
//! numbered segments, one init segment per representation and the shared
//! manifest.

pub mod retention;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::binding::{StreamBinding, StreamBindingBuilder, synthesize_adaptation_sets};
use crate::probe::MediaTrack;
use crate::settings::EncoderSettings;
use crate::util::fs;
use crate::{Error, Result};

/// Lines of child stderr kept for `last_error` context.
const STDERR_TAIL_LINES: usize = 32;

/// Shared tail of the most recent child stderr lines.
pub type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Running child processes of one pipeline launch.
pub struct PipelineHandles {
    pub encoder: Child,
    pub packager: Child,
    pub encoder_pid: Option<u32>,
    pub packager_pid: Option<u32>,
    pub stderr_tail: StderrTail,
}

/// One wired transcode run: session directory, pipes, commands.
pub struct DashTranscodePipeline {
    settings: EncoderSettings,
    session_dir: PathBuf,
    bindings: Vec<StreamBinding>,
    manifest_path: PathBuf,
}

impl DashTranscodePipeline {
    /// Allocate the output directory, select tracks and create the pipes.
    ///
    /// Fails fast, with no process spawned, when no usable track remains
    /// after the per-type caps.
    pub async fn prepare(
        settings: EncoderSettings,
        session_dir: PathBuf,
        tracks: &[MediaTrack],
    ) -> Result<Self> {
        settings.validate()?;
        fs::ensure_dir_all(&session_dir).await?;

        let bindings = StreamBindingBuilder::new(&settings, &session_dir).build(tracks)?;
        let manifest_path = session_dir.join(&settings.manifest_name);

        // Pipes must exist before the encoder first writes; stale ones from a
        // crashed run are replaced.
        for (index, binding) in bindings.iter().enumerate() {
            fs::remove_file_quiet(&binding.pipe_path).await?;
            if let Err(e) = process_utils::create_fifo(&binding.pipe_path) {
                for created in &bindings[..index] {
                    created.remove_pipe();
                }
                return Err(Error::io_path("creating pipe", &binding.pipe_path, e));
            }
        }

        let sets = synthesize_adaptation_sets(&bindings);
        info!(
            session_dir = %session_dir.display(),
            bindings = bindings.len(),
            adaptation_sets = sets.len(),
            "Pipeline prepared"
        );

        Ok(Self {
            settings,
            session_dir,
            bindings,
            manifest_path,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn bindings(&self) -> &[StreamBinding] {
        &self.bindings
    }

    /// Encoder argument list: one fragmented-MP4 output per pipe.
    pub fn encoder_args(&self) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "warning".to_string(),
            "-re".to_string(),
            "-i".to_string(),
            self.settings.input.to_string_lossy().to_string(),
        ];
        for binding in &self.bindings {
            args.extend(binding.encoder_args.iter().cloned());
        }
        args
    }

    /// Packager argument list: stream descriptors in representation order,
    /// then live-window parameters and the manifest output.
    pub fn packager_args(&self) -> Vec<String> {
        let settings = &self.settings;
        let mut args: Vec<String> = self
            .bindings
            .iter()
            .map(|b| b.descriptor(&self.session_dir))
            .collect();

        let segment_duration = settings.segment_duration_secs;
        args.extend([
            "--segment_duration".to_string(),
            format!("{segment_duration}"),
            "--fragment_duration".to_string(),
            format!("{}", settings.fragment_duration()),
            "--time_shift_buffer_depth".to_string(),
            format!("{}", segment_duration * settings.window_size as f64),
            "--preserved_segments_outside_live_window".to_string(),
            settings.extra_window_size.to_string(),
            "--min_buffer_time".to_string(),
            format!("{segment_duration}"),
            "--mpd_output".to_string(),
            self.manifest_path.to_string_lossy().to_string(),
        ]);
        args
    }

    /// Launch the packager, then the encoder.
    ///
    /// Both ends of each pipe block on open until the other side arrives, so
    /// the two processes must be spawned before either is waited on.
    pub async fn spawn(&self) -> Result<PipelineHandles> {
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));

        let mut packager = process_utils::tokio_command(&self.settings.packager_binary)
            .args(self.packager_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "failed to spawn {}: {e}",
                    self.settings.packager_binary
                ))
            })?;
        drain_stderr(&mut packager, "packager", stderr_tail.clone());

        let encoder = process_utils::tokio_command(&self.settings.encoder_binary)
            .args(self.encoder_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Process(format!(
                    "failed to spawn {}: {e}",
                    self.settings.encoder_binary
                ))
            });

        let mut encoder = match encoder {
            Ok(encoder) => encoder,
            Err(e) => {
                // Encoder failed to come up: don't leave the packager
                // blocked on pipes that will never be written.
                let _ = packager.start_kill();
                return Err(e);
            }
        };
        drain_stderr(&mut encoder, "encoder", stderr_tail.clone());

        let encoder_pid = encoder.id();
        let packager_pid = packager.id();
        info!(?encoder_pid, ?packager_pid, "Pipeline processes started");

        Ok(PipelineHandles {
            encoder,
            packager,
            encoder_pid,
            packager_pid,
            stderr_tail,
        })
    }

    /// Remove the manifest, produced files, pipes and the now-empty session
    /// directory. Used only on run completion or explicit stop.
    pub async fn cleanup_output(&self) {
        fs::remove_file_quiet(&self.manifest_path).await.ok();

        for binding in &self.bindings {
            binding.remove_pipe();
        }

        match tokio::fs::read_dir(&self.session_dir).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                    let result = if is_dir {
                        tokio::fs::remove_dir_all(&path).await
                    } else {
                        tokio::fs::remove_file(&path).await
                    };
                    match result {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "Cleanup failed"),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(dir = %self.session_dir.display(), error = %e, "Cleanup walk failed");
                return;
            }
        }

        if let Err(e) = fs::remove_dir_quiet(&self.session_dir).await {
            warn!(error = %e, "Failed to remove session directory");
        } else {
            debug!(dir = %self.session_dir.display(), "Output cleaned");
        }
    }
}

/// Drain a child's stderr into the log and the shared tail buffer.
fn drain_stderr(child: &mut Child, name: &'static str, tail: StderrTail) {
    let Some(stderr) = child.stderr.take() else {
        return;
    };
    tokio::spawn(async move {
        let reader = BufReader::new(stderr);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = name, "{line}");
            let mut tail = tail.lock();
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(format!("{name}: {line}"));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TrackKind;

    fn track(kind: TrackKind, relative_index: usize) -> MediaTrack {
        MediaTrack {
            kind,
            source_index: relative_index,
            relative_index,
            codec: "h264".to_string(),
            language: None,
            title: None,
            channels: None,
            sample_rate: None,
            frame_rate: None,
            forced: false,
            default: false,
            hearing_impaired: false,
            commentary: false,
        }
    }

    async fn prepared_pipeline() -> (tempfile::TempDir, DashTranscodePipeline) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("source.mkv");
        std::fs::write(&input, b"x").unwrap();
        let settings = EncoderSettings::new(&input)
            .with_output_root(dir.path().join("out"))
            .with_track_caps(1, 1);
        let session_dir = dir.path().join("out/session-a");
        let tracks = vec![track(TrackKind::Video, 0), track(TrackKind::Audio, 0)];
        let pipeline = DashTranscodePipeline::prepare(settings, session_dir, &tracks)
            .await
            .unwrap();
        (dir, pipeline)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_creates_pipes() {
        let (_dir, pipeline) = prepared_pipeline().await;
        assert_eq!(pipeline.bindings().len(), 2);
        for binding in pipeline.bindings() {
            let meta = std::fs::metadata(&binding.pipe_path).unwrap();
            assert!(!meta.is_file(), "expected a FIFO at {:?}", binding.pipe_path);
        }
    }

    #[tokio::test]
    async fn test_prepare_fails_without_usable_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("source.mkv");
        std::fs::write(&input, b"x").unwrap();
        let settings = EncoderSettings::new(&input)
            .with_output_root(dir.path().join("out"))
            .with_track_caps(1, 1);
        let result = DashTranscodePipeline::prepare(
            settings,
            dir.path().join("out/session-a"),
            &[track(TrackKind::Subtitle, 0)],
        )
        .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_shapes() {
        let (_dir, pipeline) = prepared_pipeline().await;

        let encoder_args = pipeline.encoder_args();
        assert!(encoder_args.contains(&"-re".to_string()));
        assert!(encoder_args.contains(&"-i".to_string()));
        assert_eq!(
            encoder_args.iter().filter(|a| *a == "-map").count(),
            2,
            "one -map per binding"
        );

        let packager_args = pipeline.packager_args();
        assert!(packager_args[0].starts_with("in="));
        assert!(packager_args[1].starts_with("in="));
        assert!(packager_args.contains(&"--segment_duration".to_string()));
        assert!(packager_args.contains(&"--mpd_output".to_string()));
        // Default 2s segments, window of 10 => 20s time-shift buffer.
        let depth_index = packager_args
            .iter()
            .position(|a| a == "--time_shift_buffer_depth")
            .unwrap();
        assert_eq!(packager_args[depth_index + 1], "20");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_removes_everything() {
        let (_dir, pipeline) = prepared_pipeline().await;
        let session_dir = pipeline.session_dir().to_path_buf();
        std::fs::write(session_dir.join("manifest.mpd"), b"mpd").unwrap();
        std::fs::write(session_dir.join("chunk-0-00001.m4s"), b"seg").unwrap();
        std::fs::write(session_dir.join("init-0.m4s"), b"init").unwrap();

        pipeline.cleanup_output().await;
        assert!(!session_dir.exists());
    }
}

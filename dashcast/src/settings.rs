//! Immutable run configuration for one transcode session.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Placeholder expanded to the representation id in naming templates.
pub const REPRESENTATION_ID_PLACEHOLDER: &str = "$RepresentationID$";

/// Run configuration for the encoder + packager pair.
///
/// Created once per run and validated at construction; nothing here changes
/// while the run is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Source file or device to encode.
    pub input: PathBuf,
    /// Root directory under which per-session output directories are created.
    pub output_root: PathBuf,
    /// Encoder binary.
    pub encoder_binary: String,
    /// Packager binary.
    pub packager_binary: String,
    /// Probe binary.
    pub probe_binary: String,
    /// Video codec arguments, e.g. `["-c:v", "libx264", "-preset", "veryfast"]`.
    pub video_codec_args: Vec<String>,
    /// Audio codec arguments, e.g. `["-c:a", "aac", "-b:a", "128k"]`.
    pub audio_codec_args: Vec<String>,
    /// Optional video filter graph (`-vf`).
    pub video_filter: Option<String>,
    /// Optional audio filter graph (`-af`).
    pub audio_filter: Option<String>,
    /// DASH segment duration in seconds.
    pub segment_duration_secs: f64,
    /// Encoder fragment duration in seconds. When unset, derived from the
    /// segment duration so fragment boundaries align with segment boundaries.
    pub fragment_duration_secs: Option<f64>,
    /// Number of segments advertised in the live window.
    pub window_size: u32,
    /// Segments preserved on disk outside the live window.
    pub extra_window_size: u32,
    /// Local segments kept per representation by the retention loop.
    pub keep_segments: usize,
    /// Retention loop interval in seconds.
    pub retention_interval_secs: u64,
    /// Init segment naming template.
    pub init_segment_template: String,
    /// Media segment naming template.
    pub media_segment_template: String,
    /// Manifest file name.
    pub manifest_name: String,
    /// Maximum video tracks selected from the source.
    pub max_video_tracks: usize,
    /// Maximum audio tracks selected from the source.
    pub max_audio_tracks: usize,
    /// Prior session directories retained by the session manager.
    pub session_retention: usize,
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_packager_binary() -> String {
    "packager".to_string()
}

fn default_probe_binary() -> String {
    "ffprobe".to_string()
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output_root: PathBuf::from("./transcodes"),
            encoder_binary: default_encoder_binary(),
            packager_binary: default_packager_binary(),
            probe_binary: default_probe_binary(),
            video_codec_args: vec![
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
            ],
            audio_codec_args: vec!["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()],
            video_filter: None,
            audio_filter: None,
            segment_duration_secs: 2.0,
            fragment_duration_secs: None,
            window_size: 10,
            extra_window_size: 5,
            keep_segments: 20,
            retention_interval_secs: 5,
            init_segment_template: "init-$RepresentationID$.m4s".to_string(),
            media_segment_template: "chunk-$RepresentationID$-$Number%05d$.m4s".to_string(),
            manifest_name: "manifest.mpd".to_string(),
            max_video_tracks: 1,
            max_audio_tracks: 2,
            session_retention: 3,
        }
    }
}

impl EncoderSettings {
    /// Create settings for `input`, with defaults for everything else.
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Set the output root directory.
    pub fn with_output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Set the per-type track caps.
    pub fn with_track_caps(mut self, video: usize, audio: usize) -> Self {
        self.max_video_tracks = video;
        self.max_audio_tracks = audio;
        self
    }

    /// Set the segment duration in seconds.
    pub fn with_segment_duration(mut self, secs: f64) -> Self {
        self.segment_duration_secs = secs;
        self
    }

    /// Effective encoder fragment duration, derived from the segment duration
    /// unless explicitly configured.
    pub fn fragment_duration(&self) -> f64 {
        self.fragment_duration_secs
            .unwrap_or(self.segment_duration_secs)
    }

    /// Validate the configuration before any process is started.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(Error::validation("input path is empty"));
        }
        if !self.input.exists() {
            return Err(Error::validation(format!(
                "input does not exist: {}",
                self.input.display()
            )));
        }
        if self.segment_duration_secs <= 0.0 {
            return Err(Error::validation("segment duration must be positive"));
        }
        if let Some(frag) = self.fragment_duration_secs
            && frag <= 0.0
        {
            return Err(Error::validation("fragment duration must be positive"));
        }
        if self.window_size == 0 {
            return Err(Error::validation("window size must be at least 1"));
        }
        if self.keep_segments == 0 {
            return Err(Error::validation("keep_segments must be at least 1"));
        }
        if self.max_video_tracks == 0 && self.max_audio_tracks == 0 {
            return Err(Error::validation("all track caps are zero"));
        }
        for (name, template) in [
            ("init segment template", &self.init_segment_template),
            ("media segment template", &self.media_segment_template),
        ] {
            if !template.contains(REPRESENTATION_ID_PLACEHOLDER) {
                return Err(Error::validation(format!(
                    "{name} is missing {REPRESENTATION_ID_PLACEHOLDER}"
                )));
            }
        }
        if self.manifest_name.is_empty() {
            return Err(Error::validation("manifest name is empty"));
        }
        Ok(())
    }
}

/// Session identity supplied by the caller when starting a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    /// Explicit session id; generated when absent.
    pub id: Option<String>,
    /// Prior session ids that must survive pruning.
    pub retain: Vec<String>,
    /// Storage subpath for published artifacts; defaults to the session id.
    pub segment_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings_with_real_input() -> (tempfile::TempDir, EncoderSettings) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("source.mkv");
        let mut f = std::fs::File::create(&input).unwrap();
        f.write_all(b"x").unwrap();
        let settings = EncoderSettings::new(&input).with_output_root(dir.path().join("out"));
        (dir, settings)
    }

    #[test]
    fn test_defaults() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.segment_duration_secs, 2.0);
        assert_eq!(settings.fragment_duration(), 2.0);
        assert_eq!(settings.manifest_name, "manifest.mpd");
        assert_eq!(settings.max_video_tracks, 1);
    }

    #[test]
    fn test_fragment_derived_from_segment() {
        let mut settings = EncoderSettings::default();
        settings.segment_duration_secs = 4.0;
        assert_eq!(settings.fragment_duration(), 4.0);
        settings.fragment_duration_secs = Some(1.0);
        assert_eq!(settings.fragment_duration(), 1.0);
    }

    #[test]
    fn test_validate_ok() {
        let (_dir, settings) = settings_with_real_input();
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_missing_input() {
        let settings = EncoderSettings::new("/nonexistent/source.mkv");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_bad_numbers() {
        let (_dir, mut settings) = settings_with_real_input();
        settings.segment_duration_secs = 0.0;
        assert!(settings.validate().is_err());

        let (_dir, mut settings) = settings_with_real_input();
        settings.window_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_template_placeholder() {
        let (_dir, mut settings) = settings_with_real_input();
        settings.media_segment_template = "chunk-$Number%05d$.m4s".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip_defaults() {
        let settings: EncoderSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.encoder_binary, "ffmpeg");
        assert_eq!(settings.packager_binary, "packager");
    }
}

//! Source container inspection.
//!
//! Runs the probe binary with JSON output and turns its stream list into
//! ordered [`MediaTrack`] descriptors: video first, then audio, then text.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Media stream categories the pipeline cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
        }
    }

    /// Encoder stream specifier letter (`-map 0:v:N` etc).
    pub fn specifier(&self) -> char {
        match self {
            Self::Video => 'v',
            Self::Audio => 'a',
            Self::Subtitle => 's',
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One discovered stream in the source container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaTrack {
    pub kind: TrackKind,
    /// Absolute stream index in the container.
    pub source_index: usize,
    /// Index among streams of the same kind; used for `-map 0:{kind}:{n}`.
    pub relative_index: usize,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    pub frame_rate: Option<f64>,
    pub forced: bool,
    pub default: bool,
    /// Hearing-impaired (SDH) flag.
    pub hearing_impaired: bool,
    /// Commentary flag.
    pub commentary: bool,
}

impl MediaTrack {
    /// Encoder stream selector for this track, e.g. `0:v:0`.
    pub fn selector(&self) -> String {
        format!("0:{}:{}", self.kind.specifier(), self.relative_index)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: usize,
    codec_type: Option<String>,
    codec_name: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
}

impl ProbeStream {
    fn disposition_flag(&self, key: &str) -> bool {
        self.disposition.get(key).copied().unwrap_or(0) != 0
    }
}

/// Parse an ffprobe rational like `30000/1001` into frames per second.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 || num == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Inspects a source container and returns its stream descriptors.
pub struct MediaTrackProbe {
    probe_binary: String,
}

impl MediaTrackProbe {
    pub fn new(probe_binary: impl Into<String>) -> Self {
        Self {
            probe_binary: probe_binary.into(),
        }
    }

    /// Probe `input` and return its tracks ordered video, audio, subtitle,
    /// each kind in container order.
    pub async fn probe(&self, input: &Path) -> Result<Vec<MediaTrack>> {
        let output = process_utils::tokio_command(&self.probe_binary)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg(input)
            .output()
            .await
            .map_err(|e| Error::Probe(format!("failed to spawn {}: {e}", self.probe_binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Probe(format!(
                "{} exited with {}: {}",
                self.probe_binary,
                output.status,
                stderr.trim()
            )));
        }

        let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Probe(format!("unparseable probe output: {e}")))?;

        Ok(Self::tracks_from_streams(parsed.streams))
    }

    fn tracks_from_streams(streams: Vec<ProbeStream>) -> Vec<MediaTrack> {
        let mut tracks = Vec::new();
        let mut per_kind: HashMap<TrackKind, usize> = HashMap::new();

        for stream in streams {
            let kind = match stream.codec_type.as_deref() {
                Some("video") => TrackKind::Video,
                Some("audio") => TrackKind::Audio,
                Some("subtitle") => TrackKind::Subtitle,
                other => {
                    debug!(codec_type = ?other, index = stream.index, "Skipping stream");
                    continue;
                }
            };

            let relative_index = {
                let counter = per_kind.entry(kind).or_insert(0);
                let i = *counter;
                *counter += 1;
                i
            };

            let title = stream.tags.get("title").cloned();
            let commentary = stream.disposition_flag("comment")
                || title
                    .as_deref()
                    .is_some_and(|t| t.to_ascii_lowercase().contains("commentary"));

            tracks.push(MediaTrack {
                kind,
                source_index: stream.index,
                relative_index,
                codec: stream.codec_name.clone().unwrap_or_else(|| {
                    warn!(index = stream.index, "Stream has no codec name");
                    "unknown".to_string()
                }),
                language: stream.tags.get("language").cloned(),
                title,
                channels: stream.channels,
                sample_rate: stream.sample_rate.as_deref().and_then(|s| s.parse().ok()),
                frame_rate: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
                forced: stream.disposition_flag("forced"),
                default: stream.disposition_flag("default"),
                hearing_impaired: stream.disposition_flag("hearing_impaired"),
                commentary,
            });
        }

        // Video first, then audio, then text; container order within a kind.
        tracks.sort_by_key(|t| {
            let rank = match t.kind {
                TrackKind::Video => 0,
                TrackKind::Audio => 1,
                TrackKind::Subtitle => 2,
            };
            (rank, t.relative_index)
        });
        tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "r_frame_rate": "30000/1001",
                "disposition": {"default": 1, "forced": 0}
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 6,
                "sample_rate": "48000",
                "tags": {"language": "eng"},
                "disposition": {"default": 1}
            },
            {
                "index": 2,
                "codec_name": "subrip",
                "codec_type": "subtitle",
                "tags": {"language": "eng", "title": "English (SDH)"},
                "disposition": {"hearing_impaired": 1}
            },
            {
                "index": 3,
                "codec_name": "aac",
                "codec_type": "audio",
                "channels": 2,
                "sample_rate": "44100",
                "tags": {"language": "fra", "title": "Director Commentary"},
                "disposition": {"comment": 1}
            }
        ]
    }"#;

    fn sample_tracks() -> Vec<MediaTrack> {
        let parsed: ProbeOutput = serde_json::from_str(SAMPLE).unwrap();
        MediaTrackProbe::tracks_from_streams(parsed.streams)
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn test_tracks_ordered_and_indexed() {
        let tracks = sample_tracks();
        assert_eq!(tracks.len(), 4);
        assert_eq!(tracks[0].kind, TrackKind::Video);
        assert_eq!(tracks[1].kind, TrackKind::Audio);
        assert_eq!(tracks[2].kind, TrackKind::Audio);
        assert_eq!(tracks[3].kind, TrackKind::Subtitle);
        assert_eq!(tracks[1].relative_index, 0);
        assert_eq!(tracks[2].relative_index, 1);
        assert_eq!(tracks[1].selector(), "0:a:0");
        assert_eq!(tracks[2].selector(), "0:a:1");
    }

    #[test]
    fn test_stream_metadata() {
        let tracks = sample_tracks();
        assert_eq!(tracks[1].channels, Some(6));
        assert_eq!(tracks[1].sample_rate, Some(48000));
        assert_eq!(tracks[1].language.as_deref(), Some("eng"));
        assert!(tracks[0].frame_rate.is_some());
    }

    #[test]
    fn test_disposition_flags() {
        let tracks = sample_tracks();
        let subtitle = &tracks[3];
        assert_eq!(subtitle.kind, TrackKind::Subtitle);
        assert!(subtitle.hearing_impaired);

        let commentary = &tracks[2];
        assert!(commentary.commentary);
    }
}

//! Sidecar subtitle pipeline: probe, select, extract to WebVTT.
//!
//! Subtitle files are static assets: published once, excluded from segment
//! retention pruning, and every failure in here is best-effort - logged,
//! never allowed to block a transcode start.

mod extractor;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::Result;
use crate::probe::{MediaTrack, MediaTrackProbe, TrackKind};
use crate::settings::EncoderSettings;

pub use extractor::SubtitleExtractor;

/// Text-based subtitle codecs convertible to WebVTT. Image-based formats
/// (PGS, DVB, VobSub) are skipped.
const TEXT_CODECS: &[&str] = &["subrip", "srt", "ass", "ssa", "webvtt", "mov_text", "text"];

/// Metadata for one extracted subtitle track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleTrack {
    /// Source stream index in the container.
    pub id: usize,
    pub language: String,
    pub label: String,
    pub codec: String,
    pub forced: bool,
    pub default: bool,
    /// Local file written by extraction.
    pub path: String,
    /// Public URL, when a publish base is known.
    pub url: Option<String>,
}

/// Track selection filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitlePreferences {
    /// Languages to consider; empty means all.
    pub languages: Vec<String>,
    pub include_forced: bool,
    pub include_commentary: bool,
    pub include_sdh: bool,
    /// Source stream indexes always included, filters notwithstanding.
    pub streams: Vec<usize>,
}

/// Applies the selection filters over probed tracks.
pub struct SubtitleCatalog;

impl SubtitleCatalog {
    /// Select one primary track per language, plus explicit opt-ins.
    pub fn select<'a>(
        tracks: &'a [MediaTrack],
        preferences: &SubtitlePreferences,
    ) -> Vec<&'a MediaTrack> {
        let text_tracks: Vec<&MediaTrack> = tracks
            .iter()
            .filter(|t| t.kind == TrackKind::Subtitle)
            .filter(|t| TEXT_CODECS.contains(&t.codec.as_str()))
            .collect();

        let mut selected: Vec<&MediaTrack> = Vec::new();

        // Explicit opt-ins bypass the filters.
        for track in &text_tracks {
            if preferences.streams.contains(&track.source_index) {
                selected.push(track);
            }
        }

        let passes_filters = |track: &MediaTrack| {
            if !preferences.languages.is_empty() {
                let language = track.language.as_deref().unwrap_or("und");
                if !preferences.languages.iter().any(|l| l == language) {
                    return false;
                }
            }
            if track.forced && !preferences.include_forced {
                return false;
            }
            if track.commentary && !preferences.include_commentary {
                return false;
            }
            if track.hearing_impaired && !preferences.include_sdh {
                return false;
            }
            true
        };

        // One primary per language: the default-flagged track wins, else the
        // first in container order.
        let mut languages_done: Vec<String> = Vec::new();
        for track in &text_tracks {
            let language = track.language.clone().unwrap_or_else(|| "und".to_string());
            if languages_done.contains(&language) {
                continue;
            }
            let candidates: Vec<&&MediaTrack> = text_tracks
                .iter()
                .filter(|t| {
                    t.language.as_deref().unwrap_or("und") == language && passes_filters(t)
                })
                .collect();
            let primary = candidates
                .iter()
                .find(|t| t.default)
                .or_else(|| candidates.first());
            if let Some(primary) = primary {
                if !selected
                    .iter()
                    .any(|s| s.source_index == primary.source_index)
                {
                    selected.push(**primary);
                }
                languages_done.push(language);
            }
        }

        selected.sort_by_key(|t| t.source_index);
        debug!(
            candidates = text_tracks.len(),
            selected = selected.len(),
            "Subtitle selection"
        );
        selected
    }
}

/// Probe + select + extract, producing per-track metadata.
pub struct SubtitleService {
    probe: MediaTrackProbe,
    extractor: SubtitleExtractor,
}

impl SubtitleService {
    pub fn new(settings: &EncoderSettings) -> Self {
        Self {
            probe: MediaTrackProbe::new(&settings.probe_binary),
            extractor: SubtitleExtractor::new(&settings.encoder_binary),
        }
    }

    /// Extract the selected tracks to WebVTT files under `out_dir`.
    ///
    /// Individual track failures are logged and skipped; only a failed probe
    /// surfaces as an error.
    pub async fn prepare(
        &self,
        settings: &EncoderSettings,
        out_dir: &Path,
        preferences: &SubtitlePreferences,
        publish_base: Option<&Url>,
        prefix: &str,
    ) -> Result<Vec<SubtitleTrack>> {
        let tracks = self.probe.probe(&settings.input).await?;
        let selected = SubtitleCatalog::select(&tracks, preferences);
        if selected.is_empty() {
            debug!("No subtitle tracks selected");
            return Ok(Vec::new());
        }

        crate::util::fs::ensure_dir_all(out_dir).await?;

        let mut extracted = Vec::new();
        for track in selected {
            let language = track.language.clone().unwrap_or_else(|| "und".to_string());
            let file_name = format!("subs-{language}-{}.vtt", track.source_index);
            let out_path = out_dir.join(&file_name);

            if let Err(e) = self
                .extractor
                .extract(&settings.input, track, &out_path)
                .await
            {
                warn!(
                    stream = track.source_index,
                    language,
                    error = %e,
                    "Subtitle extraction failed, skipping track"
                );
                continue;
            }

            let url = publish_base.and_then(|base| {
                let relative = if prefix.is_empty() {
                    file_name.clone()
                } else {
                    format!("{prefix}/{file_name}")
                };
                base.join(&relative).ok().map(|u| u.to_string())
            });

            extracted.push(SubtitleTrack {
                id: track.source_index,
                language,
                label: track
                    .title
                    .clone()
                    .unwrap_or_else(|| track.language.clone().unwrap_or_else(|| "und".to_string())),
                codec: "webvtt".to_string(),
                forced: track.forced,
                default: track.default,
                path: out_path.to_string_lossy().to_string(),
                url,
            });
        }

        info!(tracks = extracted.len(), "Subtitles prepared");
        Ok(extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtitle(
        source_index: usize,
        language: &str,
        codec: &str,
        forced: bool,
        default: bool,
        sdh: bool,
        commentary: bool,
    ) -> MediaTrack {
        MediaTrack {
            kind: TrackKind::Subtitle,
            source_index,
            relative_index: source_index,
            codec: codec.to_string(),
            language: Some(language.to_string()),
            title: None,
            channels: None,
            sample_rate: None,
            frame_rate: None,
            forced,
            default,
            hearing_impaired: sdh,
            commentary,
        }
    }

    #[test]
    fn test_one_primary_per_language() {
        let tracks = vec![
            subtitle(2, "eng", "subrip", false, false, false, false),
            subtitle(3, "eng", "subrip", false, true, false, false),
            subtitle(4, "fra", "subrip", false, false, false, false),
        ];
        let selected = SubtitleCatalog::select(&tracks, &SubtitlePreferences::default());
        let ids: Vec<usize> = selected.iter().map(|t| t.source_index).collect();
        // Default-flagged eng track wins over the first one.
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn test_filters_drop_special_tracks() {
        let tracks = vec![
            subtitle(2, "eng", "subrip", true, false, false, false),
            subtitle(3, "eng", "subrip", false, false, true, false),
            subtitle(4, "eng", "subrip", false, false, false, true),
            subtitle(5, "eng", "subrip", false, false, false, false),
        ];
        let selected = SubtitleCatalog::select(&tracks, &SubtitlePreferences::default());
        let ids: Vec<usize> = selected.iter().map(|t| t.source_index).collect();
        assert_eq!(ids, vec![5]);

        let preferences = SubtitlePreferences {
            include_forced: true,
            ..Default::default()
        };
        let selected = SubtitleCatalog::select(&tracks, &preferences);
        // Forced track is now eligible and is first in container order.
        assert_eq!(selected[0].source_index, 2);
    }

    #[test]
    fn test_language_filter() {
        let tracks = vec![
            subtitle(2, "eng", "subrip", false, false, false, false),
            subtitle(3, "fra", "subrip", false, false, false, false),
        ];
        let preferences = SubtitlePreferences {
            languages: vec!["fra".to_string()],
            ..Default::default()
        };
        let selected = SubtitleCatalog::select(&tracks, &preferences);
        let ids: Vec<usize> = selected.iter().map(|t| t.source_index).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_image_subtitles_skipped() {
        let tracks = vec![
            subtitle(2, "eng", "hdmv_pgs_subtitle", false, false, false, false),
            subtitle(3, "eng", "subrip", false, false, false, false),
        ];
        let selected = SubtitleCatalog::select(&tracks, &SubtitlePreferences::default());
        let ids: Vec<usize> = selected.iter().map(|t| t.source_index).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_explicit_streams_bypass_filters() {
        let tracks = vec![
            subtitle(2, "eng", "subrip", false, false, false, false),
            subtitle(3, "eng", "subrip", false, false, false, true),
        ];
        let preferences = SubtitlePreferences {
            streams: vec![3],
            ..Default::default()
        };
        let selected = SubtitleCatalog::select(&tracks, &preferences);
        let ids: Vec<usize> = selected.iter().map(|t| t.source_index).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}

//! Stream bindings: pairing selected tracks with pipe paths, encoder output
//! arguments and packager stream descriptors.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::probe::{MediaTrack, TrackKind};
use crate::settings::{EncoderSettings, REPRESENTATION_ID_PLACEHOLDER};
use crate::{Error, Result};

/// One selected track wired into the pipeline.
///
/// Owns the named-pipe path the encoder writes into and the packager reads
/// from; the pipe file is removed by [`StreamBinding::remove_pipe`] on every
/// cleanup path.
#[derive(Debug, Clone)]
pub struct StreamBinding {
    pub track: MediaTrack,
    /// Output representation id; maps 1:1 to the binding's output index.
    pub representation_id: usize,
    /// Named pipe the encoder writes fragmented media into.
    pub pipe_path: PathBuf,
    /// Encoder output arguments for this track.
    pub encoder_args: Vec<String>,
    /// Init segment file name, relative to the session directory.
    pub init_segment: String,
    /// Media segment template, relative to the session directory.
    pub segment_template: String,
}

impl StreamBinding {
    /// Packager stream descriptor for this binding.
    pub fn descriptor(&self, session_dir: &Path) -> String {
        let stream = match self.track.kind {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
            TrackKind::Subtitle => "text",
        };
        format!(
            "in={},stream={},init_segment={},segment_template={}",
            self.pipe_path.display(),
            stream,
            session_dir.join(&self.init_segment).display(),
            session_dir.join(&self.segment_template).display(),
        )
    }

    /// Remove the pipe file; missing files are fine.
    pub fn remove_pipe(&self) {
        match std::fs::remove_file(&self.pipe_path) {
            Ok(()) => debug!(pipe = %self.pipe_path.display(), "Removed pipe"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(pipe = %self.pipe_path.display(), error = %e, "Failed to remove pipe"),
        }
    }
}

/// Synthesized adaptation-set grouping: one set per present media type,
/// ascending ids, video before audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptationSet {
    pub id: usize,
    pub kind: TrackKind,
    pub representation_ids: Vec<usize>,
}

/// Builds [`StreamBinding`]s for a run.
pub struct StreamBindingBuilder<'a> {
    settings: &'a EncoderSettings,
    session_dir: &'a Path,
}

impl<'a> StreamBindingBuilder<'a> {
    pub fn new(settings: &'a EncoderSettings, session_dir: &'a Path) -> Self {
        Self {
            settings,
            session_dir,
        }
    }

    /// Select tracks under the per-type caps and bind them.
    ///
    /// Representation ids ascend with video bound before audio. Fails when no
    /// usable track remains after applying the caps.
    pub fn build(&self, tracks: &[MediaTrack]) -> Result<Vec<StreamBinding>> {
        let video: Vec<&MediaTrack> = tracks
            .iter()
            .filter(|t| t.kind == TrackKind::Video)
            .take(self.settings.max_video_tracks)
            .collect();
        let audio: Vec<&MediaTrack> = tracks
            .iter()
            .filter(|t| t.kind == TrackKind::Audio)
            .take(self.settings.max_audio_tracks)
            .collect();

        if video.is_empty() && audio.is_empty() {
            return Err(Error::pipeline(
                "no usable tracks remain after applying track caps",
            ));
        }

        let mut bindings = Vec::with_capacity(video.len() + audio.len());
        for (representation_id, track) in video.into_iter().chain(audio).enumerate() {
            bindings.push(self.bind(track, representation_id));
        }

        debug!(count = bindings.len(), "Built stream bindings");
        Ok(bindings)
    }

    fn bind(&self, track: &MediaTrack, representation_id: usize) -> StreamBinding {
        let settings = self.settings;
        let rep = representation_id.to_string();
        let pipe_path = self
            .session_dir
            .join(format!("enc-{representation_id}.mp4"));

        let mut encoder_args = vec!["-map".to_string(), track.selector()];
        match track.kind {
            TrackKind::Video => {
                encoder_args.extend(settings.video_codec_args.iter().cloned());
                if let Some(filter) = &settings.video_filter {
                    encoder_args.extend(["-vf".to_string(), filter.clone()]);
                }
            }
            TrackKind::Audio | TrackKind::Subtitle => {
                encoder_args.extend(settings.audio_codec_args.iter().cloned());
                if let Some(filter) = &settings.audio_filter {
                    encoder_args.extend(["-af".to_string(), filter.clone()]);
                }
            }
        }

        // Fragmented MP4 into the pipe, fragment boundaries aligned with the
        // DASH segment duration.
        let frag_us = (settings.fragment_duration() * 1_000_000.0) as u64;
        encoder_args.extend([
            "-f".to_string(),
            "mp4".to_string(),
            "-movflags".to_string(),
            "frag_keyframe+empty_moov+default_base_moof".to_string(),
            "-frag_duration".to_string(),
            frag_us.to_string(),
            pipe_path.to_string_lossy().to_string(),
        ]);

        StreamBinding {
            track: track.clone(),
            representation_id,
            pipe_path,
            encoder_args,
            init_segment: settings
                .init_segment_template
                .replace(REPRESENTATION_ID_PLACEHOLDER, &rep),
            segment_template: settings
                .media_segment_template
                .replace(REPRESENTATION_ID_PLACEHOLDER, &rep),
        }
    }
}

/// Group bindings into synthesized adaptation sets: ascending ids per present
/// media type, video before audio.
pub fn synthesize_adaptation_sets(bindings: &[StreamBinding]) -> Vec<AdaptationSet> {
    let mut sets = Vec::new();
    for kind in [TrackKind::Video, TrackKind::Audio] {
        let representation_ids: Vec<usize> = bindings
            .iter()
            .filter(|b| b.track.kind == kind)
            .map(|b| b.representation_id)
            .collect();
        if !representation_ids.is_empty() {
            sets.push(AdaptationSet {
                id: sets.len(),
                kind,
                representation_ids,
            });
        }
    }
    sets
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn source_2v_3a() -> Vec<MediaTrack> {
        vec![
            track(TrackKind::Video, 0),
            track(TrackKind::Video, 1),
            track(TrackKind::Audio, 0),
            track(TrackKind::Audio, 1),
            track(TrackKind::Audio, 2),
        ]
    }

    #[test]
    fn test_caps_limit_bindings() {
        let settings = EncoderSettings::default().with_track_caps(1, 1);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&source_2v_3a())
            .unwrap();

        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].track.kind, TrackKind::Video);
        assert_eq!(bindings[1].track.kind, TrackKind::Audio);
        assert_eq!(bindings[0].representation_id, 0);
        assert_eq!(bindings[1].representation_id, 1);
    }

    #[test]
    fn test_no_usable_tracks_fails() {
        let settings = EncoderSettings::default().with_track_caps(1, 1);
        let dir = PathBuf::from("/tmp/session");
        let result = StreamBindingBuilder::new(&settings, &dir)
            .build(&[track(TrackKind::Subtitle, 0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_template_expansion() {
        let settings = EncoderSettings::default().with_track_caps(2, 2);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&source_2v_3a())
            .unwrap();

        assert_eq!(bindings[0].init_segment, "init-0.m4s");
        assert_eq!(bindings[0].segment_template, "chunk-0-$Number%05d$.m4s");
        assert_eq!(bindings[3].init_segment, "init-3.m4s");
    }

    #[test]
    fn test_encoder_args_shape() {
        let settings = EncoderSettings::default().with_track_caps(1, 0);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&source_2v_3a())
            .unwrap();

        let args = &bindings[0].encoder_args;
        assert_eq!(args[0], "-map");
        assert_eq!(args[1], "0:v:0");
        assert!(args.contains(&"-frag_duration".to_string()));
        // 2s default segment duration => 2_000_000us fragments
        assert!(args.contains(&"2000000".to_string()));
    }

    #[test]
    fn test_descriptor() {
        let settings = EncoderSettings::default().with_track_caps(1, 1);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&source_2v_3a())
            .unwrap();

        let descriptor = bindings[0].descriptor(&dir);
        assert!(descriptor.starts_with("in=/tmp/session/enc-0.mp4,stream=video,"));
        assert!(descriptor.contains("init_segment=/tmp/session/init-0.m4s"));
        assert!(descriptor.contains("segment_template=/tmp/session/chunk-0-$Number%05d$.m4s"));
    }

    #[test]
    fn test_adaptation_sets_video_before_audio() {
        let settings = EncoderSettings::default().with_track_caps(2, 3);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&source_2v_3a())
            .unwrap();

        let sets = synthesize_adaptation_sets(&bindings);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].id, 0);
        assert_eq!(sets[0].kind, TrackKind::Video);
        assert_eq!(sets[0].representation_ids, vec![0, 1]);
        assert_eq!(sets[1].id, 1);
        assert_eq!(sets[1].kind, TrackKind::Audio);
        assert_eq!(sets[1].representation_ids, vec![2, 3, 4]);
    }

    #[test]
    fn test_audio_only_source() {
        let settings = EncoderSettings::default().with_track_caps(1, 2);
        let dir = PathBuf::from("/tmp/session");
        let bindings = StreamBindingBuilder::new(&settings, &dir)
            .build(&[track(TrackKind::Audio, 0)])
            .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].representation_id, 0);

        let sets = synthesize_adaptation_sets(&bindings);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].kind, TrackKind::Audio);
    }
}

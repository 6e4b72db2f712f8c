//! WebVTT extraction via the encoder binary.

use std::path::Path;
use std::process::Stdio;

use tracing::debug;

use crate::probe::MediaTrack;
use crate::{Error, Result};

/// Extracts one subtitle stream to a WebVTT file.
pub struct SubtitleExtractor {
    encoder_binary: String,
}

impl SubtitleExtractor {
    pub fn new(encoder_binary: impl Into<String>) -> Self {
        Self {
            encoder_binary: encoder_binary.into(),
        }
    }

    /// Run `<encoder> -i <input> -map 0:s:<n> -c:s webvtt <out>`.
    pub async fn extract(&self, input: &Path, track: &MediaTrack, out: &Path) -> Result<()> {
        debug!(
            stream = track.source_index,
            out = %out.display(),
            "Extracting subtitle track"
        );

        let output = process_utils::tokio_command(&self.encoder_binary)
            .arg("-y")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-map")
            .arg(track.selector())
            .arg("-c:s")
            .arg("webvtt")
            .arg(out)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                Error::Process(format!("failed to spawn {}: {e}", self.encoder_binary))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Process(format!(
                "subtitle extraction exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

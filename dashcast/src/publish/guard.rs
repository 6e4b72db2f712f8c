//! Manifest consistency guard.
//!
//! Before a manifest is published, its segment templates/timelines are folded
//! into the highest segment sequence each representation implies, and the
//! publish is refused when any representation is ahead of what the ledger has
//! confirmed uploaded. A refused cycle is not an error of the run: the next
//! manifest update retries naturally.

use std::collections::HashMap;

use dash_mpd::{MPD, SegmentTemplate};
use tracing::debug;

use super::ledger::SegmentLedger;
use crate::{Error, Result};

/// Highest implied sequence number per representation id.
///
/// A representation with a `SegmentTemplate` carrying a `SegmentTimeline`
/// implies `startNumber + entries - 1`, where each `<S>` element counts
/// `1 + max(@r, 0)` segments. Representations without a timeline imply
/// nothing and are skipped.
pub fn implied_max_sequences(manifest_xml: &str) -> Result<HashMap<String, u64>> {
    let mpd: MPD = dash_mpd::parse(manifest_xml)
        .map_err(|e| Error::ManifestGuard(format!("unparseable manifest: {e}")))?;

    let mut implied = HashMap::new();

    for period in &mpd.periods {
        for adaptation in &period.adaptations {
            for (index, representation) in adaptation.representations.iter().enumerate() {
                let template = representation
                    .SegmentTemplate
                    .as_ref()
                    .or(adaptation.SegmentTemplate.as_ref());
                let Some(template) = template else {
                    continue;
                };
                let Some(count) = timeline_segment_count(template) else {
                    continue;
                };
                if count == 0 {
                    continue;
                }

                let start = template.startNumber.unwrap_or(1);
                let id = representation
                    .id
                    .clone()
                    .unwrap_or_else(|| index.to_string());
                implied.insert(id, start + count - 1);
            }
        }
    }

    Ok(implied)
}

fn timeline_segment_count(template: &SegmentTemplate) -> Option<u64> {
    let timeline = template.SegmentTimeline.as_ref()?;
    let count = timeline
        .segments
        .iter()
        .map(|s| 1 + s.r.unwrap_or(0).max(0) as u64)
        .sum();
    Some(count)
}

/// Refuse a manifest that references segments beyond the confirmed ledger.
pub fn check_manifest_against_ledger(manifest_xml: &str, ledger: &SegmentLedger) -> Result<()> {
    let implied = implied_max_sequences(manifest_xml)?;

    let mut behind = Vec::new();
    for (representation, required) in &implied {
        let confirmed = ledger.confirmed(representation);
        if *required > confirmed {
            behind.push(format!(
                "representation {representation} requires sequence {required}, confirmed {confirmed}"
            ));
        }
    }

    if behind.is_empty() {
        debug!(representations = implied.len(), "Manifest within ledger");
        Ok(())
    } else {
        behind.sort();
        Err(Error::ManifestGuard(behind.join("; ")))
    }
}

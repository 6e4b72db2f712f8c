//! Published-segment bookkeeping.
//!
//! The ledger records, per representation, the highest segment sequence that
//! has been confirmed uploaded. It is private to one publisher instance and
//! lives exactly as long as it; multiple publishers writing to the same
//! remote target are unsupported.

use std::collections::HashMap;

use parking_lot::Mutex;
use regex::Regex;

use crate::settings::REPRESENTATION_ID_PLACEHOLDER;
use crate::{Error, Result};

/// Matcher turning a media segment file name back into
/// `(representation id, sequence number)`.
#[derive(Debug, Clone)]
pub struct SegmentNamePattern {
    regex: Regex,
}

impl SegmentNamePattern {
    /// Build a matcher from a naming template such as
    /// `chunk-$RepresentationID$-$Number%05d$.m4s`.
    pub fn from_template(template: &str) -> Result<Self> {
        let number_start = template.find("$Number").ok_or_else(|| {
            Error::validation(format!("segment template has no $Number$ field: {template}"))
        })?;
        let number_end = template[number_start + 1..]
            .find('$')
            .map(|i| number_start + 1 + i + 1)
            .ok_or_else(|| {
                Error::validation(format!("unterminated $Number$ field: {template}"))
            })?;

        let mut pattern = String::from("^");
        pattern.push_str(&regex::escape(&template[..number_start]));
        pattern.push_str(r"(?P<num>\d+)");
        pattern.push_str(&regex::escape(&template[number_end..]));
        pattern.push('$');
        // The representation id placeholder was escaped verbatim; swap it for
        // a capture group.
        let pattern = pattern.replace(
            &regex::escape(REPRESENTATION_ID_PLACEHOLDER),
            r"(?P<rep>[^-/]+)",
        );

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::validation(format!("bad segment template: {e}")))?;
        Ok(Self { regex })
    }

    /// Parse a file name; `None` for init segments, manifests, subtitles and
    /// anything else that is not a numbered media segment.
    pub fn parse(&self, file_name: &str) -> Option<(String, u64)> {
        let captures = self.regex.captures(file_name)?;
        let rep = captures.name("rep")?.as_str().to_string();
        let seq: u64 = captures.name("num")?.as_str().parse().ok()?;
        Some((rep, seq))
    }
}

/// Highest confirmed-uploaded sequence per representation.
#[derive(Debug, Default)]
pub struct SegmentLedger {
    inner: Mutex<HashMap<String, u64>>,
}

impl SegmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed upload. Sequences only move forward.
    pub fn record(&self, representation: &str, sequence: u64) {
        let mut inner = self.inner.lock();
        let entry = inner.entry(representation.to_string()).or_insert(0);
        if sequence > *entry {
            *entry = sequence;
        }
    }

    /// Highest confirmed sequence for a representation; 0 when nothing has
    /// been uploaded yet.
    pub fn confirmed(&self, representation: &str) -> u64 {
        self.inner.lock().get(representation).copied().unwrap_or(0)
    }

    /// Snapshot of all confirmed sequences.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parses_default_template() {
        let pattern =
            SegmentNamePattern::from_template("chunk-$RepresentationID$-$Number%05d$.m4s").unwrap();
        assert_eq!(
            pattern.parse("chunk-0-00042.m4s"),
            Some(("0".to_string(), 42))
        );
        assert_eq!(
            pattern.parse("chunk-audio_1-00001.m4s"),
            Some(("audio_1".to_string(), 1))
        );
    }

    #[test]
    fn test_pattern_rejects_non_segments() {
        let pattern =
            SegmentNamePattern::from_template("chunk-$RepresentationID$-$Number%05d$.m4s").unwrap();
        assert_eq!(pattern.parse("init-0.m4s"), None);
        assert_eq!(pattern.parse("manifest.mpd"), None);
        assert_eq!(pattern.parse("subs-eng.vtt"), None);
        assert_eq!(pattern.parse("chunk-0-abc.m4s"), None);
    }

    #[test]
    fn test_pattern_requires_number_field() {
        assert!(SegmentNamePattern::from_template("chunk-$RepresentationID$.m4s").is_err());
    }

    #[test]
    fn test_ledger_moves_forward_only() {
        let ledger = SegmentLedger::new();
        assert_eq!(ledger.confirmed("0"), 0);
        ledger.record("0", 3);
        ledger.record("0", 7);
        ledger.record("0", 5);
        assert_eq!(ledger.confirmed("0"), 7);
        assert_eq!(ledger.confirmed("1"), 0);
    }
}

#![forbid(unsafe_code)]

//! Caption track model shared by every subtitle origin.
//!
//! A [`CaptionTrack`] can only be constructed through [`CaptionTrack::new`],
//! which enforces the ordering invariants: cues are strictly increasing in
//! start time and never overlap. Rolling auto-captions routinely repeat the
//! same text across touching spans; those near-duplicates are merged rather
//! than rejected. Anything else out of order fails construction — tracks are
//! never silently reordered.

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

/// Provenance of a caption track. Used only for selection priority; the
/// downstream normalization and emission paths treat all origins uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptionOrigin {
    /// Uploaded by the channel.
    Manual,
    /// Platform speech recognition.
    AutoGenerated,
    /// Produced locally by the fallback recognizer.
    Synthesized,
}

impl CaptionOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptionOrigin::Manual => "manual",
            CaptionOrigin::AutoGenerated => "auto-generated",
            CaptionOrigin::Synthesized => "synthesized",
        }
    }
}

impl std::fmt::Display for CaptionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single timed caption unit. Times are integer milliseconds from the start
/// of the video; text may contain embedded newlines for multi-line cues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Cue {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// An ordered, validated sequence of cues in one language from one origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionTrack {
    pub language: String,
    pub origin: CaptionOrigin,
    cues: Vec<Cue>,
}

impl CaptionTrack {
    /// Validates and assembles a track. Adjacent cues whose spans touch or
    /// overlap while carrying the same normalized text are merged into one;
    /// any other overlap or ordering violation rejects the whole track.
    pub fn new(
        language: impl Into<String>,
        origin: CaptionOrigin,
        cues: Vec<Cue>,
    ) -> ArchiveResult<Self> {
        let language = language.into();
        if cues.is_empty() {
            return Err(malformed(&language, origin, "track contains no cues"));
        }

        let mut merged: Vec<Cue> = Vec::with_capacity(cues.len());
        for (index, cue) in cues.into_iter().enumerate() {
            if cue.end_ms <= cue.start_ms {
                return Err(malformed(
                    &language,
                    origin,
                    format!("cue {index} has end <= start"),
                ));
            }
            if cue.text.trim().is_empty() {
                return Err(malformed(
                    &language,
                    origin,
                    format!("cue {index} has empty text"),
                ));
            }

            let Some(prev) = merged.last_mut() else {
                merged.push(cue);
                continue;
            };

            if cue.start_ms >= prev.end_ms {
                // Touching spans with identical text are the platform's
                // rolling-caption artifact; keep one cue covering both spans.
                if cue.start_ms == prev.end_ms
                    && collapse_whitespace(&cue.text) == collapse_whitespace(&prev.text)
                {
                    prev.end_ms = cue.end_ms;
                } else {
                    merged.push(cue);
                }
                continue;
            }

            if cue.start_ms >= prev.start_ms
                && collapse_whitespace(&cue.text) == collapse_whitespace(&prev.text)
            {
                prev.end_ms = prev.end_ms.max(cue.end_ms);
                continue;
            }

            let reason = if cue.start_ms < prev.start_ms {
                format!("cue {index} starts before its predecessor")
            } else {
                format!("cue {index} overlaps its predecessor")
            };
            return Err(malformed(&language, origin, reason));
        }

        Ok(Self {
            language,
            origin,
            cues: merged,
        })
    }

    pub fn cues(&self) -> &[Cue] {
        &self.cues
    }

    pub fn into_cues(self) -> Vec<Cue> {
        self.cues
    }
}

fn malformed(
    language: &str,
    origin: CaptionOrigin,
    reason: impl Into<String>,
) -> ArchiveError {
    ArchiveError::MalformedCaptionTrack {
        language: language.to_string(),
        origin: origin.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Collapses runs of whitespace (including newlines) into single spaces and
/// trims the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Formats milliseconds as `HH:MM:SS<sep>mmm`. WebVTT uses `.` and SubRip
/// uses `,` as the millisecond separator.
pub fn format_timestamp(ms: u64, sep: char) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1_000;
    let millis = ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}{sep}{millis:03}")
}

/// Parses `HH:MM:SS.mmm`, `HH:MM:SS,mmm`, or the short `MM:SS.mmm` form.
pub fn parse_timestamp(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let (clock, millis) = raw
        .rsplit_once('.')
        .or_else(|| raw.rsplit_once(','))?;
    if millis.len() != 3 {
        return None;
    }
    let millis: u64 = millis.parse().ok()?;

    let mut parts = clock.rsplit(':');
    let seconds: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let hours: u64 = match parts.next() {
        Some(part) => part.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() || seconds > 59 || minutes > 59 {
        return None;
    }

    Some(((hours * 60 + minutes) * 60 + seconds) * 1_000 + millis)
}

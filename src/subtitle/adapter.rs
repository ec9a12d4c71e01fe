#![forbid(unsafe_code)]

//! Subtitle source adapter.
//!
//! Takes the raw caption payloads the acquisition step hands over — WebVTT or
//! SubRip bytes tagged with language and origin — and normalizes them into
//! validated [`CaptionTrack`]s. Platform auto-captions arrive as WebVTT with
//! inline word-timing tags (`<00:00:01.500>`, `<c>…</c>`); those are stripped
//! while the block-level timing is preserved exactly.
//!
//! A payload that cannot be parsed drops only that track, never the video:
//! the failure is logged, recorded, and the pipeline continues.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ArchiveError, ArchiveResult};
use crate::subtitle::track::{CaptionOrigin, CaptionTrack, Cue, parse_timestamp};

/// Caption bytes exactly as delivered by the platform, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCaptionPayload {
    pub language: String,
    pub origin: CaptionOrigin,
    pub data: Vec<u8>,
}

impl RawCaptionPayload {
    pub fn new(
        language: impl Into<String>,
        origin: CaptionOrigin,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            language: language.into(),
            origin,
            data: data.into(),
        }
    }
}

/// A track that failed parsing or validation, kept for the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedTrack {
    pub language: String,
    pub origin: CaptionOrigin,
    pub reason: String,
}

/// Result of normalizing all payloads for one video.
///
/// `raw_tracks` keeps every valid track for audit, including the ones not
/// selected; `selected` holds at most one track per language, chosen by
/// origin priority (manual before auto-generated before synthesized).
#[derive(Debug, Default)]
pub struct TrackResolution {
    pub raw_tracks: Vec<CaptionTrack>,
    pub selected: Vec<CaptionTrack>,
    pub dropped: Vec<DroppedTrack>,
}

/// Parses one payload into a validated track.
pub fn parse_track(payload: &RawCaptionPayload) -> ArchiveResult<CaptionTrack> {
    let text = String::from_utf8_lossy(&payload.data);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let cues = if sniffs_webvtt(text) {
        parse_vtt_cues(text)
    } else {
        parse_srt_cues(text)
    }
    .map_err(|reason| ArchiveError::MalformedCaptionTrack {
        language: payload.language.clone(),
        origin: payload.origin.as_str().to_string(),
        reason,
    })?;

    CaptionTrack::new(payload.language.clone(), payload.origin, cues)
}

/// Normalizes every payload and resolves the per-language preference.
pub fn resolve_tracks(payloads: &[RawCaptionPayload]) -> TrackResolution {
    let mut resolution = TrackResolution::default();

    for payload in payloads {
        match parse_track(payload) {
            Ok(track) => resolution.raw_tracks.push(track),
            Err(err) => {
                warn!(
                    language = %payload.language,
                    origin = %payload.origin,
                    "dropping caption track: {err}"
                );
                resolution.dropped.push(DroppedTrack {
                    language: payload.language.clone(),
                    origin: payload.origin,
                    reason: err.to_string(),
                });
            }
        }
    }

    // Manual wins over auto-generated for the same language; the loser stays
    // in raw_tracks but never feeds the downstream variants.
    let mut seen: Vec<String> = Vec::new();
    let mut selected = Vec::new();
    for priority in [
        CaptionOrigin::Manual,
        CaptionOrigin::AutoGenerated,
        CaptionOrigin::Synthesized,
    ] {
        for track in &resolution.raw_tracks {
            if track.origin == priority && !seen.contains(&track.language) {
                seen.push(track.language.clone());
                selected.push(track.clone());
            }
        }
    }
    selected.sort_by(|a, b| a.language.cmp(&b.language));
    resolution.selected = selected;

    resolution
}

fn sniffs_webvtt(text: &str) -> bool {
    text.lines()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.trim_start().starts_with("WEBVTT"))
}

fn blocks(text: &str) -> impl Iterator<Item = Vec<&str>> {
    let mut lines = text.lines().map(|line| line.trim_end_matches('\r'));
    std::iter::from_fn(move || {
        let mut block = Vec::new();
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                if block.is_empty() {
                    continue;
                }
                return Some(block);
            }
            block.push(line);
        }
        if block.is_empty() { None } else { Some(block) }
    })
}

fn parse_vtt_cues(text: &str) -> Result<Vec<Cue>, String> {
    let mut cues = Vec::new();
    for block in blocks(text) {
        let first = block[0].trim_start();
        if first.starts_with("WEBVTT")
            || first.starts_with("NOTE")
            || first.starts_with("STYLE")
            || first.starts_with("REGION")
        {
            continue;
        }

        // An optional cue identifier may precede the timing line.
        let Some(timing_idx) = block.iter().position(|line| line.contains("-->")) else {
            continue;
        };
        if timing_idx > 1 {
            return Err(format!("unexpected lines before timing: {:?}", block[0]));
        }

        let (start_ms, end_ms) = parse_timing(block[timing_idx])?;
        let text = cue_text(&block[timing_idx + 1..]);
        if text.is_empty() {
            // Positioning-only filler blocks in auto-caption files.
            continue;
        }
        cues.push(Cue::new(start_ms, end_ms, text));
    }
    Ok(cues)
}

fn parse_srt_cues(text: &str) -> Result<Vec<Cue>, String> {
    let mut cues = Vec::new();
    for block in blocks(text) {
        let mut lines = block.as_slice();
        // Leading counter line of a SubRip block.
        if lines
            .first()
            .is_some_and(|line| line.trim().chars().all(|c| c.is_ascii_digit()))
        {
            lines = &lines[1..];
        }
        let Some(timing) = lines.first() else {
            continue;
        };
        if !timing.contains("-->") {
            return Err(format!("expected timing line, found {timing:?}"));
        }

        let (start_ms, end_ms) = parse_timing(timing)?;
        let text = cue_text(&lines[1..]);
        if text.is_empty() {
            continue;
        }
        cues.push(Cue::new(start_ms, end_ms, text));
    }
    Ok(cues)
}

fn parse_timing(line: &str) -> Result<(u64, u64), String> {
    let (start_raw, rest) = line
        .split_once("-->")
        .ok_or_else(|| format!("missing '-->' in timing line {line:?}"))?;
    // Cue settings (position, alignment) may follow the end timestamp.
    let end_raw = rest.trim().split_whitespace().next().unwrap_or("");

    let start_ms = parse_timestamp(start_raw)
        .ok_or_else(|| format!("bad start timestamp {:?}", start_raw.trim()))?;
    let end_ms =
        parse_timestamp(end_raw).ok_or_else(|| format!("bad end timestamp {end_raw:?}"))?;
    Ok((start_ms, end_ms))
}

fn cue_text(lines: &[&str]) -> String {
    let cleaned: Vec<String> = lines
        .iter()
        .map(|line| decode_entities(&strip_inline_tags(line)))
        .collect();
    let joined = cleaned.join("\n");
    joined.trim().to_string()
}

/// Removes `<c>`, `</c>`, `<00:00:01.500>` and any other angle-bracket markup
/// while leaving the caption text untouched.
fn strip_inline_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    for ch in line.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANUAL_VTT: &str = "\
WEBVTT
Kind: captions
Language: en

00:00:00.000 --> 00:00:02.000
Hello there,
general viewer.

00:00:02.000 --> 00:00:05.120 align:start position:0%
Second cue.
";

    const AUTO_VTT: &str = "\
WEBVTT

00:00:00.000 --> 00:00:02.000
Hello<00:00:00.480><c> there</c><00:00:01.200><c> friends</c>

00:00:02.000 --> 00:00:04.000


00:00:04.000 --> 00:00:06.000
the&nbsp;next line
";

    const SIMPLE_SRT: &str = "\
1
00:00:00,000 --> 00:00:02,000
Hello there,
general viewer.

2
00:00:02,000 --> 00:00:05,120
Second cue.
";

    fn payload(language: &str, origin: CaptionOrigin, body: &str) -> RawCaptionPayload {
        RawCaptionPayload::new(language, origin, body.as_bytes())
    }

    #[test]
    fn parses_manual_webvtt() {
        let track = parse_track(&payload("en", CaptionOrigin::Manual, MANUAL_VTT)).unwrap();
        assert_eq!(track.cues().len(), 2);
        assert_eq!(track.cues()[0].text, "Hello there,\ngeneral viewer.");
        assert_eq!(track.cues()[1].start_ms, 2_000);
        assert_eq!(track.cues()[1].end_ms, 5_120);
    }

    #[test]
    fn strips_word_timing_tags_and_filler_blocks() {
        let track = parse_track(&payload("en", CaptionOrigin::AutoGenerated, AUTO_VTT)).unwrap();
        assert_eq!(track.cues().len(), 2);
        assert_eq!(track.cues()[0].text, "Hello there friends");
        assert_eq!(track.cues()[1].text, "the next line");
    }

    #[test]
    fn parses_srt_blocks() {
        let track = parse_track(&payload("en", CaptionOrigin::Manual, SIMPLE_SRT)).unwrap();
        assert_eq!(track.cues().len(), 2);
        assert_eq!(track.cues()[0].text, "Hello there,\ngeneral viewer.");
        assert_eq!(track.cues()[1].end_ms, 5_120);
    }

    #[test]
    fn bad_timestamp_is_malformed_not_fatal() {
        let body = "WEBVTT\n\n00:00:xx.000 --> 00:00:02.000\nbroken\n";
        let err = parse_track(&payload("en", CaptionOrigin::Manual, body)).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::MalformedCaptionTrack { .. }
        ));
    }

    #[test]
    fn caption_only_of_filler_blocks_is_invalid() {
        let body = "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\n<c></c>\n";
        let err = parse_track(&payload("en", CaptionOrigin::AutoGenerated, body)).unwrap_err();
        assert!(err.to_string().contains("no cues"));
    }

    #[test]
    fn resolve_prefers_manual_over_auto() {
        let resolution = resolve_tracks(&[
            payload("en", CaptionOrigin::AutoGenerated, AUTO_VTT),
            payload("en", CaptionOrigin::Manual, MANUAL_VTT),
        ]);
        assert_eq!(resolution.raw_tracks.len(), 2, "auto track kept for audit");
        assert_eq!(resolution.selected.len(), 1);
        assert_eq!(resolution.selected[0].origin, CaptionOrigin::Manual);
        assert!(resolution.dropped.is_empty());
    }

    #[test]
    fn resolve_falls_back_to_auto_when_no_manual() {
        let resolution = resolve_tracks(&[payload("en", CaptionOrigin::AutoGenerated, AUTO_VTT)]);
        assert_eq!(resolution.selected.len(), 1);
        assert_eq!(resolution.selected[0].origin, CaptionOrigin::AutoGenerated);
    }

    #[test]
    fn resolve_records_dropped_tracks() {
        let resolution = resolve_tracks(&[
            payload("en", CaptionOrigin::Manual, MANUAL_VTT),
            payload("de", CaptionOrigin::Manual, "WEBVTT\n\ngarbage --> more\nx\n"),
        ]);
        assert_eq!(resolution.selected.len(), 1);
        assert_eq!(resolution.dropped.len(), 1);
        assert_eq!(resolution.dropped[0].language, "de");
    }

    #[test]
    fn resolve_keeps_one_selection_per_language() {
        let resolution = resolve_tracks(&[
            payload("de", CaptionOrigin::AutoGenerated, AUTO_VTT),
            payload("en", CaptionOrigin::Manual, MANUAL_VTT),
            payload("en", CaptionOrigin::AutoGenerated, AUTO_VTT),
        ]);
        assert_eq!(resolution.selected.len(), 2);
        assert_eq!(resolution.selected[0].language, "de");
        assert_eq!(resolution.selected[1].language, "en");
        assert_eq!(resolution.selected[1].origin, CaptionOrigin::Manual);
    }
}

#![forbid(unsafe_code)]

//! Pure serializers for resolved caption tracks.
//!
//! Two external formats are emitted: SubRip (`.srt`) as the strict
//! line-timed format every conformant player accepts, and WebVTT (`.vtt`)
//! as the container the target desktop player prefers for the verbatim
//! variant. Both are deterministic — the same track always serializes to
//! byte-identical output — and both round-trip through the adapter's
//! parsers without loss.

use std::fs;
use std::path::Path;

use crate::error::{ArchiveError, ArchiveResult};
use crate::subtitle::track::{Cue, collapse_whitespace, format_timestamp};

/// Serializes cues as SubRip: numbered blocks with comma-millisecond
/// timestamps.
pub fn emit_srt(cues: &[Cue]) -> String {
    let mut out = String::new();
    for (index, cue) in cues.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            format_timestamp(cue.start_ms, ','),
            format_timestamp(cue.end_ms, ','),
            escape_text(&cue.text),
        ));
    }
    out
}

/// Serializes cues as WebVTT.
pub fn emit_vtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_timestamp(cue.start_ms, '.'),
            format_timestamp(cue.end_ms, '.'),
            escape_text(&cue.text),
        ));
    }
    out
}

/// Escapes the characters the parsers treat as markup, so a literal `<` or
/// `&` in cue text survives re-ingest. `&` goes first or it would re-escape
/// the entities themselves.
fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Concatenates all cue text, order-preserving, into the plain-text body the
/// search index tokenizes.
pub fn search_body(cues: &[Cue]) -> String {
    let parts: Vec<String> = cues
        .iter()
        .map(|cue| collapse_whitespace(&cue.text))
        .filter(|text| !text.is_empty())
        .collect();
    parts.join(" ")
}

/// Writes `contents` via a temp file in the same directory followed by a
/// rename, so readers never observe a half-written subtitle file. Any I/O
/// failure surfaces as a `Persistence` error.
pub fn write_atomic(path: &Path, contents: &str) -> ArchiveResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| ArchiveError::persistence(parent, err))?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents).map_err(|err| ArchiveError::persistence(&tmp_path, err))?;
    fs::rename(&tmp_path, path).map_err(|err| ArchiveError::persistence(path, err))?;
    Ok(())
}

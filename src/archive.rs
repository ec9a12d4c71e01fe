#![forbid(unsafe_code)]

//! Archive record assembly.
//!
//! An [`ArchiveRecord`] is the durable description of one archived video:
//! immutable identity, asset paths, the resolved caption tracks kept for
//! audit, the emitted subtitle variants, any language gaps, and a content
//! fingerprint over the subtitle text. Records are only built through
//! [`ArchiveRecordBuilder`], which refuses to describe a video whose media
//! asset is missing or empty.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::ReflowSettings;
use crate::error::{ArchiveError, ArchiveResult};
use crate::subtitle::{
    CaptionOrigin, CaptionTrack, LanguageGap, ReflowPolicy,
    emit::{emit_srt, emit_vtt, search_body},
    reflow,
};

/// Immutable identity of an archived video, fixed at acquisition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoIdentity {
    pub video_id: String,
    pub url: String,
    pub title: String,
    pub channel: String,
    /// `YYYY-MM-DD`, as reported by the platform.
    pub upload_date: String,
}

/// Which rendering of a caption track a variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VariantStyle {
    /// Cue-for-cue, timing and line breaks preserved exactly.
    Verbatim,
    /// Sentence-reflowed for reading, timing on original cue boundaries.
    Reflowed,
}

impl VariantStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            VariantStyle::Verbatim => "verbatim",
            VariantStyle::Reflowed => "reflowed",
        }
    }
}

/// One emitted subtitle rendering for one language. The verbatim variant also
/// carries a WebVTT body for the desktop player; the reflowed variant is SRT
/// only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleVariant {
    pub language: String,
    pub style: VariantStyle,
    pub origin: CaptionOrigin,
    pub srt: String,
    pub vtt: Option<String>,
    pub search_body: String,
}

impl SubtitleVariant {
    pub fn verbatim(track: &CaptionTrack) -> Self {
        Self {
            language: track.language.clone(),
            style: VariantStyle::Verbatim,
            origin: track.origin,
            srt: emit_srt(track.cues()),
            vtt: Some(emit_vtt(track.cues())),
            search_body: search_body(track.cues()),
        }
    }

    pub fn reflowed(track: &CaptionTrack, settings: &ReflowSettings) -> Self {
        let policy = ReflowPolicy::for_language(settings, &track.language);
        let cues: Vec<_> = reflow(track.cues(), &policy)
            .iter()
            .map(|segment| segment.to_cue())
            .collect();
        Self {
            language: track.language.clone(),
            style: VariantStyle::Reflowed,
            origin: track.origin,
            srt: emit_srt(&cues),
            vtt: None,
            search_body: search_body(&cues),
        }
    }

    /// File name this variant is stored under next to the video asset.
    pub fn file_name(&self, video_id: &str) -> String {
        format!("{video_id}.{}.{}.srt", self.language, self.style.as_str())
    }
}

/// On-disk locations of the archived assets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetPaths {
    pub video: PathBuf,
    pub thumbnail: Option<PathBuf>,
    pub subtitles: Vec<PathBuf>,
}

/// Durable description of one archived video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub identity: VideoIdentity,
    /// Free-text provenance, e.g. `direct` or
    /// `Playlist:title=…&id=…&channel=…`.
    pub source_tag: String,
    /// RFC 3339 instant the video entered the archive.
    pub downloaded_at: String,
    pub assets: AssetPaths,
    /// Resolved tracks as selected by the adapter, kept for audit.
    pub raw_tracks: Vec<CaptionTrack>,
    pub variants: Vec<SubtitleVariant>,
    pub gaps: Vec<LanguageGap>,
    /// blake3 over the concatenated variant search bodies.
    pub fingerprint: String,
    /// Subtitle assets are staged, not in their final location.
    pub postponed: bool,
    pub revision: u32,
}

/// blake3 hex digest over every variant's search body, keyed by language and
/// style so reordering variants cannot collide.
pub fn content_fingerprint(variants: &[SubtitleVariant]) -> String {
    let mut hasher = blake3::Hasher::new();
    for variant in variants {
        hasher.update(variant.language.as_bytes());
        hasher.update(b"/");
        hasher.update(variant.style.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(variant.search_body.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// Assembles [`ArchiveRecord`]s, validating the video asset on `build`.
pub struct ArchiveRecordBuilder {
    identity: VideoIdentity,
    source_tag: String,
    downloaded_at: Option<String>,
    assets: AssetPaths,
    raw_tracks: Vec<CaptionTrack>,
    variants: Vec<SubtitleVariant>,
    gaps: Vec<LanguageGap>,
    postponed: bool,
}

impl ArchiveRecordBuilder {
    pub fn new(identity: VideoIdentity, source_tag: impl Into<String>) -> Self {
        Self {
            identity,
            source_tag: source_tag.into(),
            downloaded_at: None,
            assets: AssetPaths::default(),
            raw_tracks: Vec::new(),
            variants: Vec::new(),
            gaps: Vec::new(),
            postponed: false,
        }
    }

    pub fn video_asset(mut self, path: impl Into<PathBuf>) -> Self {
        self.assets.video = path.into();
        self
    }

    pub fn thumbnail(mut self, path: impl Into<PathBuf>) -> Self {
        self.assets.thumbnail = Some(path.into());
        self
    }

    pub fn subtitle_asset(mut self, path: impl Into<PathBuf>) -> Self {
        self.assets.subtitles.push(path.into());
        self
    }

    pub fn raw_tracks(mut self, tracks: Vec<CaptionTrack>) -> Self {
        self.raw_tracks = tracks;
        self
    }

    pub fn variants(mut self, variants: Vec<SubtitleVariant>) -> Self {
        self.variants = variants;
        self
    }

    pub fn gaps(mut self, gaps: Vec<LanguageGap>) -> Self {
        self.gaps = gaps;
        self
    }

    pub fn postponed(mut self, postponed: bool) -> Self {
        self.postponed = postponed;
        self
    }

    /// Timestamp override, used by tests and re-imports; defaults to now.
    pub fn downloaded_at(mut self, instant: impl Into<String>) -> Self {
        self.downloaded_at = Some(instant.into());
        self
    }

    pub fn build(self) -> ArchiveResult<ArchiveRecord> {
        if self.identity.video_id.trim().is_empty() {
            return Err(ArchiveError::Construction(
                "video identifier is empty".to_string(),
            ));
        }
        validate_video_asset(&self.assets.video)?;

        let fingerprint = content_fingerprint(&self.variants);
        Ok(ArchiveRecord {
            identity: self.identity,
            source_tag: self.source_tag,
            downloaded_at: self
                .downloaded_at
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            assets: self.assets,
            raw_tracks: self.raw_tracks,
            variants: self.variants,
            gaps: self.gaps,
            fingerprint,
            postponed: self.postponed,
            revision: 0,
        })
    }
}

fn validate_video_asset(path: &Path) -> ArchiveResult<()> {
    if path.as_os_str().is_empty() {
        return Err(ArchiveError::Construction(
            "no video asset was provided".to_string(),
        ));
    }
    let meta = fs::metadata(path).map_err(|_| {
        ArchiveError::Construction(format!("video asset {} does not exist", path.display()))
    })?;
    if meta.len() == 0 {
        return Err(ArchiveError::Construction(format!(
            "video asset {} is empty",
            path.display()
        )));
    }
    Ok(())
}

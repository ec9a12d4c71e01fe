#![forbid(unsafe_code)]

//! Speech-recognition fallback for languages the platform left uncovered.
//!
//! The recognizer itself is a black box behind [`SpeechRecognizer`]; the
//! production implementation shells out to a configured transcriber binary.
//! Failures here are never pipeline failures — a language that cannot be
//! synthesized is recorded as a [`LanguageGap`] on the archive record and
//! the video commits without it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RecognizerSettings;
use crate::error::{ArchiveError, ArchiveResult};
use crate::subtitle::track::{CaptionOrigin, CaptionTrack, Cue, collapse_whitespace};

/// One timed transcript piece as returned by the recognizer, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

impl RecognizedSegment {
    fn to_cue(&self) -> Cue {
        // Recognizer text may carry interior newlines, which would read as
        // block breaks once serialized.
        Cue::new(
            (self.start * 1_000.0).round() as u64,
            (self.end * 1_000.0).round() as u64,
            collapse_whitespace(&self.text),
        )
    }
}

/// External recognition capability: audio/media path plus target language in,
/// ordered timed segments out.
pub trait SpeechRecognizer: Send + Sync {
    fn transcribe(&self, media: &Path, language: &str) -> ArchiveResult<Vec<RecognizedSegment>>;
}

#[derive(Debug, Deserialize)]
struct TranscriptPayload {
    #[serde(default)]
    segments: Vec<RecognizedSegment>,
}

/// Recognizer that runs a configured command and reads a JSON transcript
/// (`{"segments": [{"start", "end", "text"}, …]}`) from its stdout. The
/// command is invoked as `<command> <args…> --language <lang> <media>`.
pub struct CommandRecognizer {
    command: String,
    args: Vec<String>,
}

impl CommandRecognizer {
    pub fn from_settings(settings: &RecognizerSettings) -> Option<Self> {
        settings.command.as_ref().map(|command| Self {
            command: command.clone(),
            args: settings.args.clone(),
        })
    }
}

impl SpeechRecognizer for CommandRecognizer {
    fn transcribe(&self, media: &Path, language: &str) -> ArchiveResult<Vec<RecognizedSegment>> {
        let failure = |reason: String| ArchiveError::RecognitionFailure {
            language: language.to_string(),
            reason,
        };

        let output = Command::new(&self.command)
            .args(&self.args)
            .arg("--language")
            .arg(language)
            .arg(media)
            .output()
            .map_err(|err| failure(format!("spawning {}: {err}", self.command)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        let payload: TranscriptPayload = serde_json::from_slice(&output.stdout)
            .map_err(|err| failure(format!("unreadable transcript: {err}")))?;
        Ok(payload.segments)
    }
}

/// A required language this video could not be subtitled in, with the reason
/// recorded on the archive record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageGap {
    pub language: String,
    pub reason: String,
}

/// Fills required languages the resolved platform tracks left uncovered.
pub struct FallbackSynthesizer {
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    timeout: Duration,
}

impl FallbackSynthesizer {
    pub fn new(recognizer: Option<Arc<dyn SpeechRecognizer>>, timeout: Duration) -> Self {
        Self {
            recognizer,
            timeout,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(0))
    }

    /// Required languages with no acceptable selected track. Manual tracks
    /// satisfy a requirement by language prefix (`en-US` covers `en`);
    /// auto-generated and synthesized tracks must match exactly.
    pub fn missing_languages(required: &[String], selected: &[CaptionTrack]) -> Vec<String> {
        required
            .iter()
            .filter(|language| !selected.iter().any(|track| covers(track, language)))
            .cloned()
            .collect()
    }

    /// Invokes the recognizer once per missing language, bounded by the
    /// configured timeout. Returns synthesized tracks plus a gap entry per
    /// language that stayed uncovered. Cancellation is checked before each
    /// invocation; languages left unprocessed become gaps.
    pub async fn fill_missing(
        &self,
        media: &Path,
        missing: &[String],
        cancel: &CancellationToken,
    ) -> (Vec<CaptionTrack>, Vec<LanguageGap>) {
        let mut tracks = Vec::new();
        let mut gaps = Vec::new();

        for language in missing {
            if cancel.is_cancelled() {
                gaps.push(LanguageGap {
                    language: language.clone(),
                    reason: ArchiveError::Cancelled.to_string(),
                });
                continue;
            }
            let Some(recognizer) = self.recognizer.clone() else {
                gaps.push(LanguageGap {
                    language: language.clone(),
                    reason: "fallback recognizer not configured".to_string(),
                });
                continue;
            };

            match self.recognize_one(recognizer, media, language).await {
                Ok(track) => {
                    info!(language, "synthesized caption track");
                    tracks.push(track);
                }
                Err(err) => {
                    warn!(language, "language stays unavailable: {err}");
                    gaps.push(LanguageGap {
                        language: language.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        (tracks, gaps)
    }

    async fn recognize_one(
        &self,
        recognizer: Arc<dyn SpeechRecognizer>,
        media: &Path,
        language: &str,
    ) -> ArchiveResult<CaptionTrack> {
        let media: PathBuf = media.to_path_buf();
        let lang = language.to_string();
        let task = tokio::task::spawn_blocking(move || recognizer.transcribe(&media, &lang));

        let segments = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => return Err(ArchiveError::Timeout(self.timeout.as_secs())),
            Ok(Err(join_err)) => {
                return Err(ArchiveError::RecognitionFailure {
                    language: language.to_string(),
                    reason: format!("recognizer task failed: {join_err}"),
                });
            }
            Ok(Ok(result)) => result?,
        };

        if segments.is_empty() {
            return Err(ArchiveError::RecognitionFailure {
                language: language.to_string(),
                reason: "recognizer returned no segments".to_string(),
            });
        }

        let cues: Vec<Cue> = segments.iter().map(RecognizedSegment::to_cue).collect();
        CaptionTrack::new(language, CaptionOrigin::Synthesized, cues)
    }
}

fn covers(track: &CaptionTrack, required: &str) -> bool {
    match track.origin {
        CaptionOrigin::Manual => {
            track.language == required
                || track
                    .language
                    .strip_prefix(required)
                    .is_some_and(|rest| rest.starts_with('-'))
        }
        CaptionOrigin::AutoGenerated | CaptionOrigin::Synthesized => track.language == required,
    }
}

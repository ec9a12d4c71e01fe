#![forbid(unsafe_code)]

//! Sentence reflow for caption tracks.
//!
//! Platform captions break lines for display width, not for meaning. Reflow
//! regroups consecutive cues into sentence-level segments: text accumulates
//! until terminal punctuation closes the sentence, or until the configured
//! duration/character budget forces a break. Timing is never invented —
//! every segment spans from the first contributing cue's start to the last
//! contributing cue's end.
//!
//! The operation is idempotent: a segment closed by punctuation still ends
//! with that punctuation, and a segment closed by the budget is itself at or
//! over the budget, so feeding segments back through `reflow` reproduces
//! them unchanged.

use serde::{Deserialize, Serialize};

use crate::config::ReflowSettings;
use crate::subtitle::track::{Cue, collapse_whitespace};

/// Break policy resolved for one language.
#[derive(Debug, Clone)]
pub struct ReflowPolicy {
    pub max_duration_ms: u64,
    pub max_chars: usize,
    terminal: Vec<char>,
}

impl ReflowPolicy {
    pub fn new(max_duration_ms: u64, max_chars: usize, terminal: Vec<char>) -> Self {
        Self {
            max_duration_ms,
            max_chars,
            terminal,
        }
    }

    pub fn for_language(settings: &ReflowSettings, language: &str) -> Self {
        Self {
            max_duration_ms: (settings.max_segment_secs * 1_000.0) as u64,
            max_chars: settings.max_segment_chars,
            terminal: settings.terminal_chars(language),
        }
    }

    /// True when `text` ends a sentence. Trailing closing quotes and brackets
    /// are looked through so `…end."` still terminates.
    fn ends_sentence(&self, text: &str) -> bool {
        text.chars()
            .rev()
            .find(|c| !matches!(c, '"' | '\'' | '”' | '’' | '»' | ')' | ']'))
            .is_some_and(|c| self.terminal.contains(&c))
    }
}

/// A sentence-level grouping of one or more cues. Boundaries always fall on
/// original cue boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Segment {
    pub fn to_cue(&self) -> Cue {
        Cue::new(self.start_ms, self.end_ms, self.text.clone())
    }
}

/// Regroups cues into sentence segments under `policy`.
pub fn reflow(cues: &[Cue], policy: &ReflowPolicy) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut start_ms = 0u64;
    let mut end_ms = 0u64;

    for cue in cues {
        let piece = collapse_whitespace(&cue.text);
        if piece.is_empty() {
            continue;
        }

        if text.is_empty() {
            start_ms = cue.start_ms;
            text = piece;
        } else if text.ends_with('-') && starts_lowercase(&piece) {
            // Cross-cue hyphenation: "every-" + "thing" -> "everything".
            text.pop();
            text.push_str(&piece);
        } else {
            text.push(' ');
            text.push_str(&piece);
        }
        end_ms = cue.end_ms;

        let over_budget = end_ms.saturating_sub(start_ms) >= policy.max_duration_ms
            || text.chars().count() >= policy.max_chars;
        if policy.ends_sentence(&text) || over_budget {
            segments.push(Segment {
                start_ms,
                end_ms,
                text: std::mem::take(&mut text),
            });
        }
    }

    if !text.is_empty() {
        segments.push(Segment {
            start_ms,
            end_ms,
            text,
        });
    }

    segments
}

fn starts_lowercase(text: &str) -> bool {
    text.chars().next().is_some_and(|c| c.is_lowercase())
}

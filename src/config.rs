#![forbid(unsafe_code)]

//! JSON configuration surface for the archiving pipeline.
//!
//! Every field has a default so a missing or partial config file still yields
//! a usable setup. Command-line flags override the file via
//! [`ConfigOverrides`], mirroring how the binaries layer their settings.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/archive.json";

/// Languages subtitles are required in when nothing else is configured.
pub const DEFAULT_SUBTITLE_LANGUAGES: [&str; 2] = ["en", "de"];

const DEFAULT_MAX_SEGMENT_SECS: f64 = 28.0;
const DEFAULT_MAX_SEGMENT_CHARS: usize = 240;
const DEFAULT_WORKER_LIMIT: usize = 4;
const DEFAULT_RECOGNIZER_TIMEOUT_SECS: u64 = 600;

/// What `put` does when a record for the same video identifier already
/// exists. Silent overwrite is deliberately not an option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Reject the second write with `DuplicateIdentity`.
    #[default]
    Fail,
    /// Overwrite the stored record with the new payload.
    Replace,
    /// Snapshot the stored record before overwriting it.
    Version,
}

/// Sentence-break policy for the reflowed subtitle variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflowSettings {
    /// Force a segment break once the accumulated span reaches this length,
    /// even without terminal punctuation.
    pub max_segment_secs: f64,
    /// Force a segment break once the accumulated text reaches this length.
    pub max_segment_chars: usize,
    /// Sentence-terminal punctuation per language code. Languages without an
    /// entry fall back to `. ! ?`.
    pub terminal_punctuation: HashMap<String, String>,
}

impl Default for ReflowSettings {
    fn default() -> Self {
        let mut terminal_punctuation = HashMap::new();
        terminal_punctuation.insert("en".to_string(), ".!?".to_string());
        terminal_punctuation.insert("de".to_string(), ".!?".to_string());
        Self {
            max_segment_secs: DEFAULT_MAX_SEGMENT_SECS,
            max_segment_chars: DEFAULT_MAX_SEGMENT_CHARS,
            terminal_punctuation,
        }
    }
}

impl ReflowSettings {
    pub fn terminal_chars(&self, language: &str) -> Vec<char> {
        self.terminal_punctuation
            .get(language)
            .or_else(|| {
                // "en-US" style tags reuse the base language entry.
                language
                    .split_once('-')
                    .and_then(|(base, _)| self.terminal_punctuation.get(base))
            })
            .map(|set| set.chars().collect())
            .unwrap_or_else(|| vec!['.', '!', '?'])
    }
}

/// External speech-recognition command invoked when no platform captions
/// cover a required language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerSettings {
    /// Program to run; `None` disables the fallback entirely.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: DEFAULT_RECOGNIZER_TIMEOUT_SECS,
        }
    }
}

/// Top-level configuration, deserialized from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Languages every archived video should carry subtitles in.
    pub subtitle_languages: Vec<String>,
    pub reflow: ReflowSettings,
    pub duplicate_policy: DuplicatePolicy,
    /// When set, records are staged with `postponed=true` instead of being
    /// placed in the final archive layout.
    pub postpone_post_processing: bool,
    /// Upper bound on concurrently processed videos.
    pub worker_limit: usize,
    pub recognizer: RecognizerSettings,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            subtitle_languages: DEFAULT_SUBTITLE_LANGUAGES
                .iter()
                .map(|lang| lang.to_string())
                .collect(),
            reflow: ReflowSettings::default(),
            duplicate_policy: DuplicatePolicy::default(),
            postpone_post_processing: false,
            worker_limit: DEFAULT_WORKER_LIMIT,
            recognizer: RecognizerSettings::default(),
        }
    }
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub postpone_post_processing: Option<bool>,
    pub worker_limit: Option<usize>,
    pub duplicate_policy: Option<DuplicatePolicy>,
}

impl ArchiveConfig {
    /// Loads the config file if it exists, otherwise returns defaults. A file
    /// that exists but does not parse is an error rather than a silent
    /// fallback.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(postpone) = overrides.postpone_post_processing {
            self.postpone_post_processing = postpone;
        }
        if let Some(limit) = overrides.worker_limit
            && limit > 0
        {
            self.worker_limit = limit;
        }
        if let Some(policy) = overrides.duplicate_policy {
            self.duplicate_policy = policy;
        }
        self
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.subtitle_languages.is_empty(),
            "subtitle_languages must not be empty"
        );
        anyhow::ensure!(
            self.reflow.max_segment_secs > 0.0,
            "reflow.max_segment_secs must be positive"
        );
        anyhow::ensure!(
            self.reflow.max_segment_chars > 0,
            "reflow.max_segment_chars must be positive"
        );
        anyhow::ensure!(self.worker_limit > 0, "worker_limit must be positive");
        Ok(())
    }
}

#![forbid(unsafe_code)]

//! Subtitle resolution and normalization.
//!
//! Raw caption payloads from the platform enter through [`adapter`], get
//! validated into [`track::CaptionTrack`]s, missing required languages are
//! filled by [`recognize`], and [`reflow`] plus [`emit`] turn the resolved
//! tracks into the verbatim and sentence-reflowed output variants.

pub mod adapter;
pub mod emit;
pub mod recognize;
pub mod reflow;
pub mod track;

pub use adapter::{RawCaptionPayload, TrackResolution, resolve_tracks};
pub use recognize::{
    CommandRecognizer, FallbackSynthesizer, LanguageGap, RecognizedSegment, SpeechRecognizer,
};
pub use reflow::{ReflowPolicy, Segment, reflow};
pub use track::{CaptionOrigin, CaptionTrack, Cue};

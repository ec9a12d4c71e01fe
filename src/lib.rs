#![forbid(unsafe_code)]

//! Library shared by the tubevault binaries.
//!
//! The pipeline here takes over once the external downloader has produced a
//! media file plus whatever raw caption payloads the platform exposed. It
//! resolves subtitles across their three origins (manual, auto-generated,
//! locally synthesized), normalizes them into verbatim and sentence-reflowed
//! variants, and commits the resulting archive record to the indexed store.

pub mod archive;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod security;
pub mod store;
pub mod subtitle;

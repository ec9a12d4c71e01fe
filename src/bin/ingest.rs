#![forbid(unsafe_code)]

//! Batch ingest: scans an intake directory produced by the external
//! downloader, runs every video through the archiving pipeline, and prints a
//! per-video summary. Exits non-zero when any video failed.
//!
//! Intake convention: one subdirectory per video holding the media file, an
//! `info.json` with identity and caption metadata, optionally a thumbnail,
//! and the caption files `info.json` refers to.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tubevault_tools::{
    archive::VideoIdentity,
    config::{ArchiveConfig, ConfigOverrides, DEFAULT_CONFIG_PATH, DuplicatePolicy},
    pipeline::{AcquiredVideo, ArchiveLayout, Archiver, VideoOutcome},
    security::ensure_not_root,
    store::ArchiveStore,
    subtitle::{CaptionOrigin, RawCaptionPayload},
};
use walkdir::WalkDir;

const ARCHIVE_DB_FILE: &str = "archive.db";

#[derive(Debug, Clone)]
struct IngestArgs {
    intake_dir: PathBuf,
    archive_root: PathBuf,
    config_path: PathBuf,
    overrides: ConfigOverrides,
}

impl IngestArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    #[cfg(test)]
    fn from_slice(values: &[&str]) -> Result<Self> {
        Self::from_iter(values.iter().map(|value| value.to_string()))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut intake_dir: Option<PathBuf> = None;
        let mut archive_root: Option<PathBuf> = None;
        let mut config_path: Option<PathBuf> = None;
        let mut overrides = ConfigOverrides::default();
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--archive-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--archive-root requires a value"))?;
                    archive_root = Some(PathBuf::from(value));
                }
                "--config" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a value"))?;
                    config_path = Some(PathBuf::from(value));
                }
                "--workers" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--workers requires a value"))?;
                    overrides.worker_limit =
                        Some(value.parse().context("parsing --workers value")?);
                }
                "--duplicate-policy" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--duplicate-policy requires a value"))?;
                    overrides.duplicate_policy = Some(parse_duplicate_policy(&value)?);
                }
                "--postpone" => {
                    overrides.postpone_post_processing = Some(true);
                }
                other if other.starts_with("--") => {
                    bail!("unknown argument: {other}");
                }
                _ if intake_dir.is_none() => {
                    intake_dir = Some(PathBuf::from(arg));
                }
                other => {
                    bail!("unexpected extra argument: {other}");
                }
            }
        }

        let intake_dir =
            intake_dir.ok_or_else(|| anyhow::anyhow!("an intake directory is required"))?;
        Ok(Self {
            intake_dir,
            archive_root: archive_root.unwrap_or_else(|| PathBuf::from("archive")),
            config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            overrides,
        })
    }
}

fn parse_duplicate_policy(value: &str) -> Result<DuplicatePolicy> {
    match value {
        "fail" => Ok(DuplicatePolicy::Fail),
        "replace" => Ok(DuplicatePolicy::Replace),
        "version" => Ok(DuplicatePolicy::Version),
        other => bail!("unknown duplicate policy: {other} (expected fail, replace or version)"),
    }
}

/// The subset of the downloader's `info.json` this binary needs.
#[derive(Debug, Deserialize)]
struct IntakeInfo {
    id: String,
    title: String,
    #[serde(alias = "webpage_url")]
    url: String,
    #[serde(alias = "uploader")]
    channel: String,
    upload_date: String,
    #[serde(default)]
    source_tag: Option<String>,
    /// Language code to caption file name, uploaded by the channel.
    #[serde(default)]
    subtitles: BTreeMap<String, String>,
    /// Language code to caption file name, platform speech recognition.
    #[serde(default)]
    automatic_captions: BTreeMap<String, String>,
}

const MEDIA_EXTENSIONS: [&str; 3] = ["mkv", "mp4", "webm"];
const THUMBNAIL_EXTENSIONS: [&str; 3] = ["jpg", "png", "webp"];

/// Finds every video subdirectory under the intake root and assembles the
/// pipeline inputs. A directory that cannot be read is skipped with a
/// warning, not fatal to the batch.
fn scan_intake(root: &Path) -> Result<Vec<AcquiredVideo>> {
    let mut videos = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
    {
        match load_video(entry.path()) {
            Ok(Some(video)) => videos.push(video),
            Ok(None) => {}
            Err(err) => {
                warn!("skipping {}: {err:#}", entry.path().display());
            }
        }
    }
    videos.sort_by(|a, b| a.identity.video_id.cmp(&b.identity.video_id));
    Ok(videos)
}

fn load_video(dir: &Path) -> Result<Option<AcquiredVideo>> {
    let info_path = dir.join("info.json");
    if !info_path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&info_path)
        .with_context(|| format!("reading {}", info_path.display()))?;
    let info: IntakeInfo =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", info_path.display()))?;

    let media_path = find_by_extension(dir, &MEDIA_EXTENSIONS)
        .with_context(|| format!("no media file in {}", dir.display()))?;
    let thumbnail_path = find_by_extension(dir, &THUMBNAIL_EXTENSIONS).ok();

    let mut captions = Vec::new();
    for (origin, entries) in [
        (CaptionOrigin::Manual, &info.subtitles),
        (CaptionOrigin::AutoGenerated, &info.automatic_captions),
    ] {
        for (language, file_name) in entries {
            let path = dir.join(file_name);
            let data = fs::read(&path)
                .with_context(|| format!("reading caption file {}", path.display()))?;
            captions.push(RawCaptionPayload::new(language.clone(), origin, data));
        }
    }

    Ok(Some(AcquiredVideo {
        identity: VideoIdentity {
            video_id: info.id,
            url: info.url,
            title: info.title,
            channel: info.channel,
            upload_date: normalize_upload_date(&info.upload_date),
        },
        source_tag: info.source_tag.unwrap_or_else(|| "direct".to_string()),
        media_path,
        thumbnail_path,
        captions,
    }))
}

fn find_by_extension(dir: &Path, extensions: &[&str]) -> Result<PathBuf> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext))
        })
        .collect();
    entries.sort();
    entries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no file with extension {:?}", extensions))
}

/// The downloader reports `YYYYMMDD`; the archive stores `YYYY-MM-DD`.
fn normalize_upload_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() == 8 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return format!("{}-{}-{}", &trimmed[..4], &trimmed[4..6], &trimmed[6..8]);
    }
    trimmed.to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("ingest")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = IngestArgs::parse()?;
    let config = ArchiveConfig::load(&args.config_path)?.with_overrides(args.overrides.clone());

    let videos = scan_intake(&args.intake_dir)?;
    if videos.is_empty() {
        println!("No videos found in {}.", args.intake_dir.display());
        return Ok(());
    }
    println!(
        "Ingesting {} video(s) into {} with {} worker(s).",
        videos.len(),
        args.archive_root.display(),
        config.worker_limit
    );

    let store = Arc::new(
        ArchiveStore::open(&args.archive_root.join(ARCHIVE_DB_FILE))
            .await
            .context("opening archive store")?,
    );
    let layout = ArchiveLayout::new(&args.archive_root);
    let archiver = Arc::new(Archiver::new(config, store, layout));

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupt received, finishing in-flight videos only.");
            signal_cancel.cancel();
        }
    });

    let reports = archiver.run_batch(videos, cancel).await;

    let mut succeeded = 0usize;
    let mut with_gaps = 0usize;
    let mut failed = 0usize;
    println!();
    for report in &reports {
        match &report.outcome {
            VideoOutcome::Succeeded => {
                succeeded += 1;
                println!("  ok      {}", report.video_id);
            }
            VideoOutcome::SucceededWithGaps(gaps) => {
                with_gaps += 1;
                let languages: Vec<&str> =
                    gaps.iter().map(|gap| gap.language.as_str()).collect();
                println!("  gaps    {} (missing: {})", report.video_id, languages.join(", "));
            }
            VideoOutcome::Failed(reason) => {
                failed += 1;
                println!("  FAILED  {}: {}", report.video_id, reason);
            }
        }
    }
    println!();
    println!(
        "Done: {} archived, {} with language gaps, {} failed.",
        succeeded + with_gaps,
        with_gaps,
        failed
    );

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn args_require_intake_dir() {
        assert!(IngestArgs::from_slice(&[]).is_err());
        let args = IngestArgs::from_slice(&["/data/intake"]).unwrap();
        assert_eq!(args.intake_dir, PathBuf::from("/data/intake"));
        assert_eq!(args.archive_root, PathBuf::from("archive"));
        assert_eq!(args.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn args_parse_overrides() {
        let args = IngestArgs::from_slice(&[
            "--archive-root",
            "/srv/vault",
            "--config",
            "/etc/vault.json",
            "--workers",
            "8",
            "--duplicate-policy",
            "replace",
            "--postpone",
            "/data/intake",
        ])
        .unwrap();
        assert_eq!(args.archive_root, PathBuf::from("/srv/vault"));
        assert_eq!(args.config_path, PathBuf::from("/etc/vault.json"));
        assert_eq!(args.overrides.worker_limit, Some(8));
        assert_eq!(
            args.overrides.duplicate_policy,
            Some(DuplicatePolicy::Replace)
        );
        assert_eq!(args.overrides.postpone_post_processing, Some(true));
    }

    #[test]
    fn args_reject_unknown_flags() {
        let err = IngestArgs::from_slice(&["--frobnicate", "/data"]).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
        assert!(IngestArgs::from_slice(&["--workers"]).is_err());
        assert!(IngestArgs::from_slice(&["a", "b"]).is_err());
    }

    #[test]
    fn duplicate_policy_values() {
        assert_eq!(parse_duplicate_policy("fail").unwrap(), DuplicatePolicy::Fail);
        assert_eq!(
            parse_duplicate_policy("version").unwrap(),
            DuplicatePolicy::Version
        );
        assert!(parse_duplicate_policy("overwrite").is_err());
    }

    #[test]
    fn upload_dates_normalize() {
        assert_eq!(normalize_upload_date("20240315"), "2024-03-15");
        assert_eq!(normalize_upload_date("2024-03-15"), "2024-03-15");
        assert_eq!(normalize_upload_date(" 20240315 "), "2024-03-15");
    }

    fn write_intake_video(root: &Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{id}.mkv")), b"media").unwrap();
        fs::write(dir.join("thumb.jpg"), b"jpeg").unwrap();
        fs::write(
            dir.join("en.vtt"),
            "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHello.\n\n",
        )
        .unwrap();
        fs::write(
            dir.join("de.auto.vtt"),
            "WEBVTT\n\n00:00:00.000 --> 00:00:02.000\nHallo.\n\n",
        )
        .unwrap();
        let mut info = fs::File::create(dir.join("info.json")).unwrap();
        write!(
            info,
            r#"{{
                "id": "{id}",
                "title": "Video {id}",
                "webpage_url": "https://example.invalid/watch?v={id}",
                "uploader": "Channel",
                "upload_date": "20240315",
                "subtitles": {{"en": "en.vtt"}},
                "automatic_captions": {{"de": "de.auto.vtt"}}
            }}"#
        )
        .unwrap();
        dir
    }

    #[test]
    fn scan_intake_classifies_caption_origins() {
        let temp = tempdir().unwrap();
        write_intake_video(temp.path(), "vid-b");
        write_intake_video(temp.path(), "vid-a");
        // A stray non-video directory is ignored.
        fs::create_dir_all(temp.path().join("logs")).unwrap();

        let videos = scan_intake(temp.path()).unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].identity.video_id, "vid-a");
        assert_eq!(videos[0].identity.upload_date, "2024-03-15");
        assert_eq!(videos[0].source_tag, "direct");
        assert!(videos[0].thumbnail_path.is_some());

        let origins: Vec<(String, CaptionOrigin)> = videos[0]
            .captions
            .iter()
            .map(|payload| (payload.language.clone(), payload.origin))
            .collect();
        assert!(origins.contains(&("en".to_string(), CaptionOrigin::Manual)));
        assert!(origins.contains(&("de".to_string(), CaptionOrigin::AutoGenerated)));
    }

    #[test]
    fn load_video_without_info_is_skipped() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("not-a-video");
        fs::create_dir_all(&dir).unwrap();
        assert!(load_video(&dir).unwrap().is_none());
    }

    #[test]
    fn load_video_requires_media_file() {
        let temp = tempdir().unwrap();
        let dir = write_intake_video(temp.path(), "vid-1");
        fs::remove_file(dir.join("vid-1.mkv")).unwrap();
        assert!(load_video(&dir).is_err());
    }
}

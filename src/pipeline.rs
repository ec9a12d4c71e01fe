#![forbid(unsafe_code)]

//! Per-video archiving pipeline and the bounded batch runner.
//!
//! Each video is an independent unit of work: resolve caption tracks, fill
//! missing languages through the recognizer fallback, emit subtitle variants
//! to disk, then commit one record to the store. A failing video never takes
//! its siblings down, and a cancelled batch aborts between stages so no
//! partially written record ever reaches the store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::{ArchiveRecord, ArchiveRecordBuilder, AssetPaths, SubtitleVariant, VideoIdentity};
use crate::config::{ArchiveConfig, DuplicatePolicy};
use crate::error::{ArchiveError, ArchiveResult};
use crate::store::ArchiveStore;
use crate::subtitle::{
    CaptionTrack, CommandRecognizer, FallbackSynthesizer, LanguageGap, RawCaptionPayload,
    SpeechRecognizer, emit::write_atomic, resolve_tracks,
};

/// Everything the external downloader hands over for one video.
#[derive(Debug, Clone)]
pub struct AcquiredVideo {
    pub identity: VideoIdentity,
    pub source_tag: String,
    pub media_path: PathBuf,
    pub thumbnail_path: Option<PathBuf>,
    pub captions: Vec<RawCaptionPayload>,
}

/// On-disk layout of the archive: finalized videos live under `active/`,
/// postponed ones stage their subtitle assets under `paused/`.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    active_root: PathBuf,
    paused_root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        let root = archive_root.into();
        Self {
            active_root: root.join("active"),
            paused_root: root.join("paused"),
        }
    }

    pub fn active_dir(&self, video_id: &str) -> PathBuf {
        self.active_root.join(video_id)
    }

    pub fn staging_dir(&self, video_id: &str) -> PathBuf {
        self.paused_root.join(video_id)
    }
}

/// Final state of one video's pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoOutcome {
    Succeeded,
    /// Archived, but some required languages stayed uncovered.
    SucceededWithGaps(Vec<LanguageGap>),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoReport {
    pub video_id: String,
    pub outcome: VideoOutcome,
}

impl VideoReport {
    pub fn succeeded(&self) -> bool {
        !matches!(self.outcome, VideoOutcome::Failed(_))
    }
}

/// Drives the per-video pipeline against one store and archive layout.
pub struct Archiver {
    config: ArchiveConfig,
    store: Arc<ArchiveStore>,
    layout: ArchiveLayout,
    synthesizer: FallbackSynthesizer,
}

impl Archiver {
    pub fn new(config: ArchiveConfig, store: Arc<ArchiveStore>, layout: ArchiveLayout) -> Self {
        let recognizer = CommandRecognizer::from_settings(&config.recognizer)
            .map(|recognizer| Arc::new(recognizer) as Arc<dyn SpeechRecognizer>);
        let timeout = Duration::from_secs(config.recognizer.timeout_secs);
        Self {
            synthesizer: FallbackSynthesizer::new(recognizer, timeout),
            config,
            store,
            layout,
        }
    }

    /// Swaps in a recognizer implementation, bypassing the command settings.
    pub fn with_recognizer(mut self, recognizer: Arc<dyn SpeechRecognizer>) -> Self {
        let timeout = Duration::from_secs(self.config.recognizer.timeout_secs);
        self.synthesizer = FallbackSynthesizer::new(Some(recognizer), timeout);
        self
    }

    /// Runs every video through the pipeline with at most `worker_limit`
    /// in flight. Reports come back in input order regardless of completion
    /// order.
    pub async fn run_batch(
        self: Arc<Self>,
        videos: Vec<AcquiredVideo>,
        cancel: CancellationToken,
    ) -> Vec<VideoReport> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_limit));
        let total = videos.len();
        let mut join_set = JoinSet::new();

        for (index, video) in videos.into_iter().enumerate() {
            let archiver = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let video_id = video.identity.video_id.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            VideoReport {
                                video_id,
                                outcome: VideoOutcome::Failed(
                                    ArchiveError::Cancelled.to_string(),
                                ),
                            },
                        );
                    }
                };
                (index, archiver.report_for(video, &cancel).await)
            });
        }

        let mut reports: Vec<Option<VideoReport>> = (0..total).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, report)) = joined {
                reports[index] = Some(report);
            }
        }
        reports.into_iter().flatten().collect()
    }

    async fn report_for(&self, video: AcquiredVideo, cancel: &CancellationToken) -> VideoReport {
        let video_id = video.identity.video_id.clone();
        let outcome = match self.process_video(video, cancel).await {
            Ok(gaps) if gaps.is_empty() => VideoOutcome::Succeeded,
            Ok(gaps) => VideoOutcome::SucceededWithGaps(gaps),
            Err(err) => {
                warn!(video_id, "archiving failed: {err}");
                VideoOutcome::Failed(err.to_string())
            }
        };
        VideoReport { video_id, outcome }
    }

    /// The per-video pipeline. Cancellation is honored between stages; once
    /// the store commit starts the video completes. Subtitle assets are
    /// written into the staging layout and only promoted to `active/` after
    /// the record is committed, so a rejected or aborted video never disturbs
    /// what is already archived.
    async fn process_video(
        &self,
        video: AcquiredVideo,
        cancel: &CancellationToken,
    ) -> ArchiveResult<Vec<LanguageGap>> {
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let video_id = video.identity.video_id.clone();

        // Under the fail policy a re-ingest is rejected before anything
        // touches disk. The per-id lock inside `put` still catches a race
        // between two in-flight writers.
        if self.config.duplicate_policy == DuplicatePolicy::Fail
            && self.store.get(&video_id).await?.is_some()
        {
            return Err(ArchiveError::DuplicateIdentity(video_id));
        }

        let resolution = resolve_tracks(&video.captions);

        let missing = FallbackSynthesizer::missing_languages(
            &self.config.subtitle_languages,
            &resolution.selected,
        );
        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let (synthesized, gaps) = self
            .synthesizer
            .fill_missing(&video.media_path, &missing, cancel)
            .await;

        let mut tracks = resolution.selected;
        tracks.extend(synthesized.iter().cloned());
        let mut variants = Vec::new();
        for track in &tracks {
            variants.push(SubtitleVariant::verbatim(track));
            variants.push(SubtitleVariant::reflowed(track, &self.config.reflow));
        }

        if cancel.is_cancelled() {
            return Err(ArchiveError::Cancelled);
        }
        let staging_dir = self.layout.staging_dir(&video_id);
        let subtitle_paths = write_variants(&staging_dir, &video_id, &variants)?;

        let mut raw_tracks = resolution.raw_tracks;
        raw_tracks.extend(synthesized);
        let mut builder = ArchiveRecordBuilder::new(video.identity, video.source_tag)
            .video_asset(&video.media_path)
            .raw_tracks(raw_tracks)
            .variants(variants)
            .gaps(gaps.clone())
            // Committed as postponed; promotion flips the flag. A crash
            // between the two leaves a record `maintain --finalize` picks up.
            .postponed(true);
        if let Some(thumbnail) = &video.thumbnail_path {
            builder = builder.thumbnail(thumbnail);
        }
        for path in &subtitle_paths {
            builder = builder.subtitle_asset(path);
        }
        let record = match builder.build() {
            Ok(record) => record,
            Err(err) => {
                discard_staged(&staging_dir, &subtitle_paths);
                return Err(err);
            }
        };

        if cancel.is_cancelled() {
            discard_staged(&staging_dir, &subtitle_paths);
            return Err(ArchiveError::Cancelled);
        }
        if let Err(err) = self.store.put(&record, self.config.duplicate_policy).await {
            discard_staged(&staging_dir, &subtitle_paths);
            return Err(err);
        }

        let postponed = self.config.postpone_post_processing;
        if !postponed {
            let assets = self.relocate_assets(&record)?;
            self.store.finalize(&video_id, &assets).await?;
        }
        info!(video_id, postponed, "archived video");
        Ok(gaps)
    }

    /// Moves every postponed record's staged subtitle assets into the active
    /// layout and flips its flag in the store. Returns how many records were
    /// finalized. Safe to re-run: already-final records are not listed.
    pub async fn finalize_postponed(&self) -> ArchiveResult<usize> {
        let staged = self.store.list_postponed().await?;
        let mut finalized = 0;
        for record in staged {
            let video_id = &record.identity.video_id;
            let assets = self.relocate_assets(&record)?;
            if self.store.finalize(video_id, &assets).await? {
                info!(video_id, "finalized postponed record");
                finalized += 1;
            }
        }
        Ok(finalized)
    }

    fn relocate_assets(&self, record: &ArchiveRecord) -> ArchiveResult<AssetPaths> {
        let video_id = &record.identity.video_id;
        let active_dir = self.layout.active_dir(video_id);
        fs::create_dir_all(&active_dir)
            .map_err(|err| ArchiveError::persistence(&active_dir, err))?;

        let mut subtitles = Vec::with_capacity(record.assets.subtitles.len());
        for staged in &record.assets.subtitles {
            let Some(name) = staged.file_name() else {
                continue;
            };
            let target = active_dir.join(name);
            if staged != &target && staged.exists() {
                fs::rename(staged, &target)
                    .map_err(|err| ArchiveError::persistence(staged, err))?;
            }
            subtitles.push(target);
        }

        let staging_dir = self.layout.staging_dir(video_id);
        if staging_dir.exists() {
            // Leftover staging dirs are empty at this point.
            let _ = fs::remove_dir(&staging_dir);
        }

        Ok(AssetPaths {
            video: record.assets.video.clone(),
            thumbnail: record.assets.thumbnail.clone(),
            subtitles,
        })
    }
}

/// Best-effort cleanup of subtitle files staged for a video that never
/// committed.
fn discard_staged(dir: &Path, paths: &[PathBuf]) {
    for path in paths {
        let _ = fs::remove_file(path);
    }
    let _ = fs::remove_dir(dir);
}

fn write_variants(
    dir: &Path,
    video_id: &str,
    variants: &[SubtitleVariant],
) -> ArchiveResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for variant in variants {
        let srt_path = dir.join(variant.file_name(video_id));
        write_atomic(&srt_path, &variant.srt)?;
        paths.push(srt_path);
        if let Some(vtt) = &variant.vtt {
            let vtt_path = dir.join(format!("{video_id}.{}.vtt", variant.language));
            write_atomic(&vtt_path, vtt)?;
            paths.push(vtt_path);
        }
    }
    Ok(paths)
}

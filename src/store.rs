#![forbid(unsafe_code)]

//! Metadata store and search index for archive records.
//!
//! One SQLite database holds the canonical `records` table plus derived
//! token/date indexes. Writes for the same video identifier serialize on a
//! per-id async lock; writes for distinct identifiers proceed in parallel.
//! Every index row is derivable from `records`, so `rebuild_indexes` can
//! always reproduce the incremental state from scratch.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use libsql::{Builder, Connection, Row, Value, params};

use crate::archive::{ArchiveRecord, AssetPaths, SubtitleVariant, VideoIdentity};
use crate::config::DuplicatePolicy;
use crate::error::{ArchiveError, ArchiveResult};
use crate::subtitle::{CaptionTrack, LanguageGap};

async fn configure_connection(conn: &Connection) -> ArchiveResult<()> {
    // PRAGMA journal_mode returns a result row, which libsql's
    // execute_batch rejects with ExecuteReturnedRows; run it via query.
    conn.query("PRAGMA journal_mode=WAL", params![]).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> ArchiveResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            video_id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            channel TEXT NOT NULL,
            upload_date TEXT NOT NULL,
            source_tag TEXT NOT NULL DEFAULT '',
            downloaded_at TEXT NOT NULL,
            video_path TEXT NOT NULL,
            thumbnail_path TEXT,
            subtitle_paths_json TEXT NOT NULL DEFAULT '[]',
            raw_tracks_json TEXT NOT NULL DEFAULT '[]',
            variants_json TEXT NOT NULL DEFAULT '[]',
            gaps_json TEXT NOT NULL DEFAULT '[]',
            fingerprint TEXT NOT NULL DEFAULT '',
            postponed INTEGER NOT NULL DEFAULT 0,
            revision INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS record_versions (
            video_id TEXT NOT NULL,
            revision INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            snapshotted_at TEXT NOT NULL,
            PRIMARY KEY (video_id, revision)
        );

        CREATE TABLE IF NOT EXISTS title_tokens (
            token TEXT NOT NULL,
            video_id TEXT NOT NULL,
            PRIMARY KEY (token, video_id)
        );

        CREATE TABLE IF NOT EXISTS subtitle_tokens (
            token TEXT NOT NULL,
            language TEXT NOT NULL,
            video_id TEXT NOT NULL,
            PRIMARY KEY (token, language, video_id)
        );

        CREATE INDEX IF NOT EXISTS idx_records_channel ON records(channel);
        CREATE INDEX IF NOT EXISTS idx_records_source_tag ON records(source_tag);
        CREATE INDEX IF NOT EXISTS idx_records_upload_date ON records(upload_date);
        CREATE INDEX IF NOT EXISTS idx_records_downloaded_at ON records(downloaded_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Filters for [`ArchiveStore::query`]. Empty query returns every finalized
/// record; `include_postponed` widens the result to staged records too.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Free-text search over title and subtitle tokens; every token must
    /// match.
    pub text: Option<String>,
    /// Restrict subtitle-token matches to one language.
    pub language: Option<String>,
    pub channel: Option<String>,
    pub source_tag: Option<String>,
    /// `YYYY-MM-DD`, inclusive.
    pub uploaded_from: Option<String>,
    pub uploaded_to: Option<String>,
    pub include_postponed: bool,
}

/// Wrapper around the SQLite connection that performs all record reads and
/// writes.
pub struct ArchiveStore {
    conn: Connection,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// SQLite takes one writer at a time; every write on the shared
    /// connection holds this lock so a standalone statement never joins
    /// another task's open transaction.
    write_lock: tokio::sync::Mutex<()>,
}

impl ArchiveStore {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> ArchiveResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| ArchiveError::persistence(parent, err))?;
        }

        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            conn,
            locks: parking_lot::Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_for(&self, video_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(video_id.to_string()).or_default().clone()
    }

    /// Stores a record under the given duplicate policy and returns the
    /// revision it was stored at. `Fail` rejects a second write for the same
    /// identifier, `Replace` overwrites, `Version` snapshots the stored
    /// record into `record_versions` before overwriting.
    pub async fn put(
        &self,
        record: &ArchiveRecord,
        policy: DuplicatePolicy,
    ) -> ArchiveResult<u32> {
        let lock = self.lock_for(&record.identity.video_id);
        let _guard = lock.lock().await;

        let existing = self.get_unlocked(&record.identity.video_id).await?;
        let revision = match (&existing, policy) {
            (None, _) => 0,
            (Some(_), DuplicatePolicy::Fail) => {
                return Err(ArchiveError::DuplicateIdentity(
                    record.identity.video_id.clone(),
                ));
            }
            (Some(prior), DuplicatePolicy::Replace) => prior.revision + 1,
            (Some(prior), DuplicatePolicy::Version) => {
                self.snapshot_version(prior).await?;
                prior.revision + 1
            }
        };

        self.write_record(record, revision).await?;
        Ok(revision)
    }

    async fn snapshot_version(&self, prior: &ArchiveRecord) -> ArchiveResult<()> {
        let snapshot = serde_json::to_string(prior)?;
        let _write = self.write_lock.lock().await;
        self.conn
            .execute(
                r#"
                INSERT INTO record_versions (video_id, revision, snapshot_json, snapshotted_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(video_id, revision) DO UPDATE SET
                    snapshot_json = excluded.snapshot_json,
                    snapshotted_at = excluded.snapshotted_at
                "#,
                params![
                    prior.identity.video_id.as_str(),
                    prior.revision as i64,
                    snapshot,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Writes the record row and its derived index rows in one transaction so
    /// the index never describes a record that was not committed.
    async fn write_record(&self, record: &ArchiveRecord, revision: u32) -> ArchiveResult<()> {
        let subtitle_paths_json = serde_json::to_string(&record.assets.subtitles)?;
        let raw_tracks_json = serde_json::to_string(&record.raw_tracks)?;
        let variants_json = serde_json::to_string(&record.variants)?;
        let gaps_json = serde_json::to_string(&record.gaps)?;

        let _write = self.write_lock.lock().await;
        let tx = self.conn.transaction().await?;
        tx.execute(
            r#"
            INSERT INTO records (
                video_id, url, title, channel, upload_date, source_tag,
                downloaded_at, video_path, thumbnail_path, subtitle_paths_json,
                raw_tracks_json, variants_json, gaps_json, fingerprint,
                postponed, revision
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16
            )
            ON CONFLICT(video_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                channel = excluded.channel,
                upload_date = excluded.upload_date,
                source_tag = excluded.source_tag,
                downloaded_at = excluded.downloaded_at,
                video_path = excluded.video_path,
                thumbnail_path = excluded.thumbnail_path,
                subtitle_paths_json = excluded.subtitle_paths_json,
                raw_tracks_json = excluded.raw_tracks_json,
                variants_json = excluded.variants_json,
                gaps_json = excluded.gaps_json,
                fingerprint = excluded.fingerprint,
                postponed = excluded.postponed,
                revision = excluded.revision
            "#,
            params![
                record.identity.video_id.as_str(),
                record.identity.url.as_str(),
                record.identity.title.as_str(),
                record.identity.channel.as_str(),
                record.identity.upload_date.as_str(),
                record.source_tag.as_str(),
                record.downloaded_at.as_str(),
                path_to_string(&record.assets.video),
                record.assets.thumbnail.as_deref().map(path_to_string),
                subtitle_paths_json,
                raw_tracks_json,
                variants_json,
                gaps_json,
                record.fingerprint.as_str(),
                record.postponed as i64,
                revision as i64,
            ],
        )
        .await?;

        reindex_one(&tx, &record.identity.video_id, &record.identity.title, &record.variants)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, video_id: &str) -> ArchiveResult<Option<ArchiveRecord>> {
        self.get_unlocked(video_id).await
    }

    async fn get_unlocked(&self, video_id: &str) -> ArchiveResult<Option<ArchiveRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT} WHERE video_id = ?1"))
            .await?;
        let mut rows = stmt.query([video_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Prior revisions snapshotted by the `version` duplicate policy, oldest
    /// first.
    pub async fn versions(&self, video_id: &str) -> ArchiveResult<Vec<ArchiveRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT snapshot_json FROM record_versions
                WHERE video_id = ?1
                ORDER BY revision ASC
                "#,
            )
            .await?;
        let mut rows = stmt.query([video_id]).await?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next().await? {
            let json: String = row.get(0)?;
            snapshots.push(serde_json::from_str(&json)?);
        }
        Ok(snapshots)
    }

    /// Runs a filtered query over the archive. Postponed records are excluded
    /// unless the query opts in, so half-finished imports never surface in
    /// search results.
    pub async fn query(&self, query: &RecordQuery) -> ArchiveResult<Vec<ArchiveRecord>> {
        let mut sql = format!("{RECORD_SELECT} WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();

        if !query.include_postponed {
            sql.push_str(" AND postponed = 0");
        }
        if let Some(channel) = &query.channel {
            values.push(Value::from(channel.clone()));
            sql.push_str(&format!(" AND channel = ?{}", values.len()));
        }
        if let Some(tag) = &query.source_tag {
            values.push(Value::from(tag.clone()));
            sql.push_str(&format!(" AND source_tag = ?{}", values.len()));
        }
        if let Some(from) = &query.uploaded_from {
            values.push(Value::from(from.clone()));
            sql.push_str(&format!(" AND upload_date >= ?{}", values.len()));
        }
        if let Some(to) = &query.uploaded_to {
            values.push(Value::from(to.clone()));
            sql.push_str(&format!(" AND upload_date <= ?{}", values.len()));
        }
        if let Some(text) = &query.text {
            for token in tokenize(text) {
                values.push(Value::from(token));
                let token_ref = values.len();
                let mut subtitle_clause = format!(
                    "EXISTS (SELECT 1 FROM subtitle_tokens st \
                     WHERE st.video_id = records.video_id AND st.token = ?{token_ref}"
                );
                if let Some(language) = &query.language {
                    values.push(Value::from(language.clone()));
                    subtitle_clause.push_str(&format!(" AND st.language = ?{}", values.len()));
                }
                subtitle_clause.push(')');
                sql.push_str(&format!(
                    " AND ({subtitle_clause} OR EXISTS \
                     (SELECT 1 FROM title_tokens tt \
                      WHERE tt.video_id = records.video_id AND tt.token = ?{token_ref}))"
                ));
            }
        }
        sql.push_str(" ORDER BY upload_date DESC, video_id ASC");

        let mut stmt = self.conn.prepare(&sql).await?;
        let mut rows = stmt.query(libsql::params_from_iter(values)).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Records still staged by postpone mode, oldest download first.
    pub async fn list_postponed(&self) -> ArchiveResult<Vec<ArchiveRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{RECORD_SELECT} WHERE postponed = 1 ORDER BY downloaded_at ASC"
            ))
            .await?;
        let mut rows = stmt.query(params![]).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Marks a postponed record finalized, rewriting its asset paths to the
    /// relocated locations. Idempotent: finalizing an already-final record
    /// rewrites the same values. Returns false when no such record exists.
    pub async fn finalize(&self, video_id: &str, assets: &AssetPaths) -> ArchiveResult<bool> {
        let lock = self.lock_for(video_id);
        let _guard = lock.lock().await;

        let subtitle_paths_json = serde_json::to_string(&assets.subtitles)?;
        let _write = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE records SET
                    postponed = 0,
                    video_path = ?2,
                    thumbnail_path = ?3,
                    subtitle_paths_json = ?4
                WHERE video_id = ?1
                "#,
                params![
                    video_id,
                    path_to_string(&assets.video),
                    assets.thumbnail.as_deref().map(path_to_string),
                    subtitle_paths_json,
                ],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Drops and rebuilds every derived index row from the `records` table.
    /// Running it on a healthy store is a no-op in effect.
    pub async fn rebuild_indexes(&self) -> ArchiveResult<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT video_id, title, variants_json FROM records")
            .await?;
        let mut rows = stmt.query(params![]).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            let video_id: String = row.get(0)?;
            let title: String = row.get(1)?;
            let variants_json: String = row.get(2)?;
            let variants: Vec<SubtitleVariant> = serde_json::from_str(&variants_json)?;
            entries.push((video_id, title, variants));
        }

        let _write = self.write_lock.lock().await;
        let tx = self.conn.transaction().await?;
        tx.execute("DELETE FROM title_tokens", params![]).await?;
        tx.execute("DELETE FROM subtitle_tokens", params![]).await?;
        for (video_id, title, variants) in &entries {
            reindex_one(&tx, video_id, title, variants).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

const RECORD_SELECT: &str = r#"
    SELECT video_id, url, title, channel, upload_date, source_tag,
           downloaded_at, video_path, thumbnail_path, subtitle_paths_json,
           raw_tracks_json, variants_json, gaps_json, fingerprint,
           postponed, revision
    FROM records
"#;

/// Replaces the token rows for one record inside the caller's transaction.
async fn reindex_one(
    tx: &libsql::Transaction,
    video_id: &str,
    title: &str,
    variants: &[SubtitleVariant],
) -> ArchiveResult<()> {
    tx.execute(
        "DELETE FROM title_tokens WHERE video_id = ?1",
        params![video_id],
    )
    .await?;
    tx.execute(
        "DELETE FROM subtitle_tokens WHERE video_id = ?1",
        params![video_id],
    )
    .await?;

    for token in tokenize(title) {
        tx.execute(
            "INSERT OR IGNORE INTO title_tokens (token, video_id) VALUES (?1, ?2)",
            params![token, video_id],
        )
        .await?;
    }
    for variant in variants {
        for token in tokenize(&variant.search_body) {
            tx.execute(
                r#"
                INSERT OR IGNORE INTO subtitle_tokens (token, language, video_id)
                VALUES (?1, ?2, ?3)
                "#,
                params![token, variant.language.as_str(), video_id],
            )
            .await?;
        }
    }
    Ok(())
}

/// Lowercased alphanumeric tokens, deduplicated and sorted. Matches how both
/// indexing and query parsing split text, so the two always agree.
pub fn tokenize(text: &str) -> Vec<String> {
    let tokens: BTreeSet<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_string())
        .collect();
    tokens.into_iter().collect()
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn row_to_record(row: &Row) -> ArchiveResult<ArchiveRecord> {
    // Column order must match RECORD_SELECT.
    let subtitle_paths_json: String = row.get(9)?;
    let raw_tracks_json: String = row.get(10)?;
    let variants_json: String = row.get(11)?;
    let gaps_json: String = row.get(12)?;

    let subtitles: Vec<PathBuf> = serde_json::from_str(&subtitle_paths_json)?;
    let raw_tracks: Vec<CaptionTrack> = serde_json::from_str(&raw_tracks_json)?;
    let variants: Vec<SubtitleVariant> = serde_json::from_str(&variants_json)?;
    let gaps: Vec<LanguageGap> = serde_json::from_str(&gaps_json)?;

    let thumbnail: Option<String> = row.get(8)?;
    Ok(ArchiveRecord {
        identity: VideoIdentity {
            video_id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            channel: row.get(3)?,
            upload_date: row.get(4)?,
        },
        source_tag: row.get(5)?,
        downloaded_at: row.get(6)?,
        assets: AssetPaths {
            video: PathBuf::from(row.get::<String>(7)?),
            thumbnail: thumbnail.map(PathBuf::from),
            subtitles,
        },
        raw_tracks,
        variants,
        gaps,
        fingerprint: row.get(13)?,
        postponed: row.get::<i64>(14)? != 0,
        revision: row.get::<i64>(15)? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveRecordBuilder;
    use crate::subtitle::{CaptionOrigin, Cue};
    use tempfile::tempdir;

    fn identity(id: &str, title: &str, channel: &str) -> VideoIdentity {
        VideoIdentity {
            video_id: id.into(),
            url: format!("https://example.invalid/watch?v={id}"),
            title: title.into(),
            channel: channel.into(),
            upload_date: "2024-03-15".into(),
        }
    }

    fn track(text: &str) -> CaptionTrack {
        CaptionTrack::new(
            "en",
            CaptionOrigin::Manual,
            vec![Cue::new(0, 3_000, text)],
        )
        .unwrap()
    }

    fn record(dir: &tempfile::TempDir, id: &str, title: &str, subtitle_text: &str) -> ArchiveRecord {
        let video = dir.path().join(format!("{id}.mkv"));
        std::fs::write(&video, b"media bytes").unwrap();
        ArchiveRecordBuilder::new(identity(id, title, "The Channel"), "direct")
            .video_asset(video)
            .variants(vec![SubtitleVariant::verbatim(&track(subtitle_text))])
            .downloaded_at("2024-03-15T12:00:00+00:00")
            .build()
            .unwrap()
    }

    async fn open_store(dir: &tempfile::TempDir) -> ArchiveStore {
        ArchiveStore::open(&dir.path().join("db/archive.db"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let rec = record(&dir, "vid-1", "First Video", "hello archive world.");

        let revision = store.put(&rec, DuplicatePolicy::Fail).await.unwrap();
        assert_eq!(revision, 0);

        let fetched = store.get("vid-1").await.unwrap().unwrap();
        assert_eq!(fetched.identity, rec.identity);
        assert_eq!(fetched.variants, rec.variants);
        assert_eq!(fetched.fingerprint, rec.fingerprint);
        assert!(store.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_fails_under_default_policy() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let rec = record(&dir, "vid-1", "First", "words.");

        store.put(&rec, DuplicatePolicy::Fail).await.unwrap();
        let err = store.put(&rec, DuplicatePolicy::Fail).await.unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicateIdentity(id) if id == "vid-1"));

        // The stored record is untouched by the rejected write.
        assert_eq!(store.get("vid-1").await.unwrap().unwrap().revision, 0);
    }

    #[tokio::test]
    async fn replace_overwrites_and_bumps_revision() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .put(&record(&dir, "vid-1", "Old Title", "old words."), DuplicatePolicy::Fail)
            .await
            .unwrap();

        let updated = record(&dir, "vid-1", "New Title", "new words.");
        let revision = store.put(&updated, DuplicatePolicy::Replace).await.unwrap();
        assert_eq!(revision, 1);

        let fetched = store.get("vid-1").await.unwrap().unwrap();
        assert_eq!(fetched.identity.title, "New Title");
        assert!(store.versions("vid-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn version_policy_snapshots_prior_revision() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .put(&record(&dir, "vid-1", "Original", "first pass."), DuplicatePolicy::Fail)
            .await
            .unwrap();
        store
            .put(&record(&dir, "vid-1", "Reissue", "second pass."), DuplicatePolicy::Version)
            .await
            .unwrap();

        let versions = store.versions("vid-1").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].identity.title, "Original");
        assert_eq!(versions[0].revision, 0);
        assert_eq!(store.get("vid-1").await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn query_matches_title_and_subtitle_tokens() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .put(
                &record(&dir, "vid-1", "Baking Bread", "knead the dough well."),
                DuplicatePolicy::Fail,
            )
            .await
            .unwrap();
        store
            .put(
                &record(&dir, "vid-2", "Casting Iron", "pour the molten metal."),
                DuplicatePolicy::Fail,
            )
            .await
            .unwrap();

        let by_subtitle = store
            .query(&RecordQuery {
                text: Some("dough".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_subtitle.len(), 1);
        assert_eq!(by_subtitle[0].identity.video_id, "vid-1");

        let by_title = store
            .query(&RecordQuery {
                text: Some("casting".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_title.len(), 1);
        assert_eq!(by_title[0].identity.video_id, "vid-2");

        let none = store
            .query(&RecordQuery {
                text: Some("dough metal".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty(), "all query tokens must match");
    }

    #[tokio::test]
    async fn query_filters_by_channel_and_dates() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut early = record(&dir, "vid-1", "Early", "one.");
        early.identity.upload_date = "2023-01-10".into();
        store.put(&early, DuplicatePolicy::Fail).await.unwrap();
        store
            .put(&record(&dir, "vid-2", "Late", "two."), DuplicatePolicy::Fail)
            .await
            .unwrap();

        let in_range = store
            .query(&RecordQuery {
                uploaded_from: Some("2024-01-01".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].identity.video_id, "vid-2");

        let by_channel = store
            .query(&RecordQuery {
                channel: Some("The Channel".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(by_channel.len(), 2);

        let wrong_channel = store
            .query(&RecordQuery {
                channel: Some("Elsewhere".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert!(wrong_channel.is_empty());
    }

    #[tokio::test]
    async fn query_filters_by_source_tag() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut from_playlist = record(&dir, "vid-1", "Listed", "one.");
        from_playlist.source_tag = "Playlist:title=Talks&id=PL123&channel=The Channel".into();
        store.put(&from_playlist, DuplicatePolicy::Fail).await.unwrap();
        store
            .put(&record(&dir, "vid-2", "Direct", "two."), DuplicatePolicy::Fail)
            .await
            .unwrap();

        let listed = store
            .query(&RecordQuery {
                source_tag: Some("Playlist:title=Talks&id=PL123&channel=The Channel".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity.video_id, "vid-1");

        let direct = store
            .query(&RecordQuery {
                source_tag: Some("direct".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].identity.video_id, "vid-2");
    }

    #[tokio::test]
    async fn postponed_records_hidden_until_finalized() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let mut rec = record(&dir, "vid-1", "Staged Video", "still staged.");
        rec.postponed = true;
        store.put(&rec, DuplicatePolicy::Fail).await.unwrap();

        assert!(store.query(&RecordQuery::default()).await.unwrap().is_empty());
        let staged = store
            .query(&RecordQuery {
                include_postponed: true,
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(store.list_postponed().await.unwrap().len(), 1);

        let final_assets = AssetPaths {
            video: dir.path().join("final/vid-1.mkv"),
            thumbnail: None,
            subtitles: vec![dir.path().join("final/vid-1.en.verbatim.srt")],
        };
        assert!(store.finalize("vid-1", &final_assets).await.unwrap());
        // Finalizing twice is a harmless rewrite of the same values.
        assert!(store.finalize("vid-1", &final_assets).await.unwrap());

        let visible = store.query(&RecordQuery::default()).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert!(!visible[0].postponed);
        assert_eq!(visible[0].assets.video, final_assets.video);
        assert!(store.list_postponed().await.unwrap().is_empty());

        assert!(!store.finalize("ghost", &final_assets).await.unwrap());
    }

    #[tokio::test]
    async fn rebuild_indexes_matches_incremental_state() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .put(&record(&dir, "vid-1", "Alpha", "shared words here."), DuplicatePolicy::Fail)
            .await
            .unwrap();
        store
            .put(&record(&dir, "vid-2", "Beta", "different words there."), DuplicatePolicy::Fail)
            .await
            .unwrap();

        let query = RecordQuery {
            text: Some("words".into()),
            ..RecordQuery::default()
        };
        let before = store.query(&query).await.unwrap();
        store.rebuild_indexes().await.unwrap();
        let after = store.query(&query).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn replace_reindexes_subtitle_tokens() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .put(&record(&dir, "vid-1", "Title", "ancient content."), DuplicatePolicy::Fail)
            .await
            .unwrap();
        store
            .put(&record(&dir, "vid-1", "Title", "fresh content."), DuplicatePolicy::Replace)
            .await
            .unwrap();

        let stale = store
            .query(&RecordQuery {
                text: Some("ancient".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert!(stale.is_empty(), "replaced tokens must not linger");

        let fresh = store
            .query(&RecordQuery {
                text: Some("fresh".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn language_filter_scopes_subtitle_search() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let video = dir.path().join("vid-1.mkv");
        std::fs::write(&video, b"media").unwrap();
        let german = CaptionTrack::new(
            "de",
            CaptionOrigin::Manual,
            vec![Cue::new(0, 2_000, "Guten Morgen allerseits.")],
        )
        .unwrap();
        let rec = ArchiveRecordBuilder::new(identity("vid-1", "Untitled", "Kanal"), "direct")
            .video_asset(video)
            .variants(vec![SubtitleVariant::verbatim(&german)])
            .build()
            .unwrap();
        store.put(&rec, DuplicatePolicy::Fail).await.unwrap();

        let hit = store
            .query(&RecordQuery {
                text: Some("morgen".into()),
                language: Some("de".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = store
            .query(&RecordQuery {
                text: Some("morgen".into()),
                language: Some("en".into()),
                ..RecordQuery::default()
            })
            .await
            .unwrap();
        assert!(miss.is_empty());
    }

    #[tokio::test]
    async fn concurrent_puts_for_distinct_ids_succeed() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open_store(&dir).await);
        let mut handles = Vec::new();
        for index in 0..4 {
            let store = store.clone();
            let rec = record(
                &dir,
                &format!("vid-{index}"),
                &format!("Video {index}"),
                "parallel words.",
            );
            handles.push(tokio::spawn(async move {
                store.put(&rec, DuplicatePolicy::Fail).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let all = store.query(&RecordQuery::default()).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn finalize_during_versioned_put_loses_nothing() {
        let dir = tempdir().unwrap();
        let store = Arc::new(open_store(&dir).await);
        let mut staged = record(&dir, "vid-1", "Staged", "waiting words.");
        staged.postponed = true;
        store.put(&staged, DuplicatePolicy::Fail).await.unwrap();
        store
            .put(&record(&dir, "vid-2", "First", "first pass."), DuplicatePolicy::Fail)
            .await
            .unwrap();

        let final_assets = AssetPaths {
            video: dir.path().join("final/vid-1.mkv"),
            thumbnail: None,
            subtitles: vec![dir.path().join("final/vid-1.en.verbatim.srt")],
        };
        let reissue = record(&dir, "vid-2", "Reissue", "second pass.");
        let finalize = {
            let store = store.clone();
            let assets = final_assets.clone();
            tokio::spawn(async move { store.finalize("vid-1", &assets).await })
        };
        let put = {
            let store = store.clone();
            tokio::spawn(async move { store.put(&reissue, DuplicatePolicy::Version).await })
        };
        assert!(finalize.await.unwrap().unwrap());
        assert_eq!(put.await.unwrap().unwrap(), 1);

        assert!(!store.get("vid-1").await.unwrap().unwrap().postponed);
        let versions = store.versions("vid-2").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].identity.title, "First");
    }

    #[test]
    fn tokenize_lowercases_and_dedupes() {
        assert_eq!(
            tokenize("Hello, hello WORLD-wide!"),
            vec!["hello", "wide", "world"]
        );
        assert!(tokenize("  ... ").is_empty());
    }
}

#![forbid(unsafe_code)]

//! Archive maintenance: finalize postponed records and rebuild the derived
//! search indexes.

use anyhow::{Context, Result, bail};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tubevault_tools::{
    config::{ArchiveConfig, DEFAULT_CONFIG_PATH},
    pipeline::{ArchiveLayout, Archiver},
    security::ensure_not_root,
    store::ArchiveStore,
};

const ARCHIVE_DB_FILE: &str = "archive.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaintainAction {
    Finalize,
    Reindex,
}

#[derive(Debug, Clone)]
struct MaintainArgs {
    archive_root: PathBuf,
    config_path: PathBuf,
    action: MaintainAction,
}

impl MaintainArgs {
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
        let mut archive_root: Option<PathBuf> = None;
        let mut config_path: Option<PathBuf> = None;
        let mut action: Option<MaintainAction> = None;
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
                "--finalize" => {
                    if action.replace(MaintainAction::Finalize).is_some() {
                        bail!("--finalize and --reindex are mutually exclusive");
                    }
                }
                "--reindex" => {
                    if action.replace(MaintainAction::Reindex).is_some() {
                        bail!("--finalize and --reindex are mutually exclusive");
                    }
                }
                other => bail!("unknown argument: {other}"),
            }
        }

        let action =
            action.ok_or_else(|| anyhow::anyhow!("one of --finalize or --reindex is required"))?;
        Ok(Self {
            archive_root: archive_root.unwrap_or_else(|| PathBuf::from("archive")),
            config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            action,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_not_root("maintain")?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = MaintainArgs::parse()?;
    let store = Arc::new(
        ArchiveStore::open(&args.archive_root.join(ARCHIVE_DB_FILE))
            .await
            .context("opening archive store")?,
    );

    match args.action {
        MaintainAction::Finalize => {
            let config = ArchiveConfig::load(&args.config_path)?;
            let layout = ArchiveLayout::new(&args.archive_root);
            let archiver = Archiver::new(config, store, layout);
            let finalized = archiver
                .finalize_postponed()
                .await
                .context("finalizing postponed records")?;
            println!("Finalized {finalized} postponed record(s).");
        }
        MaintainAction::Reindex => {
            store
                .rebuild_indexes()
                .await
                .context("rebuilding search indexes")?;
            println!("Search indexes rebuilt.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_an_action() {
        let err = MaintainArgs::from_slice(&[]).unwrap_err();
        assert!(err.to_string().contains("--finalize or --reindex"));
    }

    #[test]
    fn parses_finalize_with_paths() {
        let args = MaintainArgs::from_slice(&[
            "--archive-root",
            "/srv/vault",
            "--config",
            "/etc/vault.json",
            "--finalize",
        ])
        .unwrap();
        assert_eq!(args.action, MaintainAction::Finalize);
        assert_eq!(args.archive_root, PathBuf::from("/srv/vault"));
        assert_eq!(args.config_path, PathBuf::from("/etc/vault.json"));
    }

    #[test]
    fn parses_reindex_with_defaults() {
        let args = MaintainArgs::from_slice(&["--reindex"]).unwrap();
        assert_eq!(args.action, MaintainAction::Reindex);
        assert_eq!(args.archive_root, PathBuf::from("archive"));
    }

    #[test]
    fn rejects_conflicting_actions() {
        let err = MaintainArgs::from_slice(&["--finalize", "--reindex"]).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(MaintainArgs::from_slice(&["--vacuum"]).is_err());
    }
}

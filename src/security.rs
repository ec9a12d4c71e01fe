#![forbid(unsafe_code)]

//! Shared safety checks for the tubevault binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start a binary as root. The archive lives in a user-owned
/// directory tree, and a root-owned database or subtitle file breaks every
/// later unprivileged run.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use the account that owns the archive");
    }
    Ok(())
}

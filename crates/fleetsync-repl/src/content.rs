//! Filesystem content handling.
//!
//! Canonical content is never mutated in place during a rebuild: a
//! replacement is built in a temp location and swapped in with renames
//! (canonical → backup, temp → canonical, backup removed). Rename is atomic
//! per step, so a lease expiring mid-operation leaves either the old or the
//! new content, never a partial mix; the loser's temp directory is harmless.
//!
//! [`DirContent`] is a directory-tree backed [`ReplicableContent`] where the
//! "primary" is another directory root. It exercises the full strategy
//! surface (clone, fetch, snapshot, checksum) and backs the engine tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::ReplError;
use crate::replicable::{ReplicableContent, ABSENT_CHECKSUM};

/// Swap freshly built content at `temp` into `canonical`.
///
/// On failure the previous canonical content is restored from the backup;
/// the canonical location is never left partially overwritten.
pub fn swap_in_place(canonical: &Path, temp: &Path) -> Result<(), ReplError> {
    let name = canonical
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?
        .to_string_lossy()
        .into_owned();
    let backup = canonical.with_file_name(format!("{name}+deleted"));

    // Leftover backup from a crashed swap.
    if backup.exists() {
        std::fs::remove_dir_all(&backup)?;
    }

    let had_existing = canonical.exists();
    if had_existing {
        std::fs::rename(canonical, &backup)?;
    }

    match std::fs::rename(temp, canonical) {
        Ok(()) => {
            if had_existing {
                if let Err(e) = std::fs::remove_dir_all(&backup) {
                    warn!(backup = %backup.display(), error = %e, "failed to remove swap backup");
                }
            }
            Ok(())
        }
        Err(e) => {
            if had_existing {
                if let Err(restore_err) = std::fs::rename(&backup, canonical) {
                    warn!(
                        canonical = %canonical.display(),
                        error = %restore_err,
                        "failed to restore canonical content after swap failure"
                    );
                }
            }
            Err(e.into())
        }
    }
}

/// Recursive directory copy.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), out)?;
        } else {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Content checksum of a directory tree: SHA-256 over sorted relative paths
/// and file bytes. Absent trees yield [`ABSENT_CHECKSUM`], so an absent unit
/// on both sides verifies clean.
pub fn dir_checksum(root: &Path) -> Result<String, ReplError> {
    if !root.is_dir() {
        return Ok(ABSENT_CHECKSUM.to_string());
    }
    let mut files = Vec::new();
    collect_files(root, &mut files).map_err(|e| ReplError::ChecksumFailed {
        msg: e.to_string(),
    })?;
    files.sort();

    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        let bytes = std::fs::read(&path).map_err(|e| ReplError::ChecksumFailed {
            msg: e.to_string(),
        })?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Directory-tree replicable content: replicates per-unit subdirectories of
/// a primary root into a local root.
pub struct DirContent {
    kind: &'static str,
    primary_root: PathBuf,
    local_root: PathBuf,
}

impl DirContent {
    /// Create content storage for one replicable kind.
    pub fn new(kind: &'static str, primary_root: PathBuf, local_root: PathBuf) -> Self {
        Self {
            kind,
            primary_root,
            local_root,
        }
    }

    /// The primary's directory for a unit.
    pub fn primary_path(&self, model_id: u64) -> PathBuf {
        self.primary_root.join(model_id.to_string())
    }

    fn transfer(&self, model_id: u64, target: &Path) -> Result<(), ReplError> {
        let src = self.primary_path(model_id);
        if !src.is_dir() {
            return Err(ReplError::AbsentOnPrimary);
        }
        if target.exists() {
            std::fs::remove_dir_all(target)?;
        }
        copy_dir_recursive(&src, target).map_err(|e| ReplError::Transport {
            msg: e.to_string(),
        })
    }
}

#[async_trait]
impl ReplicableContent for DirContent {
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn canonical_path(&self, model_id: u64) -> PathBuf {
        self.local_root.join(model_id.to_string())
    }

    fn temp_path(&self, model_id: u64) -> PathBuf {
        self.local_root.join(format!("{model_id}.tmp"))
    }

    fn exists_locally(&self, model_id: u64) -> bool {
        self.canonical_path(model_id).is_dir()
    }

    async fn fetch(&self, model_id: u64, target: &Path, forced: bool) -> Result<(), ReplError> {
        debug!(kind = self.kind, model_id, forced, "fetching");
        self.transfer(model_id, target)
    }

    async fn clone_fresh(&self, model_id: u64, target: &Path) -> Result<(), ReplError> {
        debug!(kind = self.kind, model_id, "cloning");
        self.transfer(model_id, target)
    }

    async fn create_from_snapshot(&self, model_id: u64, target: &Path) -> Result<(), ReplError> {
        debug!(kind = self.kind, model_id, "building from snapshot");
        self.transfer(model_id, target)
    }

    async fn checksum(&self, model_id: u64) -> Result<String, ReplError> {
        dir_checksum(&self.canonical_path(model_id))
    }

    async fn expire_caches(&self, model_id: u64) {
        debug!(kind = self.kind, model_id, "expiring content caches");
    }

    async fn run_housekeeping(&self, model_id: u64) -> Result<(), ReplError> {
        debug!(kind = self.kind, model_id, "housekeeping");
        Ok(())
    }
}

//! Backup and apply manager.
//!
//! Every mutation is preceded by a backup of the artifact's exact bytes and
//! performed as an atomic temp-file-and-rename write, so an artifact is only
//! ever observed in its original or its fully patched form.
//!
//! Backup files are named `<artifact>@<timestamp>.<digest prefix>.bak`, with
//! `/` in the artifact path replaced by `__`. The digest prefix lets a backup
//! be verified even when only its path is known.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::error::ApplyError;
use crate::domain::proposal::FixProposal;

const BACKUP_EXT: &str = "bak";
const DIGEST_PREFIX_LEN: usize = 12;

/// Reference to one backup copy of an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRef {
    /// Artifact path relative to the project root.
    pub artifact: String,
    pub path: PathBuf,
    /// SHA-256 of the backed-up bytes (hex). May be a prefix when the
    /// reference was rebuilt from a file name.
    pub digest: String,
    pub created_at: DateTime<Utc>,
}

impl BackupRef {
    /// Rebuild a reference from an existing backup file's name.
    pub fn from_path(artifact: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, ApplyError> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ApplyError::BackupMissing(path.clone()))?;
        let (_, tail) = name
            .rsplit_once('@')
            .ok_or_else(|| ApplyError::InvalidProposal(format!("not a backup file name: {name}")))?;
        let mut parts = tail.split('.');
        let (Some(stamp), Some(digest)) = (parts.next(), parts.next()) else {
            return Err(ApplyError::InvalidProposal(format!(
                "not a backup file name: {name}"
            )));
        };
        let created_at = DateTime::parse_from_str(&format!("{stamp} +0000"), "%Y%m%dT%H%M%S%6fZ %z")
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            artifact: artifact.into(),
            path,
            digest: digest.to_string(),
            created_at,
        })
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub applied: bool,
    pub backup: BackupRef,
    pub replacements: usize,
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Write `data` to `path` atomically via a temp file in the same directory.
///
/// An existing file keeps its permissions, and a symlink is written through
/// so the link itself survives.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let target = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::canonicalize(path)?,
        _ => path.to_path_buf(),
    };
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    match std::fs::metadata(&target) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    tmp.as_file().sync_all()?;
    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

/// Applies proposals to artifacts under a project root, with backups.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
    backup_dir: PathBuf,
    retain_on_success: bool,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup_dir: backup_dir.into(),
            retain_on_success: false,
        }
    }

    pub fn retain_on_success(mut self, retain: bool) -> Self {
        self.retain_on_success = retain;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn artifact_path(&self, artifact: &str) -> Result<PathBuf, ApplyError> {
        let rel = Path::new(artifact);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if artifact.is_empty() || escapes {
            return Err(ApplyError::InvalidProposal(format!(
                "artifact path must stay inside the project: {artifact}"
            )));
        }
        Ok(self.root.join(rel))
    }

    fn backup_path(&self, artifact: &str, digest: &str, at: DateTime<Utc>) -> PathBuf {
        let stem = artifact.replace(['/', '\\'], "__");
        let name = format!(
            "{}@{}.{}.{}",
            stem,
            at.format("%Y%m%dT%H%M%S%6fZ"),
            &digest[..DIGEST_PREFIX_LEN.min(digest.len())],
            BACKUP_EXT
        );
        self.backup_dir.join(name)
    }

    /// Back up the artifact, then substitute `old_text` with `new_text`.
    ///
    /// Fails with `NotFound` when `old_text` is absent and with `Ambiguous`
    /// when it occurs more than once and the proposal does not replace all.
    /// On any failure the artifact is untouched and no backup is left behind.
    pub fn apply(&self, proposal: &FixProposal) -> Result<ApplyOutcome, ApplyError> {
        if !proposal.is_well_formed() {
            return Err(ApplyError::InvalidProposal(
                "old text must be non-empty and differ from new text".to_string(),
            ));
        }
        let path = self.artifact_path(&proposal.artifact)?;
        let original = std::fs::read(&path)?;
        let text = String::from_utf8(original.clone()).map_err(|e| {
            ApplyError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let occurrences = text.matches(proposal.old_text.as_str()).count();
        if occurrences == 0 {
            return Err(ApplyError::NotFound {
                artifact: proposal.artifact.clone(),
            });
        }
        if occurrences > 1 && !proposal.replace_all {
            return Err(ApplyError::Ambiguous {
                artifact: proposal.artifact.clone(),
                occurrences,
            });
        }

        let digest = sha256_hex(&original);
        let created_at = Utc::now();
        let backup_path = self.backup_path(&proposal.artifact, &digest, created_at);
        write_atomic(&backup_path, &original)?;
        let backup = BackupRef {
            artifact: proposal.artifact.clone(),
            path: backup_path,
            digest,
            created_at,
        };

        let patched = if proposal.replace_all {
            text.replace(&proposal.old_text, &proposal.new_text)
        } else {
            text.replacen(&proposal.old_text, &proposal.new_text, 1)
        };
        if let Err(e) = write_atomic(&path, patched.as_bytes()) {
            let _ = std::fs::remove_file(&backup.path);
            return Err(e.into());
        }

        info!(
            artifact = %proposal.artifact,
            backup = %backup.path.display(),
            replacements = occurrences,
            "fix applied"
        );
        Ok(ApplyOutcome {
            applied: true,
            backup,
            replacements: occurrences,
        })
    }

    /// Restore an artifact verbatim from its backup, then drop the backup.
    pub fn rollback(&self, backup: &BackupRef) -> Result<(), ApplyError> {
        if !backup.path.is_file() {
            return Err(ApplyError::BackupMissing(backup.path.clone()));
        }
        let data = std::fs::read(&backup.path)?;
        let actual = sha256_hex(&data);
        if backup.digest.is_empty() || !actual.starts_with(&backup.digest) {
            return Err(ApplyError::BackupCorrupt {
                path: backup.path.clone(),
                expected: backup.digest.clone(),
                actual,
            });
        }

        let path = self.artifact_path(&backup.artifact)?;
        write_atomic(&path, &data)?;
        std::fs::remove_file(&backup.path)?;
        info!(artifact = %backup.artifact, "fix rolled back");
        Ok(())
    }

    /// Release a backup after its fix was verified.
    ///
    /// Returns whether the backup file was deleted.
    pub fn release(&self, backup: &BackupRef) -> Result<bool, ApplyError> {
        if self.retain_on_success {
            debug!(backup = %backup.path.display(), "retaining backup");
            return Ok(false);
        }
        match std::fs::remove_file(&backup.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Backups currently on disk, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, ApplyError> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.backup_dir)? {
            let path = entry?.path();
            let is_backup = path.extension().is_some_and(|e| e == BACKUP_EXT)
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().contains('@'));
            if is_backup {
                found.push(path);
            }
        }
        found.sort_by_key(|p| backup_sort_key(p));
        Ok(found)
    }

    /// Keep at most `keep` backups per artifact, deleting the oldest.
    ///
    /// Returns the number of files removed.
    pub fn prune_backups(&self, keep: usize) -> Result<usize, ApplyError> {
        let mut by_artifact: std::collections::BTreeMap<String, Vec<PathBuf>> =
            std::collections::BTreeMap::new();
        for path in self.list_backups()? {
            let (stem, _) = backup_sort_key(&path);
            by_artifact.entry(stem).or_default().push(path);
        }

        let mut removed = 0;
        for paths in by_artifact.values() {
            let excess = paths.len().saturating_sub(keep);
            for path in paths.iter().take(excess) {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, keep, "pruned backups");
        }
        Ok(removed)
    }
}

fn backup_sort_key(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.rsplit_once('@') {
        Some((stem, tail)) => (stem.to_string(), tail.to_string()),
        None => (name, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::classification::ErrorKind;
    use crate::domain::proposal::MatchQuality;

    fn setup(content: &str) -> (tempfile::TempDir, BackupManager) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("models")).unwrap();
        std::fs::write(dir.path().join("models/stg_orders.sql"), content).unwrap();
        let mgr = BackupManager::new(dir.path(), dir.path().join(".pipemend/backups"));
        (dir, mgr)
    }

    fn proposal(old: &str, new: &str) -> FixProposal {
        FixProposal::new(
            "models/stg_orders.sql",
            ErrorKind::Schema,
            old,
            new,
            0.9,
            MatchQuality::Sole,
        )
        .expect("proposal")
    }

    fn read(dir: &tempfile::TempDir) -> String {
        std::fs::read_to_string(dir.path().join("models/stg_orders.sql")).unwrap()
    }

    #[test]
    fn test_apply_replaces_single_occurrence() {
        let (dir, mgr) = setup("select order_date from orders\n");
        let outcome = mgr.apply(&proposal("order_date", "ordered_at")).unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.replacements, 1);
        assert_eq!(read(&dir), "select ordered_at from orders\n");
        assert!(outcome.backup.path.is_file());
        assert_eq!(
            std::fs::read_to_string(&outcome.backup.path).unwrap(),
            "select order_date from orders\n"
        );
    }

    #[test]
    fn test_ambiguous_without_replace_all() {
        let (dir, mgr) = setup("select x from t where x > 1");
        let err = mgr.apply(&proposal("x", "y")).unwrap_err();
        assert!(matches!(err, ApplyError::Ambiguous { occurrences: 2, .. }));
        assert_eq!(read(&dir), "select x from t where x > 1");
        assert!(mgr.list_backups().unwrap().is_empty());
    }

    #[test]
    fn test_replace_all() {
        let (dir, mgr) = setup("select x from t where x > 1");
        let outcome = mgr.apply(&proposal("x", "y").replacing_all()).unwrap();
        assert_eq!(outcome.replacements, 2);
        assert_eq!(read(&dir), "select y from t where y > 1");
    }

    #[test]
    fn test_escaping_artifact_rejected() {
        let (_dir, mgr) = setup("x");
        let mut p = proposal("x", "y");
        p.artifact = "../outside.sql".to_string();
        assert!(matches!(mgr.apply(&p), Err(ApplyError::InvalidProposal(_))));
    }

    #[test]
    fn test_missing_artifact_is_io_error() {
        let (_dir, mgr) = setup("x");
        let mut p = proposal("x", "y");
        p.artifact = "models/nope.sql".to_string();
        assert!(matches!(mgr.apply(&p), Err(ApplyError::Io(_))));
    }

    #[test]
    fn test_release_deletes_unless_retained() {
        let (_dir, mgr) = setup("select order_date");
        let outcome = mgr.apply(&proposal("order_date", "ordered_at")).unwrap();
        assert!(mgr.release(&outcome.backup).unwrap());
        assert!(!outcome.backup.path.exists());

        let (_dir, mgr) = setup("select order_date");
        let mgr = mgr.retain_on_success(true);
        let outcome = mgr.apply(&proposal("order_date", "ordered_at")).unwrap();
        assert!(!mgr.release(&outcome.backup).unwrap());
        assert!(outcome.backup.path.exists());
    }

    #[test]
    fn test_rollback_detects_corruption() {
        let (_dir, mgr) = setup("select order_date");
        let outcome = mgr.apply(&proposal("order_date", "ordered_at")).unwrap();
        std::fs::write(&outcome.backup.path, "tampered").unwrap();
        let err = mgr.rollback(&outcome.backup).unwrap_err();
        assert!(matches!(err, ApplyError::BackupCorrupt { .. }));
    }

    #[test]
    fn test_backup_ref_from_path_allows_rollback() {
        let (dir, mgr) = setup("select order_date");
        let outcome = mgr.apply(&proposal("order_date", "ordered_at")).unwrap();
        let rebuilt = BackupRef::from_path("models/stg_orders.sql", &outcome.backup.path).unwrap();
        assert_eq!(rebuilt.digest.len(), DIGEST_PREFIX_LEN);
        assert!(outcome.backup.digest.starts_with(&rebuilt.digest));
        mgr.rollback(&rebuilt).unwrap();
        assert_eq!(read(&dir), "select order_date");
    }

    #[test]
    fn test_prune_keeps_newest_per_artifact() {
        let (_dir, mgr) = setup("v0");
        for i in 0..4 {
            let outcome = mgr
                .apply(&proposal(&format!("v{i}"), &format!("v{}", i + 1)))
                .unwrap();
            assert!(outcome.backup.path.exists());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(mgr.list_backups().unwrap().len(), 4);
        assert_eq!(mgr.prune_backups(2).unwrap(), 2);
        let left = mgr.list_backups().unwrap();
        assert_eq!(left.len(), 2);
        let newest = std::fs::read_to_string(&left[1]).unwrap();
        assert_eq!(newest, "v3");
    }
}

//! Local file helpers for transfers
//!
//! Staging-file naming for resumable downloads, free-name generation for
//! destinations that already exist, and moving a finished staging file into
//! place.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use sharelink_common::path;
use sharelink_common::{ErrorKind, SessionError};

use crate::constants::{MAX_UNIQUE_NAME_ATTEMPTS, PART_SUFFIX, STAGING_HASH_LEN};

/// Staging file for a download of `remote_path` by the session `session_key`
///
/// The name is stable for the same identity and remote file, so a later
/// download of the same file finds the bytes an earlier one left behind.
pub fn staging_path(staging_dir: &Path, session_key: &str, remote_path: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(session_key.as_bytes());
    hasher.update(path::canonical(remote_path).as_bytes());
    let digest = hex::encode(hasher.finalize());
    let name = path::file_name(remote_path);
    staging_dir.join(format!(
        "{}-{}{}",
        &digest[..STAGING_HASH_LEN],
        name,
        PART_SUFFIX
    ))
}

/// Staging file for one task only, next to the shared `staging` file
///
/// Used when the shared file is busy; nothing resumes from it.
pub fn private_staging_path(staging: &Path, tag: &str) -> PathBuf {
    let name = staging
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(PART_SUFFIX).unwrap_or(&name);
    staging.with_file_name(format!("{base}-{tag}{PART_SUFFIX}"))
}

/// Staging files currently being written by a live download
static STAGING_IN_USE: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive use of one staging file, released on drop
#[derive(Debug)]
pub struct StagingClaim {
    path: PathBuf,
}

impl StagingClaim {
    /// Claim `path`, or `None` while another download holds it
    pub fn acquire(path: &Path) -> Option<Self> {
        let inserted = STAGING_IN_USE
            .lock()
            .expect("staging registry poisoned")
            .insert(path.to_path_buf());
        inserted.then(|| Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingClaim {
    fn drop(&mut self) {
        STAGING_IN_USE
            .lock()
            .expect("staging registry poisoned")
            .remove(&self.path);
    }
}

/// Size of an existing partial file, 0 if there is none
pub fn partial_size(path: &Path) -> u64 {
    fs::metadata(path)
        .ok()
        .filter(|metadata| metadata.is_file())
        .map(|metadata| metadata.len())
        .unwrap_or(0)
}

/// `name` with ` (n)` inserted before its extension
///
/// "file.txt" -> "file (1).txt", "README" -> "README (1)"
pub fn unique_name(name: &str, n: u32) -> String {
    let original = Path::new(name);
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    match original.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{stem} ({n}).{ext}"),
        None => format!("{stem} ({n})"),
    }
}

/// Generate a unique file path by appending (1), (2), etc.
///
/// Returns an error if no unique path can be found after 1000 attempts.
pub fn generate_unique_path(original: &Path) -> Result<PathBuf, SessionError> {
    let name = original
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let parent = original.parent();

    for i in 1..MAX_UNIQUE_NAME_ATTEMPTS {
        let new_name = unique_name(name, i);
        let new_path = match parent {
            Some(parent) => parent.join(&new_name),
            None => PathBuf::from(&new_name),
        };
        if fs::symlink_metadata(&new_path).is_err() {
            return Ok(new_path);
        }
    }

    Err(SessionError::with_detail(
        ErrorKind::TransferFailed,
        format!("no free name next to {}", original.display()),
    ))
}

/// Where a download should land
///
/// An existing directory gets `name` appended; an existing file is never
/// overwritten, a free `name (n).ext` is chosen instead.
pub fn resolve_local_destination(destination: &Path, name: &str) -> Result<PathBuf, SessionError> {
    let target = if destination.is_dir() {
        destination.join(name)
    } else {
        destination.to_path_buf()
    };
    if fs::symlink_metadata(&target).is_ok() {
        generate_unique_path(&target)
    } else {
        Ok(target)
    }
}

/// Move a file, copying when a rename is not possible (e.g. across volumes)
pub fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_claim_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc-file.bin.part");

        let claim = StagingClaim::acquire(&path).unwrap();
        assert_eq!(claim.path(), path);
        assert!(StagingClaim::acquire(&path).is_none());
        drop(claim);
        assert!(StagingClaim::acquire(&path).is_some());
    }

    #[test]
    fn test_private_staging_path_keeps_suffix() {
        let shared = Path::new("/tmp/staging/0123-report.pdf.part");
        assert_eq!(
            private_staging_path(shared, "deadbeef"),
            Path::new("/tmp/staging/0123-report.pdf-deadbeef.part")
        );
    }

    #[test]
    fn test_staging_path_is_stable_and_keyed() {
        let dir = Path::new("/tmp/staging");
        let a = staging_path(dir, "key-a", "/share/docs/report.pdf");
        let b = staging_path(dir, "key-a", "\\\\nas\\share\\docs\\report.pdf");
        let c = staging_path(dir, "key-b", "/share/docs/report.pdf");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("-report.pdf.part"));
        assert_eq!(name.len(), STAGING_HASH_LEN + "-report.pdf.part".len());
        assert_eq!(a.parent(), Some(dir));
    }

    #[test]
    fn test_partial_size() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("x.part");
        assert_eq!(partial_size(&part), 0);
        fs::write(&part, b"12345").unwrap();
        assert_eq!(partial_size(&part), 5);
        assert_eq!(partial_size(temp.path()), 0);
    }

    #[test]
    fn test_unique_name() {
        assert_eq!(unique_name("file.txt", 1), "file (1).txt");
        assert_eq!(unique_name("README", 2), "README (2)");
        assert_eq!(unique_name("archive.tar.gz", 3), "archive.tar (3).gz");
    }

    #[test]
    fn test_generate_unique_path_skips_taken_names() {
        let temp = TempDir::new().unwrap();
        let original = temp.path().join("file.txt");
        fs::write(&original, b"a").unwrap();
        fs::write(temp.path().join("file (1).txt"), b"b").unwrap();

        let unique = generate_unique_path(&original).unwrap();
        assert_eq!(unique, temp.path().join("file (2).txt"));
    }

    #[test]
    fn test_resolve_destination_directory_appends_name() {
        let temp = TempDir::new().unwrap();
        let resolved = resolve_local_destination(temp.path(), "a.bin").unwrap();
        assert_eq!(resolved, temp.path().join("a.bin"));

        fs::write(temp.path().join("a.bin"), b"taken").unwrap();
        let resolved = resolve_local_destination(temp.path(), "a.bin").unwrap();
        assert_eq!(resolved, temp.path().join("a (1).bin"));
    }

    #[test]
    fn test_resolve_destination_new_file_is_kept() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("new.bin");
        assert_eq!(resolve_local_destination(&target, "ignored").unwrap(), target);
    }

    #[test]
    fn test_move_file_creates_parent() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("staged.part");
        let to = temp.path().join("nested/dir/final.bin");
        fs::write(&from, b"payload").unwrap();

        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"payload");
    }
}

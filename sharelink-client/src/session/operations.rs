//! Directory and file operations
//!
//! Each function here is one unit of work run on a request worker. Paths are
//! caller-form (`/share/dir/file`); the share part picks the tree and the rest
//! is sent in protocol form.

use sharelink_common::path::{self, SharePath};
use sharelink_common::{EngineError, ErrorKind, RemoteFile, SessionError};
use tracing::debug;

use super::SessionCore;

/// Missing items are `FileNotFound`; anything else gets `otherwise`
fn not_found_or(otherwise: ErrorKind) -> impl Fn(&EngineError) -> ErrorKind {
    move |e| match e {
        EngineError::NotFound(_) => ErrorKind::FileNotFound,
        _ => otherwise,
    }
}

fn is_pseudo_entry(name: &str) -> bool {
    name == "." || name == ".."
}

/// Shares and the server root cannot be renamed, created or deleted
fn require_item(parsed: &SharePath, path: &str) -> Result<(), SessionError> {
    if parsed.is_server_root() || parsed.is_share_root() {
        return Err(SessionError::with_detail(
            ErrorKind::InvalidOperation,
            format!("{path} is a share, not an item inside one"),
        ));
    }
    Ok(())
}

impl SessionCore {
    pub(crate) fn list_directory(&self, dir: &str) -> Result<Vec<RemoteFile>, SessionError> {
        let parsed = SharePath::parse(dir);

        if parsed.is_server_root() {
            let shares = self.server_call(|_| ErrorKind::Unknown, |h| h.list_shares())?;
            return Ok(shares.iter().map(|name| RemoteFile::share_root(name)).collect());
        }

        let protocol_path = parsed.protocol_path();
        let entries = self.share_call(
            &parsed.share,
            not_found_or(ErrorKind::InvalidOperation),
            |h, tree| h.enumerate(tree, &protocol_path),
        )?;

        let parent = path::canonical(dir);
        let files: Vec<RemoteFile> = entries
            .iter()
            .filter(|stat| !is_pseudo_entry(&stat.name))
            .map(|stat| RemoteFile::from_stat(stat, &parent))
            .collect();
        debug!(path = %parent, count = files.len(), "listed directory");
        Ok(files)
    }

    pub(crate) fn item_attributes(&self, item: &str) -> Result<RemoteFile, SessionError> {
        let parsed = SharePath::parse(item);
        if parsed.is_server_root() {
            return Ok(RemoteFile::root_directory());
        }

        let protocol_path = parsed.protocol_path();
        let stat = self.share_call(
            &parsed.share,
            not_found_or(ErrorKind::Unknown),
            |h, tree| h.stat(tree, &protocol_path),
        )?;
        if parsed.is_share_root() {
            return Ok(RemoteFile::share_root(&parsed.share));
        }
        Ok(RemoteFile::from_stat_with_path(&stat, item))
    }

    pub(crate) fn move_item(&self, from: &str, to: &str) -> Result<RemoteFile, SessionError> {
        let source = SharePath::parse(from);
        let target = SharePath::parse(to);
        require_item(&source, from)?;
        require_item(&target, to)?;
        if source.share != target.share {
            return Err(SessionError::with_detail(
                ErrorKind::InvalidOperation,
                format!("cannot move across shares ({} to {})", source.share, target.share),
            ));
        }

        let (from_path, to_path) = (source.protocol_path(), target.protocol_path());
        self.share_call(
            &source.share,
            |e| match e {
                EngineError::NotFound(p) if *p == from_path => ErrorKind::FileNotFound,
                _ => ErrorKind::MoveFailed,
            },
            |h, tree| h.rename(tree, &from_path, &to_path),
        )?;
        debug!(from, to, "moved item");

        let stat = self.share_call(
            &target.share,
            |_| ErrorKind::MoveFailed,
            |h, tree| h.stat(tree, &to_path),
        )?;
        Ok(RemoteFile::from_stat_with_path(&stat, to))
    }

    pub(crate) fn create_directory(&self, dir: &str) -> Result<RemoteFile, SessionError> {
        let parsed = SharePath::parse(dir);
        require_item(&parsed, dir)?;

        let protocol_path = parsed.protocol_path();
        let stat = self.share_call(
            &parsed.share,
            |_| ErrorKind::DirectoryCreateFailed,
            |h, tree| {
                h.create_directory(tree, &protocol_path)?;
                h.stat(tree, &protocol_path)
            },
        )?;
        debug!(path = dir, "created directory");
        Ok(RemoteFile::from_stat_with_path(&stat, dir))
    }

    pub(crate) fn delete_item(&self, item: &str) -> Result<(), SessionError> {
        let parsed = SharePath::parse(item);
        require_item(&parsed, item)?;

        let protocol_path = parsed.protocol_path();
        let stat = self.share_call(
            &parsed.share,
            not_found_or(ErrorKind::DeleteFailed),
            |h, tree| h.stat(tree, &protocol_path),
        )?;
        self.share_call(
            &parsed.share,
            not_found_or(ErrorKind::DeleteFailed),
            |h, tree| {
                if stat.is_directory {
                    h.remove_directory(tree, &protocol_path)
                } else {
                    h.remove_file(tree, &protocol_path)
                }
            },
        )?;
        debug!(path = item, directory = stat.is_directory, "deleted item");
        Ok(())
    }
}

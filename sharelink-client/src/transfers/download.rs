//! Download half of a transfer
//!
//! Data is written to a staging file named after the identity and remote
//! path, then moved to its destination once the remote file has been read to
//! the end. A staging file left by an earlier attempt that is smaller than
//! the remote file is appended to instead of starting over. While another
//! live download holds that staging file, the task writes a private one and
//! does not resume.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sharelink_common::path::{self, SharePath};
use sharelink_common::{EngineError, ErrorKind, FileId, OpenMode, SessionError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::TransferIo;
use super::file_utils::{
    StagingClaim, move_file, partial_size, private_staging_path, resolve_local_destination,
    staging_path,
};
use crate::session::SessionCore;
use crate::wrapper::SessionHandleWrapper;

fn staging_error(staging: &Path, e: std::io::Error) -> SessionError {
    SessionError::with_detail(
        ErrorKind::TransferFailed,
        format!("staging file {}: {e}", staging.display()),
    )
}

/// Check the remote file, set up staging and open the remote file for reading
pub(super) fn prepare(
    core: &Arc<SessionCore>,
    remote_path: &str,
    destination: &Path,
    task_id: Uuid,
) -> Result<Box<dyn TransferIo>, SessionError> {
    let parsed = SharePath::parse(remote_path);
    if parsed.is_server_root() || parsed.is_share_root() {
        return Err(SessionError::with_detail(
            ErrorKind::InvalidOperation,
            format!("{remote_path} is not a file"),
        ));
    }

    let protocol_path = parsed.protocol_path();
    let (stat, wrapper) = core.share_call_on(
        &parsed.share,
        |e| match e {
            EngineError::NotFound(_) => ErrorKind::FileNotFound,
            _ => ErrorKind::TransferFailed,
        },
        |h, tree| h.stat(tree, &protocol_path),
    )?;
    if stat.is_directory {
        return Err(SessionError::with_detail(
            ErrorKind::InvalidOperation,
            format!("{remote_path} is a directory"),
        ));
    }
    let total = stat.size;

    let staging_dir = core.config().staging_dir();
    fs::create_dir_all(&staging_dir).map_err(|e| staging_error(&staging_dir, e))?;
    let shared = staging_path(&staging_dir, &wrapper.identity().session_key(), remote_path);
    let (claim, resumable) = match StagingClaim::acquire(&shared) {
        Some(claim) => (claim, true),
        None => {
            let tag = task_id.simple().to_string();
            let private = private_staging_path(&shared, &tag[..8]);
            debug!(staging = %private.display(), "shared staging file busy");
            let claim = StagingClaim::acquire(&private).ok_or_else(|| {
                SessionError::with_detail(
                    ErrorKind::TransferFailed,
                    format!("staging file {} is in use", private.display()),
                )
            })?;
            (claim, false)
        }
    };
    let staging = claim.path().to_path_buf();

    // A leftover at least as large as the remote file cannot be a prefix of it
    let existing = if resumable { partial_size(&staging) } else { 0 };
    let resume_from = if existing > 0 && existing < total {
        existing
    } else {
        0
    };
    let file = if resume_from > 0 {
        OpenOptions::new().append(true).open(&staging)
    } else {
        File::create(&staging)
    }
    .map_err(|e| staging_error(&staging, e))?;

    let fd = wrapper
        .with_share(&parsed.share, |h, tree| {
            h.open(tree, &protocol_path, OpenMode::Read)
        })
        .map_err(|e| {
            e.into_session_error(|e| match e {
                EngineError::NotFound(_) => ErrorKind::FileNotFound,
                _ => ErrorKind::TransferFailed,
            })
        })?;

    info!(
        remote = remote_path,
        size = total,
        resume_from,
        staging = %staging.display(),
        "download prepared"
    );
    Ok(Box::new(Download {
        wrapper,
        fd: Some(fd),
        file: Some(file),
        staging,
        resumable,
        _claim: claim,
        destination: destination.to_path_buf(),
        name: path::file_name(remote_path),
        total,
        offset: resume_from,
        buffer: vec![0u8; core.config().effective_chunk_size()],
        eof: false,
    }))
}

struct Download {
    wrapper: Arc<SessionHandleWrapper>,
    fd: Option<FileId>,
    file: Option<File>,
    staging: PathBuf,
    /// False for a private staging file, which is removed on abandon
    resumable: bool,
    _claim: StagingClaim,
    destination: PathBuf,
    name: String,
    total: u64,
    offset: u64,
    buffer: Vec<u8>,
    eof: bool,
}

impl Download {
    fn close_remote(&mut self) -> Result<(), SessionError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        self.wrapper
            .with_handle(|h| h.close(fd))
            .map_err(|e| SessionError::from_engine(ErrorKind::TransferFailed, e.engine_error()))
    }
}

impl TransferIo for Download {
    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn transfer_chunk(&mut self) -> Result<usize, SessionError> {
        if self.eof || self.offset >= self.total {
            self.eof = true;
            return Ok(0);
        }
        let (Some(fd), Some(file)) = (self.fd, self.file.as_mut()) else {
            return Err(SessionError::with_detail(
                ErrorKind::TransferFailed,
                "download already closed",
            ));
        };

        let want = self
            .buffer
            .len()
            .min((self.total - self.offset) as usize);
        let offset = self.offset;
        let buffer = &mut self.buffer[..want];
        let read = self
            .wrapper
            .with_handle(|h| h.read(fd, offset, buffer))
            .map_err(|e| SessionError::from_engine(ErrorKind::TransferFailed, e.engine_error()))?;
        if read == 0 {
            // Remote file shrank since it was opened
            debug!(offset, expected = self.total, "remote file ended early");
            self.eof = true;
            return Ok(0);
        }

        file.write_all(&self.buffer[..read])
            .map_err(|e| staging_error(&self.staging, e))?;
        self.offset += read as u64;
        Ok(read)
    }

    fn finish(&mut self) -> Result<(), SessionError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(|e| staging_error(&self.staging, e))?;
        }
        self.close_remote()
    }

    fn promote(&mut self) -> Result<String, SessionError> {
        let target = resolve_local_destination(&self.destination, &self.name)?;
        move_file(&self.staging, &target).map_err(|e| {
            SessionError::with_detail(
                ErrorKind::TransferFailed,
                format!("moving download to {}: {e}", target.display()),
            )
        })?;
        Ok(target.display().to_string())
    }

    fn abandon(&mut self) {
        self.file = None;
        if let Err(e) = self.close_remote() {
            warn!(error = %e, "failed to close remote file after aborted download");
        }
        if !self.resumable
            && let Err(e) = fs::remove_file(&self.staging)
        {
            warn!(
                staging = %self.staging.display(),
                error = %e,
                "failed to remove private staging file"
            );
        }
    }
}

//! Upload half of a transfer
//!
//! The remote destination is resolved before anything is created: an
//! existing directory gets the local file name appended and an existing file
//! is never overwritten. An upload that does not complete removes the
//! partial remote file.

use std::fs::{self, File};
use std::io::{ErrorKind as IoErrorKind, Read};
use std::path::Path;
use std::sync::Arc;

use sharelink_common::path::{self, SharePath};
use sharelink_common::{EngineError, ErrorKind, FileId, FileStat, OpenMode, SessionError};
use tracing::{info, warn};

use super::TransferIo;
use super::file_utils::unique_name;
use crate::constants::MAX_UNIQUE_NAME_ATTEMPTS;
use crate::session::SessionCore;
use crate::wrapper::SessionHandleWrapper;

fn classify(e: &EngineError) -> ErrorKind {
    match e {
        EngineError::NotFound(_) => ErrorKind::FileNotFound,
        _ => ErrorKind::TransferFailed,
    }
}

/// Stat `protocol_path`, with a missing item as `None`
fn remote_stat(
    wrapper: &SessionHandleWrapper,
    share: &str,
    protocol_path: &str,
) -> Result<Option<FileStat>, SessionError> {
    wrapper
        .with_share(share, |h, tree| match h.stat(tree, protocol_path) {
            Ok(stat) => Ok(Some(stat)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        })
        .map_err(|e| e.into_session_error(classify))
}

/// Check the local file, resolve the remote name and create the remote file
pub(super) fn prepare(
    core: &Arc<SessionCore>,
    source: &Path,
    destination: &str,
) -> Result<Box<dyn TransferIo>, SessionError> {
    let metadata = fs::metadata(source).map_err(|e| {
        let kind = if e.kind() == IoErrorKind::NotFound {
            ErrorKind::FileNotFound
        } else {
            ErrorKind::TransferFailed
        };
        SessionError::with_detail(kind, format!("{}: {e}", source.display()))
    })?;
    if metadata.is_dir() {
        return Err(SessionError::with_detail(
            ErrorKind::InvalidOperation,
            format!("{} is a directory", source.display()),
        ));
    }
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let parsed = SharePath::parse(destination);
    if parsed.is_server_root() {
        return Err(SessionError::with_detail(
            ErrorKind::InvalidOperation,
            "uploads need a share",
        ));
    }

    let destination_path = parsed.protocol_path();
    let (existing, wrapper) = core.share_call_on(&parsed.share, classify, |h, tree| {
        match h.stat(tree, &destination_path) {
            Ok(stat) => Ok(Some(stat)),
            Err(EngineError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    })?;

    let target = match existing {
        Some(stat) if stat.is_directory => path::join(destination, &name),
        _ => path::canonical(destination),
    };
    let target = free_remote_name(&wrapper, &parsed.share, &target)?;
    let target_path = SharePath::parse(&target).protocol_path();

    let file = File::open(source).map_err(|e| {
        SessionError::with_detail(
            ErrorKind::TransferFailed,
            format!("{}: {e}", source.display()),
        )
    })?;
    let fd = wrapper
        .with_share(&parsed.share, |h, tree| {
            h.open(tree, &target_path, OpenMode::Create)
        })
        .map_err(|e| e.into_session_error(classify))?;

    info!(
        local = %source.display(),
        remote = %target,
        size = metadata.len(),
        "upload prepared"
    );
    Ok(Box::new(Upload {
        wrapper,
        share: parsed.share,
        remote: target,
        remote_protocol_path: target_path,
        fd: Some(fd),
        file,
        total: metadata.len(),
        offset: 0,
        buffer: vec![0u8; core.config().effective_chunk_size()],
    }))
}

/// `target` if nothing exists there, else the first free `name (n).ext`
fn free_remote_name(
    wrapper: &SessionHandleWrapper,
    share: &str,
    target: &str,
) -> Result<String, SessionError> {
    let target_path = SharePath::parse(target).protocol_path();
    if remote_stat(wrapper, share, &target_path)?.is_none() {
        return Ok(target.to_string());
    }

    let (parent, name) = (path::parent(target), path::file_name(target));
    for i in 1..MAX_UNIQUE_NAME_ATTEMPTS {
        let candidate = path::join(&parent, &unique_name(&name, i));
        let candidate_path = SharePath::parse(&candidate).protocol_path();
        if remote_stat(wrapper, share, &candidate_path)?.is_none() {
            return Ok(candidate);
        }
    }
    Err(SessionError::with_detail(
        ErrorKind::TransferFailed,
        format!("no free name next to {target}"),
    ))
}

struct Upload {
    wrapper: Arc<SessionHandleWrapper>,
    share: String,
    /// Caller-form path reported on success
    remote: String,
    remote_protocol_path: String,
    fd: Option<FileId>,
    file: File,
    total: u64,
    offset: u64,
    buffer: Vec<u8>,
}

impl Upload {
    fn close_remote(&mut self) -> Result<(), SessionError> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        self.wrapper
            .with_handle(|h| h.close(fd))
            .map_err(|e| SessionError::from_engine(ErrorKind::TransferFailed, e.engine_error()))
    }
}

impl TransferIo for Upload {
    fn total_bytes(&self) -> u64 {
        self.total
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn transfer_chunk(&mut self) -> Result<usize, SessionError> {
        if self.offset >= self.total {
            return Ok(0);
        }
        let Some(fd) = self.fd else {
            return Err(SessionError::with_detail(
                ErrorKind::TransferFailed,
                "upload already closed",
            ));
        };

        let want = self
            .buffer
            .len()
            .min((self.total - self.offset) as usize);
        let read = self.file.read(&mut self.buffer[..want]).map_err(|e| {
            SessionError::with_detail(ErrorKind::TransferFailed, format!("reading source: {e}"))
        })?;
        if read == 0 {
            // Local file shrank since it was opened
            self.total = self.offset;
            return Ok(0);
        }

        let offset = self.offset;
        let data = &self.buffer[..read];
        let mut written = 0;
        while written < read {
            let n = self
                .wrapper
                .with_handle(|h| h.write(fd, offset + written as u64, &data[written..]))
                .map_err(|e| {
                    SessionError::from_engine(ErrorKind::TransferFailed, e.engine_error())
                })?;
            if n == 0 {
                return Err(SessionError::with_detail(
                    ErrorKind::TransferFailed,
                    "server accepted no data",
                ));
            }
            written += n;
        }
        self.offset += read as u64;
        Ok(read)
    }

    fn finish(&mut self) -> Result<(), SessionError> {
        self.close_remote()
    }

    fn promote(&mut self) -> Result<String, SessionError> {
        Ok(self.remote.clone())
    }

    fn abandon(&mut self) {
        if let Err(e) = self.close_remote() {
            warn!(error = %e, "failed to close remote file after aborted upload");
        }
        let removed = self.wrapper.with_share(&self.share, |h, tree| {
            h.remove_file(tree, &self.remote_protocol_path)
        });
        if let Err(e) = removed {
            warn!(remote = %self.remote, error = %e, "failed to remove partial upload");
        }
    }
}

//! Sharelink Common Library
//!
//! Shared types, path handling, and the protocol engine boundary used by the
//! sharelink client. Nothing in here performs I/O on its own except the
//! in-process [`memory::MemoryEngine`] and the OS-backed [`host::SystemResolver`].

pub mod engine;
mod error;
pub mod file;
pub mod host;
pub mod memory;
pub mod path;

pub use engine::{
    AuthOutcome, FileId, FileStat, OpenMode, ProtocolEngine, ProtocolHandle, TreeId,
};
pub use error::{EngineError, ErrorKind, SessionError};
pub use file::RemoteFile;
pub use host::{NameResolver, NameServiceType, NetBiosEntry, ResolveError, SystemResolver};

/// Default port for direct-hosted SMB connections
pub const DEFAULT_PORT: u16 = 445;

/// Separator used by the wire protocol inside a share
pub const PROTOCOL_SEPARATOR: char = '\\';

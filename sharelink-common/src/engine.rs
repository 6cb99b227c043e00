//! Protocol engine boundary
//!
//! The wire protocol (negotiation, security handshake, message framing) lives
//! behind these traits. Every call is blocking and either returns a structured
//! result or a typed [`EngineError`]. Implementations are not required to be
//! safe for concurrent use of one handle; callers serialize access.

use crate::EngineError;

/// Tree id returned by a successful tree-connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub u16);

/// Open file id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// How a remote file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file for reading
    Read,
    /// Create the file, truncating any existing content, and open for writing
    Create,
    /// Open an existing file for reading and writing
    ReadWrite,
}

/// Result of a successful logon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Logged on with the supplied credentials
    User,
    /// The server accepted the session as a guest
    Guest,
}

/// Attributes of a remote item as reported by stat or enumerate
///
/// Timestamps are Windows FILETIME values: 100-nanosecond intervals since
/// 1601-01-01 UTC. Zero means "not reported".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
    pub allocation_size: u64,
    pub is_directory: bool,
    pub read_only: bool,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
    pub written: u64,
}

/// Factory for protocol connections
pub trait ProtocolEngine: Send + Sync {
    /// Open a transport connection to a device
    ///
    /// `host_name` is the NetBIOS/DNS name the server expects to be addressed
    /// by; `address` is the IP address to dial.
    fn connect(
        &self,
        host_name: &str,
        address: &str,
        port: u16,
    ) -> Result<Box<dyn ProtocolHandle>, EngineError>;
}

/// One live protocol connection
///
/// Paths passed to a handle are relative to the tree and use the wire form
/// produced by [`crate::path::to_protocol_path`].
pub trait ProtocolHandle: Send {
    /// Log on. Empty `user` and `password` request a guest session.
    fn authenticate(
        &mut self,
        domain: &str,
        user: &str,
        password: &str,
    ) -> Result<AuthOutcome, EngineError>;

    /// Whether the transport is still up
    fn is_connected(&self) -> bool;

    /// Names of the shares exported by the device
    fn list_shares(&mut self) -> Result<Vec<String>, EngineError>;

    fn tree_connect(&mut self, share: &str) -> Result<TreeId, EngineError>;

    fn tree_disconnect(&mut self, tree: TreeId) -> Result<(), EngineError>;

    fn open(&mut self, tree: TreeId, path: &str, mode: OpenMode) -> Result<FileId, EngineError>;

    /// Read into `buf` starting at `offset`; returns 0 at end of file
    fn read(&mut self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize, EngineError>;

    /// Write `data` at `offset`; returns the number of bytes accepted
    fn write(&mut self, file: FileId, offset: u64, data: &[u8]) -> Result<usize, EngineError>;

    fn close(&mut self, file: FileId) -> Result<(), EngineError>;

    fn stat(&mut self, tree: TreeId, path: &str) -> Result<FileStat, EngineError>;

    /// Entries of the directory at `path`
    ///
    /// Engines may include the `.` and `..` pseudo-entries; callers filter them.
    fn enumerate(&mut self, tree: TreeId, path: &str) -> Result<Vec<FileStat>, EngineError>;

    fn rename(&mut self, tree: TreeId, from: &str, to: &str) -> Result<(), EngineError>;

    fn create_directory(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError>;

    fn remove_file(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError>;

    fn remove_directory(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError>;

    /// Log off and drop the transport
    fn disconnect(&mut self);
}

//! Error taxonomy for session operations
//!
//! Every failure that reaches a caller is a [`SessionError`]: one
//! machine-readable [`ErrorKind`] plus optional low-level detail. Failures from
//! the protocol engine arrive as [`EngineError`] and are mapped to a kind at the
//! point of call so engine-native errors never cross the public boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error kinds
///
/// The numeric codes are stable and grouped in the 1000 range so they can be
/// surfaced next to platform error codes without colliding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Host name or address could not be resolved
    AddressResolutionFailed,
    /// The transport connection could not be established
    ConnectionFailed,
    /// Credentials were rejected and guest login is not available
    AuthenticationFailed,
    /// Tree-connect to a share failed
    ShareConnectionFailed,
    /// The requested item does not exist
    FileNotFound,
    /// The operation is not valid for the item (e.g. downloading a directory)
    InvalidOperation,
    /// Chunked read or write failed part-way through a transfer
    TransferFailed,
    /// Rename/move failed
    MoveFailed,
    /// Directory creation failed
    DirectoryCreateFailed,
    /// Deletion failed
    DeleteFailed,
    /// The operation was cancelled before it could finish
    Cancelled,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// All kinds, in code order
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::Unknown,
        ErrorKind::AddressResolutionFailed,
        ErrorKind::ConnectionFailed,
        ErrorKind::AuthenticationFailed,
        ErrorKind::ShareConnectionFailed,
        ErrorKind::FileNotFound,
        ErrorKind::InvalidOperation,
        ErrorKind::TransferFailed,
        ErrorKind::MoveFailed,
        ErrorKind::DirectoryCreateFailed,
        ErrorKind::DeleteFailed,
        ErrorKind::Cancelled,
    ];

    /// Stable numeric code
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Unknown => 1,
            Self::AddressResolutionFailed => 1001,
            Self::ConnectionFailed => 1002,
            Self::AuthenticationFailed => 1003,
            Self::ShareConnectionFailed => 1004,
            Self::FileNotFound => 1005,
            Self::InvalidOperation => 1006,
            Self::TransferFailed => 1007,
            Self::MoveFailed => 1008,
            Self::DirectoryCreateFailed => 1009,
            Self::DeleteFailed => 1010,
            Self::Cancelled => 1013,
        }
    }

    /// Look a kind up by numeric code
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// String form used in logs and serialized state
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddressResolutionFailed => "address_resolution_failed",
            Self::ConnectionFailed => "connection_failed",
            Self::AuthenticationFailed => "authentication_failed",
            Self::ShareConnectionFailed => "share_connection_failed",
            Self::FileNotFound => "file_not_found",
            Self::InvalidOperation => "invalid_operation",
            Self::TransferFailed => "transfer_failed",
            Self::MoveFailed => "move_failed",
            Self::DirectoryCreateFailed => "directory_create_failed",
            Self::DeleteFailed => "delete_failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the string form
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Human-readable description
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unknown => "An unknown error occurred",
            Self::AddressResolutionFailed => "Unable to resolve the address of the device",
            Self::ConnectionFailed => "Unable to connect to the device",
            Self::AuthenticationFailed => "The user name or password was rejected",
            Self::ShareConnectionFailed => "Unable to connect to the share",
            Self::FileNotFound => "The file or folder could not be found",
            Self::InvalidOperation => "The operation is not supported for this item",
            Self::TransferFailed => "The file transfer failed",
            Self::MoveFailed => "The item could not be moved",
            Self::DirectoryCreateFailed => "The folder could not be created",
            Self::DeleteFailed => "The item could not be deleted",
            Self::Cancelled => "The operation was cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Error delivered to callers of session operations and transfer tasks
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{kind}{}", detail_suffix(.detail))]
pub struct SessionError {
    kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl SessionError {
    /// Error with no additional detail
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    /// Error carrying low-level context
    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    /// Map an engine failure onto `kind`, keeping the engine's text as detail
    pub fn from_engine(kind: ErrorKind, err: &EngineError) -> Self {
        Self::with_detail(kind, err.to_string())
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn code(&self) -> i64 {
        self.kind.code()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<ErrorKind> for SessionError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Typed failure reported by a protocol engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The transport dropped; the handle is no longer usable
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// The transport could not be opened
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Logon was refused
    #[error("logon failure: {0}")]
    AccessDenied(String),

    /// The share does not exist or refused the tree-connect
    #[error("bad share: {0}")]
    BadShare(String),

    /// The tree id is not (or no longer) valid on this handle
    #[error("invalid tree id")]
    InvalidTree,

    /// No such file or directory
    #[error("not found: {0}")]
    NotFound(String),

    /// Target already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory still has entries
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Access to the object was refused
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Any other status the engine reports
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True when the failure means the handle itself is dead
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// True when the failure is tied to the share's tree id
    pub fn is_share_failure(&self) -> bool {
        matches!(self, Self::BadShare(_) | Self::InvalidTree)
    }
}

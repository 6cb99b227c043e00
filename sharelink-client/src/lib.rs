//! Sharelink Client Library
//!
//! Session management for SMB-style file shares on top of a blocking
//! [`ProtocolEngine`]: credential-keyed reuse of authenticated handles,
//! per-share tree-id caching, queued operations with completion callbacks,
//! and resumable, cancellable transfer tasks.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sharelink_client::{ClientConfig, Session, SessionHandleCache, SessionOptions};
//! use sharelink_common::memory::MemoryEngine;
//!
//! let engine = MemoryEngine::new();
//! engine.add_file("/Public/readme.txt", b"hello");
//!
//! let session = Session::new(
//!     SessionOptions::for_address("192.168.1.10").with_credentials("alice", "secret"),
//!     Arc::new(engine),
//!     Arc::new(SessionHandleCache::new()),
//!     None,
//!     ClientConfig::default(),
//! );
//! session.list_directory("/Public", |result| match result {
//!     Ok(files) => println!("{} items", files.len()),
//!     Err(e) => eprintln!("listing failed: {e}"),
//! });
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod identity;
pub mod queue;
mod session;
pub mod transfers;
pub mod wrapper;

pub use cache::SessionHandleCache;
pub use config::{ClientConfig, ConfigError};
pub use identity::ConnectionIdentity;
pub use queue::{CancelToken, RequestHandle};
pub use session::{Session, SessionOptions};
pub use transfers::{TransferDelegate, TransferDirection, TransferStatus, TransferTask};
pub use wrapper::{HandleError, SessionHandleWrapper};

pub use sharelink_common::{
    ErrorKind, NameResolver, ProtocolEngine, ProtocolHandle, RemoteFile, SessionError,
};

//! Client-wide constants
//!
//! Shared constants used across multiple modules.

/// Application directory name (used in config directory path)
pub const APP_DIR_NAME: &str = "sharelink";

/// Config file name
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Directory under the system temp dir holding partial downloads
pub const STAGING_DIR_NAME: &str = "sharelink";

/// Suffix for partial download files
pub const PART_SUFFIX: &str = ".part";

/// Seconds a cached session handle may sit idle before it is discarded
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Request worker threads per session
pub const DEFAULT_REQUEST_CONCURRENCY: usize = 1;

/// Bytes per protocol read/write during transfers (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Progress is reported at most once per this many bytes (256KB)
pub const DEFAULT_PROGRESS_GRANULARITY: u64 = 256 * 1024;

/// Upper bound on sub-operations a transfer tracks at once
pub const MAX_TRACKED_OPERATIONS: usize = 64;

/// Attempts at finding a free "name (n).ext" before giving up
pub const MAX_UNIQUE_NAME_ATTEMPTS: u32 = 1000;

/// Hex characters of the staging-file hash prefix
pub const STAGING_HASH_LEN: usize = 16;

//! Remote file snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::FileStat;
use crate::path;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01 (Unix epoch)
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// FILETIME ticks per second (100ns resolution)
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Convert a Windows FILETIME value to a UTC timestamp
///
/// Zero is the protocol's "unset" value and yields `None`.
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((filetime % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Convert a UTC timestamp to a Windows FILETIME value
pub fn datetime_to_filetime(time: DateTime<Utc>) -> u64 {
    let secs = time.timestamp() + FILETIME_UNIX_OFFSET_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * FILETIME_TICKS_PER_SEC + u64::from(time.timestamp_subsec_nanos()) / 100
}

/// Immutable snapshot of a remote file, directory, or share
///
/// Returned by stat and enumerate calls; it is never updated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Caller-form path, e.g. `/share/dir/file.txt`
    pub full_path: String,
    /// True if this item is a share rather than an item inside one
    pub is_share_root: bool,
    pub name: String,
    pub size: u64,
    pub allocated_size: u64,
    pub is_directory: bool,
    pub read_only: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub written_at: Option<DateTime<Utc>>,
}

impl RemoteFile {
    /// Snapshot of an enumerated entry inside `parent_path`
    pub fn from_stat(stat: &FileStat, parent_path: &str) -> Self {
        let full_path = path::join(parent_path, &stat.name);
        Self::from_stat_with_path(stat, &full_path)
    }

    /// Snapshot of a stat result for a known full path
    ///
    /// The name is taken from the path so that stat results, which may not
    /// carry a name, are labelled consistently.
    pub fn from_stat_with_path(stat: &FileStat, full_path: &str) -> Self {
        let full_path = path::canonical(full_path);
        let name = match path::file_name(&full_path) {
            n if n.is_empty() => stat.name.clone(),
            n => n,
        };
        Self {
            full_path,
            is_share_root: false,
            name,
            size: stat.size,
            allocated_size: stat.allocation_size,
            is_directory: stat.is_directory,
            read_only: stat.read_only,
            created_at: filetime_to_datetime(stat.created),
            modified_at: filetime_to_datetime(stat.modified),
            accessed_at: filetime_to_datetime(stat.accessed),
            written_at: filetime_to_datetime(stat.written),
        }
    }

    /// A share, shown as a directory at `/name`
    pub fn share_root(name: &str) -> Self {
        Self {
            full_path: path::join("/", name),
            is_share_root: true,
            name: name.to_string(),
            ..Self::root_directory()
        }
    }

    /// The server root that lists shares
    pub fn root_directory() -> Self {
        Self {
            full_path: "/".to_string(),
            is_share_root: false,
            name: String::new(),
            size: 0,
            allocated_size: 0,
            is_directory: true,
            read_only: false,
            created_at: None,
            modified_at: None,
            accessed_at: None,
            written_at: None,
        }
    }

    /// Share this item lives on (empty for the server root)
    pub fn share_name(&self) -> String {
        path::share_name(&self.full_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filetime_zero_is_none() {
        assert!(filetime_to_datetime(0).is_none());
    }

    #[test]
    fn test_filetime_unix_epoch() {
        let epoch = FILETIME_UNIX_OFFSET_SECS as u64 * FILETIME_TICKS_PER_SEC;
        let dt = filetime_to_datetime(epoch).expect("valid");
        assert_eq!(dt, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn test_filetime_known_value() {
        // 2021-05-17T00:00:00Z
        let dt = Utc.with_ymd_and_hms(2021, 5, 17, 0, 0, 0).unwrap();
        let ft = datetime_to_filetime(dt);
        assert_eq!(filetime_to_datetime(ft), Some(dt));
    }

    #[test]
    fn test_from_stat_builds_path() {
        let stat = FileStat {
            name: "a.txt".to_string(),
            size: 10,
            allocation_size: 4096,
            ..Default::default()
        };
        let file = RemoteFile::from_stat(&stat, "/share/docs");
        assert_eq!(file.full_path, "/share/docs/a.txt");
        assert_eq!(file.name, "a.txt");
        assert_eq!(file.size, 10);
        assert_eq!(file.allocated_size, 4096);
        assert!(!file.is_share_root);
        assert_eq!(file.share_name(), "share");
        assert!(file.modified_at.is_none());
    }

    #[test]
    fn test_from_stat_with_path_prefers_path_name() {
        let stat = FileStat {
            name: String::new(),
            is_directory: true,
            ..Default::default()
        };
        let file = RemoteFile::from_stat_with_path(&stat, "\\\\srv\\share\\docs");
        assert_eq!(file.full_path, "/share/docs");
        assert_eq!(file.name, "docs");
        assert!(file.is_directory);
    }

    #[test]
    fn test_share_root() {
        let share = RemoteFile::share_root("Public");
        assert_eq!(share.full_path, "/Public");
        assert!(share.is_share_root);
        assert!(share.is_directory);
        assert_eq!(share.name, "Public");
    }

    #[test]
    fn test_root_directory() {
        let root = RemoteFile::root_directory();
        assert_eq!(root.full_path, "/");
        assert!(root.is_directory);
        assert!(root.share_name().is_empty());
    }
}

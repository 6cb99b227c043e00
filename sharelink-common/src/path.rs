//! Path parsing for share-qualified paths
//!
//! Callers address remote items with paths whose first segment is the share
//! name, e.g. `/Documents/reports/q1.pdf` or the UNC form
//! `\\server\Documents\reports\q1.pdf`. These helpers split such paths into
//! the share name and the path inside the share, and build the backslash form
//! the wire protocol expects.
//!
//! All functions are pure string transforms.

use crate::PROTOCOL_SEPARATOR;

/// A path split into its share and the remainder inside that share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePath {
    /// Share name (empty for the server root)
    pub share: String,
    /// Path inside the share using `/` separators, without a leading separator
    pub relative: String,
}

impl SharePath {
    /// Parse a caller path
    pub fn parse(path: &str) -> Self {
        let segments = segments(path);
        let share = segments.first().map(|s| s.to_string()).unwrap_or_default();
        let relative = segments.iter().skip(1).copied().collect::<Vec<_>>().join("/");
        Self { share, relative }
    }

    /// True when the path names the server root (no share)
    pub fn is_server_root(&self) -> bool {
        self.share.is_empty()
    }

    /// True when the path names a share itself rather than an item inside it
    pub fn is_share_root(&self) -> bool {
        !self.share.is_empty() && self.relative.is_empty()
    }

    /// The relative path in wire form (`\dir\file`)
    pub fn protocol_path(&self) -> String {
        to_protocol_path(&self.relative)
    }
}

/// Replace every backslash with a forward slash
pub fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

/// Split a path into its meaningful segments
///
/// A leading `//` (UNC form) means the first segment is the server name, which
/// is dropped. Empty segments from repeated or trailing separators are ignored.
fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim();
    let is_unc = trimmed.starts_with("//")
        || trimmed.starts_with("\\\\")
        || trimmed.starts_with("/\\")
        || trimmed.starts_with("\\/");

    let mut parts: Vec<&str> = trimmed
        .split(['/', '\\'])
        .filter(|s| !s.is_empty())
        .collect();

    if is_unc && !parts.is_empty() {
        parts.remove(0);
    }
    parts
}

/// Share name of a path (first segment)
///
/// Returns an empty string for the server root.
pub fn share_name(path: &str) -> String {
    SharePath::parse(path).share
}

/// Path inside the share, `/`-separated, without leading separator
pub fn relative_path(path: &str) -> String {
    SharePath::parse(path).relative
}

/// Path inside the share in wire form: backslash separators and a leading
/// backslash. The share root is a single backslash.
pub fn protocol_path(path: &str) -> String {
    SharePath::parse(path).protocol_path()
}

/// Convert a `/`-separated relative path into wire form
pub fn to_protocol_path(relative: &str) -> String {
    let mut out = String::with_capacity(relative.len() + 1);
    for segment in relative.split(['/', '\\']).filter(|s| !s.is_empty()) {
        out.push(PROTOCOL_SEPARATOR);
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push(PROTOCOL_SEPARATOR);
    }
    out
}

/// Canonical caller form of a path: `/share/dir/file`, or `/` for the root
pub fn canonical(path: &str) -> String {
    let segments = segments(path);
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Append a name to a caller path
pub fn join(base: &str, name: &str) -> String {
    let base = canonical(base);
    let name = name.trim_matches(['/', '\\']);
    if name.is_empty() {
        return base;
    }
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Last segment of a path (empty for the root)
pub fn file_name(path: &str) -> String {
    segments(path).last().map(|s| s.to_string()).unwrap_or_default()
}

/// Parent of a path in canonical form (`/` for a share or the root)
pub fn parent(path: &str) -> String {
    let segments = segments(path);
    if segments.len() <= 1 {
        return "/".to_string();
    }
    format!("/{}", segments[..segments.len() - 1].join("/"))
}

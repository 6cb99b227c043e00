//! In-process protocol engine
//!
//! `MemoryEngine` keeps shares, directories and files in memory and implements
//! [`ProtocolEngine`]/[`ProtocolHandle`] over them. It behaves like a small,
//! well-mannered file server: tree ids, file ids, guest logon, `.`/`..` entries
//! in listings and a typed error for every failure.
//!
//! It also exposes hooks for driving the orchestration layer into awkward
//! states deterministically:
//! - a call gate that parks protocol calls until released
//! - a read gate that parks reads after a given number of chunks
//! - `disconnect_all` to turn every live handle stale
//! - `set_reachable(false)` to refuse new connections
//! - `fail_next` to inject a one-off failure into a named call
//! - per-call counters

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::debug;

use crate::engine::{
    AuthOutcome, FileId, FileStat, OpenMode, ProtocolEngine, ProtocolHandle, TreeId,
};
use crate::file::datetime_to_filetime;
use crate::path::SharePath;
use crate::EngineError;

/// Allocation unit reported for files
const CLUSTER_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
enum Node {
    Directory { created: u64 },
    File { data: Vec<u8>, created: u64, written: u64 },
}

#[derive(Default)]
struct Tree {
    /// Keyed by `/`-separated path inside the share; the share root is implicit
    nodes: BTreeMap<String, Node>,
}

#[derive(Default)]
struct ServerState {
    shares: BTreeMap<String, Tree>,
    users: HashMap<String, String>,
    guest_allowed: bool,
}

#[derive(Default)]
struct GateState {
    held: bool,
    /// Reads beyond this count park until `release`
    reads_allowed: Option<u64>,
    blocked: usize,
}

struct Shared {
    state: Mutex<ServerState>,
    gate: Mutex<GateState>,
    gate_changed: Condvar,
    generation: AtomicU64,
    reachable: AtomicBool,
    reads: AtomicU64,
    calls: Mutex<HashMap<&'static str, usize>>,
    faults: Mutex<HashMap<String, EngineError>>,
}

impl Shared {
    fn count(&self, call: &'static str) {
        *self
            .calls
            .lock()
            .expect("memory engine counter lock poisoned")
            .entry(call)
            .or_default() += 1;
    }

    fn take_fault(&self, call: &str) -> Option<EngineError> {
        self.faults
            .lock()
            .expect("memory engine fault lock poisoned")
            .remove(call)
    }

    fn pass_gate(&self, is_read: bool) {
        let mut gate = self.gate.lock().expect("memory engine gate lock poisoned");
        let must_wait = |gate: &GateState| {
            gate.held
                || (is_read
                    && gate
                        .reads_allowed
                        .is_some_and(|n| self.reads.load(Ordering::SeqCst) >= n))
        };
        if !must_wait(&*gate) {
            return;
        }
        gate.blocked += 1;
        self.gate_changed.notify_all();
        while must_wait(&*gate) {
            gate = self
                .gate_changed
                .wait(gate)
                .expect("memory engine gate lock poisoned");
        }
        gate.blocked -= 1;
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().expect("memory engine state lock poisoned")
    }
}

/// Deterministic in-memory file server
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Empty server that accepts guest logons
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ServerState {
                    guest_allowed: true,
                    ..Default::default()
                }),
                gate: Mutex::new(GateState::default()),
                gate_changed: Condvar::new(),
                generation: AtomicU64::new(0),
                reachable: AtomicBool::new(true),
                reads: AtomicU64::new(0),
                calls: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn add_share(&self, name: &str) {
        self.shared
            .state()
            .shares
            .entry(name.to_string())
            .or_default();
    }

    /// Register an account; once any account exists, unknown users are refused
    /// unless guest logon is allowed.
    pub fn add_user(&self, user: &str, password: &str) {
        self.shared
            .state()
            .users
            .insert(user.to_string(), password.to_string());
    }

    pub fn set_guest_allowed(&self, allowed: bool) {
        self.shared.state().guest_allowed = allowed;
    }

    /// Create a directory (and its parents) at a share-qualified path
    pub fn add_directory(&self, path: &str) {
        let parsed = SharePath::parse(path);
        let now = now_filetime();
        let mut state = self.shared.state();
        let tree = state.shares.entry(parsed.share).or_default();
        let mut current = String::new();
        for segment in parsed.relative.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            tree.nodes
                .entry(current.clone())
                .or_insert(Node::Directory { created: now });
        }
    }

    /// Create or replace a file at a share-qualified path, creating parents
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let parsed = SharePath::parse(path);
        if let Some((parent, _)) = parsed.relative.rsplit_once('/') {
            self.add_directory(&format!("/{}/{}", parsed.share, parent));
        } else {
            self.add_share(&parsed.share);
        }
        let now = now_filetime();
        let mut state = self.shared.state();
        let tree = state.shares.entry(parsed.share).or_default();
        tree.nodes.insert(
            parsed.relative,
            Node::File {
                data: data.to_vec(),
                created: now,
                written: now,
            },
        );
    }

    /// Contents of the file at a share-qualified path
    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        let parsed = SharePath::parse(path);
        let state = self.shared.state();
        match state.shares.get(&parsed.share)?.nodes.get(&parsed.relative)? {
            Node::File { data, .. } => Some(data.clone()),
            Node::Directory { .. } => None,
        }
    }

    /// Whether anything exists at a share-qualified path
    pub fn exists(&self, path: &str) -> bool {
        let parsed = SharePath::parse(path);
        let state = self.shared.state();
        match state.shares.get(&parsed.share) {
            Some(tree) => parsed.relative.is_empty() || tree.nodes.contains_key(&parsed.relative),
            None => false,
        }
    }

    // =========================================================================
    // Fault and timing hooks
    // =========================================================================

    /// Park every subsequent protocol call until [`release`](Self::release)
    pub fn hold(&self) {
        self.shared
            .gate
            .lock()
            .expect("memory engine gate lock poisoned")
            .held = true;
    }

    /// Let reads through until `count` reads have completed in total, then
    /// park further reads until [`release`](Self::release)
    pub fn hold_reads_after(&self, count: u64) {
        self.shared
            .gate
            .lock()
            .expect("memory engine gate lock poisoned")
            .reads_allowed = Some(count);
    }

    /// Unpark every parked call and disable both gates
    pub fn release(&self) {
        let mut gate = self
            .shared
            .gate
            .lock()
            .expect("memory engine gate lock poisoned");
        gate.held = false;
        gate.reads_allowed = None;
        self.shared.gate_changed.notify_all();
    }

    /// Wait until at least `count` calls are parked at a gate
    ///
    /// Returns false if that did not happen within `timeout`.
    pub fn wait_for_blocked_calls(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self
            .shared
            .gate
            .lock()
            .expect("memory engine gate lock poisoned");
        while gate.blocked < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            gate = self
                .shared
                .gate_changed
                .wait_timeout(gate, deadline - now)
                .expect("memory engine gate lock poisoned")
                .0;
        }
        true
    }

    /// Drop every live connection; existing handles report disconnected
    pub fn disconnect_all(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        debug!("memory engine dropped all connections");
    }

    /// Refuse (or accept again) new connections
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `call` (by engine method name) fail with `error`
    ///
    /// The handle keeps reporting itself connected, as a real transport does
    /// until it notices the peer is gone.
    pub fn fail_next(&self, call: &str, error: EngineError) {
        self.shared
            .faults
            .lock()
            .expect("memory engine fault lock poisoned")
            .insert(call.to_string(), error);
    }

    /// How many times a call has been made, by engine method name
    /// (`"connect"`, `"tree_connect"`, `"read"`, `"enumerate"`, ...)
    pub fn call_count(&self, call: &str) -> usize {
        self.shared
            .calls
            .lock()
            .expect("memory engine counter lock poisoned")
            .get(call)
            .copied()
            .unwrap_or(0)
    }
}

impl ProtocolEngine for MemoryEngine {
    fn connect(
        &self,
        host_name: &str,
        address: &str,
        port: u16,
    ) -> Result<Box<dyn ProtocolHandle>, EngineError> {
        self.shared.count("connect");
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(EngineError::ConnectFailed(format!(
                "{host_name} ({address}:{port}) is unreachable"
            )));
        }
        Ok(Box::new(MemoryHandle {
            shared: Arc::clone(&self.shared),
            generation: self.shared.generation.load(Ordering::SeqCst),
            logged_off: false,
            trees: HashMap::new(),
            next_tree: 1,
            files: HashMap::new(),
            next_file: 1,
        }))
    }
}

struct OpenFile {
    share: String,
    path: String,
}

/// One connection to a [`MemoryEngine`]
struct MemoryHandle {
    shared: Arc<Shared>,
    generation: u64,
    logged_off: bool,
    trees: HashMap<u16, String>,
    next_tree: u16,
    files: HashMap<u32, OpenFile>,
    next_file: u32,
}

impl MemoryHandle {
    /// Gate, count and liveness check shared by every call
    fn enter(&self, call: &'static str) -> Result<(), EngineError> {
        self.shared.pass_gate(call == "read");
        self.shared.count(call);
        if let Some(fault) = self.shared.take_fault(call) {
            return Err(fault);
        }
        if self.is_connected() {
            Ok(())
        } else {
            Err(EngineError::Disconnected("connection reset by peer".to_string()))
        }
    }

    fn share_for(&self, tree: TreeId) -> Result<String, EngineError> {
        self.trees.get(&tree.0).cloned().ok_or(EngineError::InvalidTree)
    }
}

/// `\docs\a.txt` -> `docs/a.txt`
fn node_key(protocol_path: &str) -> String {
    protocol_path
        .split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn leaf_name(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, n)| n).unwrap_or(key)
}

fn now_filetime() -> u64 {
    datetime_to_filetime(Utc::now())
}

fn is_directory(tree: &Tree, key: &str) -> bool {
    key.is_empty() || matches!(tree.nodes.get(key), Some(Node::Directory { .. }))
}

fn stat_node(name: &str, node: &Node) -> FileStat {
    match node {
        Node::Directory { created } => FileStat {
            name: name.to_string(),
            is_directory: true,
            created: *created,
            modified: *created,
            accessed: *created,
            written: *created,
            ..Default::default()
        },
        Node::File {
            data,
            created,
            written,
        } => {
            let size = data.len() as u64;
            FileStat {
                name: name.to_string(),
                size,
                allocation_size: size.div_ceil(CLUSTER_SIZE) * CLUSTER_SIZE,
                is_directory: false,
                read_only: false,
                created: *created,
                modified: *written,
                accessed: *written,
                written: *written,
            }
        }
    }
}

fn root_stat() -> FileStat {
    FileStat {
        is_directory: true,
        ..Default::default()
    }
}

impl ProtocolHandle for MemoryHandle {
    fn authenticate(
        &mut self,
        _domain: &str,
        user: &str,
        password: &str,
    ) -> Result<AuthOutcome, EngineError> {
        self.enter("authenticate")?;
        let state = self.shared.state();
        match state.users.get(user) {
            Some(expected) if expected == password => Ok(AuthOutcome::User),
            Some(_) => Err(EngineError::AccessDenied(format!("bad password for {user}"))),
            None if state.guest_allowed => Ok(AuthOutcome::Guest),
            None => Err(EngineError::AccessDenied("guest logon disabled".to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        !self.logged_off && self.generation == self.shared.generation.load(Ordering::SeqCst)
    }

    fn list_shares(&mut self) -> Result<Vec<String>, EngineError> {
        self.enter("list_shares")?;
        Ok(self.shared.state().shares.keys().cloned().collect())
    }

    fn tree_connect(&mut self, share: &str) -> Result<TreeId, EngineError> {
        self.enter("tree_connect")?;
        if !self.shared.state().shares.contains_key(share) {
            return Err(EngineError::BadShare(share.to_string()));
        }
        let id = self.next_tree;
        self.next_tree = self.next_tree.wrapping_add(1).max(1);
        self.trees.insert(id, share.to_string());
        Ok(TreeId(id))
    }

    fn tree_disconnect(&mut self, tree: TreeId) -> Result<(), EngineError> {
        self.enter("tree_disconnect")?;
        self.trees
            .remove(&tree.0)
            .map(|_| ())
            .ok_or(EngineError::InvalidTree)
    }

    fn open(&mut self, tree: TreeId, path: &str, mode: OpenMode) -> Result<FileId, EngineError> {
        self.enter("open")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        {
            let mut state = self.shared.state();
            let tree = state
                .shares
                .get_mut(&share)
                .ok_or_else(|| EngineError::BadShare(share.clone()))?;
            if key.is_empty() {
                return Err(EngineError::PermissionDenied("share root".to_string()));
            }
            let existing = tree
                .nodes
                .get(&key)
                .map(|node| matches!(node, Node::Directory { .. }));
            match (existing, mode) {
                (Some(true), _) => {
                    return Err(EngineError::PermissionDenied(format!("{path} is a directory")));
                }
                (Some(false), OpenMode::Read | OpenMode::ReadWrite) => {}
                (None, OpenMode::Read | OpenMode::ReadWrite) => {
                    return Err(EngineError::NotFound(path.to_string()));
                }
                (_, OpenMode::Create) => {
                    if !is_directory(tree, parent_key(&key)) {
                        return Err(EngineError::NotFound(path.to_string()));
                    }
                    let now = now_filetime();
                    tree.nodes.insert(
                        key.clone(),
                        Node::File {
                            data: Vec::new(),
                            created: now,
                            written: now,
                        },
                    );
                }
            }
        }
        let id = self.next_file;
        self.next_file = self.next_file.wrapping_add(1).max(1);
        self.files.insert(id, OpenFile { share, path: key });
        Ok(FileId(id))
    }

    fn read(&mut self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<usize, EngineError> {
        self.enter("read")?;
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        let open = self
            .files
            .get(&file.0)
            .ok_or_else(|| EngineError::Other("invalid file id".to_string()))?;
        let state = self.shared.state();
        let data = match state
            .shares
            .get(&open.share)
            .and_then(|t| t.nodes.get(&open.path))
        {
            Some(Node::File { data, .. }) => data,
            _ => return Err(EngineError::NotFound(open.path.clone())),
        };
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, file: FileId, offset: u64, data: &[u8]) -> Result<usize, EngineError> {
        self.enter("write")?;
        let open = self
            .files
            .get(&file.0)
            .ok_or_else(|| EngineError::Other("invalid file id".to_string()))?;
        let mut state = self.shared.state();
        match state
            .shares
            .get_mut(&open.share)
            .and_then(|t| t.nodes.get_mut(&open.path))
        {
            Some(Node::File {
                data: contents,
                written,
                ..
            }) => {
                let start = offset as usize;
                let end = start + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[start..end].copy_from_slice(data);
                *written = now_filetime();
                Ok(data.len())
            }
            _ => Err(EngineError::NotFound(open.path.clone())),
        }
    }

    fn close(&mut self, file: FileId) -> Result<(), EngineError> {
        self.enter("close")?;
        self.files
            .remove(&file.0)
            .map(|_| ())
            .ok_or_else(|| EngineError::Other("invalid file id".to_string()))
    }

    fn stat(&mut self, tree: TreeId, path: &str) -> Result<FileStat, EngineError> {
        self.enter("stat")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        if key.is_empty() {
            return Ok(root_stat());
        }
        let state = self.shared.state();
        state
            .shares
            .get(&share)
            .and_then(|t| t.nodes.get(&key))
            .map(|node| stat_node(leaf_name(&key), node))
            .ok_or_else(|| EngineError::NotFound(path.to_string()))
    }

    fn enumerate(&mut self, tree: TreeId, path: &str) -> Result<Vec<FileStat>, EngineError> {
        self.enter("enumerate")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        let state = self.shared.state();
        let tree = state
            .shares
            .get(&share)
            .ok_or_else(|| EngineError::BadShare(share.clone()))?;
        if !tree.nodes.contains_key(&key) && !key.is_empty() {
            return Err(EngineError::NotFound(path.to_string()));
        }
        if !is_directory(tree, &key) {
            return Err(EngineError::Other(format!("{path} is not a directory")));
        }

        let mut entries = vec![
            FileStat {
                name: ".".to_string(),
                ..root_stat()
            },
            FileStat {
                name: "..".to_string(),
                ..root_stat()
            },
        ];
        entries.extend(
            tree.nodes
                .iter()
                .filter(|(k, _)| k.as_str() != key && parent_key(k) == key)
                .map(|(k, node)| stat_node(leaf_name(k), node)),
        );
        Ok(entries)
    }

    fn rename(&mut self, tree: TreeId, from: &str, to: &str) -> Result<(), EngineError> {
        self.enter("rename")?;
        let share = self.share_for(tree)?;
        let (from_key, to_key) = (node_key(from), node_key(to));
        let mut state = self.shared.state();
        let tree = state
            .shares
            .get_mut(&share)
            .ok_or_else(|| EngineError::BadShare(share.clone()))?;
        if !tree.nodes.contains_key(&from_key) {
            return Err(EngineError::NotFound(from.to_string()));
        }
        if tree.nodes.contains_key(&to_key) {
            return Err(EngineError::AlreadyExists(to.to_string()));
        }
        if !is_directory(tree, parent_key(&to_key)) {
            return Err(EngineError::NotFound(to.to_string()));
        }
        if to_key.starts_with(&format!("{from_key}/")) {
            return Err(EngineError::Other("cannot move a directory into itself".to_string()));
        }

        let prefix = format!("{from_key}/");
        let moved: Vec<String> = tree
            .nodes
            .keys()
            .filter(|k| **k == from_key || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.nodes.remove(&old) {
                let new = format!("{to_key}{}", &old[from_key.len()..]);
                tree.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn create_directory(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError> {
        self.enter("create_directory")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        let mut state = self.shared.state();
        let tree = state
            .shares
            .get_mut(&share)
            .ok_or_else(|| EngineError::BadShare(share.clone()))?;
        if key.is_empty() || tree.nodes.contains_key(&key) {
            return Err(EngineError::AlreadyExists(path.to_string()));
        }
        if !is_directory(tree, parent_key(&key)) {
            return Err(EngineError::NotFound(path.to_string()));
        }
        tree.nodes.insert(
            key,
            Node::Directory {
                created: now_filetime(),
            },
        );
        Ok(())
    }

    fn remove_file(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError> {
        self.enter("remove_file")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        let mut state = self.shared.state();
        let tree = state
            .shares
            .get_mut(&share)
            .ok_or_else(|| EngineError::BadShare(share.clone()))?;
        match tree.nodes.get(&key) {
            Some(Node::File { .. }) => {
                tree.nodes.remove(&key);
                Ok(())
            }
            Some(Node::Directory { .. }) => {
                Err(EngineError::PermissionDenied(format!("{path} is a directory")))
            }
            None => Err(EngineError::NotFound(path.to_string())),
        }
    }

    fn remove_directory(&mut self, tree: TreeId, path: &str) -> Result<(), EngineError> {
        self.enter("remove_directory")?;
        let share = self.share_for(tree)?;
        let key = node_key(path);
        let mut state = self.shared.state();
        let tree = state
            .shares
            .get_mut(&share)
            .ok_or_else(|| EngineError::BadShare(share.clone()))?;
        match tree.nodes.get(&key) {
            Some(Node::Directory { .. }) => {
                let prefix = format!("{key}/");
                if tree.nodes.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(EngineError::DirectoryNotEmpty(path.to_string()));
                }
                tree.nodes.remove(&key);
                Ok(())
            }
            Some(Node::File { .. }) => {
                Err(EngineError::Other(format!("{path} is not a directory")))
            }
            None => Err(EngineError::NotFound(path.to_string())),
        }
    }

    fn disconnect(&mut self) {
        self.shared.count("disconnect");
        self.logged_off = true;
        self.trees.clear();
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(engine: &MemoryEngine) -> Box<dyn ProtocolHandle> {
        let mut handle = engine.connect("nas", "10.0.0.2", 445).unwrap();
        handle.authenticate("", "", "").unwrap();
        handle
    }

    #[test]
    fn test_seed_and_read_back() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/docs/a.txt", b"hello");
        assert!(engine.exists("/share"));
        assert!(engine.exists("/share/docs"));
        assert_eq!(engine.file_contents("/share/docs/a.txt").unwrap(), b"hello");
        assert!(engine.file_contents("/share/docs").is_none());
        assert!(!engine.exists("/other"));
    }

    #[test]
    fn test_guest_and_user_logon() {
        let engine = MemoryEngine::new();
        engine.add_user("alice", "secret");
        let mut handle = engine.connect("nas", "10.0.0.2", 445).unwrap();
        assert_eq!(
            handle.authenticate("", "alice", "secret").unwrap(),
            AuthOutcome::User
        );
        assert!(matches!(
            handle.authenticate("", "alice", "wrong"),
            Err(EngineError::AccessDenied(_))
        ));
        assert_eq!(handle.authenticate("", "", "").unwrap(), AuthOutcome::Guest);

        engine.set_guest_allowed(false);
        assert!(matches!(
            handle.authenticate("", "", ""),
            Err(EngineError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_enumerate_includes_dot_entries() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/a.txt", b"1");
        engine.add_directory("/share/sub");
        engine.add_file("/share/sub/b.txt", b"2");
        let mut handle = connected(&engine);
        let tree = handle.tree_connect("share").unwrap();
        let names: Vec<String> = handle
            .enumerate(tree, "\\")
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec![".", "..", "a.txt", "sub"]);
    }

    #[test]
    fn test_read_write_round_trip() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let mut handle = connected(&engine);
        let tree = handle.tree_connect("share").unwrap();
        let fd = handle.open(tree, "\\new.bin", OpenMode::Create).unwrap();
        handle.write(fd, 0, b"abc").unwrap();
        handle.write(fd, 3, b"def").unwrap();
        handle.close(fd).unwrap();

        let fd = handle.open(tree, "\\new.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(fd, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(handle.read(fd, 4, &mut buf).unwrap(), 2);
        assert_eq!(handle.read(fd, 6, &mut buf).unwrap(), 0);
        assert_eq!(engine.call_count("read"), 3);
    }

    #[test]
    fn test_rename_moves_children() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/dir/a.txt", b"x");
        let mut handle = connected(&engine);
        let tree = handle.tree_connect("share").unwrap();
        handle.rename(tree, "\\dir", "\\moved").unwrap();
        assert!(engine.exists("/share/moved/a.txt"));
        assert!(!engine.exists("/share/dir"));
    }

    #[test]
    fn test_remove_directory_requires_empty() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/dir/a.txt", b"x");
        let mut handle = connected(&engine);
        let tree = handle.tree_connect("share").unwrap();
        assert!(matches!(
            handle.remove_directory(tree, "\\dir"),
            Err(EngineError::DirectoryNotEmpty(_))
        ));
        handle.remove_file(tree, "\\dir\\a.txt").unwrap();
        handle.remove_directory(tree, "\\dir").unwrap();
        assert!(!engine.exists("/share/dir"));
    }

    #[test]
    fn test_unknown_share_and_tree() {
        let engine = MemoryEngine::new();
        let mut handle = connected(&engine);
        assert!(matches!(
            handle.tree_connect("missing"),
            Err(EngineError::BadShare(_))
        ));
        assert_eq!(
            handle.stat(TreeId(99), "\\x"),
            Err(EngineError::InvalidTree)
        );
    }

    #[test]
    fn test_disconnect_all_makes_handles_stale() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let mut handle = connected(&engine);
        assert!(handle.is_connected());
        engine.disconnect_all();
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.list_shares(),
            Err(EngineError::Disconnected(_))
        ));
        let mut fresh = connected(&engine);
        assert_eq!(fresh.list_shares().unwrap(), vec!["share"]);
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let mut handle = connected(&engine);
        engine.fail_next("list_shares", EngineError::Disconnected("reset".into()));
        assert!(handle.list_shares().unwrap_err().is_disconnect());
        assert!(handle.is_connected());
        assert_eq!(handle.list_shares().unwrap(), vec!["share"]);
    }

    #[test]
    fn test_unreachable_refuses_connect() {
        let engine = MemoryEngine::new();
        engine.set_reachable(false);
        assert!(matches!(
            engine.connect("nas", "10.0.0.2", 445),
            Err(EngineError::ConnectFailed(_))
        ));
        assert_eq!(engine.call_count("connect"), 1);
    }

    #[test]
    fn test_gate_parks_calls_until_release() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let mut handle = connected(&engine);
        engine.hold();

        let worker = std::thread::spawn(move || handle.list_shares());
        assert!(engine.wait_for_blocked_calls(1, Duration::from_secs(5)));
        assert_eq!(engine.call_count("list_shares"), 0);
        engine.release();
        assert_eq!(worker.join().unwrap().unwrap(), vec!["share"]);
    }

    #[test]
    fn test_read_gate_parks_after_count() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/f.bin", &[7u8; 8]);
        let mut handle = connected(&engine);
        let tree = handle.tree_connect("share").unwrap();
        let fd = handle.open(tree, "\\f.bin", OpenMode::Read).unwrap();
        engine.hold_reads_after(1);

        let mut buf = [0u8; 4];
        assert_eq!(handle.read(fd, 0, &mut buf).unwrap(), 4);
        let worker = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            handle.read(fd, 4, &mut buf)
        });
        assert!(engine.wait_for_blocked_calls(1, Duration::from_secs(5)));
        engine.release();
        assert_eq!(worker.join().unwrap().unwrap(), 4);
    }
}

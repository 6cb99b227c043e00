//! Shared session handle
//!
//! A [`SessionHandleWrapper`] owns one authenticated protocol handle together
//! with the tree ids already negotiated on it. Every session presenting the
//! same [`ConnectionIdentity`] goes through the same wrapper, so the logon and
//! tree-connect round trips are paid once.
//!
//! Access to the handle is serialized by the wrapper's mutex. Validity is
//! monotonic: once a wrapper has been found idle, disconnected or closed it is
//! never handed out again.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError, Weak};
use std::time::{Duration, Instant};

use sharelink_common::{EngineError, ErrorKind, ProtocolHandle, SessionError, TreeId};
use thiserror::Error;
use tracing::debug;

use crate::cache::SessionHandleCache;
use crate::identity::ConnectionIdentity;

/// Failure of a call made through a wrapper
#[derive(Debug, Clone, Error)]
pub enum HandleError {
    /// The tree-connect that had to precede the call failed
    #[error("tree connect to {share} failed: {source}")]
    TreeConnect { share: String, source: EngineError },

    /// The call itself failed
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl HandleError {
    pub fn engine_error(&self) -> &EngineError {
        match self {
            Self::TreeConnect { source, .. } => source,
            Self::Engine(e) => e,
        }
    }

    /// True when the handle itself is dead and a reconnect may help
    pub fn is_disconnect(&self) -> bool {
        self.engine_error().is_disconnect()
    }

    /// Map to a caller-facing error
    ///
    /// Connection and share failures have fixed kinds; anything else is
    /// classified by `classify`.
    pub fn into_session_error(
        self,
        classify: impl FnOnce(&EngineError) -> ErrorKind,
    ) -> SessionError {
        let kind = match &self {
            e if e.is_disconnect() => ErrorKind::ConnectionFailed,
            Self::TreeConnect { .. } => ErrorKind::ShareConnectionFailed,
            Self::Engine(e) if e.is_share_failure() => ErrorKind::ShareConnectionFailed,
            Self::Engine(e) => classify(e),
        };
        SessionError::with_detail(kind, self.to_string())
    }
}

struct WrapperState {
    handle: Box<dyn ProtocolHandle>,
    tree_ids: HashMap<String, TreeId>,
}

/// One cached, authenticated protocol handle
pub struct SessionHandleWrapper {
    identity: ConnectionIdentity,
    is_guest: bool,
    idle_timeout: Duration,
    created: Instant,
    /// Milliseconds after `created` of the last successful request
    last_request_ms: AtomicU64,
    invalidated: AtomicBool,
    closed: AtomicBool,
    cache: Weak<SessionHandleCache>,
    state: Mutex<WrapperState>,
}

impl SessionHandleWrapper {
    /// Wrap a freshly authenticated handle
    ///
    /// The wrapper remembers `cache` so that [`close`](Self::close) can
    /// remove it; it does not insert itself.
    pub fn new(
        identity: ConnectionIdentity,
        handle: Box<dyn ProtocolHandle>,
        is_guest: bool,
        idle_timeout: Duration,
        cache: &Arc<SessionHandleCache>,
    ) -> Self {
        Self {
            identity,
            is_guest,
            idle_timeout,
            created: Instant::now(),
            last_request_ms: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cache: Arc::downgrade(cache),
            state: Mutex::new(WrapperState {
                handle,
                tree_ids: HashMap::new(),
            }),
        }
    }

    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Whether the server accepted the logon as a guest
    pub fn is_guest(&self) -> bool {
        self.is_guest
    }

    fn lock(&self) -> MutexGuard<'_, WrapperState> {
        self.state.lock().expect("session wrapper lock poisoned")
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_request_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_request_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Mark the wrapper unusable without touching the handle
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            debug!(session = %self.short_key(), "session handle invalidated");
        }
    }

    /// Whether the wrapper may still be handed out
    ///
    /// False once the handle has been idle for the timeout, reports itself
    /// disconnected, or the wrapper was closed. A false result is permanent.
    pub fn is_valid(&self) -> bool {
        if self.invalidated.load(Ordering::SeqCst) {
            return false;
        }
        if self.idle_for() >= self.idle_timeout {
            self.invalidate();
            return false;
        }
        // A handle busy with a call is in use, so it counts as connected
        let connected = match self.state.try_lock() {
            Ok(state) => state.handle.is_connected(),
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        };
        if !connected {
            self.invalidate();
        }
        connected
    }

    // =========================================================================
    // Tree id cache
    // =========================================================================

    pub fn share_tree_id(&self, share: &str) -> Option<TreeId> {
        self.lock().tree_ids.get(share).copied()
    }

    pub fn cache_share_tree_id(&self, share: &str, tree: TreeId) {
        self.lock().tree_ids.insert(share.to_string(), tree);
    }

    pub fn remove_share_tree_id(&self, share: &str) -> Option<TreeId> {
        self.lock().tree_ids.remove(share)
    }

    // =========================================================================
    // Handle access
    // =========================================================================

    /// Run `call` with exclusive access to the handle
    pub fn with_handle<T>(
        &self,
        call: impl FnOnce(&mut dyn ProtocolHandle) -> Result<T, EngineError>,
    ) -> Result<T, HandleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error().into());
        }
        let mut state = self.lock();
        let result = call(state.handle.as_mut());
        self.after_call(&state, result.is_ok());
        Ok(result?)
    }

    /// Run `call` against `share`, tree-connecting first if needed
    ///
    /// The tree id lookup, the tree-connect and the call happen under one lock
    /// acquisition. A share failure reported by the call drops the cached
    /// tree id so the next call renegotiates it.
    pub fn with_share<T>(
        &self,
        share: &str,
        call: impl FnOnce(&mut dyn ProtocolHandle, TreeId) -> Result<T, EngineError>,
    ) -> Result<T, HandleError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error().into());
        }
        let mut state = self.lock();

        let tree = match state.tree_ids.get(share).copied() {
            Some(tree) => tree,
            None => match state.handle.tree_connect(share) {
                Ok(tree) => {
                    debug!(session = %self.short_key(), share, tree = tree.0, "tree connected");
                    state.tree_ids.insert(share.to_string(), tree);
                    tree
                }
                Err(source) => {
                    self.after_call(&state, false);
                    return Err(HandleError::TreeConnect {
                        share: share.to_string(),
                        source,
                    });
                }
            },
        };

        let result = call(state.handle.as_mut(), tree);
        if let Err(e) = &result
            && e.is_share_failure()
        {
            state.tree_ids.remove(share);
        }
        self.after_call(&state, result.is_ok());
        Ok(result?)
    }

    fn after_call(&self, state: &WrapperState, succeeded: bool) {
        if succeeded {
            self.touch();
        }
        if !state.handle.is_connected() {
            self.invalidate();
        }
    }

    /// Tree-disconnect `share` and forget its id
    pub fn close_share(&self, share: &str) {
        let mut state = self.lock();
        if let Some(tree) = state.tree_ids.remove(share)
            && let Err(e) = state.handle.tree_disconnect(tree)
        {
            debug!(share, error = %e, "tree disconnect failed");
        }
    }

    /// Disconnect the handle and remove the wrapper from its cache
    ///
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.invalidate();
        {
            let mut state = self.lock();
            state.tree_ids.clear();
            state.handle.disconnect();
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.remove(self);
        }
        debug!(session = %self.short_key(), "session handle closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Loggable prefix of the identity's session key
    fn short_key(&self) -> String {
        let mut key = self.identity.session_key();
        key.truncate(12);
        key
    }
}

impl Drop for SessionHandleWrapper {
    fn drop(&mut self) {
        if !*self.closed.get_mut()
            && let Ok(state) = self.state.get_mut()
        {
            state.handle.disconnect();
        }
    }
}

impl fmt::Debug for SessionHandleWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandleWrapper")
            .field("identity", &self.identity)
            .field("is_guest", &self.is_guest)
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn closed_error() -> EngineError {
    EngineError::Disconnected("session handle closed".to_string())
}

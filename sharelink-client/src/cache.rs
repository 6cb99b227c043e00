//! Session handle cache
//!
//! Maps a [`ConnectionIdentity`] to the one [`SessionHandleWrapper`] currently
//! serving it. Stale wrappers are evicted lazily when looked up; there is no
//! size-based eviction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::identity::ConnectionIdentity;
use crate::wrapper::SessionHandleWrapper;

/// Identity-keyed cache of authenticated session handles
///
/// Construct one and share it (`Arc<SessionHandleCache>`) between every
/// session that should reuse connections.
#[derive(Default)]
pub struct SessionHandleCache {
    entries: Mutex<HashMap<ConnectionIdentity, Arc<SessionHandleWrapper>>>,
    /// One slot per identity, held while a logon for it is in flight
    connecting: Mutex<HashMap<ConnectionIdentity, Arc<Mutex<()>>>>,
}

impl SessionHandleCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionIdentity, Arc<SessionHandleWrapper>>> {
        self.entries
            .lock()
            .expect("session handle cache lock poisoned")
    }

    /// Valid wrapper for `identity`, evicting an invalid one
    pub fn get(&self, identity: &ConnectionIdentity) -> Option<Arc<SessionHandleWrapper>> {
        let mut entries = self.lock();
        lookup_valid(&mut entries, identity)
    }

    /// Insert a wrapper, replacing any entry for the same identity
    pub fn put(&self, wrapper: Arc<SessionHandleWrapper>) {
        let identity = wrapper.identity().clone();
        if let Some(old) = self.lock().insert(identity, wrapper) {
            old.invalidate();
        }
    }

    /// Remove `wrapper` if it is the instance cached for its identity
    ///
    /// A holder of a replaced wrapper cannot evict its replacement.
    pub fn remove(&self, wrapper: &SessionHandleWrapper) -> bool {
        let mut entries = self.lock();
        match entries.get(wrapper.identity()) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), wrapper) => {
                entries.remove(wrapper.identity());
                debug!("session handle evicted from cache");
                true
            }
            _ => false,
        }
    }

    /// Return the valid cached wrapper for `identity`, or install the one
    /// produced by `connect`
    ///
    /// `connect` runs without the cache lock held, so a slow logon only
    /// delays callers presenting the same identity. Those wait for it and then
    /// share its wrapper.
    pub fn get_or_connect<E>(
        &self,
        identity: &ConnectionIdentity,
        connect: impl FnOnce() -> Result<SessionHandleWrapper, E>,
    ) -> Result<Arc<SessionHandleWrapper>, E> {
        if let Some(wrapper) = self.get(identity) {
            debug!("session handle cache hit");
            return Ok(wrapper);
        }

        let slot = Arc::clone(
            self.connecting
                .lock()
                .expect("session handle cache lock poisoned")
                .entry(identity.clone())
                .or_default(),
        );
        let _in_flight = slot.lock().expect("session handle slot lock poisoned");

        // Whoever held the slot before us may have connected already
        if let Some(wrapper) = self.get(identity) {
            debug!("session handle connected by another caller");
            return Ok(wrapper);
        }

        let wrapper = Arc::new(connect()?);
        let mut entries = self.lock();
        if let Some(old) = entries.insert(identity.clone(), Arc::clone(&wrapper)) {
            old.invalidate();
        }
        debug!(entries = entries.len(), "session handle cached");
        Ok(wrapper)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.connecting
            .lock()
            .expect("session handle cache lock poisoned")
            .clear();
        let drained: Vec<_> = self.lock().drain().map(|(_, w)| w).collect();
        for wrapper in drained {
            wrapper.invalidate();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn lookup_valid(
    entries: &mut HashMap<ConnectionIdentity, Arc<SessionHandleWrapper>>,
    identity: &ConnectionIdentity,
) -> Option<Arc<SessionHandleWrapper>> {
    let wrapper = entries.get(identity)?;
    if wrapper.is_valid() {
        return Some(Arc::clone(wrapper));
    }
    debug!("evicting stale session handle");
    entries.remove(identity);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharelink_common::ProtocolEngine;
    use sharelink_common::memory::MemoryEngine;
    use std::time::Duration;

    fn connect(
        engine: &MemoryEngine,
        cache: &Arc<SessionHandleCache>,
        identity: &ConnectionIdentity,
        idle: Duration,
    ) -> Result<SessionHandleWrapper, String> {
        let mut handle = engine
            .connect("nas", identity.address(), 445)
            .map_err(|e| e.to_string())?;
        handle.authenticate("", "", "").map_err(|e| e.to_string())?;
        Ok(SessionHandleWrapper::new(
            identity.clone(),
            handle,
            true,
            idle,
            cache,
        ))
    }

    #[test]
    fn test_get_or_connect_reuses_wrapper() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");

        let first = cache
            .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
            .unwrap();
        let second = cache
            .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.call_count("connect"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_different_identities_get_different_wrappers() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let a = ConnectionIdentity::new("10.0.0.2", "", "", "");
        let b = ConnectionIdentity::new("10.0.0.2", "", "bob", "pw");
        let wa = cache
            .get_or_connect(&a, || connect(&engine, &cache, &a, Duration::from_secs(60)))
            .unwrap();
        let wb = cache
            .get_or_connect(&b, || connect(&engine, &cache, &b, Duration::from_secs(60)))
            .unwrap();
        assert!(!Arc::ptr_eq(&wa, &wb));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_stale_entry_is_replaced() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");
        let stale = cache
            .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
            .unwrap();
        engine.disconnect_all();
        assert!(cache.get(&id).is_none());

        let fresh = cache
            .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
            .unwrap();
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert!(fresh.is_valid());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_only_evicts_same_instance() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");
        let old = Arc::new(connect(&engine, &cache, &id, Duration::from_secs(60)).unwrap());
        let new = Arc::new(connect(&engine, &cache, &id, Duration::from_secs(60)).unwrap());
        cache.put(Arc::clone(&old));
        cache.put(Arc::clone(&new));
        assert!(!old.is_valid());

        assert!(!cache.remove(&old));
        assert!(Arc::ptr_eq(&cache.get(&id).unwrap(), &new));
        assert!(cache.remove(&new));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_connect_error_leaves_cache_empty() {
        let engine = MemoryEngine::new();
        engine.set_reachable(false);
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");
        let result =
            cache.get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");
        let wrapper = cache
            .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
            .unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert!(!wrapper.is_valid());
    }

    #[test]
    fn test_slow_logon_does_not_block_other_identities() {
        let slow = MemoryEngine::new();
        let fast = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let a = ConnectionIdentity::new("10.0.0.1", "", "", "");
        let b = ConnectionIdentity::new("10.0.0.9", "", "", "");

        slow.hold();
        let pending = {
            let (slow, cache, a) = (slow.clone(), Arc::clone(&cache), a.clone());
            std::thread::spawn(move || {
                cache.get_or_connect(&a, || connect(&slow, &cache, &a, Duration::from_secs(60)))
            })
        };
        assert!(slow.wait_for_blocked_calls(1, Duration::from_secs(5)));

        // Parked in authenticate, yet the cache still serves everyone else
        let wb = cache
            .get_or_connect(&b, || connect(&fast, &cache, &b, Duration::from_secs(60)))
            .unwrap();
        assert!(wb.is_valid());
        assert!(cache.get(&a).is_none());
        assert_eq!(cache.len(), 1);

        slow.release();
        let wa = pending.join().unwrap().unwrap();
        assert!(Arc::ptr_eq(&cache.get(&a).unwrap(), &wa));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_logons_for_one_identity_share_a_wrapper() {
        let engine = MemoryEngine::new();
        let cache = Arc::new(SessionHandleCache::new());
        let id = ConnectionIdentity::new("10.0.0.2", "", "", "");

        engine.hold();
        let spawn = || {
            let (engine, cache, id) = (engine.clone(), Arc::clone(&cache), id.clone());
            std::thread::spawn(move || {
                cache
                    .get_or_connect(&id, || connect(&engine, &cache, &id, Duration::from_secs(60)))
                    .unwrap()
            })
        };
        let first = spawn();
        assert!(engine.wait_for_blocked_calls(1, Duration::from_secs(5)));
        let second = spawn();
        engine.release();

        let (first, second) = (first.join().unwrap(), second.join().unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.call_count("connect"), 1);
        assert_eq!(cache.len(), 1);
    }
}

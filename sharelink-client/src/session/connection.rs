//! Connection establishment and handle reuse

use std::sync::Arc;

use sharelink_common::host::is_valid_ip_address;
use sharelink_common::{
    AuthOutcome, EngineError, ErrorKind, NameResolver, ProtocolHandle, SessionError,
    SystemResolver, TreeId,
};
use tracing::{debug, info, warn};

use super::{ConnectionState, SessionCore};
use crate::identity::ConnectionIdentity;
use crate::wrapper::SessionHandleWrapper;

impl SessionCore {
    fn name_resolver(&self) -> Arc<dyn NameResolver> {
        self.resolver
            .clone()
            .unwrap_or_else(|| Arc::new(SystemResolver))
    }

    /// Address for `host_name`: DNS first, then the NetBIOS name service
    fn lookup_address(&self, host_name: &str) -> Result<String, SessionError> {
        let resolver = self.name_resolver();
        let dns_error = match resolver.address_for_hostname(host_name) {
            Ok(address) => return Ok(address),
            Err(e) => e,
        };
        match resolver.netbios_lookup(host_name) {
            Ok(entry) if !entry.address.is_empty() => {
                debug!(host = host_name, group = %entry.group, "found through NetBIOS");
                Ok(entry.address)
            }
            _ => Err(SessionError::with_detail(
                ErrorKind::AddressResolutionFailed,
                dns_error.to_string(),
            )),
        }
    }

    /// Fill in whichever of host name and address is missing
    fn resolve_addresses(&self, state: &mut ConnectionState) -> Result<(), SessionError> {
        let options = &mut state.options;

        if options.ip_address.is_empty() {
            if options.host_name.is_empty() {
                return Err(SessionError::with_detail(
                    ErrorKind::AddressResolutionFailed,
                    "neither a host name nor an address was given",
                ));
            }
            if is_valid_ip_address(&options.host_name) {
                options.ip_address = options.host_name.clone();
            } else if options.use_internal_name_resolution {
                options.ip_address = self.lookup_address(&options.host_name)?;
                debug!(host = %options.host_name, address = %options.ip_address, "resolved address");
            } else {
                return Err(SessionError::with_detail(
                    ErrorKind::AddressResolutionFailed,
                    format!("no address for {} and name resolution is off", options.host_name),
                ));
            }
        }

        if options.host_name.is_empty() {
            let looked_up = options
                .use_internal_name_resolution
                .then(|| self.name_resolver().hostname_for_address(&options.ip_address))
                .and_then(Result::ok);
            // Servers generally accept their address in place of a name
            options.host_name = looked_up.unwrap_or_else(|| options.ip_address.clone());
        }
        Ok(())
    }

    /// Connect and authenticate a new handle for `identity`
    fn connect_handle(
        &self,
        identity: &ConnectionIdentity,
        host_name: &str,
        port: u16,
    ) -> Result<SessionHandleWrapper, SessionError> {
        info!(host = host_name, address = identity.address(), port, "connecting");
        let mut handle = self
            .engine
            .connect(host_name, identity.address(), port)
            .map_err(|e| SessionError::from_engine(ErrorKind::ConnectionFailed, &e))?;

        let outcome = match handle.authenticate(
            identity.domain(),
            identity.user_name(),
            identity.password(),
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                handle.disconnect();
                let kind = if e.is_disconnect() {
                    ErrorKind::ConnectionFailed
                } else {
                    ErrorKind::AuthenticationFailed
                };
                return Err(SessionError::from_engine(kind, &e));
            }
        };

        let is_guest = outcome == AuthOutcome::Guest;
        if is_guest && !identity.is_anonymous() {
            info!(user = identity.user_name(), "logged on as guest");
        }
        Ok(SessionHandleWrapper::new(
            identity.clone(),
            handle,
            is_guest,
            self.config.idle_timeout(),
            &self.cache,
        ))
    }

    /// Valid handle for this session, connecting if needed
    pub(crate) fn ensure_wrapper(&self) -> Result<Arc<SessionHandleWrapper>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::cancelled());
        }
        let mut state = self.connection();
        if let Some(wrapper) = &state.wrapper
            && wrapper.is_valid()
        {
            return Ok(Arc::clone(wrapper));
        }
        state.wrapper = None;

        self.resolve_addresses(&mut state)?;
        let options = &state.options;
        let identity = ConnectionIdentity::new(
            options.ip_address.clone(),
            options.domain.clone(),
            options.user_name.clone(),
            options.password.clone(),
        );
        let (host_name, port) = (options.host_name.clone(), options.port);

        let wrapper = self
            .cache
            .get_or_connect(&identity, || self.connect_handle(&identity, &host_name, port))?;
        state.is_guest = wrapper.is_guest();
        state.wrapper = Some(Arc::clone(&wrapper));
        Ok(wrapper)
    }

    /// Close a handle that went stale and stop using it
    pub(crate) fn discard_wrapper(&self, wrapper: &Arc<SessionHandleWrapper>) {
        wrapper.close();
        let mut state = self.connection();
        if state
            .wrapper
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, wrapper))
        {
            state.wrapper = None;
        }
    }

    /// Run `call` against `share`, reconnecting once if the handle is stale
    ///
    /// Also returns the wrapper the call succeeded on, for follow-up calls that
    /// must use the same handle (open file ids belong to it).
    pub(crate) fn share_call_on<T>(
        &self,
        share: &str,
        classify: impl Fn(&EngineError) -> ErrorKind,
        mut call: impl FnMut(&mut dyn ProtocolHandle, TreeId) -> Result<T, EngineError>,
    ) -> Result<(T, Arc<SessionHandleWrapper>), SessionError> {
        let mut reconnected = false;
        loop {
            let wrapper = self.ensure_wrapper()?;
            match wrapper.with_share(share, &mut call) {
                Ok(value) => return Ok((value, wrapper)),
                Err(e) if e.is_disconnect() && !reconnected => {
                    warn!(share, error = %e, "session handle went stale, reconnecting");
                    self.discard_wrapper(&wrapper);
                    reconnected = true;
                }
                Err(e) => return Err(e.into_session_error(&classify)),
            }
        }
    }

    pub(crate) fn share_call<T>(
        &self,
        share: &str,
        classify: impl Fn(&EngineError) -> ErrorKind,
        call: impl FnMut(&mut dyn ProtocolHandle, TreeId) -> Result<T, EngineError>,
    ) -> Result<T, SessionError> {
        self.share_call_on(share, classify, call)
            .map(|(value, _)| value)
    }

    /// Run a call that needs no share, reconnecting once if the handle is stale
    pub(crate) fn server_call<T>(
        &self,
        classify: impl Fn(&EngineError) -> ErrorKind,
        mut call: impl FnMut(&mut dyn ProtocolHandle) -> Result<T, EngineError>,
    ) -> Result<T, SessionError> {
        let mut reconnected = false;
        loop {
            let wrapper = self.ensure_wrapper()?;
            match wrapper.with_handle(&mut call) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_disconnect() && !reconnected => {
                    warn!(error = %e, "session handle went stale, reconnecting");
                    self.discard_wrapper(&wrapper);
                    reconnected = true;
                }
                Err(e) => return Err(e.into_session_error(&classify)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sharelink_common::memory::MemoryEngine;
    use sharelink_common::{
        EngineError, ErrorKind, NameResolver, NameServiceType, NetBiosEntry, ResolveError,
    };

    use crate::cache::SessionHandleCache;
    use crate::config::ClientConfig;
    use crate::session::{Session, SessionOptions};

    struct FixedResolver;

    impl NameResolver for FixedResolver {
        fn address_for_hostname(&self, host_name: &str) -> Result<String, ResolveError> {
            match host_name {
                "nas" => Ok("10.0.0.2".to_string()),
                other => Err(ResolveError::NotFound(other.to_string())),
            }
        }

        fn hostname_for_address(&self, address: &str) -> Result<String, ResolveError> {
            match address {
                "10.0.0.2" => Ok("nas".to_string()),
                _ => Err(ResolveError::Unsupported),
            }
        }

        fn netbios_lookup(&self, name: &str) -> Result<NetBiosEntry, ResolveError> {
            match name {
                "FILESERVER" => Ok(NetBiosEntry {
                    name: name.to_string(),
                    group: "WORKGROUP".to_string(),
                    service_type: NameServiceType::FileServer,
                    address: "10.0.0.7".to_string(),
                }),
                other => Err(ResolveError::NotFound(other.to_string())),
            }
        }
    }

    fn session(engine: &MemoryEngine, options: SessionOptions) -> Session {
        Session::new(
            options,
            Arc::new(engine.clone()),
            Arc::new(SessionHandleCache::new()),
            Some(Arc::new(FixedResolver)),
            ClientConfig::default(),
        )
    }

    #[test]
    fn test_host_name_is_resolved() {
        let engine = MemoryEngine::new();
        let session = session(&engine, SessionOptions::for_host("nas"));
        session.core().ensure_wrapper().unwrap();
        assert_eq!(session.ip_address(), "10.0.0.2");
        assert!(session.connected());
    }

    #[test]
    fn test_netbios_name_used_when_dns_fails() {
        let engine = MemoryEngine::new();
        let session = session(&engine, SessionOptions::for_host("FILESERVER"));
        session.core().ensure_wrapper().unwrap();
        assert_eq!(session.ip_address(), "10.0.0.7");
        assert_eq!(session.host_name(), "FILESERVER");
    }

    #[test]
    fn test_address_is_reverse_resolved() {
        let engine = MemoryEngine::new();
        let session = session(&engine, SessionOptions::for_address("10.0.0.2"));
        session.core().ensure_wrapper().unwrap();
        assert_eq!(session.host_name(), "nas");
    }

    #[test]
    fn test_ip_literal_host_name_needs_no_lookup() {
        let engine = MemoryEngine::new();
        let options = SessionOptions {
            host_name: "192.168.1.9".to_string(),
            use_internal_name_resolution: false,
            ..Default::default()
        };
        let session = session(&engine, options);
        session.core().ensure_wrapper().unwrap();
        assert_eq!(session.ip_address(), "192.168.1.9");
    }

    #[test]
    fn test_unknown_host_fails_resolution() {
        let engine = MemoryEngine::new();
        let session = session(&engine, SessionOptions::for_host("nowhere"));
        let err = session.core().ensure_wrapper().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressResolutionFailed);
        assert_eq!(engine.call_count("connect"), 0);
    }

    #[test]
    fn test_resolution_disabled_fails_for_names() {
        let engine = MemoryEngine::new();
        let options = SessionOptions {
            use_internal_name_resolution: false,
            ..SessionOptions::for_host("nas")
        };
        let err = session(&engine, options).core().ensure_wrapper().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressResolutionFailed);
    }

    #[test]
    fn test_unreachable_is_connection_failed() {
        let engine = MemoryEngine::new();
        engine.set_reachable(false);
        let session = session(&engine, SessionOptions::for_address("10.0.0.2"));
        let err = session.core().ensure_wrapper().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(!session.connected());
    }

    #[test]
    fn test_rejected_credentials() {
        let engine = MemoryEngine::new();
        engine.add_user("alice", "secret");
        let options = SessionOptions::for_address("10.0.0.2").with_credentials("alice", "nope");
        let err = session(&engine, options).core().ensure_wrapper().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_guest_logon_is_recorded() {
        let engine = MemoryEngine::new();
        engine.add_user("alice", "secret");
        let guest = session(&engine, SessionOptions::for_address("10.0.0.2"));
        guest.core().ensure_wrapper().unwrap();
        assert!(guest.is_guest());

        let user = session(
            &engine,
            SessionOptions::for_address("10.0.0.2").with_credentials("alice", "secret"),
        );
        user.core().ensure_wrapper().unwrap();
        assert!(!user.is_guest());
    }

    #[test]
    fn test_dead_handle_is_replaced_before_use() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let session = session(&engine, SessionOptions::for_address("10.0.0.2"));
        let first = session.core().ensure_wrapper().unwrap();

        // Held by the session but dead on the server side
        engine.disconnect_all();
        let shares = session
            .core()
            .server_call(|_| ErrorKind::Unknown, |h| h.list_shares())
            .unwrap();
        assert_eq!(shares, vec!["share"]);
        assert_eq!(engine.call_count("connect"), 2);
        assert!(!first.is_valid());
    }

    #[test]
    fn test_disconnect_during_call_retries_once() {
        let engine = MemoryEngine::new();
        engine.add_share("share");
        let session = session(&engine, SessionOptions::for_address("10.0.0.2"));
        let first = session.core().ensure_wrapper().unwrap();

        engine.fail_next("list_shares", EngineError::Disconnected("reset".into()));
        let shares = session
            .core()
            .server_call(|_| ErrorKind::Unknown, |h| h.list_shares())
            .unwrap();
        assert_eq!(shares, vec!["share"]);
        assert!(first.is_closed());
        assert_eq!(engine.call_count("connect"), 2);
        assert_eq!(engine.call_count("list_shares"), 2);
    }

    #[test]
    fn test_second_disconnect_surfaces_connection_failed() {
        let engine = MemoryEngine::new();
        engine.add_file("/share/a.txt", b"x");
        let session = session(&engine, SessionOptions::for_address("10.0.0.2"));
        session.core().ensure_wrapper().unwrap();

        // Fails on the stale handle, then again right after reconnecting
        engine.fail_next("stat", EngineError::Disconnected("reset".into()));
        let err = session
            .core()
            .share_call("share", |_| ErrorKind::Unknown, |h, t| {
                let stat = h.stat(t, "\\a.txt");
                engine.fail_next("stat", EngineError::Disconnected("reset again".into()));
                stat
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
    }
}

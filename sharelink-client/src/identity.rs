//! Connection identity
//!
//! The credential tuple a session handle is authenticated under. Two sessions
//! with equal identities share one cached handle.

use std::fmt;

use sha2::{Digest, Sha256};

/// Cache key for session handles: address plus credentials
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    address: String,
    domain: String,
    user_name: String,
    password: String,
}

impl ConnectionIdentity {
    pub fn new(
        address: impl Into<String>,
        domain: impl Into<String>,
        user_name: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            domain: domain.into(),
            user_name: user_name.into(),
            password: password.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    /// True when no credentials are supplied (guest logon)
    pub fn is_anonymous(&self) -> bool {
        self.user_name.is_empty() && self.password.is_empty()
    }

    /// Stable SHA-256 hex digest of address, domain and user name
    ///
    /// Used in logs and staging file names. The password is left out, so
    /// identities differing only in password share a key.
    pub fn session_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.address, &self.domain, &self.user_name] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIdentity")
            .field("address", &self.address)
            .field("domain", &self.domain)
            .field("user_name", &self.user_name)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

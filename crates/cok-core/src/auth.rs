//! API key authentication.
//!
//! Two paths are consulted for every presented key:
//!
//! 1. **Stateless**: the expected key for a subdomain is
//!    `HEX(HMAC-SHA256(secret, subdomain))`. Deterministic, survives
//!    restarts, and needs no storage.
//! 2. **Registered**: ephemeral keys minted at runtime and held in memory
//!    with an optional expiry.
//!
//! Both paths are evaluated on every call and all key comparisons are
//! constant-time, so a caller cannot learn from response timing which path
//! (if any) matched.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of a registry-minted key in hex characters (32 random bytes).
pub const API_KEY_HEX_LEN: usize = 64;

/// Proof of a successful key validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    /// Subdomain the key is bound to.
    pub subdomain: String,
    /// Expiry for registered keys; `None` for stateless keys.
    pub expires_at: Option<SystemTime>,
}

#[derive(Debug, Clone)]
struct RegisteredKey {
    subdomain: String,
    expires_at: Option<SystemTime>,
}

/// Validates presented API keys and mints registered ones.
pub struct AuthService {
    secret: Vec<u8>,
    registry: Mutex<HashMap<String, RegisteredKey>>,
}

impl AuthService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        AuthService {
            secret: secret.into(),
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// The stateless key for `subdomain`.
    pub fn derive_key(&self, subdomain: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts keys of any length");
        mac.update(subdomain.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Validate `presented` for `subdomain` through both paths.
    pub fn validate_api_key(&self, presented: &str, subdomain: &str) -> Option<AuthRecord> {
        self.validate_api_key_at(presented, subdomain, SystemTime::now())
    }

    pub(crate) fn validate_api_key_at(
        &self,
        presented: &str,
        subdomain: &str,
        now: SystemTime,
    ) -> Option<AuthRecord> {
        // Stateless path: always computed.
        let expected = self.derive_key(subdomain);
        let hmac_ok = bool::from(expected.as_bytes().ct_eq(presented.as_bytes()));

        // Registered path: always probed, even when the stateless path
        // already matched, to keep timing uniform across the two paths.
        let registered = self.lookup_registered_at(presented, now);
        let registered_ok = registered
            .as_ref()
            .map(|record| bool::from(record.subdomain.as_bytes().ct_eq(subdomain.as_bytes())))
            .unwrap_or(false);

        if hmac_ok {
            return Some(AuthRecord {
                subdomain: subdomain.to_string(),
                expires_at: None,
            });
        }
        if registered_ok {
            return registered;
        }
        None
    }

    /// Look up a registered key without binding it to a subdomain; used
    /// when a client presents a key but requests no particular subdomain.
    /// Expired entries are removed on the way.
    pub fn lookup_registered(&self, presented: &str) -> Option<AuthRecord> {
        self.lookup_registered_at(presented, SystemTime::now())
    }

    fn lookup_registered_at(&self, presented: &str, now: SystemTime) -> Option<AuthRecord> {
        let mut registry = self.registry.lock();
        match registry.get(presented) {
            Some(record) => {
                if let Some(expires_at) = record.expires_at {
                    if expires_at <= now {
                        registry.remove(presented);
                        return None;
                    }
                }
                Some(AuthRecord {
                    subdomain: record.subdomain.clone(),
                    expires_at: record.expires_at,
                })
            }
            None => None,
        }
    }

    /// Mint and store a fresh random key for `subdomain`. The key is
    /// returned exactly once; it cannot be recovered from the registry.
    pub fn create_api_key(&self, subdomain: &str, expires_in: Option<Duration>) -> String {
        self.create_api_key_at(subdomain, expires_in, SystemTime::now())
    }

    pub(crate) fn create_api_key_at(
        &self,
        subdomain: &str,
        expires_in: Option<Duration>,
        now: SystemTime,
    ) -> String {
        let mut raw = [0u8; API_KEY_HEX_LEN / 2];
        rand::thread_rng().fill_bytes(&mut raw);
        let key = hex::encode(raw);

        let expires_at = expires_in.map(|d| now + d);
        self.registry.lock().insert(
            key.clone(),
            RegisteredKey {
                subdomain: subdomain.to_string(),
                expires_at,
            },
        );
        key
    }

    /// Remove a registered key, e.g. when an operator revokes it.
    pub fn revoke_api_key(&self, key: &str) -> bool {
        self.registry.lock().remove(key).is_some()
    }

    /// Number of live registered keys (expired entries may still be
    /// counted until their next lookup).
    pub fn registered_keys(&self) -> usize {
        self.registry.lock().len()
    }
}

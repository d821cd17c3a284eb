//! Local hub identity
//!
//! Holds the private signing key and the private halves of the exchange
//! keys published in the hub status.

use crate::error::{ErrorKind, Result};
use crate::hub::{now_unix, sign_blob, Announcement, ExchangeKey, Hub, HubId, Status};
use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

/// Lifetime of a freshly generated exchange key.
pub const EXCHANGE_KEY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Private identity of the local hub.
pub struct Identity {
    signing_key: SigningKey,
    exchange_keys: RwLock<HashMap<String, StaticSecret>>,
    hub: RwLock<Arc<Hub>>,
}

impl Identity {
    /// Generate a new identity with one exchange key.
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signing_public = signing_key.verifying_key().to_bytes();
        let id = HubId::from_signing_key(&signing_public);
        let now = now_unix();

        let announcement = Announcement {
            id,
            name: name.into(),
            signing_key: signing_public,
            timestamp: now,
        };
        let announcement_blob = sign_blob(&announcement, &signing_key)?;

        let identity = Self {
            hub: RwLock::new(Arc::new(Hub {
                id,
                announcement,
                status: None,
                announcement_blob: Bytes::from(announcement_blob),
                status_blob: None,
            })),
            signing_key,
            exchange_keys: RwLock::new(HashMap::new()),
        };
        identity.rotate_exchange_key()?;
        Ok(identity)
    }

    /// Create a new exchange key and re-sign the status with all unexpired
    /// keys.
    pub fn rotate_exchange_key(&self) -> Result<ExchangeKey> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut key_id = [0u8; 8];
        OsRng.fill_bytes(&mut key_id);
        let now = now_unix();
        let key = ExchangeKey {
            id: hex::encode(key_id),
            public: PublicKey::from(&secret).to_bytes(),
            expires: now + EXCHANGE_KEY_TTL_SECS,
        };

        let mut hub = self.hub.write();
        let mut keys: Vec<ExchangeKey> = hub
            .status
            .as_ref()
            .map(|s| s.keys.iter().filter(|k| k.expires > now).cloned().collect())
            .unwrap_or_default();
        keys.push(key.clone());

        let status = Status {
            id: hub.id,
            // Status timestamps must increase for importers to accept them.
            timestamp: hub
                .status
                .as_ref()
                .map(|s| now.max(s.timestamp + 1))
                .unwrap_or(now),
            keys,
        };
        let status_blob = sign_blob(&status, &self.signing_key)?;

        let mut updated = (**hub).clone();
        updated.status = Some(status);
        updated.status_blob = Some(Bytes::from(status_blob));
        *hub = Arc::new(updated);

        self.exchange_keys.write().insert(key.id.clone(), secret);
        Ok(key)
    }

    /// Public view of the local hub.
    pub fn hub(&self) -> Arc<Hub> {
        self.hub.read().clone()
    }

    pub fn id(&self) -> HubId {
        self.hub.read().id
    }

    /// Sign arbitrary data with the hub key.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }

    /// Private half of a published exchange key.
    pub fn exchange_secret(&self, key_id: &str) -> Result<StaticSecret> {
        self.exchange_keys
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| ErrorKind::Integrity.with(format!("unknown exchange key {key_id}")))
    }

    pub fn announcement_blob(&self) -> Bytes {
        self.hub.read().announcement_blob.clone()
    }

    pub fn status_blob(&self) -> Bytes {
        self.hub.read().status_blob.clone().unwrap_or_default()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate() {
        let identity = Identity::generate("alpha").unwrap();
        let hub = identity.hub();

        assert_eq!(hub.announcement.name, "alpha");
        let key = hub.select_exchange_key().unwrap();
        let secret = identity.exchange_secret(&key.id).unwrap();
        assert_eq!(PublicKey::from(&secret).to_bytes(), key.public);
        assert!(identity.exchange_secret("missing").is_err());
    }

    #[test]
    fn test_sign_verifies_with_hub() {
        let identity = Identity::generate("alpha").unwrap();
        let signature = identity.sign(b"challenge");

        assert!(identity.hub().verify_signature(b"challenge", &signature).is_ok());
        assert!(identity.hub().verify_signature(b"other", &signature).is_err());
    }

    #[test]
    fn test_rotate_keeps_old_keys() {
        let identity = Identity::generate("alpha").unwrap();
        let first = identity.hub().status.clone().unwrap();
        identity.rotate_exchange_key().unwrap();
        let second = identity.hub().status.clone().unwrap();

        assert_eq!(second.keys.len(), 2);
        assert!(second.timestamp > first.timestamp);
        assert!(Status::verify_blob(&identity.status_blob(), &identity.hub().announcement).is_ok());
    }
}

//! Hub identifiers, signed hub messages and the hub cache
//!
//! A hub publishes two signed messages: an [`Announcement`] that binds its
//! name to its signing key, and a [`Status`] that lists its current
//! exchange keys. Both travel as `postcard(Signed { payload, signature })`.

use crate::canonical::{canonical_bytes, from_canonical_bytes};
use crate::error::{ErrorKind, Result};
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// 32-byte fixed-size array used for keys and identifiers.
pub type Bytes32 = [u8; 32];

/// Domain prefix for HubId derivation
pub const DOMAIN_HUB_ID: &[u8] = b"spn-hub-id";

/// Current unix time in seconds.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Stable hub identifier: BLAKE3("spn-hub-id" || signing_key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HubId(pub Bytes32);

impl HubId {
    /// Derive the hub ID from an Ed25519 verifying key.
    pub fn from_signing_key(signing_key: &Bytes32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(DOMAIN_HUB_ID);
        hasher.update(signing_key);
        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a hub ID from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: Bytes32 = bytes
            .try_into()
            .map_err(|_| ErrorKind::MalformedData.with(format!("hub id of {} bytes", bytes.len())))?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl std::fmt::Display for HubId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Public hub announcement, signed with the hub's own key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: HubId,
    pub name: String,
    pub signing_key: Bytes32,
    /// Unix seconds; newer announcements replace older ones.
    pub timestamp: u64,
}

/// An X25519 key others may use to open Wire-V1 sessions to the hub.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeKey {
    pub id: String,
    pub public: Bytes32,
    /// Unix seconds after which the key must not be used.
    pub expires: u64,
}

/// Volatile hub status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: HubId,
    pub timestamp: u64,
    pub keys: Vec<ExchangeKey>,
}

#[derive(Serialize, Deserialize)]
struct Signed {
    payload: Vec<u8>,
    signature: Vec<u8>,
}

/// Serialize and sign a hub message.
pub fn sign_blob<T: Serialize>(value: &T, key: &SigningKey) -> Result<Vec<u8>> {
    let payload = canonical_bytes(value)?;
    let signature = key.sign(&payload).to_bytes().to_vec();
    canonical_bytes(&Signed { payload, signature })
}

fn open_blob<T: serde::de::DeserializeOwned>(blob: &[u8]) -> Result<(T, Signed)> {
    let signed: Signed = from_canonical_bytes(blob)?;
    let value = from_canonical_bytes(&signed.payload)?;
    Ok((value, signed))
}

/// Verify an Ed25519 signature made by `signing_key`.
pub fn verify_signature(signing_key: &Bytes32, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(signing_key)
        .map_err(|_| ErrorKind::Integrity.with("invalid signing key"))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| ErrorKind::Integrity.with("invalid signature encoding"))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| ErrorKind::Integrity.with("signature verification failed"))
}

impl Announcement {
    /// Parse an announcement blob and check its self-signature.
    pub fn verify_blob(blob: &[u8]) -> Result<Self> {
        let (announcement, signed): (Announcement, Signed) = open_blob(blob)?;
        if HubId::from_signing_key(&announcement.signing_key) != announcement.id {
            return Err(ErrorKind::Integrity.with("hub id does not match signing key"));
        }
        verify_signature(&announcement.signing_key, &signed.payload, &signed.signature)?;
        Ok(announcement)
    }
}

impl Status {
    /// Parse a status blob and check it was signed by the announced hub.
    pub fn verify_blob(blob: &[u8], announcement: &Announcement) -> Result<Self> {
        let (status, signed): (Status, Signed) = open_blob(blob)?;
        if status.id != announcement.id {
            return Err(ErrorKind::Integrity.with("status belongs to another hub"));
        }
        verify_signature(&announcement.signing_key, &signed.payload, &signed.signature)?;
        Ok(status)
    }
}

/// Public view of a hub, as assembled from its signed messages.
#[derive(Clone, Debug)]
pub struct Hub {
    pub id: HubId,
    pub announcement: Announcement,
    pub status: Option<Status>,
    pub announcement_blob: Bytes,
    pub status_blob: Option<Bytes>,
}

impl Hub {
    /// Build a hub from verified blobs.
    pub fn from_blobs(announcement_blob: &[u8], status_blob: Option<&[u8]>) -> Result<Self> {
        let announcement = Announcement::verify_blob(announcement_blob)?;
        let status = match status_blob {
            Some(blob) => Some(Status::verify_blob(blob, &announcement)?),
            None => None,
        };
        Ok(Self {
            id: announcement.id,
            announcement,
            status,
            announcement_blob: Bytes::copy_from_slice(announcement_blob),
            status_blob: status_blob.map(Bytes::copy_from_slice),
        })
    }

    /// Pick the exchange key to address new sessions to: the unexpired key
    /// with the latest expiry.
    pub fn select_exchange_key(&self) -> Option<&ExchangeKey> {
        let now = now_unix();
        self.status
            .as_ref()?
            .keys
            .iter()
            .filter(|k| k.expires > now)
            .max_by_key(|k| k.expires)
    }

    /// Verify a signature made by this hub.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        verify_signature(&self.announcement.signing_key, message, signature)
    }
}

/// Collaborator that receives hub messages from the network.
pub trait HubInfoImporter: Send + Sync {
    /// Import an announcement and/or status. Returns the updated hub and
    /// whether the messages should be forwarded to other peers.
    fn import_hub_info(
        &self,
        announcement: Option<&[u8]>,
        status: Option<&[u8]>,
    ) -> Result<(Arc<Hub>, bool)>;

    /// Look up a known hub.
    fn get_hub(&self, id: &HubId) -> Option<Arc<Hub>>;

    /// All known hub messages, for catching up a new peer.
    fn export_hub_info(&self) -> Vec<(Bytes, Option<Bytes>)>;
}

/// In-memory hub store that verifies and keeps the newest messages.
#[derive(Default)]
pub struct HubCache {
    hubs: RwLock<HashMap<HubId, Arc<Hub>>>,
}

impl HubCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a hub directly, e.g. our own.
    pub fn insert(&self, hub: Arc<Hub>) {
        self.hubs.write().insert(hub.id, hub);
    }

    pub fn len(&self) -> usize {
        self.hubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.read().is_empty()
    }
}

impl HubInfoImporter for HubCache {
    fn import_hub_info(
        &self,
        announcement: Option<&[u8]>,
        status: Option<&[u8]>,
    ) -> Result<(Arc<Hub>, bool)> {
        let new_announcement = announcement.map(Announcement::verify_blob).transpose()?;

        let mut hubs = self.hubs.write();
        let existing = match &new_announcement {
            Some(a) => hubs.get(&a.id).cloned(),
            None => None,
        };

        let mut changed = false;
        let mut hub = match (existing, new_announcement, announcement) {
            (Some(existing), Some(a), Some(blob)) if a.timestamp > existing.announcement.timestamp => {
                changed = true;
                let mut hub = (*existing).clone();
                hub.announcement = a;
                hub.announcement_blob = Bytes::copy_from_slice(blob);
                hub
            }
            (Some(existing), _, _) => (*existing).clone(),
            (None, Some(a), Some(blob)) => {
                changed = true;
                Hub {
                    id: a.id,
                    announcement: a,
                    status: None,
                    announcement_blob: Bytes::copy_from_slice(blob),
                    status_blob: None,
                }
            }
            _ => {
                // Status only: the hub must already be known.
                let blob = status.ok_or_else(|| ErrorKind::IncorrectUsage.with("nothing to import"))?;
                let signed: Signed = from_canonical_bytes(blob)?;
                let status: Status = from_canonical_bytes(&signed.payload)?;
                let known = hubs
                    .get(&status.id)
                    .cloned()
                    .ok_or_else(|| ErrorKind::HubUnavailable.with(format!("status for unknown hub {}", status.id)))?;
                (*known).clone()
            }
        };

        if let Some(blob) = status {
            let new_status = Status::verify_blob(blob, &hub.announcement)?;
            let newer = hub
                .status
                .as_ref()
                .map(|s| new_status.timestamp > s.timestamp)
                .unwrap_or(true);
            if newer {
                changed = true;
                hub.status = Some(new_status);
                hub.status_blob = Some(Bytes::copy_from_slice(blob));
            }
        }

        let hub = Arc::new(hub);
        if changed {
            debug!("Imported hub info for {} ({})", hub.id, hub.announcement.name);
            hubs.insert(hub.id, hub.clone());
        }
        Ok((hub, changed))
    }

    fn get_hub(&self, id: &HubId) -> Option<Arc<Hub>> {
        self.hubs.read().get(id).cloned()
    }

    fn export_hub_info(&self) -> Vec<(Bytes, Option<Bytes>)> {
        self.hubs
            .read()
            .values()
            .map(|h| (h.announcement_blob.clone(), h.status_blob.clone()))
            .collect()
    }
}

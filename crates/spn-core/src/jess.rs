//! Wire-V1 authenticated encryption sessions
//!
//! A session is opened by sending an initial letter addressed to one of the
//! recipient hub's published exchange keys:
//!
//! ```text
//! initial := 0x01 || block(key_id) || ephemeral_pub[32] || seq_le[8] || ciphertext || tag[16]
//! letter  := 0x01 || seq_le[8] || ciphertext || tag[16]
//! ```
//!
//! Keys are derived with HKDF-SHA256 from the X25519 shared secret, salted
//! with both public keys. Each direction has its own key and its own
//! sequence counter; sequence numbers must arrive strictly in order.

use crate::error::{ErrorKind, Result};
use crate::hub::ExchangeKey;
use crate::identity::Identity;
use crate::varint;
use bytes::{Buf, Bytes};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

/// Wire-V1 version byte.
pub const WIRE_V1: u8 = 1;

/// Bytes a session letter adds to its plaintext: version, sequence and tag.
pub const WIRE_V1_OVERHEAD: usize = 1 + 8 + 16;

const INFO_INITIATOR_TO_RESPONDER: &[u8] = b"spn wire-v1 initiator to responder";
const INFO_RESPONDER_TO_INITIATOR: &[u8] = b"spn wire-v1 responder to initiator";

fn derive_cipher(hkdf: &Hkdf<Sha256>, info: &[u8]) -> Result<ChaCha20Poly1305> {
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|_| ErrorKind::InternalError.with("key derivation failed"))?;
    ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| ErrorKind::InternalError.with("invalid key length"))
}

fn nonce_for(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

fn aad_for(seq: u64) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[0] = WIRE_V1;
    aad[1..].copy_from_slice(&seq.to_le_bytes());
    aad
}

/// Outgoing half of a session.
pub struct Sealer {
    cipher: ChaCha20Poly1305,
    next_seq: u64,
}

impl Sealer {
    fn seal_raw(&mut self, plaintext: &[u8]) -> Result<(u64, Vec<u8>)> {
        let seq = self.next_seq;
        self.next_seq = seq
            .checked_add(1)
            .ok_or_else(|| ErrorKind::Integrity.with("sequence exhausted"))?;
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_for(seq)),
                Payload {
                    msg: plaintext,
                    aad: &aad_for(seq),
                },
            )
            .map_err(|_| ErrorKind::InternalError.with("encryption failed"))?;
        Ok((seq, ciphertext))
    }

    /// Encrypt `plaintext` into a session letter.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (seq, ciphertext) = self.seal_raw(plaintext)?;
        let mut letter = Vec::with_capacity(WIRE_V1_OVERHEAD + plaintext.len());
        letter.push(WIRE_V1);
        letter.extend_from_slice(&seq.to_le_bytes());
        letter.extend_from_slice(&ciphertext);
        Ok(letter)
    }
}

/// Incoming half of a session.
pub struct Opener {
    cipher: ChaCha20Poly1305,
    next_seq: u64,
}

impl Opener {
    /// Decrypt a session letter.
    pub fn open(&mut self, letter: &[u8]) -> Result<Vec<u8>> {
        match letter.first() {
            Some(&WIRE_V1) => {}
            Some(v) => return Err(ErrorKind::UnsupportedVersion.with(format!("wire version {v}"))),
            None => return Err(ErrorKind::Integrity.with("empty letter")),
        }
        self.open_body(&letter[1..])
    }

    /// Decrypt `seq_le || ciphertext || tag`.
    fn open_body(&mut self, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < WIRE_V1_OVERHEAD - 1 {
            return Err(ErrorKind::Integrity.with("letter too short"));
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&body[..8]);
        let seq = u64::from_le_bytes(seq_bytes);
        if seq != self.next_seq {
            return Err(ErrorKind::Integrity.with(format!(
                "expected sequence {}, got {seq}",
                self.next_seq
            )));
        }
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_for(seq)),
                Payload {
                    msg: &body[8..],
                    aad: &aad_for(seq),
                },
            )
            .map_err(|_| ErrorKind::Integrity.with("letter authentication failed"))?;
        self.next_seq += 1;
        Ok(plaintext)
    }
}

/// An established Wire-V1 session.
pub struct Session {
    sealer: Sealer,
    opener: Opener,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    fn from_shared(
        shared: SharedSecret,
        ephemeral: &PublicKey,
        recipient: &PublicKey,
        initiator: bool,
    ) -> Result<Self> {
        if !shared.was_contributory() {
            return Err(ErrorKind::Integrity.with("non-contributory key exchange"));
        }
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(ephemeral.as_bytes());
        salt[32..].copy_from_slice(recipient.as_bytes());
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());

        let outgoing = derive_cipher(&hkdf, INFO_INITIATOR_TO_RESPONDER)?;
        let incoming = derive_cipher(&hkdf, INFO_RESPONDER_TO_INITIATOR)?;
        let (seal_cipher, open_cipher) = if initiator {
            (outgoing, incoming)
        } else {
            (incoming, outgoing)
        };
        Ok(Self {
            sealer: Sealer {
                cipher: seal_cipher,
                next_seq: 0,
            },
            opener: Opener {
                cipher: open_cipher,
                next_seq: 0,
            },
        })
    }

    /// Open a session to `recipient` and encrypt `plaintext` as its initial
    /// letter.
    pub fn initiate(recipient: &ExchangeKey, plaintext: &[u8]) -> Result<(Self, Vec<u8>)> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let recipient_public = PublicKey::from(recipient.public);
        let shared = ephemeral.diffie_hellman(&recipient_public);
        let mut session = Self::from_shared(shared, &ephemeral_public, &recipient_public, true)?;

        let (seq, ciphertext) = session.sealer.seal_raw(plaintext)?;
        let mut letter = Vec::with_capacity(
            WIRE_V1_OVERHEAD + 32 + recipient.id.len() + 2 + plaintext.len(),
        );
        letter.push(WIRE_V1);
        varint::put_block(&mut letter, recipient.id.as_bytes());
        letter.extend_from_slice(ephemeral_public.as_bytes());
        letter.extend_from_slice(&seq.to_le_bytes());
        letter.extend_from_slice(&ciphertext);
        Ok((session, letter))
    }

    /// Accept an initial letter addressed to one of our exchange keys.
    pub fn accept(letter: &[u8], identity: &Identity) -> Result<(Self, Vec<u8>)> {
        let mut buf = Bytes::copy_from_slice(letter);
        if buf.is_empty() {
            return Err(ErrorKind::Integrity.with("empty letter"));
        }
        let version = buf.get_u8();
        if version != WIRE_V1 {
            return Err(ErrorKind::UnsupportedVersion.with(format!("wire version {version}")));
        }
        let key_id = varint::get_block(&mut buf)?;
        let key_id = std::str::from_utf8(&key_id)
            .map_err(|_| ErrorKind::MalformedData.with("exchange key id is not utf-8"))?;
        if buf.len() < 32 {
            return Err(ErrorKind::Integrity.with("letter too short"));
        }
        let mut ephemeral = [0u8; 32];
        buf.copy_to_slice(&mut ephemeral);
        let ephemeral_public = PublicKey::from(ephemeral);

        let secret = identity.exchange_secret(key_id)?;
        let recipient_public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&ephemeral_public);
        let mut session = Self::from_shared(shared, &ephemeral_public, &recipient_public, false)?;

        let plaintext = session.opener.open_body(&buf)?;
        Ok((session, plaintext))
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.sealer.seal(plaintext)
    }

    pub fn open(&mut self, letter: &[u8]) -> Result<Vec<u8>> {
        self.opener.open(letter)
    }

    /// Split into independently owned halves.
    pub fn split(self) -> (Sealer, Opener) {
        (self.sealer, self.opener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established() -> (Session, Session) {
        let identity = Identity::generate("responder").unwrap();
        let hub = identity.hub();
        let key = hub.select_exchange_key().unwrap();

        let (initiator, letter) = Session::initiate(key, b"hello").unwrap();
        let (responder, plaintext) = Session::accept(&letter, &identity).unwrap();
        assert_eq!(plaintext, b"hello");
        (initiator, responder)
    }

    #[test]
    fn test_handshake_and_both_directions() {
        let (mut initiator, mut responder) = established();

        let letter = initiator.seal(b"to responder").unwrap();
        assert_eq!(letter.len(), b"to responder".len() + WIRE_V1_OVERHEAD);
        assert_eq!(responder.open(&letter).unwrap(), b"to responder");

        let letter = responder.seal(b"to initiator").unwrap();
        assert_eq!(initiator.open(&letter).unwrap(), b"to initiator");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut initiator, mut responder) = established();

        let letter = initiator.seal(b"once").unwrap();
        responder.open(&letter).unwrap();
        let err = responder.open(&letter).unwrap_err();
        assert!(err.is(ErrorKind::Integrity));
    }

    #[test]
    fn test_reorder_rejected() {
        let (mut initiator, mut responder) = established();

        let first = initiator.seal(b"first").unwrap();
        let second = initiator.seal(b"second").unwrap();
        assert!(responder.open(&second).is_err());
        assert_eq!(responder.open(&first).unwrap(), b"first");
    }

    #[test]
    fn test_tampering_detected() {
        let (mut initiator, mut responder) = established();

        let mut letter = initiator.seal(b"payload").unwrap();
        let last = letter.len() - 1;
        letter[last] ^= 0x80;
        assert!(responder.open(&letter).unwrap_err().is(ErrorKind::Integrity));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let responder = Identity::generate("responder").unwrap();
        let other = Identity::generate("other").unwrap();
        let hub = other.hub();
        let key = hub.select_exchange_key().unwrap();

        let (_, letter) = Session::initiate(key, b"hello").unwrap();
        assert!(Session::accept(&letter, &responder)
            .unwrap_err()
            .is(ErrorKind::Integrity));
    }

    #[test]
    fn test_split_halves() {
        let (initiator, responder) = established();
        let (mut sealer, _) = initiator.split();
        let (_, mut opener) = responder.split();

        for i in 0..5u8 {
            let letter = sealer.seal(&[i; 10]).unwrap();
            assert_eq!(opener.open(&letter).unwrap(), vec![i; 10]);
        }
    }
}

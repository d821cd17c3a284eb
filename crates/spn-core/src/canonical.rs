//! Canonical encoding for SPN blobs
//!
//! Structured blobs (terminal options, hub announcements and status,
//! operation parameters) use postcard serialization. Field order is Rust
//! struct field order, so changing a struct changes its wire format.

use crate::error::{Error, ErrorKind, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Deserialize a value from canonical bytes.
///
/// Trailing bytes are rejected so that a blob has exactly one valid
/// encoding.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(ErrorKind::MalformedData.with(format!(
            "{} trailing bytes after canonical value",
            rest.len()
        )));
    }
    Ok(value)
}

/// Like [`from_canonical_bytes`], but returns the unparsed remainder.
pub fn take_canonical<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, &[u8])> {
    postcard::take_from_bytes(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Opts {
        queue_size: u16,
        padding: u16,
        encrypt: bool,
    }

    #[test]
    fn test_canonical_bytes_deterministic() {
        let opts = Opts {
            queue_size: 100,
            padding: 8,
            encrypt: true,
        };

        let bytes1 = canonical_bytes(&opts).unwrap();
        let bytes2 = canonical_bytes(&opts).unwrap();
        assert_eq!(bytes1, bytes2);
        assert_eq!(from_canonical_bytes::<Opts>(&bytes1).unwrap(), opts);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = canonical_bytes(&Opts {
            queue_size: 1,
            padding: 0,
            encrypt: false,
        })
        .unwrap();
        bytes.push(7);

        assert!(from_canonical_bytes::<Opts>(&bytes).is_err());
        let (_, rest) = take_canonical::<Opts>(&bytes).unwrap();
        assert_eq!(rest, &[7]);
    }
}

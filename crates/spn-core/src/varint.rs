//! Unsigned LEB128 varints and length-delimited blocks
//!
//! Every length, identifier and message type on the SPN wire is a varint.
//! A block is `varint(len) || bytes`.

use crate::error::{ErrorKind, Result};
use bytes::{Buf, BufMut, Bytes};

/// Maximum encoded length of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Number of bytes `value` occupies when encoded.
pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` to a buffer.
pub fn put(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Append `value` to a vector.
pub fn put_vec(buf: &mut Vec<u8>, value: u64) {
    put(buf, value)
}

/// Encode `value` into a fresh vector.
pub fn encode(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_len(value));
    put(&mut buf, value);
    buf
}

/// Decode a varint at the start of `src`.
///
/// Returns `Ok(None)` if `src` ends before the varint does, and the value
/// with its encoded length otherwise.
pub fn decode(src: &[u8]) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && *byte > 1) {
            return Err(ErrorKind::MalformedData.with("varint overflows u64"));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Consume a varint from the front of `buf`.
pub fn get(buf: &mut Bytes) -> Result<u64> {
    match decode(buf)? {
        Some((value, n)) => {
            buf.advance(n);
            Ok(value)
        }
        None => Err(ErrorKind::MalformedData.with("truncated varint")),
    }
}

/// Consume a varint that must fit into a u32.
pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    let value = get(buf)?;
    u32::try_from(value).map_err(|_| ErrorKind::MalformedData.with("varint exceeds u32"))
}

/// Append a length-delimited block.
pub fn put_block(buf: &mut impl BufMut, data: &[u8]) {
    put(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Consume a length-delimited block.
pub fn get_block(buf: &mut Bytes) -> Result<Bytes> {
    let len = get(buf)? as usize;
    if buf.len() < len {
        return Err(ErrorKind::MalformedData.with(format!(
            "block of {len} bytes exceeds remaining {} bytes",
            buf.len()
        )));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(16384), vec![0x80, 0x80, 0x01]);
        assert_eq!(encoded_len(16383), 2);
        assert_eq!(encoded_len(u64::MAX), MAX_VARINT_LEN);
    }

    #[test]
    fn test_truncated() {
        assert!(decode(&[0x80]).unwrap().is_none());
        let mut buf = Bytes::from_static(&[0x80, 0x80]);
        assert!(get(&mut buf).is_err());
    }

    #[test]
    fn test_overflow() {
        let data = [0xff; 11];
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_blocks() {
        let mut buf = BytesMut::new();
        put_block(&mut buf, b"hub");
        put_block(&mut buf, b"");
        put(&mut buf, 300);

        let mut buf = buf.freeze();
        assert_eq!(&get_block(&mut buf).unwrap()[..], b"hub");
        assert!(get_block(&mut buf).unwrap().is_empty());
        assert_eq!(get_u32(&mut buf).unwrap(), 300);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_block_too_long() {
        let mut buf = Bytes::from_static(&[5, 1, 2]);
        assert!(get_block(&mut buf).is_err());
    }

    proptest! {
        #[test]
        fn prop_varint_decodes_what_was_encoded(value in any::<u64>()) {
            let encoded = encode(value);
            prop_assert_eq!(encoded.len(), encoded_len(value));
            prop_assert_eq!(decode(&encoded).unwrap(), Some((value, encoded.len())));
        }
    }
}

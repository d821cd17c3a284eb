//! Shipment framing
//!
//! Wire format of one shipment:
//! - varint: body length (at most [`MAX_UNLOAD_SIZE`])
//! - N bytes: body, either plaintext segments or one Wire-V1 letter
//!
//! A plaintext body is a sequence of `varint(len) || segment`. A segment
//! length of 0 marks the rest of the body as padding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use spn_core::jess::WIRE_V1_OVERHEAD;
use spn_core::varint::{self, MAX_VARINT_LEN};
use spn_core::{Error, ErrorKind, Result};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum shipment body accepted from the wire.
pub const MAX_UNLOAD_SIZE: usize = 16384;

/// Maximum length of a single segment.
pub const MAX_SEGMENT_LENGTH: usize = 16384;

/// Shipments are grown to at least this size when the ship's load size is
/// smaller.
pub const OPTIMAL_MIN_LOAD_SIZE: usize = 3072;

/// Tag of the first shipments on a crane, before the controller exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeTag {
    End = 0,
    Info = 1,
    Verify = 2,
    RequestHubInfo = 3,
    StartEncrypted = 4,
    StartUnencrypted = 5,
}

impl HandshakeTag {
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(Self::End),
            1 => Ok(Self::Info),
            2 => Ok(Self::Verify),
            3 => Ok(Self::RequestHubInfo),
            4 => Ok(Self::StartEncrypted),
            5 => Ok(Self::StartUnencrypted),
            _ => Err(ErrorKind::UnexpectedMsgType.with(format!("handshake tag {code}"))),
        }
    }

    /// Build a tagged shipment body.
    pub fn with_body(self, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + body.len());
        varint::put(&mut buf, self as u64);
        buf.put_slice(body);
        buf.freeze()
    }
}

/// Codec for length-prefixed shipments
pub struct ShipmentCodec {
    max_size: usize,
}

impl ShipmentCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_UNLOAD_SIZE,
        }
    }
}

impl Default for ShipmentCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ShipmentCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some((length, prefix)) = varint::decode(src)? else {
            return Ok(None);
        };
        let length = length as usize;
        if length > self.max_size {
            return Err(ErrorKind::MalformedData.with(format!(
                "shipment of {length} bytes exceeds maximum of {}",
                self.max_size
            )));
        }
        if src.len() < prefix + length {
            src.reserve(prefix + length - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for ShipmentCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        if item.len() > self.max_size {
            return Err(ErrorKind::InternalError.with(format!(
                "shipment of {} bytes exceeds maximum of {}",
                item.len(),
                self.max_size
            )));
        }
        dst.reserve(MAX_VARINT_LEN + item.len());
        varint::put(dst, item.len() as u64);
        dst.put_slice(&item);
        Ok(())
    }
}

/// Plaintext shipment size for a ship with the given load size.
///
/// The load size is multiplied until it reaches [`OPTIMAL_MIN_LOAD_SIZE`],
/// then the Wire-V1 overhead and the length prefix are taken off, so that a
/// full shipment still matches whole multiples of the load size.
pub fn target_load_size(load_size: usize) -> usize {
    let unit = if load_size == 0 {
        OPTIMAL_MIN_LOAD_SIZE
    } else {
        load_size
    };
    let mut target = unit * OPTIMAL_MIN_LOAD_SIZE.div_ceil(unit);
    target = target.min(MAX_UNLOAD_SIZE) - WIRE_V1_OVERHEAD;
    target - varint::encoded_len(target as u64)
}

/// Plaintext length after padding a shipment of `len` bytes.
///
/// Padding makes the full wire size (prefix included) a multiple of
/// `quantum`, but never grows the plaintext beyond `target`. Padding needs
/// at least one byte for its marker.
pub fn padded_len(len: usize, quantum: usize, encrypted: bool, target: usize) -> usize {
    if quantum == 0 {
        return len;
    }
    let overhead = if encrypted { WIRE_V1_OVERHEAD } else { 0 };
    let wire_len = |plain: usize| {
        let body = plain + overhead;
        varint::encoded_len(body as u64) + body
    };
    if wire_len(len) % quantum == 0 {
        return len;
    }
    (len + 1..=target)
        .take(quantum + MAX_VARINT_LEN)
        .find(|&padded| wire_len(padded) % quantum == 0)
        .unwrap_or(len)
}

/// Split a plaintext body into segments.
///
/// `partial` holds the bytes of a segment that started in a previous body;
/// it is prepended to `body` and refilled with any unfinished tail.
pub fn split_segments(body: Bytes, partial: &mut BytesMut) -> Result<Vec<Bytes>> {
    let mut data = if partial.is_empty() {
        body
    } else {
        partial.extend_from_slice(&body);
        partial.split().freeze()
    };

    let mut segments = Vec::new();
    while !data.is_empty() {
        let Some((length, prefix)) = varint::decode(&data)? else {
            partial.extend_from_slice(&data);
            break;
        };
        if length == 0 {
            // Padding.
            break;
        }
        let length = length as usize;
        if length > MAX_SEGMENT_LENGTH {
            return Err(ErrorKind::MalformedData.with(format!(
                "segment of {length} bytes exceeds maximum of {MAX_SEGMENT_LENGTH}"
            )));
        }
        if data.len() < prefix + length {
            partial.extend_from_slice(&data);
            break;
        }
        data.advance(prefix);
        segments.push(data.split_to(length));
    }
    Ok(segments)
}

//! Messages passed between terminals and their upstream

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use spn_core::{varint, ErrorKind, Result};

/// Message type tag, used both at terminal and at operation level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Opens a terminal or an operation
    Init = 1,
    /// Regular payload
    Data = 2,
    /// Ends a terminal or an operation; carries a packed error
    Stop = 3,
    /// Payload that is loaded ahead of regular data
    PriorityData = 4,
}

impl MsgType {
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            1 => Ok(Self::Init),
            2 => Ok(Self::Data),
            3 => Ok(Self::Stop),
            4 => Ok(Self::PriorityData),
            _ => Err(ErrorKind::UnexpectedMsgType.with(format!("message type {code}"))),
        }
    }

    /// Whether the crane loads this type from its important queue.
    pub fn is_important(self) -> bool {
        !matches!(self, Self::Data)
    }
}

/// A message addressed to a flow: a terminal on a crane, or an operation
/// on a terminal.
#[derive(Clone, Debug)]
pub struct Msg {
    pub flow_id: u32,
    pub msg_type: MsgType,
    pub data: Bytes,
}

impl Msg {
    pub fn new(flow_id: u32, msg_type: MsgType, data: impl Into<Bytes>) -> Self {
        Self {
            flow_id,
            msg_type,
            data: data.into(),
        }
    }

    /// Encode as `varint(flow_id) || varint(msg_type) || data`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 6);
        varint::put(&mut buf, self.flow_id as u64);
        varint::put(&mut buf, self.msg_type as u64);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse a frame produced by [`Msg::encode`].
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        let flow_id = varint::get_u32(&mut frame)?;
        let msg_type = MsgType::from_code(varint::get(&mut frame)?)?;
        Ok(Self {
            flow_id,
            msg_type,
            data: frame,
        })
    }
}

/// Where a terminal hands its outgoing messages: a crane, or an operation
/// of another terminal when the terminal is expanded.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, msg: Msg) -> Result<()>;
}

//! Ships: the raw byte-stream connections cranes run on
//!
//! A ship only moves bytes. Framing, padding and encryption are done by the
//! crane on top of it.

mod tcp;
mod testing;

pub use tcp::TcpShip;
pub use testing::{TestShip, TestShipOptions};

use async_trait::async_trait;
use spn_core::Result;

/// Load size of ships that do not know better: the Ethernet MSS.
pub const DEFAULT_LOAD_SIZE: usize = 1460;

/// A single duplex byte-stream connection.
///
/// Any error returned by `load` or `unload` is fatal to the crane using the
/// ship. Reads and writes may happen concurrently.
#[async_trait]
pub trait Ship: Send + Sync {
    /// Write all of `data` to the peer.
    async fn load(&self, data: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes. Never returns 0 on success.
    async fn unload(&self, buf: &mut [u8]) -> Result<usize>;

    /// Natural write unit of the transport.
    fn load_size(&self) -> usize;

    /// Whether we initiated the connection.
    fn is_mine(&self) -> bool;

    /// Whether the transport already provides confidentiality and
    /// integrity, so the crane does not need to encrypt.
    fn is_secure(&self) -> bool;

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    /// Close both directions. Idempotent.
    async fn sink(&self);
}

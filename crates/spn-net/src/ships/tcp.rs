//! TCP ship

use super::{Ship, DEFAULT_LOAD_SIZE};
use async_trait::async_trait;
use spn_core::{ErrorKind, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Ship over a plain TCP connection. Not secure: cranes encrypt on it.
pub struct TcpShip {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    mine: bool,
    local: SocketAddr,
    remote: SocketAddr,
    sunk: CancellationToken,
}

impl TcpShip {
    /// Dial a hub.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, true)
    }

    /// Wrap an established stream; `mine` is false for accepted connections.
    pub fn from_stream(stream: TcpStream, mine: bool) -> Result<Self> {
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            mine,
            local,
            remote,
            sunk: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Ship for TcpShip {
    async fn load(&self, data: &[u8]) -> Result<()> {
        if self.sunk.is_cancelled() {
            return Err(ErrorKind::ShipSunk.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    async fn unload(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.sunk.cancelled() => Err(ErrorKind::ShipSunk.into()),
            n = reader.read(buf) => match n? {
                0 => Err(ErrorKind::ShipSunk.with("connection closed by peer")),
                n => Ok(n),
            },
        }
    }

    fn load_size(&self) -> usize {
        DEFAULT_LOAD_SIZE
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn local_addr(&self) -> String {
        self.local.to_string()
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    async fn sink(&self) {
        if self.sunk.is_cancelled() {
            return;
        }
        self.sunk.cancel();
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Failed to shut down tcp ship to {}: {}", self.remote, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_ship_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpShip::from_stream(stream, false).unwrap()
        });
        let client = TcpShip::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        assert!(client.is_mine());
        assert!(!server.is_mine());
        assert!(!client.is_secure());

        client.load(b"shipment").await.unwrap();
        let mut buf = [0u8; 64];
        let mut read = 0;
        while read < 8 {
            read += server.unload(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf[..8], b"shipment");

        client.sink().await;
        client.sink().await;
        assert!(server.unload(&mut buf).await.is_err());
        assert!(client.load(b"late").await.is_err());
    }
}

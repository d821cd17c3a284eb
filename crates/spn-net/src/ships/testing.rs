//! In-memory ship pair for tests and local wiring

use super::{Ship, DEFAULT_LOAD_SIZE};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use spn_core::{ErrorKind, Result};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Options for [`TestShip::pair`].
#[derive(Clone, Debug)]
pub struct TestShipOptions {
    /// Simulated one-way delay
    pub delay: Duration,
    /// Whether the ships report themselves as secure
    pub secure: bool,
    pub load_size: usize,
}

impl Default for TestShipOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            secure: true,
            load_size: DEFAULT_LOAD_SIZE,
        }
    }
}

struct Inbound {
    rx: mpsc::UnboundedReceiver<(Instant, Bytes)>,
    pending: Bytes,
}

/// One end of a connected in-memory ship pair.
///
/// Loads are delivered to the peer after the configured delay. Deliveries
/// are pipelined and keep their order.
pub struct TestShip {
    mine: bool,
    options: TestShipOptions,
    tx: mpsc::UnboundedSender<(Instant, Bytes)>,
    inbound: Mutex<Inbound>,
    sunk: CancellationToken,
}

impl TestShip {
    /// Create a connected pair: the first ship is the initiator.
    pub fn pair(options: TestShipOptions) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let sunk = CancellationToken::new();

        let make = |mine, tx, rx| Self {
            mine,
            options: options.clone(),
            tx,
            inbound: Mutex::new(Inbound {
                rx,
                pending: Bytes::new(),
            }),
            sunk: sunk.clone(),
        };
        (make(true, a_tx, b_rx), make(false, b_tx, a_rx))
    }
}

#[async_trait]
impl Ship for TestShip {
    async fn load(&self, data: &[u8]) -> Result<()> {
        if self.sunk.is_cancelled() {
            return Err(ErrorKind::ShipSunk.into());
        }
        let deliver_at = Instant::now() + self.options.delay;
        self.tx
            .send((deliver_at, Bytes::copy_from_slice(data)))
            .map_err(|_| ErrorKind::ShipSunk.with("peer ship dropped"))
    }

    async fn unload(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        if inbound.pending.is_empty() {
            let (deliver_at, data) = tokio::select! {
                _ = self.sunk.cancelled() => return Err(ErrorKind::ShipSunk.into()),
                item = inbound.rx.recv() => item.ok_or_else(|| ErrorKind::ShipSunk.with("peer ship dropped"))?,
            };
            tokio::select! {
                _ = self.sunk.cancelled() => return Err(ErrorKind::ShipSunk.into()),
                _ = sleep_until(deliver_at) => {}
            }
            inbound.pending = data;
        }

        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.advance(n);
        Ok(n)
    }

    fn load_size(&self) -> usize {
        self.options.load_size
    }

    fn is_mine(&self) -> bool {
        self.mine
    }

    fn is_secure(&self) -> bool {
        self.options.secure
    }

    fn local_addr(&self) -> String {
        if self.mine { "test:client" } else { "test:server" }.to_string()
    }

    fn remote_addr(&self) -> String {
        if self.mine { "test:server" } else { "test:client" }.to_string()
    }

    async fn sink(&self) {
        self.sunk.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_transfers_in_order() {
        let (a, b) = TestShip::pair(TestShipOptions::default());
        a.load(b"one").await.unwrap();
        a.load(b"two").await.unwrap();

        let mut buf = [0u8; 2];
        assert_eq!(b.unload(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"on");
        assert_eq!(b.unload(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"e");
        assert_eq!(b.unload(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf, b"tw");
    }

    #[tokio::test]
    async fn test_delay_is_pipelined() {
        let (a, b) = TestShip::pair(TestShipOptions {
            delay: Duration::from_millis(30),
            ..Default::default()
        });
        let start = Instant::now();
        for _ in 0..5 {
            a.load(b"x").await.unwrap();
        }
        let mut buf = [0u8; 1];
        for _ in 0..5 {
            b.unload(&mut buf).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_sink_stops_both_ends() {
        let (a, b) = TestShip::pair(TestShipOptions::default());
        a.sink().await;
        let mut buf = [0u8; 4];
        assert!(b.unload(&mut buf).await.is_err());
        assert!(b.load(b"x").await.is_err());
    }
}

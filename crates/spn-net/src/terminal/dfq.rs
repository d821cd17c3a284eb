//! Duplex flow queue
//!
//! Credit-based flow control for one terminal. Every outgoing frame starts
//! with `varint(credits)`: the number of receive slots we freed since the
//! last report. The peer may only send while it holds credits, so our
//! receive queue can never overflow unless the peer misbehaves.
//!
//! With a padding quantum, each payload is sent as
//! `varint(len) || payload || zeros`, filled up to a multiple of the
//! quantum before it is sealed. The terminal strips it after opening.

use crate::msg::{Msg, MsgType, Upstream};
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use spn_core::jess::Sealer;
use spn_core::{varint, Error, ErrorKind, Result};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

enum SendItem {
    Frame { data: Bytes, high_prio: bool },
    Flush(oneshot::Sender<()>),
}

/// Per-terminal send and receive queues with credit accounting.
pub struct DuplexFlowQueue {
    flow_id: u32,
    ctx: CancellationToken,
    upstream: Arc<dyn Upstream>,
    /// Payload padding quantum; 0 sends payloads as they are.
    padding: usize,
    /// Seals frames after credit accounting, for encrypted terminals.
    sealer: Option<Mutex<Sealer>>,

    send_tx: mpsc::Sender<SendItem>,
    recv_tx: mpsc::Sender<Bytes>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    /// Frames the peer can still accept from us.
    send_space: AtomicI32,
    /// Credits the peer still holds for sending to us.
    reported_space: AtomicI32,
    force_space_report: Notify,
    wake_sender: Notify,
}

impl DuplexFlowQueue {
    /// Create the queue and start its sender. The sender stops when `ctx`
    /// is cancelled.
    pub fn new(
        ctx: CancellationToken,
        flow_id: u32,
        queue_size: u16,
        padding: u16,
        upstream: Arc<dyn Upstream>,
        sealer: Option<Sealer>,
    ) -> Arc<Self> {
        let queue_size = queue_size.max(1) as usize;
        let (send_tx, send_rx) = mpsc::channel(queue_size);
        let (recv_tx, recv_rx) = mpsc::channel(queue_size);

        let dfq = Arc::new(Self {
            flow_id,
            ctx,
            upstream,
            padding: padding as usize,
            sealer: sealer.map(Mutex::new),
            send_tx,
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            send_space: AtomicI32::new(queue_size as i32),
            reported_space: AtomicI32::new(queue_size as i32),
            force_space_report: Notify::new(),
            wake_sender: Notify::new(),
        });
        tokio::spawn(dfq.clone().sender(send_rx));
        dfq
    }

    fn capacity(&self) -> i32 {
        self.recv_tx.max_capacity() as i32
    }

    /// Frames waiting in the receive queue.
    pub fn recv_queue_len(&self) -> usize {
        self.recv_tx.max_capacity() - self.recv_tx.capacity()
    }

    pub fn send_space(&self) -> i32 {
        self.send_space.load(Ordering::SeqCst)
    }

    pub fn reported_space(&self) -> i32 {
        self.reported_space.load(Ordering::SeqCst)
    }

    /// Queue a frame for sending. Waits while the send queue is full.
    pub async fn send(&self, data: Bytes, high_prio: bool, timeout: Option<Duration>) -> Result<()> {
        self.submit(SendItem::Frame { data, high_prio }, timeout).await
    }

    /// Wait until everything queued before this call was handed upstream.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.submit(SendItem::Flush(tx), timeout).await?;
        let done = async {
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => Err(Error::new(ErrorKind::Abandoning)),
                r = rx => r.map_err(|_| Error::new(ErrorKind::Abandoning)),
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, done)
                .await
                .map_err(|_| ErrorKind::Timeout.with("flush"))?,
            None => done.await,
        }
    }

    async fn submit(&self, item: SendItem, timeout: Option<Duration>) -> Result<()> {
        let send = async {
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => Err(Error::new(ErrorKind::Abandoning)),
                r = self.send_tx.send(item) => r.map_err(|_| Error::new(ErrorKind::Abandoning)),
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, send)
                .await
                .map_err(|_| ErrorKind::Timeout.with("send queue full"))?,
            None => send.await,
        }
    }

    /// Take the next received frame. Returns `None` once the queue is
    /// cancelled.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.recv_rx.lock().await;
        let frame = tokio::select! {
            _ = self.ctx.cancelled() => None,
            frame = rx.recv() => frame,
        };
        drop(rx);
        if frame.is_some() && self.should_report() {
            self.force_space_report.notify_one();
        }
        frame
    }

    /// Hand over a frame received from the peer. Never blocks.
    pub fn deliver(&self, mut frame: Bytes) -> Result<()> {
        let credits = varint::get(&mut frame)?;
        let credits = i32::try_from(credits)
            .map_err(|_| ErrorKind::MalformedData.with("credit report out of range"))?;
        if credits > 0 {
            let before = self.send_space.fetch_add(credits, Ordering::SeqCst);
            if before <= 0 {
                self.wake_sender.notify_one();
            }
        }

        if frame.is_empty() {
            return Ok(());
        }

        match self.recv_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(ErrorKind::QueueOverflow.with(format!(
                    "peer exceeded receive window of {}",
                    self.capacity()
                )))
            }
            Err(TrySendError::Closed(_)) => return Err(ErrorKind::Abandoning.into()),
        }

        self.reported_space.fetch_sub(1, Ordering::SeqCst);
        if self.should_report() {
            self.force_space_report.notify_one();
        }
        Ok(())
    }

    /// Whether the peer's credits dropped below three quarters of the
    /// window.
    fn should_report(&self) -> bool {
        self.reported_space.load(Ordering::SeqCst) * 4 < self.capacity() * 3
    }

    /// Credits to hand to the peer now, already accounted as reported.
    fn reportable_recv_space(&self) -> i32 {
        let reported = self.reported_space.load(Ordering::SeqCst);
        let available = self.capacity() - self.recv_queue_len() as i32 - reported;
        // Single credits are held back unless the peer has none left.
        if available <= 0 || (available == 1 && reported > 0) {
            return 0;
        }
        self.reported_space.fetch_add(available, Ordering::SeqCst);
        available
    }

    async fn sender(self: Arc<Self>, mut send_rx: mpsc::Receiver<SendItem>) {
        loop {
            if self.send_space.load(Ordering::SeqCst) <= 0 {
                tokio::select! {
                    biased;
                    _ = self.ctx.cancelled() => return,
                    _ = self.wake_sender.notified() => continue,
                    _ = self.force_space_report.notified() => {
                        if let Err(e) = self.send_space_report().await {
                            self.sender_failed(e);
                            return;
                        }
                        continue;
                    }
                }
            }

            let result = tokio::select! {
                biased;
                _ = self.ctx.cancelled() => return,
                item = send_rx.recv() => match item {
                    Some(SendItem::Frame { data, high_prio }) => self.send_frame(data, high_prio).await,
                    Some(SendItem::Flush(done)) => {
                        let _ = done.send(());
                        Ok(())
                    }
                    None => return,
                },
                _ = self.force_space_report.notified() => self.send_space_report().await,
            };
            if let Err(e) = result {
                self.sender_failed(e);
                return;
            }
        }
    }

    fn sender_failed(&self, err: Error) {
        if !self.ctx.is_cancelled() {
            debug!("flow {}: sender stopped: {}", self.flow_id, err);
        }
    }

    async fn send_frame(&self, data: Bytes, high_prio: bool) -> Result<()> {
        let data = if self.padding > 0 {
            pad_payload(&data, self.padding)
        } else {
            data
        };
        let payload = match &self.sealer {
            Some(sealer) => Bytes::from(sealer.lock().seal(&data)?),
            None => data,
        };
        let credits = self.reportable_recv_space();
        let mut frame = BytesMut::with_capacity(payload.len() + 5);
        varint::put(&mut frame, credits as u64);
        frame.put_slice(&payload);

        // Sealed frames must keep their order, so they never skip ahead.
        let msg_type = if high_prio && self.sealer.is_none() {
            MsgType::PriorityData
        } else {
            MsgType::Data
        };
        self.upstream
            .send(Msg::new(self.flow_id, msg_type, frame.freeze()))
            .await?;
        self.send_space.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Send a frame that only carries credits. Does not use send space.
    async fn send_space_report(&self) -> Result<()> {
        let credits = self.reportable_recv_space();
        if credits == 0 {
            return Ok(());
        }
        let mut frame = BytesMut::with_capacity(5);
        varint::put(&mut frame, credits as u64);
        if let Err(e) = self
            .upstream
            .send(Msg::new(self.flow_id, MsgType::Data, frame.freeze()))
            .await
        {
            // The credits were never seen by the peer.
            self.reported_space.fetch_sub(credits, Ordering::SeqCst);
            warn!("flow {}: failed to report receive space: {}", self.flow_id, e);
            return Err(e);
        }
        Ok(())
    }
}

/// Wrap `data` as `varint(len) || data || zeros`, filled up to a multiple
/// of `quantum`.
pub fn pad_payload(data: &[u8], quantum: usize) -> Bytes {
    let len = varint::encoded_len(data.len() as u64) + data.len();
    let padded = len.div_ceil(quantum) * quantum;
    let mut buf = BytesMut::with_capacity(padded);
    varint::put(&mut buf, data.len() as u64);
    buf.put_slice(data);
    buf.resize(padded, 0);
    buf.freeze()
}

/// Strip the padding added by [`pad_payload`].
pub fn unpad_payload(mut frame: Bytes) -> Result<Bytes> {
    let len = varint::get(&mut frame)? as usize;
    if len > frame.len() {
        return Err(ErrorKind::MalformedData.with(format!(
            "padded payload claims {len} bytes, has {}",
            frame.len()
        )));
    }
    frame.truncate(len);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spn_core::jess::{Session, WIRE_V1_OVERHEAD};
    use spn_core::Identity;
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelUpstream(UnboundedSender<Msg>);

    #[async_trait]
    impl Upstream for ChannelUpstream {
        async fn send(&self, msg: Msg) -> Result<()> {
            self.0.send(msg).map_err(|_| ErrorKind::Stopping.into())
        }
    }

    fn dfq(queue_size: u16) -> (Arc<DuplexFlowQueue>, mpsc::UnboundedReceiver<Msg>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let dfq = DuplexFlowQueue::new(ctx.clone(), 8, queue_size, 0, Arc::new(ChannelUpstream(tx)), None);
        (dfq, rx, ctx)
    }

    fn frame(credits: u64, data: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        varint::put(&mut buf, credits);
        buf.put_slice(data);
        buf.freeze()
    }

    #[tokio::test]
    async fn test_send_consumes_space() {
        let (dfq, mut out, _ctx) = dfq(4);
        for i in 0..3u8 {
            dfq.send(Bytes::from(vec![i]), false, None).await.unwrap();
        }
        for i in 0..3u8 {
            let msg = out.recv().await.unwrap();
            assert_eq!(msg.flow_id, 8);
            assert_eq!(msg.msg_type, MsgType::Data);
            // No credits to report yet, then the payload.
            assert_eq!(&msg.data[..], &[0, i]);
        }
        dfq.flush(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(dfq.send_space(), 1);
    }

    #[tokio::test]
    async fn test_sender_blocks_without_space() {
        let (dfq, mut out, _ctx) = dfq(2);
        for i in 0..3u8 {
            dfq.send(Bytes::from(vec![i]), false, None).await.unwrap();
        }
        out.recv().await.unwrap();
        out.recv().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), out.recv())
            .await
            .is_err());
        assert_eq!(dfq.send_space(), 0);

        // A pure credit update from the peer unblocks the sender.
        dfq.deliver(frame(1, &[])).unwrap();
        let msg = out.recv().await.unwrap();
        assert_eq!(&msg.data[..], &[0, 2]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dfq.send_space(), 0);
    }

    #[tokio::test]
    async fn test_credits_follow_sent_and_refreshed() {
        let (dfq, mut out, _ctx) = dfq(10);
        for _ in 0..6 {
            dfq.send(Bytes::from_static(b"x"), false, None).await.unwrap();
        }
        dfq.deliver(frame(2, &[])).unwrap();
        dfq.deliver(frame(1, &[])).unwrap();
        dfq.flush(Some(Duration::from_secs(1))).await.unwrap();
        for _ in 0..6 {
            out.recv().await.unwrap();
        }
        assert_eq!(dfq.send_space(), 10 - 6 + 3);
    }

    #[tokio::test]
    async fn test_overflow_is_reported() {
        let (dfq, _out, _ctx) = dfq(2);
        dfq.deliver(frame(0, b"a")).unwrap();
        dfq.deliver(frame(0, b"b")).unwrap();
        let err = dfq.deliver(frame(0, b"c")).unwrap_err();
        assert!(err.is(ErrorKind::QueueOverflow));
        assert_eq!(dfq.reported_space(), 0);
        assert_eq!(dfq.recv_queue_len(), 2);
    }

    #[tokio::test]
    async fn test_receiving_reports_space() {
        let (dfq, mut out, _ctx) = dfq(4);
        for i in 0..4u8 {
            dfq.deliver(frame(0, &[i])).unwrap();
        }
        assert_eq!(dfq.reported_space(), 0);
        for i in 0..4u8 {
            assert_eq!(&dfq.recv().await.unwrap()[..], &[i]);
        }

        // The freed slots are reported without any payload to carry them.
        // A single trailing credit may be held back.
        let mut reported = 0;
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), out.recv()).await {
            let mut data = msg.data.clone();
            reported += varint::get(&mut data).unwrap();
            assert!(data.is_empty());
        }
        assert!(reported >= 3);
        assert_eq!(dfq.reported_space() as u64, reported);
        // Credit-only frames do not use send space.
        assert_eq!(dfq.send_space(), 4);
    }

    #[tokio::test]
    async fn test_piggybacked_credits() {
        let (dfq, mut out, _ctx) = dfq(10);
        for _ in 0..5 {
            dfq.deliver(frame(0, b"in")).unwrap();
        }
        for _ in 0..5 {
            dfq.recv().await.unwrap();
        }
        dfq.send(Bytes::from_static(b"out"), false, None).await.unwrap();

        let mut total = 0;
        loop {
            let msg = out.recv().await.unwrap();
            let mut data = msg.data.clone();
            total += varint::get(&mut data).unwrap();
            if !data.is_empty() {
                break;
            }
        }
        assert!((4..=5).contains(&total));
    }

    #[tokio::test]
    async fn test_cancel_stops_queue() {
        let (dfq, _out, ctx) = dfq(1);
        ctx.cancel();
        assert!(dfq.recv().await.is_none());
        assert!(dfq.send(Bytes::from_static(b"x"), false, None).await.is_err());
        assert!(dfq.flush(Some(Duration::from_millis(100))).await.is_err());
    }

    #[test]
    fn test_pad_payload() {
        let padded = pad_payload(b"hello", 16);
        assert_eq!(padded.len(), 16);
        assert_eq!(&unpad_payload(padded).unwrap()[..], b"hello");

        // Exactly filling the quantum needs no extra block.
        assert_eq!(pad_payload(&[7u8; 15], 16).len(), 16);
        assert_eq!(pad_payload(&[7u8; 16], 16).len(), 32);

        let mut lying = BytesMut::new();
        varint::put(&mut lying, 10);
        lying.put_slice(b"short");
        assert!(unpad_payload(lying.freeze())
            .unwrap_err()
            .is(ErrorKind::MalformedData));
    }

    #[tokio::test]
    async fn test_sealed_frames_hide_payload_size() {
        let identity = Identity::generate("padding").unwrap();
        let hub = identity.hub();
        let key = hub.select_exchange_key().unwrap();
        let (session, letter) = Session::initiate(key, &[]).unwrap();
        let (sealer, _) = session.split();
        let (peer, _) = Session::accept(&letter, &identity).unwrap();
        let (_, mut opener) = peer.split();

        let (tx, mut out) = mpsc::unbounded_channel();
        let dfq = DuplexFlowQueue::new(
            CancellationToken::new(),
            8,
            10,
            64,
            Arc::new(ChannelUpstream(tx)),
            Some(sealer),
        );
        for n in 1..=5usize {
            dfq.send(Bytes::from(vec![n as u8; n]), false, None).await.unwrap();
        }

        let mut lengths = Vec::new();
        for n in 1..=5usize {
            let msg = out.recv().await.unwrap();
            let mut frame = msg.data.clone();
            assert_eq!(varint::get(&mut frame).unwrap(), 0);
            lengths.push(frame.len());
            assert_eq!((frame.len() - WIRE_V1_OVERHEAD) % 64, 0);

            let payload = unpad_payload(Bytes::from(opener.open(&frame).unwrap())).unwrap();
            assert_eq!(&payload[..], &vec![n as u8; n][..]);
        }
        assert!(lengths.iter().all(|&l| l == lengths[0]), "{lengths:?}");
    }
}

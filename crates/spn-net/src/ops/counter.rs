//! `debug/count`: both sides count up and check the peer's sequence

use super::Outcome;
use crate::terminal::{Operation, OperationFactory, Permission, Terminal};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spn_core::canonical::{canonical_bytes, from_canonical_bytes};
use spn_core::{varint, Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const OP_TYPE: &str = "debug/count";

/// Counter targets and pacing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterOpts {
    pub client_count_to: u64,
    pub server_count_to: u64,
    /// Pause between two messages, in milliseconds
    pub wait_ms: u64,
}

pub(crate) fn factory() -> OperationFactory {
    OperationFactory {
        op_type: OP_TYPE,
        requires: Permission::empty(),
        start: start_remote,
    }
}

fn start_remote(terminal: &Arc<Terminal>, id: u32, data: Bytes) -> Result<Arc<dyn Operation>> {
    let opts: CounterOpts = from_canonical_bytes(&data)?;
    Ok(CounterOp::new(terminal, id, opts, false))
}

/// Start a counter on `terminal`.
pub async fn start_counter(terminal: &Arc<Terminal>, opts: CounterOpts) -> Result<Arc<CounterOp>> {
    let op = CounterOp::new(terminal, terminal.next_operation_id(), opts, true);
    terminal
        .start_operation(op.clone(), &canonical_bytes(&opts)?)
        .await?;
    Ok(op)
}

pub struct CounterOp {
    id: u32,
    terminal: Arc<Terminal>,
    opts: CounterOpts,
    client: bool,
    ctx: CancellationToken,
    sent: AtomicU64,
    received: AtomicU64,
    send_done: AtomicBool,
    failure: Mutex<Option<Error>>,
    outcome: Outcome<()>,
}

impl CounterOp {
    fn new(terminal: &Arc<Terminal>, id: u32, opts: CounterOpts, client: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            terminal: terminal.clone(),
            opts,
            client,
            ctx: terminal.ctx().child_token(),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            send_done: AtomicBool::new(false),
            failure: Mutex::new(None),
            outcome: Outcome::new(),
        })
    }

    fn send_target(&self) -> u64 {
        if self.client {
            self.opts.client_count_to
        } else {
            self.opts.server_count_to
        }
    }

    fn recv_target(&self) -> u64 {
        if self.client {
            self.opts.server_count_to
        } else {
            self.opts.client_count_to
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    fn is_complete(&self) -> bool {
        self.send_done.load(Ordering::SeqCst) && self.received() >= self.recv_target()
    }

    fn end_if_complete(&self) {
        if self.is_complete() {
            self.terminal.end_operation(self.id, None);
        }
    }

    async fn count(self: Arc<Self>) {
        let wait = Duration::from_millis(self.opts.wait_ms);
        for i in 1..=self.send_target() {
            let mut buf = BytesMut::with_capacity(varint::MAX_VARINT_LEN);
            varint::put(&mut buf, i);
            let sent = tokio::select! {
                _ = self.ctx.cancelled() => return,
                r = self.terminal.send_op_data(self.id, buf.freeze()) => r,
            };
            if let Err(e) = sent {
                self.terminal.end_operation(self.id, Some(e));
                return;
            }
            self.sent.store(i, Ordering::SeqCst);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        self.send_done.store(true, Ordering::SeqCst);
        self.end_if_complete();
    }

    /// Wait until the counter finished.
    pub async fn wait(&self) -> Result<()> {
        self.outcome.wait().await
    }
}

impl Operation for CounterOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, mut data: Bytes) -> Result<()> {
        let n = varint::get(&mut data)?;
        let expected = self.received() + 1;
        if n != expected {
            let err = ErrorKind::MalformedData.with(format!("counter expected {expected}, got {n}"));
            *self.failure.lock() = Some(err.clone());
            return Err(err);
        }
        self.received.store(n, Ordering::SeqCst);
        if n >= self.recv_target() {
            self.end_if_complete();
        }
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        self.ctx.cancel();
        let result = match err {
            // The peer only stops once it has all of our sequence.
            Some(e) if e.is(ErrorKind::Stopping) && self.received() >= self.recv_target() => Ok(()),
            Some(e) => Err(e),
            None if self.is_complete() => Ok(()),
            None => Err(self
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| ErrorKind::Stopping.with("counter ended early"))),
        };
        debug!(
            "{}: counter {} ended at sent={} received={}",
            self.terminal.fmt_id(),
            self.id,
            self.sent(),
            self.received()
        );
        self.outcome.set(result);
    }

    fn started(self: Arc<Self>) {
        tokio::spawn(self.count());
    }
}

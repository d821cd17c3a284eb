//! `capacity`: measure the throughput of a crane's lane
//!
//! The initiator asks for a test volume; the responder sends it in 1000
//! byte chunks, then `Done`. The initiator computes the bit rate from the
//! bytes received and the time since it started, and acks the volume.
//!
//! Data messages: `varint(tag) || body`, with tags `Data` (1), `Done` (2)
//! and `Ack` (3, body is `varint(bytes received)`).

use super::{controller, Outcome};
use crate::crane::Crane;
use crate::terminal::{Operation, OperationFactory, Permission, Terminal};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use spn_core::canonical::{canonical_bytes, from_canonical_bytes};
use spn_core::{varint, Error, ErrorKind, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const OP_TYPE: &str = "capacity";

pub const MAX_VOLUME: u64 = 100_000_000;
pub const MAX_TIME: Duration = Duration::from_secs(15);

/// Size of a data message, tag included.
pub const CHUNK_SIZE: usize = 1000;

/// Extra time the initiator grants the responder beyond `max_time`.
const GRACE: Duration = Duration::from_secs(5);

const TAG_DATA: u64 = 1;
const TAG_DONE: u64 = 2;
const TAG_ACK: u64 = 3;

/// One capacity test per process.
static TEST_RUNNING: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityTestOpts {
    /// Bytes to transfer
    pub volume: u64,
    /// Upper bound for the transfer, in milliseconds
    pub max_time_ms: u64,
}

impl Default for CapacityTestOpts {
    fn default() -> Self {
        Self {
            volume: 10_000_000,
            max_time_ms: 5_000,
        }
    }
}

impl CapacityTestOpts {
    pub fn validate(&self) -> Result<()> {
        if self.volume == 0 || self.volume > MAX_VOLUME {
            return Err(ErrorKind::InvalidOptions.with(format!(
                "volume {} not in [1, {MAX_VOLUME}]",
                self.volume
            )));
        }
        if self.max_time_ms == 0 || self.max_time() > MAX_TIME {
            return Err(ErrorKind::InvalidOptions.with(format!(
                "max time {}ms not in [1, {}]",
                self.max_time_ms,
                MAX_TIME.as_millis()
            )));
        }
        Ok(())
    }

    fn max_time(&self) -> Duration {
        Duration::from_millis(self.max_time_ms)
    }
}

pub(crate) fn factory() -> OperationFactory {
    OperationFactory {
        op_type: OP_TYPE,
        requires: Permission::IS_CRANE_CONTROLLER,
        start: start_remote,
    }
}

fn start_remote(terminal: &Arc<Terminal>, id: u32, data: Bytes) -> Result<Arc<dyn Operation>> {
    let opts: CapacityTestOpts = from_canonical_bytes(&data)?;
    opts.validate()?;
    if TEST_RUNNING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(ErrorKind::TryAgainLater.with("a capacity test is already running"));
    }
    Ok(Arc::new(SenderOp {
        id,
        terminal: terminal.clone(),
        opts,
        ctx: terminal.ctx().child_token(),
        released: AtomicBool::new(false),
    }))
}

/// Measure the capacity of a crane's lane in bit/s and record it on the
/// crane.
pub async fn measure_capacity(crane: &Arc<Crane>, opts: CapacityTestOpts) -> Result<u64> {
    opts.validate()?;
    let terminal = controller(crane)?;
    let op = Arc::new(ReceiverOp {
        id: terminal.next_operation_id(),
        terminal: terminal.clone(),
        started_at: Instant::now(),
        received: AtomicU64::new(0),
        outcome: Outcome::new(),
    });
    terminal
        .start_operation(op.clone(), &canonical_bytes(&opts)?)
        .await?;

    let bits_per_second = match tokio::time::timeout(opts.max_time() + GRACE, op.outcome.wait()).await {
        Ok(result) => result?,
        Err(_) => {
            let err = ErrorKind::Timeout.with("capacity test");
            terminal.end_operation(op.id, Some(err.clone()));
            return Err(err);
        }
    };
    crane.set_lane_capacity(bits_per_second);
    Ok(bits_per_second)
}

fn tagged(tag: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    varint::put(&mut buf, tag);
    buf.put_slice(body);
    buf.freeze()
}

/// Responder: sends the test volume.
struct SenderOp {
    id: u32,
    terminal: Arc<Terminal>,
    opts: CapacityTestOpts,
    ctx: CancellationToken,
    released: AtomicBool,
}

impl SenderOp {
    async fn send_volume(self: Arc<Self>) {
        let deadline = Instant::now() + self.opts.max_time();
        let chunk = tagged(TAG_DATA, &[0u8; CHUNK_SIZE - 1]);
        let mut sent = 0u64;

        while sent < self.opts.volume && Instant::now() < deadline {
            let result = tokio::select! {
                _ = self.ctx.cancelled() => return,
                r = tokio::time::timeout_at(deadline, self.terminal.send_op_data(self.id, chunk.clone())) => r,
            };
            match result {
                Ok(Ok(())) => sent += CHUNK_SIZE as u64,
                Ok(Err(e)) => {
                    self.terminal.end_operation(self.id, Some(e));
                    return;
                }
                // Out of time: report what was sent.
                Err(_) => break,
            }
        }

        debug!("{}: capacity test sent {} bytes", self.terminal.fmt_id(), sent);
        if let Err(e) = self.terminal.send_op_data(self.id, tagged(TAG_DONE, &[])).await {
            self.terminal.end_operation(self.id, Some(e));
            return;
        }

        // The initiator ends the operation after acking.
        tokio::select! {
            _ = self.ctx.cancelled() => {}
            _ = tokio::time::sleep(GRACE) => {
                self.terminal.end_operation(self.id, Some(ErrorKind::Timeout.with("no capacity ack")));
            }
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            TEST_RUNNING.store(false, Ordering::SeqCst);
        }
    }
}

impl Operation for SenderOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, mut data: Bytes) -> Result<()> {
        match varint::get(&mut data)? {
            TAG_ACK => {
                let received = varint::get(&mut data)?;
                debug!("{}: capacity test acked {} bytes", self.terminal.fmt_id(), received);
                Ok(())
            }
            tag => Err(ErrorKind::UnexpectedMsgType.with(format!("capacity tag {tag}"))),
        }
    }

    fn end(&self, _err: Option<Error>) {
        self.ctx.cancel();
        self.release();
    }

    fn started(self: Arc<Self>) {
        tokio::spawn(self.send_volume());
    }
}

impl Drop for SenderOp {
    fn drop(&mut self) {
        self.release();
    }
}

/// Initiator: counts what arrives.
struct ReceiverOp {
    id: u32,
    terminal: Arc<Terminal>,
    started_at: Instant,
    received: AtomicU64,
    outcome: Outcome<u64>,
}

impl ReceiverOp {
    fn finish(&self) {
        let received = self.received.load(Ordering::SeqCst);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if received == 0 || elapsed <= 0.0 {
            self.outcome
                .set(Err(ErrorKind::InternalError.with("capacity test received nothing")));
            self.terminal.end_operation(self.id, None);
            return;
        }
        let bits_per_second = (received as f64 * 8.0 / elapsed) as u64;
        info!(
            "{}: capacity test received {} bytes in {:.3}s",
            self.terminal.fmt_id(),
            received,
            elapsed
        );
        self.outcome.set(Ok(bits_per_second));

        let mut ack = BytesMut::new();
        varint::put(&mut ack, TAG_ACK);
        varint::put(&mut ack, received);
        let terminal = self.terminal.clone();
        let id = self.id;
        tokio::spawn(async move {
            match terminal.send_op_data(id, ack.freeze()).await {
                Ok(()) => terminal.end_operation(id, None),
                Err(e) => terminal.end_operation(id, Some(e)),
            }
        });
    }
}

impl Operation for ReceiverOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, mut data: Bytes) -> Result<()> {
        let total_len = data.len() as u64;
        match varint::get(&mut data)? {
            TAG_DATA => {
                self.received.fetch_add(total_len, Ordering::SeqCst);
                Ok(())
            }
            TAG_DONE => {
                self.finish();
                Ok(())
            }
            tag => Err(ErrorKind::UnexpectedMsgType.with(format!("capacity tag {tag}"))),
        }
    }

    fn end(&self, err: Option<Error>) {
        if !self.outcome.is_set() {
            self.outcome
                .set(Err(err.unwrap_or_else(|| ErrorKind::Stopping.with("capacity test ended"))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_validation() {
        assert!(CapacityTestOpts::default().validate().is_ok());
        let too_big = CapacityTestOpts {
            volume: MAX_VOLUME + 1,
            ..Default::default()
        };
        assert!(too_big.validate().unwrap_err().is(ErrorKind::InvalidOptions));
        let too_long = CapacityTestOpts {
            max_time_ms: 15_001,
            ..Default::default()
        };
        assert!(too_long.validate().unwrap_err().is(ErrorKind::InvalidOptions));
    }

    #[test]
    fn test_chunk_size() {
        assert_eq!(tagged(TAG_DATA, &[0u8; CHUNK_SIZE - 1]).len(), CHUNK_SIZE);
    }
}

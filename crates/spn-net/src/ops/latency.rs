//! `latency`: ping the peer with nonces and keep the fastest round trip

use super::{controller, Outcome};
use crate::crane::Crane;
use crate::terminal::{Operation, OperationFactory, Permission, Terminal};
use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use spn_core::canonical::{canonical_bytes, from_canonical_bytes};
use spn_core::{Error, ErrorKind, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const OP_TYPE: &str = "latency";

const NONCE_SIZE: usize = 16;

/// How long to wait for a single echo.
const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyTestOpts {
    pub rounds: u32,
    /// Pause between rounds, in milliseconds
    pub pause_ms: u64,
}

impl Default for LatencyTestOpts {
    fn default() -> Self {
        Self {
            rounds: 10,
            pause_ms: 1000,
        }
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
    let opts: LatencyTestOpts = from_canonical_bytes(&data)?;
    if opts.rounds == 0 {
        return Err(ErrorKind::InvalidOptions.with("latency test needs at least one round"));
    }
    Ok(Arc::new(EchoOp {
        id,
        terminal: terminal.clone(),
    }))
}

/// Measure the latency of a crane's lane and record it on the crane.
///
/// The result is the one-way latency: half of the fastest round trip over
/// all rounds, not the round trip itself. Multiply by two to compare it
/// against round-trip figures.
pub async fn measure_latency(crane: &Arc<Crane>, opts: LatencyTestOpts) -> Result<Duration> {
    if opts.rounds == 0 {
        return Err(ErrorKind::InvalidOptions.with("latency test needs at least one round"));
    }
    let terminal = controller(crane)?;
    let (echo_tx, echo_rx) = mpsc::channel(1);
    let op = Arc::new(LatencyOp {
        id: terminal.next_operation_id(),
        terminal: terminal.clone(),
        opts,
        ctx: terminal.ctx().child_token(),
        echo_tx,
        echo_rx: tokio::sync::Mutex::new(Some(echo_rx)),
        outcome: Outcome::new(),
    });
    terminal
        .start_operation(op.clone(), &canonical_bytes(&opts)?)
        .await?;
    let latency = op.outcome.wait().await?;
    crane.set_lane_latency(latency);
    Ok(latency)
}

/// Echoes every nonce back.
struct EchoOp {
    id: u32,
    terminal: Arc<Terminal>,
}

impl Operation for EchoOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        if data.len() != NONCE_SIZE {
            return Err(ErrorKind::MalformedData.with(format!("nonce of {} bytes", data.len())));
        }
        let terminal = self.terminal.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = terminal.send_op_data(id, data).await {
                terminal.end_operation(id, Some(e));
            }
        });
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}
}

struct LatencyOp {
    id: u32,
    terminal: Arc<Terminal>,
    opts: LatencyTestOpts,
    ctx: CancellationToken,
    echo_tx: mpsc::Sender<Bytes>,
    echo_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    outcome: Outcome<Duration>,
}

impl LatencyOp {
    async fn run(self: Arc<Self>) {
        let Some(mut echoes) = self.echo_rx.lock().await.take() else {
            return;
        };
        match self.measure(&mut echoes).await {
            Ok(latency) => {
                self.outcome.set(Ok(latency));
                self.terminal.end_operation(self.id, None);
            }
            Err(e) => {
                self.outcome.set(Err(e.clone()));
                self.terminal.end_operation(self.id, Some(e));
            }
        }
    }

    async fn measure(&self, echoes: &mut mpsc::Receiver<Bytes>) -> Result<Duration> {
        let mut fastest: Option<Duration> = None;
        for round in 0..self.opts.rounds {
            if round > 0 {
                tokio::time::sleep(Duration::from_millis(self.opts.pause_ms)).await;
            }
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng
                .try_fill_bytes(&mut nonce)
                .map_err(|e| ErrorKind::InternalError.with(e.to_string()))?;

            let sent_at = Instant::now();
            self.terminal
                .send_op_data(self.id, Bytes::copy_from_slice(&nonce))
                .await?;
            let echo = tokio::select! {
                _ = self.ctx.cancelled() => return Err(ErrorKind::Stopping.into()),
                r = tokio::time::timeout(ECHO_TIMEOUT, echoes.recv()) => match r {
                    Ok(Some(echo)) => echo,
                    Ok(None) => return Err(ErrorKind::Stopping.into()),
                    Err(_) => return Err(ErrorKind::Timeout.with("latency echo")),
                },
            };
            if echo[..] != nonce[..] {
                return Err(ErrorKind::Integrity.with("latency echo does not match nonce"));
            }
            let rtt = sent_at.elapsed();
            debug!("{}: latency round {} took {:?}", self.terminal.fmt_id(), round, rtt);
            fastest = Some(fastest.map_or(rtt, |f| f.min(rtt)));
        }
        fastest
            .map(|rtt| rtt / 2)
            .ok_or_else(|| ErrorKind::InternalError.with("no latency rounds"))
    }
}

impl Operation for LatencyOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        self.echo_tx
            .try_send(data)
            .map_err(|_| ErrorKind::UnexpectedMsgType.with("unsolicited latency echo"))
    }

    fn end(&self, err: Option<Error>) {
        self.ctx.cancel();
        self.outcome
            .set(Err(err.unwrap_or_else(|| ErrorKind::Stopping.with("latency test ended"))));
    }

    fn started(self: Arc<Self>) {
        tokio::spawn(self.run());
    }
}

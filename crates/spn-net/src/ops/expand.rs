//! `expand`: open a terminal on a hub further away, relayed by the peer
//!
//! The initiator creates the new terminal locally, with the operation as
//! its upstream, and sends `block(destination hub id) || terminal init`.
//! The relaying hub looks up the crane assigned to the destination, opens
//! a relay terminal on it with the same init data and pumps frames in both
//! directions through two flow queues, one per side.

use crate::crane::Crane;
use crate::msg::{Msg, MsgType, Upstream};
use crate::terminal::{
    DuplexFlowQueue, Operation, OperationFactory, Permission, Terminal, TerminalInterface,
    TerminalOpts, TerminalSetup,
};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use spn_core::{varint, Error, ErrorKind, Hub, HubId, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const OP_TYPE: &str = "expand";

const STOP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn factory() -> OperationFactory {
    OperationFactory {
        op_type: OP_TYPE,
        requires: Permission::MAY_EXPAND,
        start: start_remote,
    }
}

/// Open a terminal on `dest` through the peer of `home`.
pub async fn expand(
    home: &Arc<Terminal>,
    dest: &Arc<Hub>,
    opts: Option<TerminalOpts>,
) -> Result<Arc<Terminal>> {
    let config = &home.dock().config;
    let opts = opts.unwrap_or(TerminalOpts {
        queue_size: config.default_queue_size,
        padding: config.default_padding,
        encrypt: false,
    });

    let op_id = home.next_operation_id();
    let op = Arc::new(ExpandClientOp {
        id: op_id,
        home: home.clone(),
        terminal: OnceLock::new(),
    });
    let (terminal, init_data) = Terminal::new_local(
        TerminalSetup {
            id: op_id,
            parent_id: home.fmt_id(),
            ctx: home.ctx().child_token(),
            dock: home.dock().clone(),
            crane: None,
            upstream: op.clone(),
            permission: Permission::empty(),
            local: true,
        },
        opts,
        Some(dest.as_ref()),
    )?;
    let _ = op.terminal.set(Arc::downgrade(&terminal));

    let mut init = BytesMut::with_capacity(init_data.len() + 40);
    varint::put_block(&mut init, dest.id.as_bytes());
    init.put_slice(&init_data);
    if let Err(e) = home.start_operation(op, &init).await {
        terminal.abandon(e.clone());
        return Err(e);
    }
    info!("{}: expanding to {}", terminal.fmt_id(), dest.id);
    Ok(terminal)
}

/// Initiator side: carries the expanded terminal's frames as operation
/// data on the home terminal.
struct ExpandClientOp {
    id: u32,
    home: Arc<Terminal>,
    terminal: OnceLock<Weak<Terminal>>,
}

impl ExpandClientOp {
    fn terminal(&self) -> Option<Arc<Terminal>> {
        self.terminal.get().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl Upstream for ExpandClientOp {
    async fn send(&self, msg: Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Stop => {
                self.home
                    .end_operation(self.id, Some(Error::unpack(&msg.data).as_local()));
                Ok(())
            }
            _ => self.home.send_op_data(self.id, msg.data).await,
        }
    }
}

impl Operation for ExpandClientOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        match self.terminal() {
            Some(terminal) => terminal.deliver(data),
            None => Err(ErrorKind::Abandoning.with("expanded terminal is gone")),
        }
    }

    fn end(&self, err: Option<Error>) {
        if let Some(terminal) = self.terminal() {
            terminal.abandon(err.unwrap_or_else(|| Error::new(ErrorKind::Stopping).as_external()));
        }
    }
}

fn start_remote(home: &Arc<Terminal>, op_id: u32, mut data: Bytes) -> Result<Arc<dyn Operation>> {
    let dest = HubId::from_slice(&varint::get_block(&mut data)?)?;
    let (opts, _) = TerminalOpts::parse(&data)?;
    let crane = home
        .dock()
        .cranes
        .get_assigned(&dest)
        .ok_or_else(|| ErrorKind::HubUnavailable.with(format!("no lane to hub {dest}")))?;

    let ctx = home.ctx().child_token();
    let relay_id = crane.allocate_terminal_id();
    let origin = DuplexFlowQueue::new(
        ctx.clone(),
        op_id,
        opts.queue_size,
        0,
        Arc::new(OpUpstream {
            home: home.clone(),
            op_id,
        }),
        None,
    );
    let relay_dfq = DuplexFlowQueue::new(ctx.clone(), relay_id, opts.queue_size, 0, crane.upstream(), None);

    let relay = Arc::new_cyclic(|me| ExpansionRelayTerminal {
        id: relay_id,
        me: me.clone(),
        parent_id: crane.id().to_string(),
        ctx,
        crane: Arc::downgrade(&crane),
        upstream: crane.upstream(),
        dfq: relay_dfq,
        home: home.clone(),
        op_id,
        abandoning: AtomicBool::new(false),
    });
    let op = Arc::new(ExpandOp {
        id: op_id,
        origin,
        relay: relay.clone(),
        pending_init: Mutex::new(Some((crane, data))),
    });
    debug!(
        "{}: relaying operation {} to {} as {}",
        home.fmt_id(),
        op_id,
        dest,
        relay.fmt_id()
    );
    Ok(op)
}

/// Relay side: the operation on the home terminal.
struct ExpandOp {
    id: u32,
    origin: Arc<DuplexFlowQueue>,
    relay: Arc<ExpansionRelayTerminal>,
    pending_init: Mutex<Option<(Arc<Crane>, Bytes)>>,
}

impl ExpandOp {
    async fn run(self: Arc<Self>) {
        let Some((crane, init)) = self.pending_init.lock().take() else {
            return;
        };
        if let Err(e) = crane
            .establish_new_terminal(self.relay.clone(), init)
            .await
        {
            self.relay.abandon(e);
            return;
        }

        let to_relay = {
            let origin = self.origin.clone();
            let relay = self.relay.clone();
            async move {
                while let Some(frame) = origin.recv().await {
                    if let Err(e) = relay.dfq.send(frame, false, None).await {
                        relay.abandon(e);
                        return;
                    }
                }
            }
        };
        let to_origin = {
            let origin = self.origin.clone();
            let relay = self.relay.clone();
            async move {
                while let Some(frame) = relay.dfq.recv().await {
                    if let Err(e) = origin.send(frame, false, None).await {
                        relay.abandon(e);
                        return;
                    }
                }
            }
        };
        tokio::spawn(to_relay);
        tokio::spawn(to_origin);
    }
}

impl Operation for ExpandOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        self.origin.deliver(data)
    }

    fn end(&self, err: Option<Error>) {
        let err = err
            .map(Error::as_local)
            .unwrap_or_else(|| Error::new(ErrorKind::Stopping));
        self.relay.abandon(err);
    }

    fn started(self: Arc<Self>) {
        tokio::spawn(self.run());
    }
}

/// Sends a flow queue's frames as data of an operation.
struct OpUpstream {
    home: Arc<Terminal>,
    op_id: u32,
}

#[async_trait]
impl Upstream for OpUpstream {
    async fn send(&self, msg: Msg) -> Result<()> {
        self.home.send_op_data(self.op_id, msg.data).await
    }
}

/// The relay's end of an expansion, registered on the crane towards the
/// destination.
pub struct ExpansionRelayTerminal {
    id: u32,
    me: Weak<ExpansionRelayTerminal>,
    parent_id: String,
    ctx: CancellationToken,
    crane: Weak<Crane>,
    upstream: Arc<dyn Upstream>,
    dfq: Arc<DuplexFlowQueue>,
    home: Arc<Terminal>,
    op_id: u32,
    abandoning: AtomicBool,
}

impl ExpansionRelayTerminal {
    async fn finish_abandon(self: Arc<Self>, err: Error) {
        if err.is_graceful() {
            debug!("{}: abandoning relay: {}", self.fmt_id(), err);
        } else {
            info!("{}: abandoning relay: {}", self.fmt_id(), err);
        }
        if !err.is_external() {
            let stop = Msg::new(self.id, MsgType::Stop, err.pack());
            if let Ok(Err(e)) = tokio::time::timeout(STOP_SEND_TIMEOUT, self.upstream.send(stop)).await {
                debug!("{}: failed to send stop: {}", self.fmt_id(), e);
            }
        }
        self.ctx.cancel();
        self.home.end_operation(self.op_id, Some(err.as_local()));
        if let Some(crane) = self.crane.upgrade() {
            crane.remove_terminal(self.id);
        }
    }
}

impl TerminalInterface for ExpansionRelayTerminal {
    fn id(&self) -> u32 {
        self.id
    }

    fn fmt_id(&self) -> String {
        format!("{}#{}", self.parent_id, self.id)
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        self.dfq.deliver(data)
    }

    fn abandon(&self, err: Error) {
        if self.abandoning.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.me.upgrade() {
            Some(relay) => {
                tokio::spawn(relay.finish_abandon(err));
            }
            None => self.ctx.cancel(),
        }
    }
}

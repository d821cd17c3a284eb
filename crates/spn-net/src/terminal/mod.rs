//! Terminals: permissioned logical channels carrying operations
//!
//! A terminal lives on a crane (or, when expanded, on an operation of
//! another terminal). Outgoing frames pass through the terminal's
//! [`DuplexFlowQueue`]; incoming frames are decrypted if the terminal has
//! its own Wire-V1 session and dispatched to operations by ID.
//!
//! Operation frame: `varint(op_id) || varint(msg_type) || data`. An op
//! `Init` carries `block(op_type) || init_data`, a `Stop` a packed error.

pub mod dfq;
pub mod operation;

pub use dfq::DuplexFlowQueue;
pub use operation::{Operation, OperationFactory, OperationRegistry, StartFn};

use crate::crane::Crane;
use crate::dock::Dock;
use crate::msg::{Msg, MsgType, Upstream};
use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spn_core::canonical::{canonical_bytes, take_canonical};
use spn_core::jess::{Opener, Session};
use spn_core::{varint, Error, ErrorKind, Hub, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal protocol version.
pub const TERMINAL_VERSION: u64 = 1;

/// Largest DFQ window a terminal may request.
pub const MAX_QUEUE_SIZE: u16 = 100;

/// How long an abandoning terminal tries to get its `Stop` out.
const STOP_SEND_TIMEOUT: Duration = Duration::from_secs(1);

bitflags! {
    /// What the peer of a terminal is allowed to do on it.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Permission: u8 {
        const MAY_EXPAND = 0x01;
        const MAY_TUNNEL = 0x02;
        const IS_HUB_OWNER = 0x04;
        const IS_HUB_ADVISOR = 0x08;
        const IS_CRANE_CONTROLLER = 0x10;
    }
}

/// Options negotiated in a terminal `Init`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOpts {
    /// DFQ window
    pub queue_size: u16,
    /// Padding quantum
    pub padding: u16,
    /// Wrap the terminal's frames in its own Wire-V1 session
    pub encrypt: bool,
}

impl Default for TerminalOpts {
    fn default() -> Self {
        Self {
            queue_size: MAX_QUEUE_SIZE,
            padding: 8,
            encrypt: false,
        }
    }
}

impl TerminalOpts {
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ErrorKind::InvalidOptions.with(format!(
                "queue size {} not in [1, {MAX_QUEUE_SIZE}]",
                self.queue_size
            )));
        }
        Ok(())
    }

    /// `varint(version) || postcard(opts)`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = varint::encode(TERMINAL_VERSION);
        buf.extend(canonical_bytes(self)?);
        Ok(buf)
    }

    /// Parse and validate init data. Returns the options and the remaining
    /// bytes, which hold the Wire-V1 letter of encrypted terminals.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8])> {
        let (version, n) = varint::decode(data)?
            .ok_or_else(|| ErrorKind::MalformedData.with("truncated terminal init"))?;
        if version != TERMINAL_VERSION {
            return Err(ErrorKind::UnsupportedVersion.with(format!("terminal version {version}")));
        }
        let (opts, rest): (Self, _) = take_canonical(&data[n..])?;
        opts.validate()?;
        Ok((opts, rest))
    }
}

/// What a crane needs from the terminals it carries.
pub trait TerminalInterface: Send + Sync {
    fn id(&self) -> u32;

    fn fmt_id(&self) -> String;

    /// Hand over a `Data` payload. Must not block.
    fn deliver(&self, data: Bytes) -> Result<()>;

    /// Shut the terminal down. Only the first call has an effect.
    fn abandon(&self, err: Error);
}

/// Runs once when a terminal is abandoned.
pub type AbandonHook = Box<dyn FnOnce(u32, &Error) + Send>;

/// Everything a terminal is constructed with, apart from its options.
pub struct TerminalSetup {
    pub id: u32,
    /// Prefix for log identifiers, usually the crane ID.
    pub parent_id: String,
    pub ctx: CancellationToken,
    pub dock: Arc<Dock>,
    pub crane: Option<Weak<Crane>>,
    pub upstream: Arc<dyn Upstream>,
    pub permission: Permission,
    /// Whether we opened the terminal; selects the operation ID parity.
    pub local: bool,
}

/// A logical channel with flow control, carrying operations.
pub struct Terminal {
    id: u32,
    parent_id: String,
    me: Weak<Terminal>,
    ctx: CancellationToken,
    dock: Arc<Dock>,
    crane: Option<Weak<Crane>>,
    opts: TerminalOpts,

    permission: AtomicU8,
    abandoning: AtomicBool,
    abandon_hook: Mutex<Option<AbandonHook>>,

    next_op_id: AtomicU32,
    operations: Mutex<HashMap<u32, Arc<dyn Operation>>>,

    upstream: Arc<dyn Upstream>,
    dfq: Arc<DuplexFlowQueue>,
    opener: Option<Mutex<Opener>>,
}

impl Terminal {
    /// Create a terminal we open. Returns the terminal and the init data to
    /// send to the peer. Encrypted terminals are keyed to `encrypt_for`.
    pub fn new_local(
        setup: TerminalSetup,
        opts: TerminalOpts,
        encrypt_for: Option<&Hub>,
    ) -> Result<(Arc<Self>, Bytes)> {
        opts.validate()?;
        let mut init_data = opts.encode()?;

        let session = if opts.encrypt {
            let hub = encrypt_for
                .ok_or_else(|| ErrorKind::HubNotReady.with("no hub to encrypt terminal for"))?;
            let key = hub.select_exchange_key().ok_or_else(|| {
                ErrorKind::HubNotReady.with(format!("no exchange key for hub {}", hub.id))
            })?;
            let (session, letter) = Session::initiate(key, &[])?;
            init_data.extend(letter);
            Some(session)
        } else {
            None
        };

        Ok((Self::build(setup, opts, session), Bytes::from(init_data)))
    }

    /// Create a terminal the peer opened, from its init data.
    pub fn new_remote(setup: TerminalSetup, init_data: &[u8]) -> Result<Arc<Self>> {
        let (opts, rest) = TerminalOpts::parse(init_data)?;
        let session = if opts.encrypt {
            let identity = setup
                .dock
                .identity
                .as_ref()
                .ok_or_else(|| ErrorKind::Integrity.with("no identity to accept encrypted terminal"))?;
            let (session, _) = Session::accept(rest, identity)?;
            Some(session)
        } else {
            if !rest.is_empty() {
                return Err(ErrorKind::MalformedData.with("trailing data in terminal init"));
            }
            None
        };
        Ok(Self::build(setup, opts, session))
    }

    fn build(setup: TerminalSetup, opts: TerminalOpts, session: Option<Session>) -> Arc<Self> {
        let (sealer, opener) = match session.map(Session::split) {
            Some((sealer, opener)) => (Some(sealer), Some(Mutex::new(opener))),
            None => (None, None),
        };
        let dfq = DuplexFlowQueue::new(
            setup.ctx.clone(),
            setup.id,
            opts.queue_size,
            opts.padding,
            setup.upstream.clone(),
            sealer,
        );

        let terminal = Arc::new_cyclic(|me| Self {
            id: setup.id,
            parent_id: setup.parent_id,
            me: me.clone(),
            ctx: setup.ctx,
            dock: setup.dock,
            crane: setup.crane,
            opts,
            permission: AtomicU8::new(setup.permission.bits()),
            abandoning: AtomicBool::new(false),
            abandon_hook: Mutex::new(None),
            next_op_id: AtomicU32::new(if setup.local { 2 } else { 1 }),
            operations: Mutex::new(HashMap::new()),
            upstream: setup.upstream,
            dfq,
            opener,
        });
        tokio::spawn(terminal.clone().handler());
        terminal
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// `<crane-id>#<terminal-id>`
    pub fn fmt_id(&self) -> String {
        format!("{}#{}", self.parent_id, self.id)
    }

    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn opts(&self) -> TerminalOpts {
        self.opts
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }

    /// The crane carrying this terminal, if it is still running.
    pub fn crane(&self) -> Option<Arc<Crane>> {
        self.crane.as_ref().and_then(Weak::upgrade)
    }

    pub fn dfq(&self) -> &Arc<DuplexFlowQueue> {
        &self.dfq
    }

    pub fn is_encrypted(&self) -> bool {
        self.opener.is_some()
    }

    pub fn permission(&self) -> Permission {
        Permission::from_bits_truncate(self.permission.load(Ordering::SeqCst))
    }

    pub fn grant_permission(&self, permission: Permission) {
        self.permission.fetch_or(permission.bits(), Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoning.load(Ordering::SeqCst)
    }

    pub(crate) fn set_abandon_hook(&self, hook: AbandonHook) {
        *self.abandon_hook.lock() = Some(hook);
    }

    /// Allocate an ID for a new local operation.
    pub fn next_operation_id(&self) -> u32 {
        self.next_op_id.fetch_add(2, Ordering::SeqCst)
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().len()
    }

    /// Register a local operation and send its `Init` to the peer.
    pub async fn start_operation(&self, op: Arc<dyn Operation>, init_data: &[u8]) -> Result<()> {
        if self.is_abandoned() {
            return Err(ErrorKind::Abandoning.with("terminal is abandoned"));
        }
        let op_id = op.id();
        {
            let mut operations = self.operations.lock();
            if operations.contains_key(&op_id) {
                return Err(ErrorKind::IncorrectUsage.with(format!("operation ID {op_id} in use")));
            }
            operations.insert(op_id, op.clone());
        }

        let mut payload = BytesMut::with_capacity(op.op_type().len() + init_data.len() + 2);
        varint::put_block(&mut payload, op.op_type().as_bytes());
        payload.put_slice(init_data);
        let init = Msg::new(op_id, MsgType::Init, payload.freeze()).encode();

        if let Err(e) = self.dfq.send(init, true, None).await {
            self.operations.lock().remove(&op_id);
            return Err(e);
        }
        debug!("{}: started {} operation {}", self.fmt_id(), op.op_type(), op_id);
        op.started();
        Ok(())
    }

    /// Send a message to the peer of an operation.
    pub async fn send_op_msg(
        &self,
        op_id: u32,
        msg_type: MsgType,
        data: Bytes,
        high_prio: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.dfq
            .send(Msg::new(op_id, msg_type, data).encode(), high_prio, timeout)
            .await
    }

    /// Send operation data with normal priority.
    pub async fn send_op_data(&self, op_id: u32, data: Bytes) -> Result<()> {
        self.send_op_msg(op_id, MsgType::Data, data, false, None).await
    }

    /// End an operation from our side. The peer is sent a `Stop` carrying
    /// `err`, or `Stopping` if there is none. Only the first call for an
    /// operation has an effect.
    pub fn end_operation(&self, op_id: u32, err: Option<Error>) {
        let Some(op) = self.operations.lock().remove(&op_id) else {
            return;
        };
        let err = err.unwrap_or_else(|| Error::new(ErrorKind::Stopping));
        if err.is_graceful() {
            debug!("{}: {} operation {} ended: {}", self.fmt_id(), op.op_type(), op_id, err);
        } else {
            info!("{}: {} operation {} failed: {}", self.fmt_id(), op.op_type(), op_id, err);
        }
        if !err.is_external() {
            self.spawn_op_stop(op_id, &err);
        }
        op.end(None);
    }

    fn spawn_op_stop(&self, op_id: u32, err: &Error) {
        let dfq = self.dfq.clone();
        let stop = Msg::new(op_id, MsgType::Stop, err.pack()).encode();
        let fmt_id = self.fmt_id();
        tokio::spawn(async move {
            if let Err(e) = dfq.send(stop, false, Some(STOP_SEND_TIMEOUT)).await {
                debug!("{}: failed to send stop for operation {}: {}", fmt_id, op_id, e);
            }
        });
    }

    /// The peer ended an operation.
    fn stop_operation(&self, op_id: u32, err: Error) {
        let Some(op) = self.operations.lock().remove(&op_id) else {
            return;
        };
        if err.is_graceful() {
            debug!("{}: {} operation {} ended by peer: {}", self.fmt_id(), op.op_type(), op_id, err);
        } else {
            info!("{}: {} operation {} failed at peer: {}", self.fmt_id(), op.op_type(), op_id, err);
        }
        op.end(Some(err));
    }

    async fn handler(self: Arc<Self>) {
        while let Some(frame) = self.dfq.recv().await {
            if let Err(err) = self.handle_frame(frame) {
                self.abandon(err);
                return;
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Bytes) -> Result<()> {
        let frame = match &self.opener {
            Some(opener) => Bytes::from(opener.lock().open(&frame)?),
            None => frame,
        };
        let frame = if self.opts.padding > 0 {
            dfq::unpad_payload(frame)?
        } else {
            frame
        };
        let msg = Msg::decode(frame)?;
        match msg.msg_type {
            MsgType::Init => self.run_operation(msg.flow_id, msg.data),
            MsgType::Data | MsgType::PriorityData => {
                let op = self.operations.lock().get(&msg.flow_id).cloned();
                match op {
                    Some(op) => {
                        if let Err(e) = op.deliver(msg.data) {
                            self.end_operation(msg.flow_id, Some(e));
                        }
                    }
                    None => debug!(
                        "{}: dropping data for unknown operation {}",
                        self.fmt_id(),
                        msg.flow_id
                    ),
                }
            }
            MsgType::Stop => self.stop_operation(msg.flow_id, Error::unpack(&msg.data)),
        }
        Ok(())
    }

    /// Start an operation requested by the peer.
    fn run_operation(self: &Arc<Self>, op_id: u32, mut data: Bytes) {
        if let Err(err) = self.try_run_operation(op_id, &mut data) {
            debug!("{}: refused operation {}: {}", self.fmt_id(), op_id, err);
            self.spawn_op_stop(op_id, &err);
        }
    }

    fn try_run_operation(self: &Arc<Self>, op_id: u32, data: &mut Bytes) -> Result<()> {
        let op_type = varint::get_block(data)?;
        let op_type = std::str::from_utf8(&op_type)
            .map_err(|_| ErrorKind::MalformedData.with("operation type is not utf-8"))?;
        let factory = self.dock.operations.get(op_type).ok_or_else(|| {
            ErrorKind::UnknownOperationType.with(op_type.to_string())
        })?;
        if !self.permission().contains(factory.requires) {
            return Err(ErrorKind::PermissionDenied.with(format!("{op_type} requires {:?}", factory.requires)));
        }
        if self.operations.lock().contains_key(&op_id) {
            return Err(ErrorKind::IncorrectUsage.with(format!("operation ID {op_id} in use")));
        }

        let op = (factory.start)(self, op_id, data.split_off(0))?;
        self.operations.lock().insert(op_id, op.clone());
        debug!("{}: peer started {} operation {}", self.fmt_id(), op_type, op_id);
        op.started();
        Ok(())
    }

    /// Hand over a `Data` payload from upstream.
    pub fn deliver(&self, data: Bytes) -> Result<()> {
        if self.is_abandoned() {
            return Ok(());
        }
        self.dfq.deliver(data)
    }

    /// Shut the terminal down: notify the peer unless `err` came from it,
    /// end all operations, cancel the context and run the abandon hook.
    pub fn abandon(&self, err: Error) {
        if self.abandoning.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(terminal) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move { terminal.finish_abandon(err).await });
    }

    async fn finish_abandon(&self, err: Error) {
        if err.is_graceful() {
            debug!("{}: abandoning: {}", self.fmt_id(), err);
        } else {
            warn!("{}: abandoning: {}", self.fmt_id(), err);
        }

        if !err.is_external() {
            let stop = Msg::new(self.id, MsgType::Stop, err.pack());
            match tokio::time::timeout(STOP_SEND_TIMEOUT, self.upstream.send(stop)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{}: failed to send stop: {}", self.fmt_id(), e),
                Err(_) => debug!("{}: timed out sending stop", self.fmt_id()),
            }
        }

        let operations: Vec<_> = self.operations.lock().drain().map(|(_, op)| op).collect();
        for op in operations {
            op.end(Some(err.clone()));
        }

        self.ctx.cancel();
        let hook = self.abandon_hook.lock().take();
        if let Some(hook) = hook {
            hook(self.id, &err);
        }
    }

    /// Wait until everything sent so far was handed to the upstream.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.dfq.flush(Some(timeout)).await
    }

    /// Open a new terminal on the hub `dest`, relayed through the peer of
    /// this terminal.
    pub async fn expand(
        self: &Arc<Self>,
        dest: &Arc<Hub>,
        opts: Option<TerminalOpts>,
    ) -> Result<Arc<Terminal>> {
        crate::ops::expand::expand(self, dest, opts).await
    }
}

impl TerminalInterface for Terminal {
    fn id(&self) -> u32 {
        self.id
    }

    fn fmt_id(&self) -> String {
        Terminal::fmt_id(self)
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        Terminal::deliver(self, data)
    }

    fn abandon(&self, err: Error) {
        Terminal::abandon(self, err)
    }
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("id", &self.fmt_id())
            .field("opts", &self.opts)
            .field("permission", &self.permission())
            .finish()
    }
}

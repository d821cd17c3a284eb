//! Cranes: one ship, many terminals
//!
//! A crane frames, pads and encrypts shipments on a single ship and
//! multiplexes terminals over it. It runs three workers:
//!
//! - the unloader reads shipments off the ship,
//! - the handler decrypts them and routes segments to terminals,
//! - the loader batches outgoing segments into shipments.
//!
//! Terminal 0 is the crane controller. Terminal IDs we allocate are stepped
//! by 8, starting at 0 on the initiating side and at 4 on the accepting
//! side.

mod init;
mod registry;

pub use init::RuntimeInfo;
pub use registry::CraneRegistry;

use crate::dock::{CraneEvent, Dock};
use crate::msg::{Msg, MsgType, Upstream};
use crate::ops::gossip::GossipOp;
use crate::shipment::{padded_len, split_segments, target_load_size, ShipmentCodec, MAX_SEGMENT_LENGTH, MAX_UNLOAD_SIZE};
use crate::ships::Ship;
use crate::terminal::{Permission, Terminal, TerminalInterface, TerminalOpts, TerminalSetup};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use spn_core::jess::{Opener, Sealer};
use spn_core::varint::{self, MAX_VARINT_LEN};
use spn_core::{Error, ErrorKind, Hub, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the crane's internal queues.
const QUEUE_CAPACITY: usize = 100;

/// Lane measurements are trusted for this long.
pub const MEASUREMENT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug)]
struct Measurement<T> {
    value: T,
    expires_at: SystemTime,
}

impl<T: Copy> Measurement<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: SystemTime::now() + MEASUREMENT_TTL,
        }
    }

    fn current(&self) -> Option<T> {
        (SystemTime::now() < self.expires_at).then_some(self.value)
    }
}

/// Hands terminal messages to the loader. Holds only the queue senders, so
/// terminals do not keep their crane alive.
#[derive(Clone)]
pub(crate) struct CraneUpstream {
    ctx: CancellationToken,
    important: mpsc::Sender<Bytes>,
    regular: mpsc::Sender<Bytes>,
}

#[async_trait]
impl Upstream for CraneUpstream {
    async fn send(&self, msg: Msg) -> Result<()> {
        let queue = if msg.msg_type.is_important() {
            &self.important
        } else {
            &self.regular
        };
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(ErrorKind::Stopping.with("crane stopped")),
            r = queue.send(msg.encode()) => r.map_err(|_| ErrorKind::Stopping.with("crane stopped")),
        }
    }
}

struct LoaderQueues {
    important: mpsc::Receiver<Bytes>,
    regular: mpsc::Receiver<Bytes>,
}

/// A crane on one ship.
pub struct Crane {
    id: String,
    me: Weak<Crane>,
    ctx: CancellationToken,
    dock: Arc<Dock>,
    ship: Arc<dyn Ship>,
    connected_hub: RwLock<Option<Arc<Hub>>>,

    started: AtomicBool,
    authenticated: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
    public: AtomicBool,

    controller: OnceLock<Arc<Terminal>>,
    terminals: Mutex<HashMap<u32, Arc<dyn TerminalInterface>>>,
    next_terminal_id: AtomicU32,

    target_load_size: usize,
    /// Shipment padding quantum, from the controller options.
    padding: AtomicU16,

    upstream: CraneUpstream,
    unloading_tx: mpsc::Sender<Bytes>,
    unloading_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    loader_queues: Mutex<Option<LoaderQueues>>,

    gossip: Mutex<Option<Arc<GossipOp>>>,
    lane_latency: RwLock<Option<Measurement<Duration>>>,
    lane_capacity: RwLock<Option<Measurement<u64>>>,
}

impl Crane {
    /// Create a crane on `ship` and register it with the dock.
    ///
    /// Client cranes pass the hub they dial, if known; server cranes pass
    /// `None`.
    pub fn new(dock: Arc<Dock>, ship: Arc<dyn Ship>, connected_hub: Option<Arc<Hub>>) -> Arc<Self> {
        let ctx = CancellationToken::new();
        let (important_tx, important_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (regular_tx, regular_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (unloading_tx, unloading_rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut id = [0u8; 4];
        OsRng.fill_bytes(&mut id);
        let first_terminal_id = if ship.is_mine() { 0 } else { 4 };

        let crane = Arc::new_cyclic(|me| Self {
            id: hex::encode(id),
            me: me.clone(),
            ctx: ctx.clone(),
            target_load_size: target_load_size(ship.load_size()),
            padding: AtomicU16::new(dock.config.controller_padding),
            dock,
            ship,
            connected_hub: RwLock::new(connected_hub),
            started: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            public: AtomicBool::new(false),
            controller: OnceLock::new(),
            terminals: Mutex::new(HashMap::new()),
            next_terminal_id: AtomicU32::new(first_terminal_id),
            upstream: CraneUpstream {
                ctx,
                important: important_tx,
                regular: regular_tx,
            },
            unloading_tx,
            unloading_rx: tokio::sync::Mutex::new(unloading_rx),
            loader_queues: Mutex::new(Some(LoaderQueues {
                important: important_rx,
                regular: regular_rx,
            })),
            gossip: Mutex::new(None),
            lane_latency: RwLock::new(None),
            lane_capacity: RwLock::new(None),
        });
        crane.dock.cranes.register(&crane);
        debug!(
            "crane {}: created on {} -> {}",
            crane.id,
            crane.ship.local_addr(),
            crane.ship.remote_addr()
        );
        crane
    }

    /// Run the handshake and start the workers. On failure the crane is
    /// stopped.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ErrorKind::IncorrectUsage.with("crane already started"));
        }
        tokio::spawn(self.clone().unloader());

        let result = if self.ship.is_mine() {
            self.start_client().await
        } else {
            self.start_server().await
        };
        let (sealer, opener) = match result {
            Ok(session) => session,
            Err(err) => {
                self.stop(Some(err.clone()));
                return Err(err);
            }
        };

        let Some(queues) = self.loader_queues.lock().take() else {
            return Err(ErrorKind::InternalError.with("loader queues already taken"));
        };
        tokio::spawn(self.clone().loader(sealer, queues));
        tokio::spawn(self.clone().handler(opener));

        let hub = self.connected_hub().map(|h| h.id);
        info!(
            "crane {}: started to {} ({})",
            self.id,
            hub.map(|h| h.to_string()).unwrap_or_else(|| "unknown hub".into()),
            self.ship.remote_addr()
        );
        self.dock.notify(CraneEvent::Started {
            crane_id: self.id.clone(),
            hub,
        });
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }

    pub fn ship(&self) -> &Arc<dyn Ship> {
        &self.ship
    }

    pub fn connected_hub(&self) -> Option<Arc<Hub>> {
        self.connected_hub.read().clone()
    }

    pub(crate) fn set_connected_hub(&self, hub: Arc<Hub>) {
        *self.connected_hub.write() = Some(hub);
    }

    /// The controller terminal, once the handshake is done.
    pub fn controller(&self) -> Option<Arc<Terminal>> {
        self.controller.get().cloned()
    }

    pub fn target_load_size(&self) -> usize {
        self.target_load_size
    }

    /// Whether the peer proved its hub identity.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn is_public(&self) -> bool {
        self.public.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.lock().len()
    }

    /// Record that the peer proved its hub identity.
    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    /// Mark the crane public and assign it to `hub`. Callers must have
    /// verified that the peer holds `hub`'s signing key.
    pub(crate) fn mark_public(self: &Arc<Self>, hub: Arc<Hub>) {
        let hub_id = hub.id;
        self.set_connected_hub(hub);
        if self.public.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dock.cranes.assign(hub_id, self);
        info!("crane {}: published as lane to {}", self.id, hub_id);
        self.dock.notify(CraneEvent::Public {
            crane_id: self.id.clone(),
            hub: hub_id,
        });
    }

    pub(crate) fn gossip_op(&self) -> Option<Arc<GossipOp>> {
        self.gossip.lock().clone()
    }

    /// Install the gossip operation. Fails if one is already running.
    pub(crate) fn set_gossip_op(&self, op: Arc<GossipOp>) -> Result<()> {
        let mut gossip = self.gossip.lock();
        if gossip.is_some() {
            return Err(ErrorKind::IncorrectUsage.with("gossip already running on crane"));
        }
        *gossip = Some(op);
        Ok(())
    }

    pub(crate) fn clear_gossip_op(&self, op_id: u32) {
        let mut gossip = self.gossip.lock();
        if gossip.as_ref().map(|op| op.id_matches(op_id)).unwrap_or(false) {
            *gossip = None;
        }
    }

    fn next_terminal_id(&self) -> u32 {
        self.next_terminal_id.fetch_add(8, Ordering::SeqCst) + 8
    }

    fn terminal_setup(self: &Arc<Self>, id: u32, permission: Permission, local: bool) -> TerminalSetup {
        TerminalSetup {
            id,
            parent_id: self.id.clone(),
            ctx: self.ctx.child_token(),
            dock: self.dock.clone(),
            crane: Some(Arc::downgrade(self)),
            upstream: Arc::new(self.upstream.clone()),
            permission,
            local,
        }
    }

    /// Upstream for terminals carried by this crane.
    pub(crate) fn upstream(&self) -> Arc<dyn Upstream> {
        Arc::new(self.upstream.clone())
    }

    /// Allocate a terminal ID on this crane.
    pub(crate) fn allocate_terminal_id(&self) -> u32 {
        self.next_terminal_id()
    }

    /// Drop the terminal from the crane when it is abandoned.
    fn attach_terminal(self: &Arc<Self>, terminal: &Arc<Terminal>) {
        let crane = Arc::downgrade(self);
        terminal.set_abandon_hook(Box::new(move |id, _| {
            if let Some(crane) = crane.upgrade() {
                crane.remove_terminal(id);
            }
        }));
    }

    /// Open a data terminal to the connected hub. Encrypted terminals are
    /// keyed to the connected hub.
    pub async fn new_terminal(self: &Arc<Self>, opts: Option<TerminalOpts>) -> Result<Arc<Terminal>> {
        let opts = opts.unwrap_or(TerminalOpts {
            queue_size: self.dock.config.default_queue_size,
            padding: self.dock.config.default_padding,
            encrypt: false,
        });
        let id = self.next_terminal_id();
        let hub = self.connected_hub();
        let (terminal, init_data) = Terminal::new_local(
            self.terminal_setup(id, Permission::empty(), true),
            opts,
            hub.as_deref(),
        )?;
        self.attach_terminal(&terminal);
        if let Err(e) = self.establish_new_terminal(terminal.clone(), init_data).await {
            terminal.abandon(e.clone());
            return Err(e);
        }
        Ok(terminal)
    }

    /// Register a terminal we opened and send its `Init`.
    ///
    /// The terminal is registered before the `Init` is queued, so that
    /// replies can always be routed.
    pub async fn establish_new_terminal(
        &self,
        terminal: Arc<dyn TerminalInterface>,
        init_data: Bytes,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(ErrorKind::Stopping.with("crane stopped"));
        }
        let id = terminal.id();
        match self.terminals.lock().entry(id) {
            Entry::Occupied(_) => {
                return Err(ErrorKind::IncorrectUsage.with(format!("terminal ID {id} in use")));
            }
            Entry::Vacant(slot) => {
                slot.insert(terminal);
            }
        }
        if let Err(e) = self.upstream.send(Msg::new(id, MsgType::Init, init_data)).await {
            self.terminals.lock().remove(&id);
            return Err(e);
        }
        debug!("crane {}: established terminal {}", self.id, id);
        Ok(())
    }

    /// Create a terminal the peer opened. Failures are reported to the peer
    /// with a `Stop` for that terminal ID.
    fn establish_terminal(self: &Arc<Self>, id: u32, init_data: Bytes) {
        if let Err(err) = self.try_establish_terminal(id, &init_data) {
            warn!("crane {}: failed to establish terminal {}: {}", self.id, id, err);
            let upstream = self.upstream.clone();
            tokio::spawn(async move {
                let _ = upstream.send(Msg::new(id, MsgType::Stop, err.pack())).await;
            });
        }
    }

    fn try_establish_terminal(self: &Arc<Self>, id: u32, init_data: &[u8]) -> Result<()> {
        if self.is_stopping() || self.is_stopped() {
            return Err(ErrorKind::Stopping.with("crane is stopping"));
        }
        if self.terminals.lock().contains_key(&id) {
            return Err(ErrorKind::IncorrectUsage.with(format!("terminal ID {id} in use")));
        }
        let permission = if self.dock.config.public_hub {
            Permission::MAY_EXPAND
        } else {
            Permission::empty()
        };
        let terminal = Terminal::new_remote(self.terminal_setup(id, permission, false), init_data)?;
        self.attach_terminal(&terminal);
        self.terminals.lock().insert(id, terminal);
        debug!("crane {}: peer established terminal {}", self.id, id);
        Ok(())
    }

    /// Remove an abandoned terminal. A stopping crane stops once only its
    /// controller is left.
    pub(crate) fn remove_terminal(&self, id: u32) {
        let remaining = {
            let mut terminals = self.terminals.lock();
            terminals.remove(&id);
            terminals.len()
        };
        if self.is_stopping() && remaining <= 1 {
            self.stop(Some(ErrorKind::Stopping.with("crane drained")));
        }
    }

    /// Stop accepting work; stop as soon as only the controller is left.
    pub fn mark_stopping(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("crane {}: marked as stopping", self.id);
        if self.terminal_count() <= 1 {
            self.stop(Some(ErrorKind::Stopping.with("crane drained")));
        }
    }

    /// Stop the crane. Idempotent; the shutdown runs in the background.
    pub fn stop(&self, err: Option<Error>) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.me.upgrade() {
            Some(crane) => {
                tokio::spawn(async move { crane.shutdown(err).await });
            }
            None => self.ctx.cancel(),
        }
    }

    async fn shutdown(&self, err: Option<Error>) {
        match &err {
            Some(e) if !e.is_graceful() => warn!("crane {}: stopping: {}", self.id, e),
            Some(e) => info!("crane {}: stopping: {}", self.id, e),
            None => info!("crane {}: stopping", self.id),
        }
        self.dock.cranes.unregister(self);

        let err = err.unwrap_or_else(|| Error::new(ErrorKind::Stopping));
        if let Some(controller) = self.controller() {
            controller.abandon(err.clone());
        }
        // Give the loader a chance to get the controller's stop out.
        tokio::time::sleep(self.dock.config.loading_max_wait * 10).await;
        self.ship.sink().await;

        let terminals: Vec<_> = self.terminals.lock().drain().map(|(_, t)| t).collect();
        for terminal in terminals {
            terminal.abandon(ErrorKind::Stopping.with("crane stopped").as_external());
        }
        self.ctx.cancel();

        self.dock.notify(CraneEvent::Stopped {
            crane_id: self.id.clone(),
            hub: self.connected_hub().map(|h| h.id),
        });
    }

    /// Latest measured latency to the connected hub.
    pub fn lane_latency(&self) -> Option<Duration> {
        self.lane_latency.read().and_then(|m| m.current())
    }

    pub fn lane_latency_expires_at(&self) -> Option<SystemTime> {
        self.lane_latency.read().map(|m| m.expires_at)
    }

    pub fn set_lane_latency(&self, latency: Duration) {
        *self.lane_latency.write() = Some(Measurement::new(latency));
        info!("crane {}: lane latency is {:?}", self.id, latency);
    }

    /// Latest measured capacity to the connected hub, in bit/s.
    pub fn lane_capacity(&self) -> Option<u64> {
        self.lane_capacity.read().and_then(|m| m.current())
    }

    pub fn lane_capacity_expires_at(&self) -> Option<SystemTime> {
        self.lane_capacity.read().map(|m| m.expires_at)
    }

    pub fn set_lane_capacity(&self, bits_per_second: u64) {
        *self.lane_capacity.write() = Some(Measurement::new(bits_per_second));
        info!(
            "crane {}: lane capacity is {:.2} Mbit/s",
            self.id,
            bits_per_second as f64 / 1_000_000.0
        );
    }

    async fn unloader(self: Arc<Self>) {
        let mut codec = ShipmentCodec::new();
        let mut buf = BytesMut::with_capacity(2 * MAX_UNLOAD_SIZE);
        let mut chunk = vec![0u8; MAX_UNLOAD_SIZE + MAX_VARINT_LEN];

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(shipment)) => {
                    tokio::select! {
                        _ = self.ctx.cancelled() => return,
                        r = self.unloading_tx.send(shipment) => if r.is_err() { return },
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.stop(Some(e.wrap("failed to unload shipment")));
                    return;
                }
            }

            let n = tokio::select! {
                _ = self.ctx.cancelled() => return,
                r = self.ship.unload(&mut chunk) => match r {
                    Ok(n) => n,
                    Err(e) => {
                        self.stop(Some(e));
                        return;
                    }
                },
            };
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn handler(self: Arc<Self>, mut opener: Option<Opener>) {
        let mut unloading = self.unloading_rx.lock().await;
        let mut partial = BytesMut::new();

        loop {
            let shipment = tokio::select! {
                _ = self.ctx.cancelled() => return,
                s = unloading.recv() => match s {
                    Some(s) => s,
                    None => return,
                },
            };

            let body = match opener.as_mut() {
                Some(opener) => match opener.open(&shipment) {
                    Ok(body) => Bytes::from(body),
                    Err(e) => {
                        self.stop(Some(e.wrap("failed to open shipment")));
                        return;
                    }
                },
                None => shipment,
            };

            let result = split_segments(body, &mut partial)
                .and_then(|segments| segments.into_iter().try_for_each(|s| self.handle_segment(s)));
            if let Err(e) = result {
                self.stop(Some(e));
                return;
            }
        }
    }

    fn handle_segment(self: &Arc<Self>, segment: Bytes) -> Result<()> {
        // Terminals see nothing once the crane stopped.
        if self.is_stopped() {
            return Ok(());
        }
        let msg = Msg::decode(segment)?;
        match msg.msg_type {
            MsgType::Init => self.establish_terminal(msg.flow_id, msg.data),
            MsgType::Data | MsgType::PriorityData => {
                let terminal = self.terminals.lock().get(&msg.flow_id).cloned();
                match terminal {
                    Some(terminal) => {
                        if let Err(e) = terminal.deliver(msg.data) {
                            terminal.abandon(e);
                        }
                    }
                    None => debug!(
                        "crane {}: dropping data for unknown terminal {}",
                        self.id, msg.flow_id
                    ),
                }
            }
            MsgType::Stop => {
                let terminal = self.terminals.lock().get(&msg.flow_id).cloned();
                if let Some(terminal) = terminal {
                    terminal.abandon(Error::unpack(&msg.data));
                }
            }
        }
        Ok(())
    }

    async fn loader(self: Arc<Self>, mut sealer: Option<Sealer>, mut queues: LoaderQueues) {
        let max_wait = self.dock.config.loading_max_wait;
        let target = self.target_load_size;
        let mut shipment = BytesMut::with_capacity(2 * target);
        let mut deadline: Option<Instant> = None;

        loop {
            let segment = match queues.important.try_recv() {
                Ok(segment) => Some(segment),
                Err(_) => tokio::select! {
                    biased;
                    _ = self.ctx.cancelled() => return,
                    Some(segment) = queues.important.recv() => Some(segment),
                    Some(segment) = queues.regular.recv() => Some(segment),
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => None,
                    else => return,
                },
            };

            let timer_fired = segment.is_none();
            if let Some(segment) = segment {
                if segment.len() > MAX_SEGMENT_LENGTH {
                    warn!(
                        "crane {}: dropping segment of {} bytes",
                        self.id,
                        segment.len()
                    );
                    continue;
                }
                varint::put(&mut shipment, segment.len() as u64);
                shipment.put_slice(&segment);
                if deadline.is_none() {
                    deadline = Some(Instant::now() + max_wait);
                }
            }

            let mut split = false;
            while shipment.len() >= target {
                let full = shipment.split_to(target);
                if let Err(e) = self.load_shipment(full, sealer.as_mut()).await {
                    self.stop(Some(e));
                    return;
                }
                split = true;
            }

            if shipment.is_empty() {
                deadline = None;
            } else if split {
                // The tail starts a new batch.
                deadline = Some(Instant::now() + max_wait);
            } else if timer_fired {
                let rest = shipment.split();
                if let Err(e) = self.load_shipment(rest, sealer.as_mut()).await {
                    self.stop(Some(e));
                    return;
                }
                deadline = None;
            }
        }
    }

    async fn load_shipment(&self, mut plaintext: BytesMut, sealer: Option<&mut Sealer>) -> Result<()> {
        self.pad_shipment(&mut plaintext, sealer.is_some());
        let body = match sealer {
            Some(sealer) => Bytes::from(sealer.seal(&plaintext)?),
            None => plaintext.freeze(),
        };
        self.load_raw(body).await
    }

    /// Write one length-prefixed shipment to the ship.
    async fn load_raw(&self, body: Bytes) -> Result<()> {
        let mut wire = BytesMut::with_capacity(body.len() + MAX_VARINT_LEN);
        ShipmentCodec::new().encode(body, &mut wire)?;
        self.ship.load(&wire).await
    }

    fn pad_shipment(&self, shipment: &mut BytesMut, encrypted: bool) {
        let quantum = self.padding.load(Ordering::SeqCst) as usize;
        let padded = padded_len(shipment.len(), quantum, encrypted, self.target_load_size);
        if padded <= shipment.len() {
            return;
        }
        let mut padding = vec![0u8; padded - shipment.len()];
        if let Err(e) = OsRng.try_fill_bytes(&mut padding[1..]) {
            warn!("crane {}: padding with zeros, rng failed: {}", self.id, e);
            padding.fill(0);
        }
        shipment.put_slice(&padding);
    }

    /// Open a `publish` operation on the controller and wait for both sides
    /// to confirm.
    pub async fn publish(self: &Arc<Self>) -> Result<()> {
        crate::ops::publish::publish(self).await
    }

    /// Start gossiping hub messages with the peer.
    pub async fn start_gossip(self: &Arc<Self>) -> Result<()> {
        crate::ops::gossip::start_gossip(self).await
    }

    /// Fetch all hub messages known to the peer. Returns how many were
    /// imported.
    pub async fn query_gossip(self: &Arc<Self>) -> Result<usize> {
        crate::ops::gossip::query(self).await
    }
}

impl std::fmt::Debug for Crane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crane")
            .field("id", &self.id)
            .field("remote", &self.ship.remote_addr())
            .field("public", &self.is_public())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::ships::{TestShip, TestShipOptions};
    use crate::terminal::OperationRegistry;
    use spn_core::HubCache;

    fn dock(config: NetConfig) -> Arc<Dock> {
        Dock::new(
            config,
            Arc::new(HubCache::new()),
            None,
            Arc::new(OperationRegistry::with_defaults()),
        )
    }

    /// Reads raw shipments off the peer end of a crane's ship.
    struct ShipReader {
        ship: TestShip,
        codec: ShipmentCodec,
        buf: BytesMut,
        partial: BytesMut,
    }

    impl ShipReader {
        fn new(ship: TestShip) -> Self {
            Self {
                ship,
                codec: ShipmentCodec::new(),
                buf: BytesMut::new(),
                partial: BytesMut::new(),
            }
        }

        /// Next shipment body and its full size on the wire.
        async fn shipment(&mut self) -> (Bytes, usize) {
            let mut chunk = vec![0u8; MAX_UNLOAD_SIZE];
            loop {
                let before = self.buf.len();
                if let Some(body) = self.codec.decode(&mut self.buf).unwrap() {
                    return (body, before - self.buf.len());
                }
                let n = self.ship.unload(&mut chunk).await.unwrap();
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn messages(&mut self) -> Vec<Msg> {
            let (body, _) = self.shipment().await;
            split_segments(body, &mut self.partial)
                .unwrap()
                .into_iter()
                .map(|s| Msg::decode(s).unwrap())
                .collect()
        }
    }

    /// A crane on the initiating ship, without a handshake.
    fn crane(config: NetConfig) -> (Arc<Crane>, ShipReader) {
        let (mine, theirs) = TestShip::pair(TestShipOptions::default());
        let crane = Crane::new(dock(config), Arc::new(mine), None);
        (crane, ShipReader::new(theirs))
    }

    fn start_loader(crane: &Arc<Crane>) {
        let queues = crane.loader_queues.lock().take().unwrap();
        tokio::spawn(crane.clone().loader(None, queues));
    }

    async fn send(crane: &Crane, flow_id: u32, msg_type: MsgType, data: &[u8]) {
        crane
            .upstream
            .send(Msg::new(flow_id, msg_type, Bytes::copy_from_slice(data)))
            .await
            .unwrap();
    }

    struct StaticTerminal(u32);

    impl TerminalInterface for StaticTerminal {
        fn id(&self) -> u32 {
            self.0
        }

        fn fmt_id(&self) -> String {
            format!("static#{}", self.0)
        }

        fn deliver(&self, _data: Bytes) -> Result<()> {
            Ok(())
        }

        fn abandon(&self, _err: Error) {}
    }

    #[tokio::test]
    async fn test_small_segments_share_shipment() {
        let (crane, mut reader) = crane(NetConfig::default());
        for data in [&b"one"[..], b"two", b"three"] {
            send(&crane, 8, MsgType::Data, data).await;
        }
        start_loader(&crane);

        let (body, wire) = reader.shipment().await;
        assert_eq!(wire % 8, 0, "wire size {wire} not padded");
        let msgs = split_segments(body, &mut reader.partial).unwrap();
        let payloads: Vec<_> = msgs
            .into_iter()
            .map(|s| Msg::decode(s).unwrap().data)
            .collect();
        assert_eq!(payloads, vec![&b"one"[..], b"two", b"three"]);
        assert!(reader.partial.is_empty());
    }

    #[tokio::test]
    async fn test_important_segments_go_first() {
        let (crane, mut reader) = crane(NetConfig::default());
        send(&crane, 8, MsgType::Data, b"d1").await;
        send(&crane, 8, MsgType::Data, b"d2").await;
        send(&crane, 16, MsgType::Init, b"init").await;
        send(&crane, 24, MsgType::Stop, b"stop").await;
        start_loader(&crane);

        let order: Vec<_> = reader
            .messages()
            .await
            .into_iter()
            .map(|m| (m.flow_id, m.msg_type))
            .collect();
        assert_eq!(
            order,
            vec![
                (16, MsgType::Init),
                (24, MsgType::Stop),
                (8, MsgType::Data),
                (8, MsgType::Data),
            ]
        );
    }

    #[tokio::test]
    async fn test_large_load_is_split_at_target() {
        let (crane, mut reader) = crane(NetConfig::default());
        for i in 0..5u8 {
            send(&crane, 8, MsgType::Data, &[i; 1000]).await;
        }
        start_loader(&crane);

        let (first, _) = reader.shipment().await;
        assert_eq!(first.len(), crane.target_load_size());
        let mut msgs = split_segments(first, &mut reader.partial).unwrap();
        assert!(msgs.len() < 5);
        assert!(!reader.partial.is_empty());
        while msgs.len() < 5 {
            let (body, _) = reader.shipment().await;
            msgs.extend(split_segments(body, &mut reader.partial).unwrap());
        }

        for (i, segment) in msgs.into_iter().enumerate() {
            let msg = Msg::decode(segment).unwrap();
            assert_eq!(&msg.data[..], &[i as u8; 1000][..]);
        }
        assert!(reader.partial.is_empty());
    }

    #[tokio::test]
    async fn test_tail_after_split_waits_again() {
        let config = NetConfig {
            loading_max_wait: Duration::from_millis(200),
            ..Default::default()
        };
        let (crane, mut reader) = crane(config);
        start_loader(&crane);

        send(&crane, 8, MsgType::Data, b"early").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let big = vec![1u8; crane.target_load_size()];
        send(&crane, 8, MsgType::Data, &big).await;

        let (first, _) = reader.shipment().await;
        assert_eq!(first.len(), crane.target_load_size());
        let split_at = Instant::now();

        reader.shipment().await;
        let waited = split_at.elapsed();
        assert!(waited >= Duration::from_millis(150), "tail left after {waited:?}");
    }

    #[tokio::test]
    async fn test_terminal_id_parity() {
        let (mine, theirs) = TestShip::pair(TestShipOptions::default());
        let client = Crane::new(dock(NetConfig::default()), Arc::new(mine), None);
        let server = Crane::new(dock(NetConfig::default()), Arc::new(theirs), None);

        assert_eq!(client.allocate_terminal_id(), 8);
        assert_eq!(client.allocate_terminal_id(), 16);
        assert_eq!(server.allocate_terminal_id(), 12);
        assert_eq!(server.allocate_terminal_id(), 20);
    }

    #[tokio::test]
    async fn test_terminal_id_collision() {
        let (crane, _reader) = crane(NetConfig::default());
        crane
            .establish_new_terminal(Arc::new(StaticTerminal(8)), Bytes::new())
            .await
            .unwrap();
        let err = crane
            .establish_new_terminal(Arc::new(StaticTerminal(8)), Bytes::new())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::IncorrectUsage));
        assert_eq!(crane.terminal_count(), 1);
    }

    #[tokio::test]
    async fn test_stopping_crane_refuses_terminals() {
        let (crane, _reader) = crane(NetConfig::default());
        let init = Bytes::from(TerminalOpts::default().encode().unwrap());
        for id in [12, 20] {
            crane
                .handle_segment(Msg::new(id, MsgType::Init, init.clone()).encode())
                .unwrap();
        }
        assert_eq!(crane.terminal_count(), 2);

        crane.mark_stopping();
        assert!(!crane.is_stopped());
        crane
            .handle_segment(Msg::new(28, MsgType::Init, init.clone()).encode())
            .unwrap();
        assert_eq!(crane.terminal_count(), 2);

        let mut queues = crane.loader_queues.lock().take().unwrap();
        let refusal = Msg::decode(queues.important.recv().await.unwrap()).unwrap();
        assert_eq!((refusal.flow_id, refusal.msg_type), (28, MsgType::Stop));
        assert!(Error::unpack(&refusal.data).is(ErrorKind::Stopping));
    }

    #[tokio::test]
    async fn test_stopped_crane_ignores_segments() {
        let (crane, _reader) = crane(NetConfig::default());
        crane.stop(None);
        assert!(crane.is_stopped());

        let init = Bytes::from(TerminalOpts::default().encode().unwrap());
        crane
            .handle_segment(Msg::new(12, MsgType::Init, init).encode())
            .unwrap();
        assert_eq!(crane.terminal_count(), 0);
    }
}

//! `gossip` and `gossip/query`: spreading signed hub messages
//!
//! Both carry messages as `varint(kind) || block(blob)`, where kind 1 is a
//! hub announcement and kind 2 a hub status. A gossip operation lives on
//! the crane controller for as long as the crane runs; imports that change
//! our view are forwarded to the gossip operations of all other cranes.

use super::{controller, Outcome};
use crate::crane::Crane;
use crate::dock::Dock;
use crate::terminal::{Operation, OperationFactory, Permission, Terminal};
use bytes::{Bytes, BytesMut};
use spn_core::{varint, Error, ErrorKind, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const OP_TYPE: &str = "gossip";
pub const QUERY_OP_TYPE: &str = "gossip/query";

/// Kind of a gossiped hub message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GossipMsgType {
    Announcement = 1,
    Status = 2,
}

impl GossipMsgType {
    fn from_code(code: u64) -> Result<Self> {
        match code {
            1 => Ok(Self::Announcement),
            2 => Ok(Self::Status),
            _ => Err(ErrorKind::UnexpectedMsgType.with(format!("gossip message type {code}"))),
        }
    }
}

fn encode_msg(kind: GossipMsgType, blob: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(blob.len() + 4);
    varint::put(&mut buf, kind as u64);
    varint::put_block(&mut buf, blob);
    buf.freeze()
}

/// Parse a gossip message and hand it to the importer. Returns the kind,
/// the blob and whether it should be forwarded.
fn import_msg(dock: &Dock, mut data: Bytes) -> Result<(GossipMsgType, Bytes, bool)> {
    let kind = GossipMsgType::from_code(varint::get(&mut data)?)?;
    let blob = varint::get_block(&mut data)?;
    let (hub, forward) = match kind {
        GossipMsgType::Announcement => dock.hubs.import_hub_info(Some(&blob), None)?,
        GossipMsgType::Status => dock.hubs.import_hub_info(None, Some(&blob))?,
    };
    debug!("imported {:?} of hub {}", kind, hub.id);
    Ok((kind, blob, forward))
}

pub(crate) fn factory() -> OperationFactory {
    OperationFactory {
        op_type: OP_TYPE,
        requires: Permission::IS_CRANE_CONTROLLER,
        start: start_remote,
    }
}

pub(crate) fn query_factory() -> OperationFactory {
    OperationFactory {
        op_type: QUERY_OP_TYPE,
        requires: Permission::IS_CRANE_CONTROLLER,
        start: start_remote_query,
    }
}

fn start_remote(terminal: &Arc<Terminal>, id: u32, _data: Bytes) -> Result<Arc<dyn Operation>> {
    let crane = terminal
        .crane()
        .ok_or_else(|| ErrorKind::IncorrectUsage.with("gossip needs a crane"))?;
    let op = GossipOp::new(terminal, &crane, id);
    crane.set_gossip_op(op.clone())?;
    Ok(op)
}

/// Start gossiping on `crane`.
pub async fn start_gossip(crane: &Arc<Crane>) -> Result<()> {
    let terminal = controller(crane)?;
    let op = GossipOp::new(&terminal, crane, terminal.next_operation_id());
    crane.set_gossip_op(op.clone())?;
    if let Err(e) = terminal.start_operation(op.clone(), &[]).await {
        crane.clear_gossip_op(op.id);
        return Err(e);
    }
    Ok(())
}

/// Send a hub message to every crane that gossips, except the crane with
/// ID `except`. Returns the number of cranes it was sent to.
pub fn broadcast(dock: &Dock, kind: GossipMsgType, blob: &[u8], except: Option<&str>) -> usize {
    let mut sent = 0;
    for crane in dock.cranes.all() {
        if except == Some(crane.id()) {
            continue;
        }
        if let Some(op) = crane.gossip_op() {
            op.send_msg(kind, blob);
            sent += 1;
        }
    }
    sent
}

/// Long-lived gossip operation of one crane.
pub struct GossipOp {
    id: u32,
    terminal: Arc<Terminal>,
    crane: Weak<Crane>,
}

impl GossipOp {
    fn new(terminal: &Arc<Terminal>, crane: &Arc<Crane>, id: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            terminal: terminal.clone(),
            crane: Arc::downgrade(crane),
        })
    }

    pub(crate) fn id_matches(&self, op_id: u32) -> bool {
        self.id == op_id
    }

    /// Queue a hub message for the peer.
    pub fn send_msg(&self, kind: GossipMsgType, blob: &[u8]) {
        let terminal = self.terminal.clone();
        let id = self.id;
        let msg = encode_msg(kind, blob);
        tokio::spawn(async move {
            if let Err(e) = terminal.send_op_data(id, msg).await {
                terminal.end_operation(id, Some(e));
            }
        });
    }
}

impl Operation for GossipOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        let dock = self.terminal.dock();
        let (kind, blob, forward) = match import_msg(dock, data) {
            Ok(imported) => imported,
            Err(e) if e.is(ErrorKind::UnexpectedMsgType) => return Err(e),
            Err(e) => {
                // A bad hub message is the hub's fault, not the peer's.
                warn!("{}: failed to import gossip: {}", self.terminal.fmt_id(), e);
                return Ok(());
            }
        };
        if !forward {
            return Ok(());
        }

        let own_id = self.crane.upgrade().map(|c| c.id().to_string());
        broadcast(dock, kind, &blob, own_id.as_deref());
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        if let Some(crane) = self.crane.upgrade() {
            crane.clear_gossip_op(self.id);
            if let Some(e) = err.filter(|e| !e.is_graceful()) {
                info!("crane {}: gossip ended: {}", crane.id(), e);
            }
        }
    }
}

fn start_remote_query(terminal: &Arc<Terminal>, id: u32, _data: Bytes) -> Result<Arc<dyn Operation>> {
    Ok(Arc::new(QueryResponderOp {
        id,
        terminal: terminal.clone(),
    }))
}

/// Fetch all hub messages the peer of `crane` knows. Returns how many were
/// imported.
pub async fn query(crane: &Arc<Crane>) -> Result<usize> {
    let terminal = controller(crane)?;
    let op = Arc::new(QueryOp {
        id: terminal.next_operation_id(),
        terminal: terminal.clone(),
        imported: AtomicUsize::new(0),
        outcome: Outcome::new(),
    });
    terminal.start_operation(op.clone(), &[]).await?;
    let imported = op.outcome.wait().await?;
    debug!("crane {}: gossip query imported {} messages", crane.id(), imported);
    Ok(imported)
}

/// Sends everything we know, then acks.
struct QueryResponderOp {
    id: u32,
    terminal: Arc<Terminal>,
}

impl QueryResponderOp {
    async fn respond(self: Arc<Self>) {
        for (announcement, status) in self.terminal.dock().hubs.export_hub_info() {
            let mut msgs = vec![encode_msg(GossipMsgType::Announcement, &announcement)];
            if let Some(status) = status {
                msgs.push(encode_msg(GossipMsgType::Status, &status));
            }
            for msg in msgs {
                if let Err(e) = self.terminal.send_op_data(self.id, msg).await {
                    self.terminal.end_operation(self.id, Some(e));
                    return;
                }
            }
        }
        self.terminal
            .end_operation(self.id, Some(Error::new(ErrorKind::ExplicitAck)));
    }
}

impl Operation for QueryResponderOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        QUERY_OP_TYPE
    }

    fn deliver(&self, _data: Bytes) -> Result<()> {
        Err(ErrorKind::UnexpectedMsgType.with("gossip query takes no data"))
    }

    fn end(&self, _err: Option<Error>) {}

    fn started(self: Arc<Self>) {
        tokio::spawn(self.respond());
    }
}

struct QueryOp {
    id: u32,
    terminal: Arc<Terminal>,
    imported: AtomicUsize,
    outcome: Outcome<usize>,
}

impl Operation for QueryOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        QUERY_OP_TYPE
    }

    fn deliver(&self, data: Bytes) -> Result<()> {
        match import_msg(self.terminal.dock(), data) {
            Ok(_) => {
                self.imported.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) if e.is(ErrorKind::UnexpectedMsgType) => return Err(e),
            Err(e) => warn!("{}: failed to import queried hub message: {}", self.terminal.fmt_id(), e),
        }
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        let result = match err {
            Some(e) if e.is(ErrorKind::ExplicitAck) => Ok(self.imported.load(Ordering::SeqCst)),
            Some(e) => Err(e),
            None => Err(ErrorKind::Stopping.with("gossip query ended before ack")),
        };
        self.outcome.set(result);
    }
}

//! `publish`: prove our hub identity to the peer and turn the crane into a
//! public lane
//!
//! Both sides prove their hub. The initiator sends its announcement,
//! status and a random challenge. The responder imports the hub info and
//! replies with its own challenge plus a signature over the initiator's.
//! The initiator checks that signature against the hub it believes it is
//! connected to and signs the responder's challenge in turn. If that
//! checks out too, the responder marks its crane public and ends with
//! `ExplicitAck`, on which the initiator does the same.

use super::gossip::{self, GossipMsgType};
use super::{controller, Outcome};
use crate::crane::Crane;
use crate::terminal::{Operation, OperationFactory, Permission, Terminal};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use spn_core::{varint, Error, ErrorKind, Hub, Identity, Result};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub const OP_TYPE: &str = "publish";

const CHALLENGE_SIZE: usize = 32;

type Challenge = [u8; CHALLENGE_SIZE];

pub(crate) fn factory() -> OperationFactory {
    OperationFactory {
        op_type: OP_TYPE,
        requires: Permission::IS_CRANE_CONTROLLER,
        start: start_remote,
    }
}

fn new_challenge() -> Result<Challenge> {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    OsRng
        .try_fill_bytes(&mut challenge)
        .map_err(|e| ErrorKind::InternalError.with(e.to_string()))?;
    Ok(challenge)
}

fn take_challenge(data: &mut Bytes) -> Result<Challenge> {
    let block = varint::get_block(data)?;
    block
        .as_ref()
        .try_into()
        .map_err(|_| ErrorKind::MalformedData.with("publish challenge has wrong size"))
}

fn start_remote(terminal: &Arc<Terminal>, id: u32, mut data: Bytes) -> Result<Arc<dyn Operation>> {
    let announcement = varint::get_block(&mut data)?;
    let status = varint::get_block(&mut data)?;
    let their_challenge = take_challenge(&mut data)?;
    let dock = terminal.dock();
    let identity = dock
        .identity
        .clone()
        .ok_or_else(|| ErrorKind::HubNotReady.with("no identity to answer publish"))?;

    let (hub, forward) = dock.hubs.import_hub_info(Some(&announcement), Some(&status))?;
    if forward {
        let except = terminal.crane().map(|c| c.id().to_string());
        gossip::broadcast(dock, GossipMsgType::Announcement, &announcement, except.as_deref());
        gossip::broadcast(dock, GossipMsgType::Status, &status, except.as_deref());
    }

    Ok(Arc::new(VerifierOp {
        id,
        terminal: terminal.clone(),
        hub,
        challenge: new_challenge()?,
        response: identity.sign(&their_challenge),
    }))
}

/// Publish our hub on `crane`. Returns once the peer confirmed.
pub async fn publish(crane: &Arc<Crane>) -> Result<()> {
    let identity = crane
        .dock()
        .identity
        .clone()
        .ok_or_else(|| ErrorKind::HubNotReady.with("no identity to publish"))?;
    let terminal = controller(crane)?;
    let challenge = new_challenge()?;

    let mut init = BytesMut::new();
    varint::put_block(&mut init, &identity.announcement_blob());
    varint::put_block(&mut init, &identity.status_blob());
    varint::put_block(&mut init, &challenge);

    let op = Arc::new(PublishOp {
        id: terminal.next_operation_id(),
        terminal: terminal.clone(),
        crane: Arc::downgrade(crane),
        identity,
        challenge,
        verified: Mutex::new(None),
        outcome: Outcome::new(),
    });
    terminal.start_operation(op.clone(), &init).await?;
    op.outcome.wait().await
}

/// Initiator: checks the peer's proof and answers its challenge.
struct PublishOp {
    id: u32,
    terminal: Arc<Terminal>,
    crane: Weak<Crane>,
    identity: Arc<Identity>,
    challenge: Challenge,
    /// The connected hub, once it signed our challenge.
    verified: Mutex<Option<Arc<Hub>>>,
    outcome: Outcome<()>,
}

impl PublishOp {
    fn verify_peer(&self, crane: &Crane, signature: &[u8]) -> Result<Arc<Hub>> {
        let hub = crane
            .connected_hub()
            .ok_or_else(|| ErrorKind::HubNotReady.with("publishing to unknown hub"))?;
        hub.verify_signature(&self.challenge, signature)
            .map_err(|e| e.wrap(format!("hub {} failed publish challenge", hub.id)))?;
        Ok(hub)
    }
}

impl Operation for PublishOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, mut data: Bytes) -> Result<()> {
        let their_challenge = take_challenge(&mut data)?;
        let signature = varint::get_block(&mut data)?;
        let crane = self
            .crane
            .upgrade()
            .ok_or_else(|| ErrorKind::Stopping.with("crane stopped"))?;

        let hub = match self.verify_peer(&crane, &signature) {
            Ok(hub) => hub,
            Err(e) => {
                warn!("crane {}: {}", crane.id(), e);
                self.outcome.set(Err(e.clone()));
                return Err(e);
            }
        };
        crane.mark_authenticated();
        *self.verified.lock() = Some(hub);

        let response = Bytes::from(self.identity.sign(&their_challenge));
        let terminal = self.terminal.clone();
        let id = self.id;
        tokio::spawn(async move {
            if let Err(e) = terminal.send_op_data(id, response).await {
                terminal.end_operation(id, Some(e));
            }
        });
        Ok(())
    }

    fn end(&self, err: Option<Error>) {
        let result = match err {
            Some(e) if e.is(ErrorKind::ExplicitAck) => {
                let verified = self.verified.lock().take();
                match (self.crane.upgrade(), verified) {
                    (Some(crane), Some(hub)) => {
                        crane.mark_public(hub);
                        Ok(())
                    }
                    (Some(crane), None) => {
                        debug!("crane {}: publish acked without proof", crane.id());
                        Err(ErrorKind::Integrity.with("peer acked publish without proving its hub"))
                    }
                    (None, _) => Err(ErrorKind::Stopping.with("crane stopped")),
                }
            }
            Some(e) => Err(e),
            None => Err(ErrorKind::Stopping.with("publish ended before ack")),
        };
        self.outcome.set(result);
    }
}

/// Responder: proves our hub, then checks the initiator's signature.
struct VerifierOp {
    id: u32,
    terminal: Arc<Terminal>,
    hub: Arc<Hub>,
    challenge: Challenge,
    /// Our signature over the initiator's challenge.
    response: Vec<u8>,
}

impl Operation for VerifierOp {
    fn id(&self) -> u32 {
        self.id
    }

    fn op_type(&self) -> &'static str {
        OP_TYPE
    }

    fn deliver(&self, signature: Bytes) -> Result<()> {
        self.hub
            .verify_signature(&self.challenge, &signature)
            .map_err(|e| e.wrap(format!("hub {} failed publish challenge", self.hub.id)))?;
        let crane = self
            .terminal
            .crane()
            .ok_or_else(|| ErrorKind::Stopping.with("crane stopped"))?;
        crane.mark_authenticated();
        crane.mark_public(self.hub.clone());
        info!(
            "crane {}: hub {} ({}) published",
            crane.id(),
            self.hub.id,
            self.hub.announcement.name
        );
        self.terminal
            .end_operation(self.id, Some(Error::new(ErrorKind::ExplicitAck)));
        Ok(())
    }

    fn end(&self, _err: Option<Error>) {}

    fn started(self: Arc<Self>) {
        let mut reply = BytesMut::new();
        varint::put_block(&mut reply, &self.challenge);
        varint::put_block(&mut reply, &self.response);
        let reply = reply.freeze();
        tokio::spawn(async move {
            if let Err(e) = self.terminal.send_op_data(self.id, reply).await {
                self.terminal.end_operation(self.id, Some(e));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        let factory = factory();
        assert_eq!(factory.op_type, OP_TYPE);
        assert_eq!(factory.requires, Permission::IS_CRANE_CONTROLLER);
    }

    #[test]
    fn test_take_challenge() {
        let challenge = new_challenge().unwrap();
        let mut data = BytesMut::new();
        varint::put_block(&mut data, &challenge);
        varint::put_block(&mut data, &challenge[..8]);
        let mut data = data.freeze();

        assert_eq!(take_challenge(&mut data).unwrap(), challenge);
        assert!(take_challenge(&mut data)
            .unwrap_err()
            .is(ErrorKind::MalformedData));
    }
}

//! Crane handshake
//!
//! Before the controller exists, shipments are plaintext and carry
//! `varint(tag) || body`. The initiator may ask for runtime info, a
//! signature proving the hub identity, or the hub's signed messages any
//! number of times, and then starts the crane with the controller's init
//! data, wrapped in a Wire-V1 letter unless the ship is secure.

use super::Crane;
use crate::shipment::{HandshakeTag, ShipmentCodec};
use crate::ships::Ship;
use crate::terminal::{Permission, Terminal, TerminalOpts};
use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use spn_core::hub::now_unix;
use spn_core::jess::{Opener, Sealer, Session};
use spn_core::{varint, Error, ErrorKind, Hub, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info};

/// What a hub tells about itself before a crane is started.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub hub_id: Option<String>,
    pub time: u64,
    pub cranes: usize,
    pub public_hub: bool,
}

type CraneSession = (Option<Sealer>, Option<Opener>);

impl Crane {
    /// Next plaintext shipment during the handshake.
    async fn next_init_shipment(&self) -> Result<Bytes> {
        let mut unloading = self.unloading_rx.lock().await;
        match tokio::time::timeout(self.dock.config.handshake_timeout, unloading.recv()).await {
            Ok(Some(shipment)) => Ok(shipment),
            Ok(None) => Err(ErrorKind::ShipSunk.with("ship sunk during handshake")),
            Err(_) => Err(ErrorKind::Timeout.with("crane handshake")),
        }
    }

    pub(super) async fn start_client(self: &Arc<Self>) -> Result<CraneSession> {
        let has_key = self
            .connected_hub()
            .map(|hub| hub.select_exchange_key().is_some())
            .unwrap_or(false);
        if !self.ship.is_secure() && !has_key {
            self.request_hub_info().await?;
        }

        let opts = TerminalOpts {
            queue_size: self.dock.config.controller_queue_size,
            padding: self.dock.config.controller_padding,
            encrypt: false,
        };
        let (controller, init_data) = Terminal::new_local(
            self.terminal_setup(0, Permission::IS_CRANE_CONTROLLER, true),
            opts,
            None,
        )?;

        let session = if self.ship.is_secure() {
            self.load_raw(HandshakeTag::StartUnencrypted.with_body(&init_data))
                .await?;
            (None, None)
        } else {
            let hub = self
                .connected_hub()
                .ok_or_else(|| ErrorKind::HubNotReady.with("no hub to encrypt crane for"))?;
            let key = hub.select_exchange_key().ok_or_else(|| {
                ErrorKind::HubNotReady.with(format!("no exchange key for hub {}", hub.id))
            })?;
            let (session, letter) = Session::initiate(key, &init_data)?;
            self.load_raw(HandshakeTag::StartEncrypted.with_body(&letter))
                .await?;
            // Only the holder of the exchange key can open our shipments.
            self.mark_authenticated();
            let (sealer, opener) = session.split();
            (Some(sealer), Some(opener))
        };

        self.install_controller(controller)?;
        Ok(session)
    }

    /// Fetch and import the signed messages of the hub on the other end.
    async fn request_hub_info(&self) -> Result<()> {
        self.load_raw(HandshakeTag::RequestHubInfo.with_body(&[]))
            .await?;
        let mut reply = self.next_init_shipment().await?;
        let announcement = varint::get_block(&mut reply)?;
        let status = varint::get_block(&mut reply)?;
        let (hub, _) = self
            .dock
            .hubs
            .import_hub_info(Some(&announcement), Some(&status))?;

        if let Some(expected) = self.connected_hub() {
            if expected.id != hub.id {
                return Err(ErrorKind::Integrity.with(format!(
                    "expected hub {}, ship leads to {}",
                    expected.id, hub.id
                )));
            }
        }
        debug!("crane {}: received hub info of {}", self.id, hub.id);
        self.set_connected_hub(hub);
        Ok(())
    }

    pub(super) async fn start_server(self: &Arc<Self>) -> Result<CraneSession> {
        loop {
            let mut shipment = self.next_init_shipment().await?;
            let tag = HandshakeTag::from_code(varint::get(&mut shipment)?)?;
            match tag {
                HandshakeTag::End => {
                    return Err(ErrorKind::Stopping.with("peer ended handshake"));
                }
                HandshakeTag::Info => {
                    let info = serde_json::to_vec(&self.runtime_info())
                        .map_err(|e| ErrorKind::InternalError.with(e.to_string()))?;
                    self.load_raw(Bytes::from(info)).await?;
                }
                HandshakeTag::Verify => {
                    let identity = self.dock.identity.as_ref().ok_or_else(|| {
                        ErrorKind::HubNotReady.with("no identity to verify")
                    })?;
                    let signature = identity.sign(&shipment);
                    self.load_raw(Bytes::from(signature)).await?;
                }
                HandshakeTag::RequestHubInfo => {
                    let identity = self.dock.identity.as_ref().ok_or_else(|| {
                        ErrorKind::HubNotReady.with("no identity to share")
                    })?;
                    let mut reply = BytesMut::new();
                    varint::put_block(&mut reply, &identity.announcement_blob());
                    varint::put_block(&mut reply, &identity.status_blob());
                    self.load_raw(reply.freeze()).await?;
                }
                HandshakeTag::StartUnencrypted => {
                    if !self.ship.is_secure() {
                        return Err(ErrorKind::Integrity
                            .with("refusing unencrypted crane on insecure ship"));
                    }
                    let controller = Terminal::new_remote(
                        self.terminal_setup(0, Permission::IS_CRANE_CONTROLLER, false),
                        &shipment,
                    )?;
                    self.install_controller(controller)?;
                    return Ok((None, None));
                }
                HandshakeTag::StartEncrypted => {
                    let identity = self.dock.identity.clone().ok_or_else(|| {
                        ErrorKind::HubNotReady.with("no identity to accept encrypted crane")
                    })?;
                    let (session, init_data) = Session::accept(&shipment, &identity)?;
                    let controller = Terminal::new_remote(
                        self.terminal_setup(0, Permission::IS_CRANE_CONTROLLER, false),
                        &init_data,
                    )?;
                    self.install_controller(controller)?;
                    let (sealer, opener) = session.split();
                    return Ok((Some(sealer), Some(opener)));
                }
            }
        }
    }

    fn install_controller(self: &Arc<Self>, controller: Arc<Terminal>) -> Result<()> {
        let crane = Arc::downgrade(self);
        controller.set_abandon_hook(Box::new(move |_, err| {
            if let Some(crane) = crane.upgrade() {
                crane.stop(Some(err.clone()));
            }
        }));
        self.padding.store(
            controller.opts().padding,
            std::sync::atomic::Ordering::SeqCst,
        );
        self.terminals.lock().insert(0, controller.clone());
        self.controller
            .set(controller)
            .map_err(|_| ErrorKind::InternalError.with("controller already set"))
    }

    fn runtime_info(&self) -> RuntimeInfo {
        let identity = self.dock.identity.as_ref();
        RuntimeInfo {
            name: identity
                .map(|i| i.hub().announcement.name.clone())
                .unwrap_or_default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hub_id: identity.map(|i| i.id().to_string()),
            time: now_unix(),
            cranes: self.dock.cranes.len(),
            public_hub: self.dock.config.public_hub,
        }
    }

    /// Ask the hub on the other end of a fresh ship for its runtime info.
    pub async fn query_info(ship: &dyn Ship, timeout: Duration) -> Result<RuntimeInfo> {
        let reply = exchange(ship, HandshakeTag::Info.with_body(&[]), timeout).await?;
        serde_json::from_slice(&reply)
            .map_err(|e| ErrorKind::MalformedData.with(format!("runtime info: {e}")))
    }

    /// Have the hub on the other end of a fresh ship prove it is `hub`.
    pub async fn verify_hub(ship: &dyn Ship, hub: &Hub, timeout: Duration) -> Result<()> {
        let mut challenge = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut challenge)
            .map_err(|e| ErrorKind::InternalError.with(e.to_string()))?;
        let signature = exchange(ship, HandshakeTag::Verify.with_body(&challenge), timeout).await?;
        hub.verify_signature(&challenge, &signature)
            .map_err(|e| e.wrap(format!("hub {} failed verification", hub.id)))?;
        info!("verified hub {} at {}", hub.id, ship.remote_addr());
        Ok(())
    }

    /// Tell the peer we will not start a crane on this ship.
    pub async fn end_handshake(ship: &dyn Ship) -> Result<()> {
        let mut wire = BytesMut::new();
        ShipmentCodec::new().encode(HandshakeTag::End.with_body(&[]), &mut wire)?;
        ship.load(&wire).await
    }
}

/// Send one handshake request on a bare ship and read the reply.
async fn exchange(ship: &dyn Ship, request: Bytes, timeout: Duration) -> Result<Bytes> {
    let mut codec = ShipmentCodec::new();
    let mut wire = BytesMut::new();
    codec.encode(request, &mut wire)?;
    ship.load(&wire).await?;

    let read = async {
        let mut buf = BytesMut::new();
        let mut chunk = vec![0u8; 4096];
        loop {
            if let Some(reply) = codec.decode(&mut buf)? {
                return Ok::<_, Error>(reply);
            }
            let n = ship.unload(&mut chunk).await?;
            buf.extend_from_slice(&chunk[..n]);
        }
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| ErrorKind::Timeout.with("handshake reply"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::dock::Dock;
    use crate::ships::{TestShip, TestShipOptions};
    use crate::terminal::OperationRegistry;
    use spn_core::{HubCache, Identity};

    fn server_dock() -> (Arc<Dock>, Arc<Identity>) {
        let identity = Arc::new(Identity::generate("server").unwrap());
        let dock = Dock::new(
            NetConfig::default(),
            Arc::new(HubCache::new()),
            Some(identity.clone()),
            Arc::new(OperationRegistry::with_defaults()),
        );
        (dock, identity)
    }

    #[tokio::test]
    async fn test_info_and_verify() {
        let (dock, identity) = server_dock();
        let (client, server) = TestShip::pair(TestShipOptions::default());
        let crane = Crane::new(dock, Arc::new(server), None);
        let handle = tokio::spawn(async move { crane.start().await });

        let info = Crane::query_info(&client, Duration::from_secs(1)).await.unwrap();
        assert_eq!(info.name, "server");
        assert_eq!(info.hub_id, Some(identity.id().to_string()));
        assert!(!info.public_hub);

        Crane::verify_hub(&client, &identity.hub(), Duration::from_secs(1))
            .await
            .unwrap();
        let other = Identity::generate("other").unwrap();
        let err = Crane::verify_hub(&client, &other.hub(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Integrity));

        Crane::end_handshake(&client).await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::Stopping));
    }

    #[tokio::test]
    async fn test_unencrypted_refused_on_insecure_ship() {
        let (dock, _) = server_dock();
        let (client, server) = TestShip::pair(TestShipOptions {
            secure: false,
            ..Default::default()
        });
        let crane = Crane::new(dock, Arc::new(server), None);
        let handle = tokio::spawn({
            let crane = crane.clone();
            async move { crane.start().await }
        });

        let init = TerminalOpts::default().encode().unwrap();
        let mut wire = BytesMut::new();
        ShipmentCodec::new()
            .encode(HandshakeTag::StartUnencrypted.with_body(&init), &mut wire)
            .unwrap();
        client.load(&wire).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::Integrity));
        assert!(crane.is_stopped());
    }
}

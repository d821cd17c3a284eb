//! Dock: the services every crane is built with

use crate::config::NetConfig;
use crate::crane::CraneRegistry;
use crate::terminal::OperationRegistry;
use spn_core::{HubId, HubInfoImporter, Identity};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Crane lifecycle changes, for whoever keeps track of the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CraneEvent {
    /// The crane finished its handshake.
    Started {
        crane_id: String,
        hub: Option<HubId>,
    },
    /// The crane was published and assigned to its hub.
    Public { crane_id: String, hub: HubId },
    /// The crane stopped.
    Stopped {
        crane_id: String,
        hub: Option<HubId>,
    },
}

/// Collaborators shared by all cranes of a process.
pub struct Dock {
    /// Our own hub identity. Required to accept encrypted cranes and
    /// terminals.
    pub identity: Option<Arc<Identity>>,
    /// Where hub messages from the network are imported to
    pub hubs: Arc<dyn HubInfoImporter>,
    pub cranes: CraneRegistry,
    pub operations: Arc<OperationRegistry>,
    pub config: NetConfig,
    events: broadcast::Sender<CraneEvent>,
}

impl Dock {
    /// Build a dock. The operation registry is locked.
    pub fn new(
        config: NetConfig,
        hubs: Arc<dyn HubInfoImporter>,
        identity: Option<Arc<Identity>>,
        operations: Arc<OperationRegistry>,
    ) -> Arc<Self> {
        operations.lock();
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            identity,
            hubs,
            cranes: CraneRegistry::new(),
            operations,
            config,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CraneEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: CraneEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

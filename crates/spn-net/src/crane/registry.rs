//! Crane registry

use super::Crane;
use parking_lot::RwLock;
use spn_core::HubId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Running cranes by crane ID, and the crane assigned to each connected
/// hub.
#[derive(Default)]
pub struct CraneRegistry {
    cranes: RwLock<HashMap<String, Arc<Crane>>>,
    assigned: RwLock<HashMap<HubId, Arc<Crane>>>,
}

impl CraneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, crane: &Arc<Crane>) {
        self.cranes.write().insert(crane.id().to_string(), crane.clone());
    }

    /// Remove a crane and any hub assignment pointing to it.
    pub fn unregister(&self, crane: &Crane) {
        self.cranes.write().remove(crane.id());
        self.assigned.write().retain(|_, c| c.id() != crane.id());
    }

    /// Make `crane` the crane to reach `hub` through. Replaces a previous
    /// assignment.
    pub fn assign(&self, hub: HubId, crane: &Arc<Crane>) {
        if let Some(previous) = self.assigned.write().insert(hub, crane.clone()) {
            if previous.id() != crane.id() {
                debug!("crane {} replaces crane {} for hub {}", crane.id(), previous.id(), hub);
            }
        }
    }

    pub fn get(&self, crane_id: &str) -> Option<Arc<Crane>> {
        self.cranes.read().get(crane_id).cloned()
    }

    pub fn get_assigned(&self, hub: &HubId) -> Option<Arc<Crane>> {
        self.assigned.read().get(hub).cloned()
    }

    pub fn assigned(&self) -> Vec<Arc<Crane>> {
        self.assigned.read().values().cloned().collect()
    }

    pub fn all(&self) -> Vec<Arc<Crane>> {
        self.cranes.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cranes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cranes.read().is_empty()
    }
}

//! Operations and the operation registry

use super::{Permission, Terminal};
use bytes::Bytes;
use parking_lot::RwLock;
use spn_core::{Error, ErrorKind, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A stateful dialog between two terminals.
///
/// Operations are driven by their terminal: `deliver` runs on the terminal
/// handler and must not block. Longer work is spawned from `started`.
pub trait Operation: Send + Sync {
    fn id(&self) -> u32;

    fn op_type(&self) -> &'static str;

    /// Handle data sent by the peer operation.
    fn deliver(&self, data: Bytes) -> Result<()>;

    /// Called exactly once when the operation ends.
    ///
    /// `err` is set when the end was caused by the peer or by the terminal
    /// being abandoned; an operation ending itself sees `None`.
    fn end(&self, err: Option<Error>);

    /// Called once the operation is registered on its terminal.
    fn started(self: Arc<Self>) {}
}

/// Builds the responding side of an operation from its init data.
pub type StartFn = fn(&Arc<Terminal>, u32, Bytes) -> Result<Arc<dyn Operation>>;

/// A registered operation type.
#[derive(Clone)]
pub struct OperationFactory {
    pub op_type: &'static str,
    /// Permissions the terminal needs before the peer may start this op.
    pub requires: Permission,
    pub start: StartFn,
}

/// Operation types known to this process. Frozen with [`lock`] before any
/// crane starts.
///
/// [`lock`]: OperationRegistry::lock
#[derive(Default)]
pub struct OperationRegistry {
    factories: RwLock<HashMap<&'static str, OperationFactory>>,
    locked: AtomicBool,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all built-in operations.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for factory in crate::ops::builtin() {
            // Fresh registry: neither locked nor holding duplicates.
            let _ = registry.register(factory);
        }
        registry
    }

    pub fn register(&self, factory: OperationFactory) -> Result<()> {
        if self.locked.load(Ordering::SeqCst) {
            return Err(ErrorKind::IncorrectUsage.with(format!(
                "registry is locked, cannot register {}",
                factory.op_type
            )));
        }
        let mut factories = self.factories.write();
        if factories.contains_key(factory.op_type) {
            return Err(ErrorKind::IncorrectUsage.with(format!(
                "operation {} is already registered",
                factory.op_type
            )));
        }
        factories.insert(factory.op_type, factory);
        Ok(())
    }

    /// Freeze the registry.
    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    pub fn get(&self, op_type: &str) -> Option<OperationFactory> {
        self.factories.read().get(op_type).cloned()
    }

    pub fn op_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.read().keys().copied().collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuse(_: &Arc<Terminal>, _: u32, _: Bytes) -> Result<Arc<dyn Operation>> {
        Err(ErrorKind::InternalError.into())
    }

    #[test]
    fn test_register_and_lock() {
        let registry = OperationRegistry::new();
        let factory = OperationFactory {
            op_type: "test/refuse",
            requires: Permission::MAY_TUNNEL,
            start: refuse,
        };
        registry.register(factory.clone()).unwrap();
        assert!(registry.register(factory.clone()).is_err());

        registry.lock();
        let err = registry
            .register(OperationFactory {
                op_type: "test/other",
                ..factory
            })
            .unwrap_err();
        assert!(err.is(ErrorKind::IncorrectUsage));
        assert_eq!(
            registry.get("test/refuse").unwrap().requires,
            Permission::MAY_TUNNEL
        );
        assert!(registry.get("test/other").is_none());
    }

    #[test]
    fn test_defaults() {
        let registry = OperationRegistry::with_defaults();
        assert!(!registry.is_locked());
        for op_type in ["expand", "gossip", "gossip/query", "capacity", "latency", "publish", "debug/count"] {
            assert!(registry.get(op_type).is_some(), "{op_type} missing");
        }
    }
}

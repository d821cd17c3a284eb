//! Built-in operations

pub mod capacity;
pub mod counter;
pub mod expand;
pub mod gossip;
pub mod latency;
pub mod publish;

use crate::crane::Crane;
use crate::terminal::{OperationFactory, Terminal};
use spn_core::{ErrorKind, Result};
use std::sync::Arc;
use tokio::sync::watch;

/// Factories of all operations every dock knows.
pub fn builtin() -> Vec<OperationFactory> {
    vec![
        expand::factory(),
        gossip::factory(),
        gossip::query_factory(),
        capacity::factory(),
        latency::factory(),
        publish::factory(),
        counter::factory(),
    ]
}

/// The controller terminal of a started crane.
pub(crate) fn controller(crane: &Crane) -> Result<Arc<Terminal>> {
    crane
        .controller()
        .ok_or_else(|| ErrorKind::NoSession.with(format!("crane {} has no controller", crane.id())))
}

/// Outcome of an operation, set once and awaited by whoever started it.
pub(crate) struct Outcome<T: Clone> {
    tx: watch::Sender<Option<Result<T>>>,
}

impl<T: Clone> Outcome<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Set the outcome. Later calls are ignored.
    pub(crate) fn set(&self, result: Result<T>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
    }

    pub(crate) fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) async fn wait(&self) -> Result<T> {
        let mut rx = self.tx.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ErrorKind::InternalError.with("operation outcome dropped"))?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(ErrorKind::InternalError.with("operation outcome missing")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outcome_set_once() {
        let outcome = Outcome::new();
        assert!(!outcome.is_set());
        outcome.set(Ok(1u32));
        outcome.set(Err(ErrorKind::Timeout.into()));
        assert!(outcome.is_set());
        assert_eq!(outcome.wait().await.unwrap(), 1);
    }
}

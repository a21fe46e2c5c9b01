//! Single-shot hand-off from an HTTP callback to the task waiting on the flow.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;

/// Producer half. Clones share the same slot; only the first
/// [`Completion::complete`] delivers a value.
pub struct Completion<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Creates a completion slot and the receiver the orchestrating task waits on.
pub fn completion<T>() -> (Completion<T>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    let completion = Completion {
        slot: Arc::new(Mutex::new(Some(tx))),
    };
    (completion, rx)
}

impl<T> Completion<T> {
    /// Delivers `value` to the receiver.
    ///
    /// Returns `false` if a value was already delivered or the receiver is gone;
    /// `value` is dropped in that case.
    pub fn complete(&self, value: T) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

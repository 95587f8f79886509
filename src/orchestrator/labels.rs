//! Per-label serialization of credential creation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per label currently being created.
#[derive(Default)]
pub(crate) struct LabelLocks {
    held: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LabelLocks {
    /// Wait until no other creation of `label` is in flight.
    pub(crate) async fn lock(&self, label: &str) -> LabelGuard<'_> {
        let entry = self
            .held
            .lock()
            .entry(label.to_string())
            .or_default()
            .clone();
        let guard = entry.lock_owned().await;
        LabelGuard {
            locks: self,
            label: label.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.held.lock().len()
    }
}

pub(crate) struct LabelGuard<'a> {
    locks: &'a LabelLocks,
    label: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LabelGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut held = self.locks.held.lock();
        // Only the map still references an entry nobody waits on.
        if held
            .get(&self.label)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            held.remove(&self.label);
        }
    }
}

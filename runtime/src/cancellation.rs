//! In-flight effects registered under cancellation ids.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use composable_arch_core::EffectId;
use futures::future::AbortHandle;
use parking_lot::Mutex;

use crate::metrics::EffectMetrics;

/// Abort handles of running cancellable effects, grouped by id.
#[derive(Default)]
pub(crate) struct CancellationRegistry {
    entries: Mutex<HashMap<EffectId, HashMap<u64, AbortHandle>>>,
    next_key: AtomicU64,
}

impl CancellationRegistry {
    /// Track `handle` under `id` until the returned guard drops.
    pub(crate) fn register(self: &Arc<Self>, id: EffectId, handle: AbortHandle) -> Registration {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .entry(id.clone())
            .or_default()
            .insert(key, handle);
        Registration {
            registry: Arc::clone(self),
            id,
            key,
        }
    }

    /// Abort everything running under `id`. Returns how many effects were
    /// signalled.
    pub(crate) fn cancel(&self, id: &EffectId) -> usize {
        let Some(handles) = self.entries.lock().remove(id) else {
            tracing::trace!(?id, "Cancel requested for an id with nothing in flight");
            return 0;
        };
        for handle in handles.values() {
            handle.abort();
        }
        tracing::debug!(?id, cancelled = handles.len(), "Cancelled in-flight effects");
        EffectMetrics::record_cancelled(handles.len());
        handles.len()
    }

    /// How many effects are running under `id`.
    pub(crate) fn in_flight(&self, id: &EffectId) -> usize {
        self.entries.lock().get(id).map_or(0, HashMap::len)
    }

    /// Abort every registered effect.
    pub(crate) fn cancel_all(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for handle in entries.values().flat_map(HashMap::values) {
            handle.abort();
        }
    }

    fn unregister(&self, id: &EffectId, key: u64) {
        let mut entries = self.entries.lock();
        if let Some(handles) = entries.get_mut(id) {
            handles.remove(&key);
            if handles.is_empty() {
                entries.remove(id);
            }
        }
    }
}

/// Removes a registration when the effect finishes or is dropped.
pub(crate) struct Registration {
    registry: Arc<CancellationRegistry>,
    id: EffectId,
    key: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.id, self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_aborts_and_clears_every_handle_under_id() {
        let registry = Arc::new(CancellationRegistry::default());
        let (first, _first_reg) = AbortHandle::new_pair();
        let (second, _second_reg) = AbortHandle::new_pair();
        let _a = registry.register(EffectId::new("timer"), first.clone());
        let _b = registry.register(EffectId::new("timer"), second.clone());

        assert_eq!(registry.in_flight(&EffectId::new("timer")), 1);
        assert_eq!(registry.cancel(&EffectId::new("timer")), 2);
        assert!(first.is_aborted());
        assert!(second.is_aborted());

        // Idempotent
        assert_eq!(registry.cancel(&EffectId::new("timer")), 0);
        assert_eq!(registry.in_flight(&EffectId::new("timer")), 0);
    }

    #[test]
    fn dropping_registration_unregisters() {
        let registry = Arc::new(CancellationRegistry::default());
        let (handle, _reg) = AbortHandle::new_pair();
        let registration = registry.register(EffectId::new(1_u8), handle.clone());
        drop(registration);

        assert_eq!(registry.in_flight(&EffectId::new(1_u8)), 0);
        assert_eq!(registry.cancel(&EffectId::new(1_u8)), 0);
        assert!(!handle.is_aborted());
    }
}

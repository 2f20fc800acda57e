//! The persistence contract and the cache that deduplicates persisted
//! references.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use composable_arch_core::DependencyKey;
use parking_lot::Mutex;

/// Called with a freshly loaded value when the backing store changes
/// outside this process, or `None` when the value could not be loaded.
pub type DidSet<V> = Box<dyn Fn(Option<V>) + Send + Sync>;

/// Where and how a [`Shared`](crate::Shared) value is persisted.
pub trait PersistenceKey<V>: Send + Sync + 'static {
    /// Identity of the stored value. References created with keys whose
    /// ids are equal share storage.
    fn cache_id(&self) -> CacheId;

    /// Read the stored value, or return `initial` when nothing usable is
    /// stored.
    fn load(&self, initial: Option<&V>) -> Option<V>;

    /// Persist `value`. Implementations may coalesce rapid saves.
    fn save(&self, value: &V);

    /// Observe changes made by someone else. The default never reports any.
    fn subscribe(&self, initial: Option<V>, did_set: DidSet<V>) -> Subscription {
        let _ = (initial, did_set);
        Subscription::empty()
    }
}

/// Identity of a persisted value: the key type plus a key-specific id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheId {
    kind: TypeId,
    kind_name: &'static str,
    id: String,
}

impl CacheId {
    /// An id for keys of type `K`.
    pub fn new<K: 'static>(id: impl Into<String>) -> Self {
        Self {
            kind: TypeId::of::<K>(),
            kind_name: std::any::type_name::<K>(),
            id: id.into(),
        }
    }

    /// The key-specific part of the id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Debug for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind_name, self.id)
    }
}

/// A cancellation token. The registration it stands for ends when it drops.
pub struct Subscription(Option<Box<dyn FnOnce() + Send>>);

impl Subscription {
    /// A subscription that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// A subscription with nothing to cancel.
    #[must_use]
    pub const fn empty() -> Self {
        Self(None)
    }

    /// End the registration now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.0.is_some())
            .finish()
    }
}

/// Live persisted references, weakly held by cache id.
///
/// A reference stays in the cache while anyone holds a `Shared` to it, so
/// independent features constructing the same key observe each other.
#[derive(Default)]
pub struct PersistentReferences {
    entries: Mutex<HashMap<CacheId, Weak<dyn Any + Send + Sync>>>,
}

impl PersistentReferences {
    /// The live reference for `id`, if any.
    pub(crate) fn get<T>(&self, id: &CacheId) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.entries
            .lock()
            .get(id)
            .and_then(Weak::upgrade)
            .and_then(|reference| reference.downcast::<T>().ok())
    }

    /// The live reference for `id`, or the one built by `create`.
    pub(crate) fn get_or_insert<T>(&self, id: CacheId, create: impl FnOnce() -> Arc<T>) -> Arc<T>
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries
            .get(&id)
            .and_then(Weak::upgrade)
            .and_then(|reference| reference.downcast::<T>().ok())
        {
            return existing;
        }

        let created = create();
        let erased: Arc<dyn Any + Send + Sync> = created.clone();
        entries.retain(|_, entry| entry.strong_count() > 0);
        entries.insert(id, Arc::downgrade(&erased));
        created
    }

    /// Number of references currently alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }

    /// Whether no reference is alive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PersistentReferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentReferences")
            .field("len", &self.len())
            .finish()
    }
}

/// The reference cache in scope. Each root dependency scope gets its own,
/// so tests never share persisted references.
pub struct PersistentReferencesKey;

impl DependencyKey for PersistentReferencesKey {
    type Value = Arc<PersistentReferences>;

    fn live_value() -> Option<Self::Value> {
        Some(Arc::default())
    }

    fn test_value() -> Option<Self::Value> {
        Some(Arc::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn cache_returns_live_reference_and_forgets_dropped_ones() {
        let references = PersistentReferences::default();
        let first = references.get_or_insert(CacheId::new::<u8>("a"), || Arc::new(1_u32));
        let second = references.get_or_insert(CacheId::new::<u8>("a"), || Arc::new(2_u32));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(references.len(), 1);

        drop(first);
        drop(second);
        assert!(references.is_empty());

        let third = references.get_or_insert(CacheId::new::<u8>("a"), || Arc::new(3_u32));
        assert_eq!(*third, 3);
    }

    #[test]
    fn ids_of_different_key_types_differ() {
        assert_ne!(CacheId::new::<u8>("a"), CacheId::new::<u16>("a"));
        assert_eq!(CacheId::new::<u8>("a").id(), "a");
    }

    #[test]
    fn subscription_cancels_once() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let subscription = Subscription::new(move || flag.store(true, Ordering::SeqCst));
        subscription.cancel();
        assert!(cancelled.load(Ordering::SeqCst));
    }
}

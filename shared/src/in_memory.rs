//! Process-local persistence.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use composable_arch_core::{DependencyKey, DependencyValues};
use parking_lot::Mutex;

use crate::persistence::{CacheId, PersistenceKey};

/// Values saved by [`InMemoryKey`]s, by name.
///
/// Values outlive the references that wrote them, so a reference created
/// again later under the same name picks up where the last one left off.
#[derive(Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, Box<dyn Any + Send>>>,
}

impl InMemoryStorage {
    /// Forget every stored value.
    pub fn clear(&self) {
        self.values.lock().clear();
    }

    /// Whether a value is stored under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.lock().contains_key(name)
    }
}

impl fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("len", &self.values.lock().len())
            .finish()
    }
}

/// The in-memory storage in scope.
pub struct InMemoryStorageKey;

impl DependencyKey for InMemoryStorageKey {
    type Value = Arc<InMemoryStorage>;

    fn live_value() -> Option<Self::Value> {
        Some(Arc::default())
    }

    fn test_value() -> Option<Self::Value> {
        Some(Arc::default())
    }
}

/// Persists a value in memory under a name, for the life of the process
/// (or of the dependency scope that owns the storage).
pub struct InMemoryKey<V> {
    name: String,
    storage: Arc<InMemoryStorage>,
    _value: PhantomData<fn() -> V>,
}

impl<V> InMemoryKey<V> {
    /// A key for `name` in the in-memory storage in scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_storage(name, DependencyValues::current().get::<InMemoryStorageKey>())
    }

    /// A key for `name` in `storage`.
    pub fn with_storage(name: impl Into<String>, storage: Arc<InMemoryStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
            _value: PhantomData,
        }
    }
}

impl<V> fmt::Debug for InMemoryKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InMemoryKey").field(&self.name).finish()
    }
}

impl<V> PersistenceKey<V> for InMemoryKey<V>
where
    V: Clone + Send + 'static,
{
    fn cache_id(&self) -> CacheId {
        let storage = Arc::as_ptr(&self.storage) as usize;
        CacheId::new::<Self>(format!("{}#{storage:x}", self.name))
    }

    fn load(&self, initial: Option<&V>) -> Option<V> {
        self.storage
            .values
            .lock()
            .get(&self.name)
            .and_then(|value| value.downcast_ref::<V>())
            .cloned()
            .or_else(|| initial.cloned())
    }

    fn save(&self, value: &V) {
        self.storage
            .values
            .lock()
            .insert(self.name.clone(), Box::new(value.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shared;

    #[test]
    fn value_survives_its_last_reference() {
        let storage = Arc::new(InMemoryStorage::default());
        let first = Shared::with_key(0, InMemoryKey::with_storage("count", Arc::clone(&storage)));
        first.set(42);
        drop(first);
        assert!(storage.contains("count"));

        let second = Shared::with_key(0, InMemoryKey::with_storage("count", Arc::clone(&storage)));
        assert_eq!(second.get(), 42);

        storage.clear();
        assert!(!storage.contains("count"));
    }

    #[test]
    fn load_falls_back_to_initial() {
        let key = InMemoryKey::<String>::with_storage("name", Arc::default());
        assert_eq!(key.load(Some(&"initial".to_string())), Some("initial".to_string()));
        assert_eq!(key.load(None), None);
    }
}

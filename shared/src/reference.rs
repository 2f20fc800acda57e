//! The shared reference type.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use composable_arch_core::DependencyValues;
use composable_arch_core::issue::report_issue;
use parking_lot::{Mutex, ReentrantMutex};

use crate::change_tracking::{active_trackers, asserting_tracker};
use crate::persistence::{PersistenceKey, PersistentReferencesKey, Subscription};

/// A mutation notification delivered to [`Shared::observe`] callbacks.
#[derive(Debug, PartialEq, Eq)]
pub enum SharedChange<'a, V> {
    /// The value is about to change from this one.
    WillSet(&'a V),
    /// The value changed to this one.
    DidSet(&'a V),
}

impl<V> Clone for SharedChange<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for SharedChange<'_, V> {}

impl<'a, V> SharedChange<'a, V> {
    /// The value carried by the notification.
    #[must_use]
    pub fn value(self) -> &'a V {
        match self {
            Self::WillSet(value) | Self::DidSet(value) => value,
        }
    }
}

type Observer<V> = Arc<dyn Fn(SharedChange<'_, V>) + Send + Sync>;

/// Storage behind one or more [`Shared`] handles.
pub(crate) struct Reference<V> {
    value: ReentrantMutex<RefCell<V>>,
    observers: Mutex<BTreeMap<u64, Observer<V>>>,
    next_observer: AtomicU64,
    key: Option<Arc<dyn PersistenceKey<V>>>,
    subscription: Mutex<Option<Subscription>>,
    description: String,
}

impl<V> Reference<V>
where
    V: Clone + Send + 'static,
{
    fn new(value: V) -> Arc<Self> {
        Arc::new(Self {
            value: ReentrantMutex::new(RefCell::new(value)),
            observers: Mutex::new(BTreeMap::new()),
            next_observer: AtomicU64::new(0),
            key: None,
            subscription: Mutex::new(None),
            description: format!("Shared<{}>", std::any::type_name::<V>()),
        })
    }

    fn persisted(initial: V, key: Arc<dyn PersistenceKey<V>>) -> Arc<Self> {
        let value = key.load(Some(&initial)).unwrap_or_else(|| initial.clone());
        let description = format!("Shared<{}>@{:?}", std::any::type_name::<V>(), key.cache_id());

        let reference = Arc::new(Self {
            value: ReentrantMutex::new(RefCell::new(value)),
            observers: Mutex::new(BTreeMap::new()),
            next_observer: AtomicU64::new(0),
            key: Some(Arc::clone(&key)),
            subscription: Mutex::new(None),
            description,
        });

        let weak = Arc::downgrade(&reference);
        let fallback = Mutex::new(initial.clone());
        let subscription = key.subscribe(
            Some(initial),
            Box::new(move |loaded: Option<V>| {
                if let Some(reference) = weak.upgrade() {
                    reference.apply_external(loaded.unwrap_or_else(|| fallback.lock().clone()));
                }
            }),
        );
        *reference.subscription.lock() = Some(subscription);
        reference
    }

    pub(crate) fn current(&self) -> V {
        self.value.lock().borrow().clone()
    }

    pub(crate) fn description(&self) -> &str {
        &self.description
    }

    fn read<R>(&self, read: impl FnOnce(&V) -> R) -> R {
        let guard = self.value.lock();
        let value = guard.borrow();
        read(&value)
    }

    /// Mutate the live value, persist it and notify observers. The lock is
    /// held throughout so observers see changes in order.
    fn mutate<R>(&self, mutate: impl FnOnce(&mut V) -> R) -> R {
        let guard = self.value.lock();
        let before = guard.borrow().clone();
        self.notify(SharedChange::WillSet(&before));

        let result = mutate(&mut guard.borrow_mut());

        let after = guard.borrow().clone();
        if let Some(key) = &self.key {
            key.save(&after);
        }
        self.notify(SharedChange::DidSet(&after));
        result
    }

    /// Take a value loaded from the backing store without saving it back.
    fn apply_external(&self, value: V) {
        let guard = self.value.lock();
        let before = guard.replace(value.clone());
        self.notify(SharedChange::WillSet(&before));
        self.notify(SharedChange::DidSet(&value));
    }

    fn notify(&self, change: SharedChange<'_, V>) {
        let observers: Vec<Observer<V>> = self.observers.lock().values().cloned().collect();
        for observer in observers {
            observer(change);
        }
    }

    fn observe(self: &Arc<Self>, observer: Observer<V>) -> Subscription {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(id, observer);

        let weak: Weak<Self> = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(reference) = weak.upgrade() {
                reference.observers.lock().remove(&id);
            }
        })
    }
}

/// A mutable, observable value shared by every holder of a handle.
///
/// Clones are handles to the same storage. A `Shared` created with a
/// [`PersistenceKey`] loads its value from the key, saves every change
/// through it and follows changes made outside the process. Two `Shared`s
/// created with equal keys, while either is alive, are the same reference.
///
/// Access is serialized by a reentrant lock, so a value can be read from an
/// observer callback running on the writing thread. Do not access the same
/// reference from inside [`with_lock`](Self::with_lock).
///
/// # Example
///
/// ```
/// use composable_arch_shared::Shared;
///
/// let count = Shared::new(0);
/// let other = count.clone();
/// other.with_lock(|count| *count += 1);
/// assert_eq!(count.get(), 1);
/// ```
pub struct Shared<V> {
    reference: Arc<Reference<V>>,
}

impl<V> Shared<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    /// A reference holding `value`, not persisted.
    pub fn new(value: V) -> Self {
        Self {
            reference: Reference::new(value),
        }
    }

    /// The reference persisted under `key`, created with `initial` if no
    /// live reference exists for it.
    ///
    /// A new reference takes the stored value when one loads.
    pub fn with_key<K: PersistenceKey<V>>(initial: V, key: K) -> Self {
        let references = DependencyValues::current().get::<PersistentReferencesKey>();
        let reference = references.get_or_insert(key.cache_id(), || {
            tracing::debug!(key = ?key.cache_id(), "Creating persisted shared reference");
            Reference::persisted(initial, Arc::new(key))
        });
        Self { reference }
    }

    /// The reference persisted under `key`, only if it is alive or a stored
    /// value loads.
    pub fn load<K: PersistenceKey<V>>(key: K) -> Option<Self> {
        let references = DependencyValues::current().get::<PersistentReferencesKey>();
        if let Some(reference) = references.get::<Reference<V>>(&key.cache_id()) {
            return Some(Self { reference });
        }
        let stored = key.load(None)?;
        Some(Self::with_key(stored, key))
    }

    /// A copy of the value.
    ///
    /// Inside an asserting change-tracking scope this is the recorded
    /// snapshot, when there is one.
    #[must_use]
    pub fn get(&self) -> V {
        if let Some(snapshot) = asserting_tracker().and_then(|tracker| tracker.snapshot(&self.reference)) {
            return snapshot;
        }
        self.reference.current()
    }

    /// Read the value without cloning it.
    pub fn read<R>(&self, read: impl FnOnce(&V) -> R) -> R {
        if let Some(snapshot) = asserting_tracker().and_then(|tracker| tracker.snapshot(&self.reference)) {
            return read(&snapshot);
        }
        self.reference.read(read)
    }

    /// Replace the value.
    pub fn set(&self, value: V) {
        self.with_lock(|current| *current = value);
    }

    /// Mutate the value in place under the reference's lock.
    ///
    /// Observers are told before and after. A persisted reference saves the
    /// result.
    pub fn with_lock<R>(&self, mutate: impl FnOnce(&mut V) -> R) -> R {
        if let Some(tracker) = asserting_tracker() {
            let mut snapshot = tracker
                .snapshot(&self.reference)
                .unwrap_or_else(|| self.reference.current());
            let result = mutate(&mut snapshot);
            tracker.set_snapshot(&self.reference, Some(snapshot));
            return result;
        }

        for tracker in active_trackers() {
            tracker.record(&self.reference);
        }
        self.reference.mutate(mutate)
    }

    /// Call `observer` before and after every change. Observation ends when
    /// the returned subscription drops.
    pub fn observe(
        &self,
        observer: impl Fn(SharedChange<'_, V>) + Send + Sync + 'static,
    ) -> Subscription {
        self.reference.observe(Arc::new(observer))
    }

    /// Call `did_set` with the new value after every change.
    pub fn on_change(&self, did_set: impl Fn(&V) + Send + Sync + 'static) -> Subscription {
        self.observe(move |change| {
            if let SharedChange::DidSet(value) = change {
                did_set(value);
            }
        })
    }

    /// Assert on the change made to this reference since tracking began.
    ///
    /// `expected` is applied to the value recorded before the change; the
    /// result must equal the live value. Reports an issue when nothing
    /// changed or the values differ. The change counts as asserted either
    /// way.
    #[track_caller]
    pub fn assert(&self, expected: impl FnOnce(&mut V)) {
        let Some(tracker) = active_trackers()
            .into_iter()
            .find(|tracker| tracker.contains(&self.reference))
        else {
            report_issue("Expected changes, but none occurred.");
            return;
        };

        let current = self.reference.current();
        let Some(mut snapshot) = tracker
            .snapshot(&self.reference)
            .filter(|snapshot| *snapshot != current)
        else {
            tracker.set_snapshot::<V>(&self.reference, None);
            report_issue("Expected changes, but none occurred.");
            return;
        };

        expected(&mut snapshot);
        tracker.set_snapshot::<V>(&self.reference, None);
        if snapshot != current {
            report_issue(format!(
                "{} did not change as expected:\n\n{}",
                self.reference.description(),
                pretty_assertions::Comparison::new(&snapshot, &current),
            ));
        }
    }

    /// Whether both handles refer to the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reference, &other.reference)
    }
}

impl<V> Clone for Shared<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V> Default for Shared<V>
where
    V: Default + Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new(V::default())
    }
}

/// Handles to different storage compare by value. A handle compared with
/// itself inside an asserting change-tracking scope compares the recorded
/// snapshot with the live value.
impl<V> PartialEq for Shared<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return asserting_tracker()
                .and_then(|tracker| tracker.snapshot(&self.reference))
                .is_none_or(|snapshot| snapshot == self.reference.current());
        }
        self.get() == other.get()
    }
}

impl<V> fmt::Debug for Shared<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shared").field(&self.get()).finish()
    }
}

/// A read-only handle to a shared value.
///
/// A reader sees every change made through the [`Shared`] it came from but
/// cannot make any. Features that only display a value hold one of these.
///
/// # Example
///
/// ```
/// use composable_arch_shared::{Shared, SharedReader};
///
/// let count = Shared::new(1);
/// let reader: SharedReader<i32> = count.reader();
/// count.set(2);
/// assert_eq!(reader.get(), 2);
/// ```
pub struct SharedReader<V> {
    reference: Arc<Reference<V>>,
}

impl<V> SharedReader<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    /// A reader of a value nobody can change.
    pub fn constant(value: V) -> Self {
        Self {
            reference: Reference::new(value),
        }
    }

    /// A reader of the reference persisted under `key`.
    ///
    /// See [`Shared::with_key`].
    pub fn with_key<K: PersistenceKey<V>>(initial: V, key: K) -> Self {
        Shared::with_key(initial, key).reader()
    }

    /// A copy of the value.
    #[must_use]
    pub fn get(&self) -> V {
        self.as_shared().get()
    }

    /// Read the value without cloning it.
    pub fn read<R>(&self, read: impl FnOnce(&V) -> R) -> R {
        self.as_shared().read(read)
    }

    /// Call `observer` before and after every change.
    pub fn observe(
        &self,
        observer: impl Fn(SharedChange<'_, V>) + Send + Sync + 'static,
    ) -> Subscription {
        self.reference.observe(Arc::new(observer))
    }

    /// Call `did_set` with the new value after every change.
    pub fn on_change(&self, did_set: impl Fn(&V) + Send + Sync + 'static) -> Subscription {
        self.as_shared().on_change(did_set)
    }

    /// Whether both handles refer to the same storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.reference, &other.reference)
    }

    fn as_shared(&self) -> Shared<V> {
        Shared {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V> Shared<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    /// A read-only handle to this reference.
    #[must_use]
    pub fn reader(&self) -> SharedReader<V> {
        SharedReader {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V> From<Shared<V>> for SharedReader<V> {
    fn from(shared: Shared<V>) -> Self {
        Self {
            reference: shared.reference,
        }
    }
}

impl<V> Clone for SharedReader<V> {
    fn clone(&self) -> Self {
        Self {
            reference: Arc::clone(&self.reference),
        }
    }
}

impl<V> PartialEq for SharedReader<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn eq(&self, other: &Self) -> bool {
        self.as_shared() == other.as_shared()
    }
}

impl<V> fmt::Debug for SharedReader<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedReader").field(&self.get()).finish()
    }
}

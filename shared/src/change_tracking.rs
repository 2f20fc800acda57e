//! Change tracking for asserting on shared state in tests.
//!
//! Shared values live outside the state that a test store snapshots, so a
//! write through one is visible in the "before" copy as well. A
//! [`SharedChangeTracker`] fixes that:
//!
//! - While *tracking*, the first write to each reference records the value
//!   it had before.
//! - While *asserting*, reads see that recorded snapshot and writes go to
//!   it instead of the live value, so an expected state can be built and
//!   compared against the live one.
//!
//! Anything tracked but never asserted is reported by
//! [`assert_unchanged`](SharedChangeTracker::assert_unchanged).

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use composable_arch_core::issue::report_issue;
use composable_arch_core::{DependencyKey, DependencyValues};
use parking_lot::Mutex;
use tokio::task::futures::TaskLocalFuture;

use crate::reference::Reference;

trait TrackedChange: Send {
    /// A description of the unasserted change, if the value moved.
    fn unasserted(&self) -> Option<String>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct Change<V> {
    reference: Arc<Reference<V>>,
    snapshot: V,
}

impl<V> TrackedChange for Change<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + 'static,
{
    fn unasserted(&self) -> Option<String> {
        let current = self.reference.current();
        (self.snapshot != current).then(|| {
            format!(
                "Tracked changes to '{}' but failed to assert:\n\n{}\n\nAssert the change with \
                 `Shared::assert`, or include it in the expected state.",
                self.reference.description(),
                pretty_assertions::Comparison::new(&self.snapshot, &current),
            )
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Records the state of shared references before they are written.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct SharedChangeTracker {
    changes: Arc<Mutex<HashMap<usize, Box<dyn TrackedChange>>>>,
}

impl SharedChangeTracker {
    /// A tracker with nothing recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add this tracker to the trackers `values` records writes for.
    pub fn install(&self, values: &mut DependencyValues) {
        let mut trackers = values.try_get::<ChangeTrackersKey>().unwrap_or_default();
        if !trackers.iter().any(|tracker| tracker.ptr_eq(self)) {
            trackers.push(self.clone());
        }
        values.set::<ChangeTrackersKey>(trackers);
    }

    /// Run `operation` with writes to shared references recorded here.
    pub fn track<R>(&self, operation: impl FnOnce() -> R) -> R {
        let mut values = DependencyValues::current();
        self.install(&mut values);
        values.enter(operation)
    }

    /// Async form of [`track`](Self::track).
    pub fn track_async<F: Future>(&self, future: F) -> TaskLocalFuture<DependencyValues, F> {
        let mut values = DependencyValues::current();
        self.install(&mut values);
        values.scope(future)
    }

    /// Run `operation` against the recorded snapshots: reads see them and
    /// writes update them, leaving live values alone.
    pub fn asserting<R>(&self, operation: impl FnOnce() -> R) -> R {
        let mut values = DependencyValues::current();
        values.set::<AssertingTrackerKey>(Some(self.clone()));
        values.enter(operation)
    }

    /// Whether any reference was written since the last reset.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.changes.lock().is_empty()
    }

    /// Forget every recorded change.
    pub fn reset(&self) {
        self.changes.lock().clear();
    }

    /// Report every recorded change whose snapshot differs from the live
    /// value, then reset.
    #[track_caller]
    pub fn assert_unchanged(&self) {
        let changes = std::mem::take(&mut *self.changes.lock());
        for message in changes.values().filter_map(|change| change.unasserted()) {
            report_issue(message);
        }
    }

    /// Whether both handles share a record.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.changes, &other.changes)
    }

    pub(crate) fn contains<V>(&self, reference: &Arc<Reference<V>>) -> bool {
        self.changes.lock().contains_key(&address(reference))
    }

    /// Record the current value of `reference` unless already recorded.
    pub(crate) fn record<V>(&self, reference: &Arc<Reference<V>>)
    where
        V: Clone + PartialEq + fmt::Debug + Send + 'static,
    {
        self.changes
            .lock()
            .entry(address(reference))
            .or_insert_with(|| {
                Box::new(Change {
                    reference: Arc::clone(reference),
                    snapshot: reference.current(),
                })
            });
    }

    pub(crate) fn snapshot<V>(&self, reference: &Arc<Reference<V>>) -> Option<V>
    where
        V: Clone + 'static,
    {
        self.changes
            .lock()
            .get(&address(reference))
            .and_then(|change| change.as_any().downcast_ref::<Change<V>>())
            .map(|change| change.snapshot.clone())
    }

    /// Replace the snapshot of `reference`, recording it first if needed.
    /// `None` drops the record.
    pub(crate) fn set_snapshot<V>(&self, reference: &Arc<Reference<V>>, snapshot: Option<V>)
    where
        V: Clone + PartialEq + fmt::Debug + Send + 'static,
    {
        let mut changes = self.changes.lock();
        let Some(snapshot) = snapshot else {
            changes.remove(&address(reference));
            return;
        };
        let entry = changes.entry(address(reference)).or_insert_with(|| {
            Box::new(Change {
                reference: Arc::clone(reference),
                snapshot: snapshot.clone(),
            })
        });
        if let Some(change) = entry.as_any_mut().downcast_mut::<Change<V>>() {
            change.snapshot = snapshot;
        }
    }
}

impl fmt::Debug for SharedChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedChangeTracker")
            .field("changes", &self.changes.lock().len())
            .finish()
    }
}

fn address<V>(reference: &Arc<Reference<V>>) -> usize {
    Arc::as_ptr(reference).cast::<()>() as usize
}

/// Run `operation` with a fresh tracker recording shared writes.
pub fn with_shared_change_tracking<R>(operation: impl FnOnce(&SharedChangeTracker) -> R) -> R {
    let tracker = SharedChangeTracker::new();
    tracker.track(|| operation(&tracker))
}

/// Trackers recording writes in the current scope.
pub(crate) struct ChangeTrackersKey;

impl DependencyKey for ChangeTrackersKey {
    type Value = Vec<SharedChangeTracker>;

    fn live_value() -> Option<Self::Value> {
        Some(Vec::new())
    }

    fn test_value() -> Option<Self::Value> {
        Some(Vec::new())
    }
}

/// The tracker whose snapshots reads and writes are redirected to.
pub(crate) struct AssertingTrackerKey;

impl DependencyKey for AssertingTrackerKey {
    type Value = Option<SharedChangeTracker>;

    fn live_value() -> Option<Self::Value> {
        Some(None)
    }

    fn test_value() -> Option<Self::Value> {
        Some(None)
    }
}

pub(crate) fn active_trackers() -> Vec<SharedChangeTracker> {
    DependencyValues::current()
        .try_get::<ChangeTrackersKey>()
        .unwrap_or_default()
}

pub(crate) fn asserting_tracker() -> Option<SharedChangeTracker> {
    DependencyValues::current()
        .try_get::<AssertingTrackerKey>()
        .ok()
        .flatten()
}

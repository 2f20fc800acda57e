//! Ordered collections addressed by stable element identity.
//!
//! [`IdentifiedVec`] keeps its elements in order, like a `Vec`, and indexes
//! them by id, like a map. Every element's id is unique and matches the id it
//! is stored under. Storage is copy-on-write, so cloning state that holds a
//! large collection is O(1).

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::{Deref, DerefMut, Index};
use std::sync::Arc;

use indexmap::IndexMap;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A value with a stable identity.
pub trait Identifiable {
    /// The identity type.
    type Id: Clone + Eq + Hash + fmt::Debug;

    /// This value's identity.
    fn id(&self) -> Self::Id;
}

/// Ordered, id-indexed collection of [`Identifiable`] elements.
///
/// # Example
///
/// ```
/// use composable_arch_core::identified::{Identifiable, IdentifiedVec};
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Todo {
///     id: u32,
///     title: String,
/// }
///
/// impl Identifiable for Todo {
///     type Id = u32;
///     fn id(&self) -> u32 {
///         self.id
///     }
/// }
///
/// let mut todos = IdentifiedVec::new();
/// todos.push(Todo { id: 1, title: "Milk".into() });
/// todos.push(Todo { id: 2, title: "Eggs".into() });
///
/// todos.get_mut(&2).unwrap().title = "Bread".into();
/// assert_eq!(todos[1].title, "Bread");
/// assert_eq!(todos.remove(&1).title, "Milk");
/// assert_eq!(todos.len(), 1);
/// ```
pub struct IdentifiedVec<T: Identifiable> {
    elements: Arc<IndexMap<T::Id, T>>,
}

impl<T: Identifiable> IdentifiedVec<T> {
    /// An empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            elements: Arc::new(IndexMap::new()),
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Ids in element order.
    pub fn ids(&self) -> impl Iterator<Item = &T::Id> {
        self.elements.keys()
    }

    /// Elements in order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.elements.values()
    }

    /// The element with `id`.
    #[must_use]
    pub fn get(&self, id: &T::Id) -> Option<&T> {
        self.elements.get(id)
    }

    /// The element at `index`.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&T> {
        self.elements.get_index(index).map(|(_, element)| element)
    }

    /// Position of the element with `id`.
    #[must_use]
    pub fn index_of(&self, id: &T::Id) -> Option<usize> {
        self.elements.get_index_of(id)
    }

    /// Whether an element with `id` is present.
    #[must_use]
    pub fn contains(&self, id: &T::Id) -> bool {
        self.elements.contains_key(id)
    }

    /// First element.
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.get_index(0)
    }

    /// Last element.
    #[must_use]
    pub fn last(&self) -> Option<&T> {
        self.elements.last().map(|(_, element)| element)
    }

    /// Whether both collections share storage, so are trivially equal.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.elements, &other.elements)
    }
}

impl<T> IdentifiedVec<T>
where
    T: Identifiable + Clone,
{
    fn elements_mut(&mut self) -> &mut IndexMap<T::Id, T> {
        Arc::make_mut(&mut self.elements)
    }

    /// Build from `elements`, or return the first duplicated id.
    ///
    /// # Errors
    ///
    /// Returns the id that appears more than once.
    pub fn try_from_elements(elements: impl IntoIterator<Item = T>) -> Result<Self, T::Id> {
        let mut map = IndexMap::new();
        for element in elements {
            let id = element.id();
            if map.contains_key(&id) {
                return Err(id);
            }
            map.insert(id, element);
        }
        Ok(Self {
            elements: Arc::new(map),
        })
    }

    /// Mutable access to the element with `id`.
    ///
    /// The returned guard checks, when dropped, that the element still
    /// reports the id it is stored under.
    pub fn get_mut(&mut self, id: &T::Id) -> Option<ElementMut<'_, T>> {
        let element = self.elements_mut().get_mut(id)?;
        Some(ElementMut {
            id: id.clone(),
            element,
        })
    }

    /// Mutate the element with `id` in place, returning the closure's result.
    pub fn update<R>(&mut self, id: &T::Id, update: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.get_mut(id).map(|mut element| update(&mut element))
    }

    /// Append `element` unless its id is present.
    ///
    /// Returns whether it was inserted and the index of the element with
    /// that id.
    pub fn push(&mut self, element: T) -> (bool, usize) {
        let id = element.id();
        if let Some(index) = self.index_of(&id) {
            return (false, index);
        }
        let (index, _) = self.elements_mut().insert_full(id, element);
        (true, index)
    }

    /// Insert `element` at `index` unless its id is present.
    ///
    /// Returns whether it was inserted and the index of the element with
    /// that id.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&mut self, element: T, index: usize) -> (bool, usize) {
        let id = element.id();
        if let Some(existing) = self.index_of(&id) {
            return (false, existing);
        }
        self.elements_mut().shift_insert(index, id, element);
        (true, index)
    }

    /// Replace the element with `id`, append it when absent, or remove it
    /// when `element` is `None`.
    ///
    /// # Panics
    ///
    /// Panics if `element` reports an id other than `id`.
    pub fn set(&mut self, id: &T::Id, element: Option<T>) {
        match element {
            Some(element) => {
                let element_id = element.id();
                if &element_id != id {
                    #[allow(clippy::panic)] // Mismatched ids break the collection invariant
                    {
                        panic!(
                            "Element identity must match the id it is stored under: \
                             expected {id:?}, got {element_id:?}"
                        );
                    }
                }
                self.elements_mut().insert(element_id, element);
            },
            None => {
                self.try_remove(id);
            },
        }
    }

    /// Remove and return the element with `id`.
    ///
    /// # Panics
    ///
    /// Panics if no element has `id`. See [`try_remove`](Self::try_remove).
    pub fn remove(&mut self, id: &T::Id) -> T {
        match self.try_remove(id) {
            Some(element) => element,
            None => {
                #[allow(clippy::panic)] // Removing a missing id is a programmer error
                {
                    panic!("Attempted to remove missing element with id {id:?}");
                }
            },
        }
    }

    /// Remove and return the element with `id`, if present.
    pub fn try_remove(&mut self, id: &T::Id) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        self.elements_mut().shift_remove(id)
    }

    /// Remove and return the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove_at(&mut self, index: usize) -> T {
        match self.elements_mut().shift_remove_index(index) {
            Some((_, element)) => element,
            None => {
                #[allow(clippy::panic)] // Mirrors Vec::remove
                {
                    panic!("Removal index {index} is out of bounds");
                }
            },
        }
    }

    /// Remove the elements at each of `offsets`.
    ///
    /// # Panics
    ///
    /// Panics if any offset is out of bounds.
    pub fn remove_at_offsets(&mut self, offsets: impl IntoIterator<Item = usize>) {
        let mut offsets: Vec<usize> = offsets.into_iter().collect();
        offsets.sort_unstable();
        offsets.dedup();
        for offset in offsets.into_iter().rev() {
            self.remove_at(offset);
        }
    }

    /// Remove every element for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        if self.iter().all(&mut keep) {
            return;
        }
        self.elements_mut().retain(|_, element| keep(element));
    }

    /// Move the elements at `offsets` so they sit, in their current relative
    /// order, before the element that was at `destination`.
    ///
    /// `destination` may equal `len` to move elements to the end.
    ///
    /// # Panics
    ///
    /// Panics if any offset is out of bounds or `destination > len`.
    pub fn move_offsets(&mut self, offsets: impl IntoIterator<Item = usize>, destination: usize) {
        let moving: HashSet<usize> = offsets.into_iter().collect();
        let len = self.len();
        if destination > len || moving.iter().any(|&offset| offset >= len) {
            #[allow(clippy::panic)] // Mirrors slice indexing
            {
                panic!("Move offsets out of bounds for collection of length {len}");
            }
        }

        let insertion = destination - moving.iter().filter(|&&offset| offset < destination).count();
        let entries = self.elements_mut().drain(..).enumerate();
        let (moved, mut rest): (Vec<_>, Vec<_>) =
            entries.partition(|(offset, _)| moving.contains(offset));
        let tail = rest.split_off(insertion);

        let map = self.elements_mut();
        map.extend(rest.into_iter().map(|(_, entry)| entry));
        map.extend(moved.into_iter().map(|(_, entry)| entry));
        map.extend(tail.into_iter().map(|(_, entry)| entry));
    }

    /// Swap the elements at `a` and `b`.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of bounds.
    pub fn swap(&mut self, a: usize, b: usize) {
        self.elements_mut().swap_indices(a, b);
    }

    /// Sort with `compare`.
    pub fn sort_by(&mut self, mut compare: impl FnMut(&T, &T) -> std::cmp::Ordering) {
        self.elements_mut().sort_by(|_, a, _, b| compare(a, b));
    }

    /// Sort by the key `key` extracts.
    pub fn sort_by_key<K: Ord>(&mut self, mut key: impl FnMut(&T) -> K) {
        self.sort_by(|a, b| key(a).cmp(&key(b)));
    }

    /// Shuffle using `rng`.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut entries: Vec<(T::Id, T)> = self.elements_mut().drain(..).collect();
        entries.shuffle(rng);
        self.elements_mut().extend(entries);
    }

    /// Remove every element.
    pub fn clear(&mut self) {
        self.elements = Arc::new(IndexMap::new());
    }
}

impl<T> IdentifiedVec<T>
where
    T: Identifiable + Clone + Ord,
{
    /// Sort by the elements' ordering.
    pub fn sort(&mut self) {
        self.sort_by(Ord::cmp);
    }
}

/// Mutable access to one element of an [`IdentifiedVec`].
///
/// # Panics
///
/// Dropping the guard panics if the element's id was changed.
pub struct ElementMut<'a, T: Identifiable> {
    id: T::Id,
    element: &'a mut T,
}

impl<T: Identifiable> Deref for ElementMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.element
    }
}

impl<T: Identifiable> DerefMut for ElementMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.element
    }
}

impl<T: Identifiable> Drop for ElementMut<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let id = self.element.id();
        if id != self.id {
            #[allow(clippy::panic)] // Mutating an element's identity breaks the collection invariant
            {
                panic!(
                    "Element identity changed during mutation: stored under {:?}, now {id:?}",
                    self.id
                );
            }
        }
    }
}

impl<T: Identifiable> Clone for IdentifiedVec<T> {
    fn clone(&self) -> Self {
        Self {
            elements: Arc::clone(&self.elements),
        }
    }
}

impl<T: Identifiable> Default for IdentifiedVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Identifiable + fmt::Debug> fmt::Debug for IdentifiedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Identifiable + PartialEq> PartialEq for IdentifiedVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || (self.len() == other.len() && self.iter().eq(other.iter()))
    }
}

impl<T: Identifiable + Eq> Eq for IdentifiedVec<T> {}

impl<T: Identifiable> Index<usize> for IdentifiedVec<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.elements[index]
    }
}

impl<T: Identifiable + Clone> FromIterator<T> for IdentifiedVec<T> {
    /// # Panics
    ///
    /// Panics on duplicate ids. Use
    /// [`try_from_elements`](IdentifiedVec::try_from_elements) to handle them.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        match Self::try_from_elements(iter) {
            Ok(collection) => collection,
            Err(id) => {
                #[allow(clippy::panic)] // Duplicate ids break the collection invariant
                {
                    panic!("Duplicate element id {id:?}");
                }
            },
        }
    }
}

impl<T: Identifiable + Clone> From<Vec<T>> for IdentifiedVec<T> {
    fn from(elements: Vec<T>) -> Self {
        elements.into_iter().collect()
    }
}

impl<'a, T: Identifiable> IntoIterator for &'a IdentifiedVec<T> {
    type Item = &'a T;
    type IntoIter = indexmap::map::Values<'a, T::Id, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.values()
    }
}

impl<T: Identifiable + Clone> IntoIterator for IdentifiedVec<T> {
    type Item = T;
    type IntoIter = indexmap::map::IntoValues<T::Id, T>;

    fn into_iter(self) -> Self::IntoIter {
        Arc::unwrap_or_clone(self.elements).into_values()
    }
}

impl<T: Identifiable + Serialize> Serialize for IdentifiedVec<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de, T> Deserialize<'de> for IdentifiedVec<T>
where
    T: Identifiable + Clone + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let elements = Vec::<T>::deserialize(deserializer)?;
        Self::try_from_elements(elements)
            .map_err(|id| D::Error::custom(format!("duplicate element id {id:?}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    struct Row {
        id: u32,
        value: i64,
    }

    impl Identifiable for Row {
        type Id = u32;

        fn id(&self) -> u32 {
            self.id
        }
    }

    fn row(id: u32) -> Row {
        Row {
            id,
            value: i64::from(id) * 10,
        }
    }

    fn rows(ids: &[u32]) -> IdentifiedVec<Row> {
        ids.iter().copied().map(row).collect()
    }

    fn ids(collection: &IdentifiedVec<Row>) -> Vec<u32> {
        collection.ids().copied().collect()
    }

    fn assert_consistent(collection: &IdentifiedVec<Row>) {
        let ids: Vec<u32> = collection.ids().copied().collect();
        let unique: HashSet<u32> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
        assert_eq!(ids.len(), collection.len());
        for (index, id) in ids.iter().enumerate() {
            assert_eq!(collection.get(id).unwrap().id, *id);
            assert_eq!(collection.get_index(index).unwrap().id, *id);
        }
    }

    #[test]
    fn push_keeps_existing_element() {
        let mut collection = rows(&[1, 2]);
        let (inserted, index) = collection.push(Row { id: 1, value: -1 });
        assert!(!inserted);
        assert_eq!(index, 0);
        assert_eq!(collection.get(&1).unwrap().value, 10);
    }

    #[test]
    fn insert_places_element_at_index() {
        let mut collection = rows(&[1, 3]);
        assert_eq!(collection.insert(row(2), 1), (true, 1));
        assert_eq!(ids(&collection), vec![1, 2, 3]);
    }

    #[test]
    fn set_replaces_appends_and_removes() {
        let mut collection = rows(&[1, 2]);
        collection.set(&2, Some(Row { id: 2, value: 0 }));
        collection.set(&3, Some(row(3)));
        collection.set(&1, None);
        assert_eq!(ids(&collection), vec![2, 3]);
        assert_eq!(collection.get(&2).unwrap().value, 0);
    }

    #[test]
    #[should_panic(expected = "Element identity must match")]
    fn set_with_mismatched_id_panics() {
        let mut collection = rows(&[1]);
        collection.set(&1, Some(row(2)));
    }

    #[test]
    #[should_panic(expected = "missing element")]
    fn remove_missing_id_panics() {
        let mut collection = rows(&[1]);
        collection.remove(&9);
    }

    #[test]
    #[should_panic(expected = "identity changed")]
    fn changing_identity_through_guard_panics() {
        let mut collection = rows(&[1]);
        collection.get_mut(&1).unwrap().id = 5;
    }

    #[test]
    fn clones_are_copy_on_write() {
        let original = rows(&[1, 2, 3]);
        let mut copy = original.clone();
        assert!(copy.ptr_eq(&original));

        copy.update(&2, |row| row.value = 0);
        assert!(!copy.ptr_eq(&original));
        assert_eq!(original.get(&2).unwrap().value, 20);
        assert_eq!(copy.get(&2).unwrap().value, 0);
    }

    #[test]
    fn move_offsets_matches_list_semantics() {
        let mut collection = rows(&[0, 1, 2, 3, 4]);
        collection.move_offsets([1, 3], 0);
        assert_eq!(ids(&collection), vec![1, 3, 0, 2, 4]);

        let mut collection = rows(&[0, 1, 2, 3, 4]);
        collection.move_offsets([0], 5);
        assert_eq!(ids(&collection), vec![1, 2, 3, 4, 0]);

        let mut collection = rows(&[0, 1, 2, 3, 4]);
        collection.move_offsets([0, 4], 3);
        assert_eq!(ids(&collection), vec![1, 2, 0, 4, 3]);
    }

    #[test]
    fn remove_at_offsets_removes_each_once() {
        let mut collection = rows(&[0, 1, 2, 3]);
        collection.remove_at_offsets([3, 1, 1]);
        assert_eq!(ids(&collection), vec![0, 2]);
    }

    #[test]
    fn equality_is_order_sensitive() {
        assert_eq!(rows(&[1, 2]), rows(&[1, 2]));
        assert_ne!(rows(&[1, 2]), rows(&[2, 1]));
    }

    #[test]
    fn deserializing_duplicates_fails() {
        let json = r#"[{"id":1,"value":1},{"id":1,"value":2}]"#;
        let error = serde_json::from_str::<IdentifiedVec<Row>>(json).unwrap_err();
        assert!(error.to_string().contains("duplicate element id"));

        let json = serde_json::to_string(&rows(&[2, 1])).unwrap();
        let back: IdentifiedVec<Row> = serde_json::from_str(&json).unwrap();
        assert_eq!(ids(&back), vec![2, 1]);
    }

    #[test]
    fn sorting_and_shuffling_keep_elements() {
        use rand::SeedableRng;

        let mut collection = rows(&[3, 1, 2]);
        collection.sort();
        assert_eq!(ids(&collection), vec![1, 2, 3]);

        collection.sort_by_key(|row| std::cmp::Reverse(row.value));
        assert_eq!(ids(&collection), vec![3, 2, 1]);

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        collection.shuffle(&mut rng);
        assert_consistent(&collection);
        assert_eq!(collection.len(), 3);
    }

    #[derive(Debug, Clone)]
    enum Operation {
        Push(u32),
        Insert(u32, usize),
        Remove(u32),
        RemoveAt(usize),
        Move(Vec<usize>, usize),
        Swap(usize, usize),
        Set(u32, bool),
    }

    fn operation() -> impl Strategy<Value = Operation> {
        prop_oneof![
            (0_u32..20).prop_map(Operation::Push),
            (0_u32..20, 0_usize..20).prop_map(|(id, index)| Operation::Insert(id, index)),
            (0_u32..20).prop_map(Operation::Remove),
            (0_usize..20).prop_map(Operation::RemoveAt),
            (proptest::collection::vec(0_usize..20, 0..4), 0_usize..21)
                .prop_map(|(offsets, to)| Operation::Move(offsets, to)),
            (0_usize..20, 0_usize..20).prop_map(|(a, b)| Operation::Swap(a, b)),
            (0_u32..20, any::<bool>()).prop_map(|(id, present)| Operation::Set(id, present)),
        ]
    }

    fn apply(collection: &mut IdentifiedVec<Row>, operation: Operation) {
        let len = collection.len();
        match operation {
            Operation::Push(id) => {
                collection.push(row(id));
            },
            Operation::Insert(id, index) => {
                collection.insert(row(id), index.min(len));
            },
            Operation::Remove(id) => {
                collection.try_remove(&id);
            },
            Operation::RemoveAt(index) if index < len => {
                collection.remove_at(index);
            },
            Operation::Move(offsets, to) if len > 0 => {
                let offsets: Vec<usize> = offsets.into_iter().map(|o| o % len).collect();
                collection.move_offsets(offsets, to.min(len));
            },
            Operation::Swap(a, b) if len > 0 => collection.swap(a % len, b % len),
            Operation::Set(id, present) => collection.set(&id, present.then(|| row(id))),
            _ => {},
        }
    }

    proptest! {
        #[test]
        fn invariant_holds_under_any_operation_sequence(
            operations in proptest::collection::vec(operation(), 0..40)
        ) {
            let mut collection = IdentifiedVec::new();
            for operation in operations {
                let snapshot = collection.clone();
                apply(&mut collection, operation);
                assert_consistent(&collection);
                assert_consistent(&snapshot);
            }
        }
    }
}

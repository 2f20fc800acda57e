//! Paths from a parent value into a child.
//!
//! Composition needs to get at a piece of the parent state and to move
//! actions between parent and child. Paths are plain function pointers, so
//! they are `Copy` and comparable by address.
//!
//! The [`state_path!`](crate::state_path) and [`case_path!`](crate::case_path)
//! macros build the common forms:
//!
//! ```
//! use composable_arch_core::{case_path, state_path};
//!
//! struct App {
//!     counter: i32,
//! }
//!
//! enum AppAction {
//!     Counter(i32),
//!     Reset,
//! }
//!
//! let counter = state_path!(App => counter);
//! let mut app = App { counter: 1 };
//! *counter.get_mut(&mut app) += 1;
//! assert_eq!(*counter.get(&app), 2);
//!
//! let action = case_path!(AppAction::Counter);
//! assert_eq!(action.extract(action.embed(5)), Some(5));
//! assert_eq!(action.extract(AppAction::Reset), None);
//! ```

use std::fmt;

/// Read and write access to a field of `Root`.
pub struct StatePath<Root, Value> {
    get: fn(&Root) -> &Value,
    get_mut: fn(&mut Root) -> &mut Value,
}

impl<Root, Value> StatePath<Root, Value> {
    /// A path from a getter and a mutable getter.
    #[must_use]
    pub const fn new(get: fn(&Root) -> &Value, get_mut: fn(&mut Root) -> &mut Value) -> Self {
        Self { get, get_mut }
    }

    /// Borrow the field.
    pub fn get<'a>(&self, root: &'a Root) -> &'a Value {
        (self.get)(root)
    }

    /// Mutably borrow the field.
    pub fn get_mut<'a>(&self, root: &'a mut Root) -> &'a mut Value {
        (self.get_mut)(root)
    }

    pub(crate) fn address(&self) -> usize {
        self.get_mut as usize
    }
}

impl<Root, Value> Clone for StatePath<Root, Value> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Root, Value> Copy for StatePath<Root, Value> {}

impl<Root, Value> fmt::Debug for StatePath<Root, Value> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatePath").field(&self.address()).finish()
    }
}

/// Access to a value of `Root` that may be absent, such as one case of an
/// enum held in state.
pub struct OptionalPath<Root, Value> {
    get: fn(&Root) -> Option<&Value>,
    get_mut: fn(&mut Root) -> Option<&mut Value>,
}

impl<Root, Value> OptionalPath<Root, Value> {
    /// A path from an optional getter and an optional mutable getter.
    #[must_use]
    pub const fn new(
        get: fn(&Root) -> Option<&Value>,
        get_mut: fn(&mut Root) -> Option<&mut Value>,
    ) -> Self {
        Self { get, get_mut }
    }

    /// Borrow the value, if present.
    pub fn get<'a>(&self, root: &'a Root) -> Option<&'a Value> {
        (self.get)(root)
    }

    /// Mutably borrow the value, if present.
    pub fn get_mut<'a>(&self, root: &'a mut Root) -> Option<&'a mut Value> {
        (self.get_mut)(root)
    }

    pub(crate) fn address(&self) -> usize {
        self.get_mut as usize
    }
}

impl<Root, Value> Clone for OptionalPath<Root, Value> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Root, Value> Copy for OptionalPath<Root, Value> {}

impl<Root, Value> fmt::Debug for OptionalPath<Root, Value> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OptionalPath").field(&self.address()).finish()
    }
}

/// Moves values in and out of one case of the enum `Root`.
pub struct CasePath<Root, Value> {
    embed: fn(Value) -> Root,
    extract: fn(Root) -> Option<Value>,
}

impl<Root, Value> CasePath<Root, Value> {
    /// A path from an embedding and an extraction.
    #[must_use]
    pub const fn new(embed: fn(Value) -> Root, extract: fn(Root) -> Option<Value>) -> Self {
        Self { embed, extract }
    }

    /// Wrap `value` in the case.
    pub fn embed(&self, value: Value) -> Root {
        (self.embed)(value)
    }

    /// Unwrap the case, or `None` when `root` is another case.
    pub fn extract(&self, root: Root) -> Option<Value> {
        (self.extract)(root)
    }

    /// The embedding function.
    #[must_use]
    pub const fn embedding(&self) -> fn(Value) -> Root {
        self.embed
    }
}

impl<Root, Value> Clone for CasePath<Root, Value> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Root, Value> Copy for CasePath<Root, Value> {}

impl<Root, Value> fmt::Debug for CasePath<Root, Value> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CasePath").field(&(self.embed as usize)).finish()
    }
}

/// Build a [`StatePath`] to a field: `state_path!(Root => field.nested)`.
#[macro_export]
macro_rules! state_path {
    ($root:ty => $($field:ident).+) => {
        $crate::paths::StatePath::<$root, _>::new(
            |root| &root.$($field).+,
            |root| &mut root.$($field).+,
        )
    };
}

/// Build a [`CasePath`] for a single-field tuple variant:
/// `case_path!(Action::Child)`.
#[macro_export]
macro_rules! case_path {
    ($($variant:ident)::+) => {
        $crate::paths::CasePath::new($($variant)::+, |root| match root {
            $($variant)::+(value) => ::std::option::Option::Some(value),
            #[allow(unreachable_patterns)]
            _ => ::std::option::Option::None,
        })
    };
}

/// Build an [`OptionalPath`] for a single-field tuple variant of an enum
/// held in state: `optional_path!(Destination::Edit)`.
#[macro_export]
macro_rules! optional_path {
    ($($variant:ident)::+) => {
        $crate::paths::OptionalPath::new(
            |root| match root {
                $($variant)::+(value) => ::std::option::Option::Some(value),
                #[allow(unreachable_patterns)]
                _ => ::std::option::Option::None,
            },
            |root| match root {
                $($variant)::+(value) => ::std::option::Option::Some(value),
                #[allow(unreachable_patterns)]
                _ => ::std::option::Option::None,
            },
        )
    };
}

#[cfg(test)]
mod tests {
    #[derive(Debug, PartialEq)]
    enum Destination {
        Edit(String),
        Alert(u8),
    }

    struct Parent {
        destination: Destination,
    }

    #[test]
    fn optional_path_matches_only_its_case() {
        let path = optional_path!(Destination::Edit);
        let mut parent = Parent {
            destination: Destination::Edit("draft".into()),
        };
        if let Some(draft) = path.get_mut(&mut parent.destination) {
            draft.push('!');
        }
        assert_eq!(path.get(&parent.destination).map(String::as_str), Some("draft!"));

        parent.destination = Destination::Alert(1);
        assert!(path.get(&parent.destination).is_none());
    }

    #[test]
    fn nested_state_path() {
        struct Inner {
            value: u8,
        }
        struct Outer {
            inner: Inner,
        }

        let path = state_path!(Outer => inner.value);
        let mut outer = Outer {
            inner: Inner { value: 1 },
        };
        *path.get_mut(&mut outer) = 9;
        assert_eq!(*path.get(&outer), 9);
    }
}

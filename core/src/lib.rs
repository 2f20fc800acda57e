//! # Composable Architecture Core
//!
//! Core traits and types for building features as state, actions, reducers
//! and effects.
//!
//! ## Core Concepts
//!
//! - **State**: the data a feature owns
//! - **Action**: every input a feature reacts to, from the user or from effects
//! - **Reducer**: `(State, Action, Dependencies) → Effects`, synchronous and deterministic
//! - **Effect**: a description of async work that feeds actions back in
//! - **Dependencies**: values resolved by key and context, overridable per scope
//!
//! ## Architecture Principles
//!
//! - Functional Core, Imperative Shell
//! - Unidirectional Data Flow
//! - Explicit Effects (no hidden I/O)
//! - Composition over configuration: small reducers build large ones
//!
//! ## Example
//!
//! ```
//! use composable_arch_core::{Effect, Effects, Reducer, smallvec};
//! use composable_arch_core::dependencies::DependencyValues;
//! use std::time::Duration;
//!
//! #[derive(Debug, Default)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum CounterAction {
//!     Increment,
//!     IncrementLater,
//! }
//!
//! struct CounterFeature;
//!
//! impl Reducer for CounterFeature {
//!     type State = Counter;
//!     type Action = CounterAction;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut Counter,
//!         action: CounterAction,
//!         _dependencies: &DependencyValues,
//!     ) -> Effects<CounterAction> {
//!         match action {
//!             CounterAction::Increment => {
//!                 state.count += 1;
//!                 Effects::new()
//!             },
//!             CounterAction::IncrementLater => smallvec![Effect::delay(
//!                 Duration::from_secs(1),
//!                 CounterAction::Increment,
//!             )],
//!         }
//!     }
//! }
//!
//! let mut state = Counter::default();
//! CounterFeature.reduce(&mut state, CounterAction::Increment, &DependencyValues::test());
//! assert_eq!(state.count, 1);
//! ```

pub mod composition;
pub mod dependencies;
pub mod effect;
pub mod effect_macros;
pub mod identified;
pub mod issue;
pub mod navigation;
pub mod paths;
pub mod reducer;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use smallvec::{SmallVec, smallvec};

pub use dependencies::{DependencyContext, DependencyKey, DependencyValues, dependency};
pub use effect::{ActionSender, Effect, EffectId, Effects};
pub use identified::{Identifiable, IdentifiedVec};
pub use issue::{Issue, IssueReporter, report_issue};
pub use navigation::{
    PresentationAction, PresentationState, StackAction, StackElementId, StackState,
};
pub use paths::{CasePath, OptionalPath, StatePath};
pub use reducer::{BoxReducer, EmptyReducer, Reduce, Reducer, ReducerExt};

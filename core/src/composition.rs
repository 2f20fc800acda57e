//! Reducer composition utilities
//!
//! This module provides utilities for composing reducers in various ways:
//! - **`combine_reducers`** / [`Combine`]: Run multiple reducers on the same state/action
//! - **`scope_reducer`**: Focus a reducer on a field of state and a case of an action
//! - [`OnChange`], [`WithDependencies`], [`Filter`], [`TraceChanges`]: modifiers
//!   layered over an existing reducer
//!
//! Navigation-aware composition (optional, enum, collection and presented
//! children) lives in [`crate::navigation`].
//!
//! # Examples
//!
//! ## Combining Reducers
//!
//! ```
//! use composable_arch_core::{Effects, Reduce, Reducer, ReducerExt};
//! use composable_arch_core::dependencies::DependencyValues;
//!
//! #[derive(Clone, Default)]
//! struct MyState {
//!     count: i32,
//!     name: String,
//! }
//!
//! #[derive(Clone)]
//! enum MyAction {
//!     Increment,
//!     SetName(String),
//! }
//!
//! let counter = Reduce::new(|state: &mut MyState, action: MyAction, _| {
//!     if matches!(action, MyAction::Increment) {
//!         state.count += 1;
//!     }
//!     Effects::new()
//! });
//! let names = Reduce::new(|state: &mut MyState, action: MyAction, _| {
//!     if let MyAction::SetName(name) = action {
//!         state.name = name;
//!     }
//!     Effects::new()
//! });
//!
//! let combined = counter.combine(names);
//! let mut state = MyState::default();
//! combined.reduce(&mut state, MyAction::SetName("Blob".into()), &DependencyValues::test());
//! assert_eq!(state.name, "Blob");
//! ```

use std::fmt;
use std::sync::Arc;

use crate::dependencies::DependencyValues;
use crate::effect::Effects;
use crate::paths::{CasePath, StatePath};
use crate::reducer::{BoxReducer, Reducer};

/// Combines multiple reducers that operate on the same state and action types.
///
/// Each reducer is run in sequence, and all effects are collected in order.
/// This is useful when you want to split reducer logic across multiple implementations.
///
/// # Examples
///
/// ```
/// use composable_arch_core::{Effects, Reduce, Reducer, ReducerExt};
/// use composable_arch_core::composition::combine_reducers;
/// use composable_arch_core::dependencies::DependencyValues;
///
/// #[derive(Clone)]
/// enum AppAction {
///     Increment,
/// }
///
/// let add_one = Reduce::new(|state: &mut i32, _: AppAction, _| {
///     *state += 1;
///     Effects::new()
/// });
/// let double = Reduce::new(|state: &mut i32, _: AppAction, _| {
///     *state *= 2;
///     Effects::new()
/// });
///
/// let combined = combine_reducers(vec![add_one.boxed(), double.boxed()]);
///
/// let mut state = 1;
/// combined.reduce(&mut state, AppAction::Increment, &DependencyValues::test());
/// assert_eq!(state, 4);
/// ```
#[must_use]
pub fn combine_reducers<S, A>(reducers: Vec<BoxReducer<S, A>>) -> CombinedReducer<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    CombinedReducer { reducers }
}

/// A combined reducer that runs multiple reducers in sequence.
///
/// Created by [`combine_reducers`].
pub struct CombinedReducer<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    reducers: Vec<BoxReducer<S, A>>,
}

impl<S, A> Reducer for CombinedReducer<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    type State = S;
    type Action = A;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut all_effects = Effects::new();

        for reducer in &self.reducers {
            let effects = reducer.reduce(state, action.clone(), dependencies);
            all_effects.extend(effects);
        }

        all_effects
    }
}

impl<S, A> fmt::Debug for CombinedReducer<S, A>
where
    S: 'static,
    A: Clone + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedReducer")
            .field("reducers", &self.reducers.len())
            .finish()
    }
}

/// Two reducers run in sequence. Built by
/// [`ReducerExt::combine`](crate::ReducerExt::combine).
#[derive(Debug, Clone)]
pub struct Combine<L, R> {
    first: L,
    second: R,
}

impl<L, R> Combine<L, R> {
    /// Run `first`, then `second`.
    pub const fn new(first: L, second: R) -> Self {
        Self { first, second }
    }
}

impl<L, R> Reducer for Combine<L, R>
where
    L: Reducer,
    L::Action: Clone,
    R: Reducer<State = L::State, Action = L::Action>,
{
    type State = L::State;
    type Action = L::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = self.first.reduce(state, action.clone(), dependencies);
        effects.extend(self.second.reduce(state, action, dependencies));
        effects
    }
}

/// Scopes a reducer to operate on a field of a larger state, for one case of
/// a larger action.
///
/// Actions of other cases are ignored. Effects from the child are mapped back
/// into the parent action.
///
/// # Examples
///
/// ```
/// use composable_arch_core::{case_path, smallvec, state_path, Effect, Effects, Reducer};
/// use composable_arch_core::composition::scope_reducer;
/// use composable_arch_core::dependencies::DependencyValues;
///
/// #[derive(Clone, Default)]
/// struct CounterState {
///     count: i32,
/// }
///
/// #[derive(Clone)]
/// enum CounterAction {
///     Increment,
/// }
///
/// struct CounterReducer;
///
/// impl Reducer for CounterReducer {
///     type State = CounterState;
///     type Action = CounterAction;
///
///     fn reduce(&self, state: &mut CounterState, _action: CounterAction, _deps: &DependencyValues) -> Effects<CounterAction> {
///         state.count += 1;
///         smallvec![Effect::none()]
///     }
/// }
///
/// #[derive(Clone, Default)]
/// struct AppState {
///     counter: CounterState,
///     other_data: String,
/// }
///
/// #[derive(Clone)]
/// enum AppAction {
///     Counter(CounterAction),
/// }
///
/// let scoped = scope_reducer(
///     CounterReducer,
///     state_path!(AppState => counter),
///     case_path!(AppAction::Counter),
/// );
///
/// let mut state = AppState::default();
/// scoped.reduce(&mut state, AppAction::Counter(CounterAction::Increment), &DependencyValues::test());
/// assert_eq!(state.counter.count, 1);
/// ```
pub const fn scope_reducer<PS, PA, R>(
    reducer: R,
    state: StatePath<PS, R::State>,
    action: CasePath<PA, R::Action>,
) -> ScopedReducer<PS, PA, R>
where
    PS: 'static,
    PA: Send + 'static,
    R: Reducer,
{
    ScopedReducer {
        reducer,
        state,
        action,
    }
}

/// A scoped reducer that operates on a subset of state.
///
/// Created by [`scope_reducer`].
pub struct ScopedReducer<PS, PA, R>
where
    R: Reducer,
{
    reducer: R,
    state: StatePath<PS, R::State>,
    action: CasePath<PA, R::Action>,
}

impl<PS, PA, R> Reducer for ScopedReducer<PS, PA, R>
where
    PS: 'static,
    PA: Send + 'static,
    R: Reducer,
{
    type State = PS;
    type Action = PA;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let Some(child_action) = self.action.extract(action) else {
            return Effects::new();
        };

        let child_state = self.state.get_mut(state);
        let embed = self.action.embedding();
        self.reducer
            .reduce(child_state, child_action, dependencies)
            .into_iter()
            .map(|effect| effect.map(embed))
            .collect()
    }
}

/// Runs a follow-up whenever a derived value changes.
///
/// Built by [`ReducerExt::on_change`](crate::ReducerExt::on_change).
pub struct OnChange<R: Reducer, V, F> {
    base: R,
    value: fn(&R::State) -> V,
    on_change: F,
}

impl<R: Reducer, V, F> OnChange<R, V, F> {
    /// Run `on_change(old, new, state)` after `base` when `value` changes.
    pub const fn new(base: R, value: fn(&R::State) -> V, on_change: F) -> Self {
        Self {
            base,
            value,
            on_change,
        }
    }
}

impl<R, V, F> Reducer for OnChange<R, V, F>
where
    R: Reducer,
    V: PartialEq,
    F: Fn(&V, &V, &mut R::State, &DependencyValues) -> Effects<R::Action> + Send + Sync,
{
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let old = (self.value)(state);
        let mut effects = self.base.reduce(state, action, dependencies);
        let new = (self.value)(state);
        if old != new {
            effects.extend((self.on_change)(&old, &new, state, dependencies));
        }
        effects
    }
}

type DependencyUpdate = Arc<dyn Fn(&mut DependencyValues) + Send + Sync>;

/// Runs a reducer, and the effects it builds, under modified dependencies.
///
/// Built by [`ReducerExt::dependency`](crate::ReducerExt::dependency) and
/// [`ReducerExt::transform_dependencies`](crate::ReducerExt::transform_dependencies).
pub struct WithDependencies<R> {
    base: R,
    update: DependencyUpdate,
}

impl<R> WithDependencies<R> {
    /// Run `base` with dependencies modified by `update`.
    pub fn new(base: R, update: impl Fn(&mut DependencyValues) + Send + Sync + 'static) -> Self {
        Self {
            base,
            update: Arc::new(update),
        }
    }
}

impl<R: Reducer> Reducer for WithDependencies<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut values = dependencies.clone();
        (self.update)(&mut values);
        values
            .clone()
            .enter(|| self.base.reduce(state, action, &values))
    }
}

/// Skips actions a predicate rejects.
pub struct Filter<R: Reducer> {
    base: R,
    predicate: fn(&R::State, &R::Action) -> bool,
}

impl<R: Reducer> Filter<R> {
    /// Only pass actions for which `predicate` holds to `base`.
    pub const fn new(base: R, predicate: fn(&R::State, &R::Action) -> bool) -> Self {
        Self { base, predicate }
    }
}

impl<R: Reducer> Reducer for Filter<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        if (self.predicate)(state, &action) {
            self.base.reduce(state, action, dependencies)
        } else {
            Effects::new()
        }
    }
}

/// Logs actions and state diffs at debug level.
pub struct TraceChanges<R> {
    base: R,
    label: &'static str,
}

impl<R> TraceChanges<R> {
    /// Trace `base`, tagging log lines with `label`.
    pub const fn new(base: R, label: &'static str) -> Self {
        Self { base, label }
    }
}

impl<R> Reducer for TraceChanges<R>
where
    R: Reducer,
    R::State: Clone + fmt::Debug,
    R::Action: fmt::Debug,
{
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return self.base.reduce(state, action, dependencies);
        }

        let description = format!("{action:?}");
        let before = format!("{state:#?}");
        let effects = self.base.reduce(state, action, dependencies);
        let after = format!("{state:#?}");

        if before == after {
            tracing::debug!(label = self.label, action = %description, "(No state changes)");
        } else {
            let diff = diff_lines(&before, &after);
            tracing::debug!(label = self.label, action = %description, "State changed:\n{diff}");
        }
        effects
    }
}

fn diff_lines(before: &str, after: &str) -> String {
    let old: Vec<&str> = before.lines().collect();
    let new: Vec<&str> = after.lines().collect();
    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) if a == b => {
                i += 1;
                j += 1;
            },
            (Some(a), _) if !new[j..].contains(a) => {
                out.push_str("- ");
                out.push_str(a);
                out.push('\n');
                i += 1;
            },
            (_, Some(b)) => {
                out.push_str("+ ");
                out.push_str(b);
                out.push('\n');
                j += 1;
            },
            (Some(a), None) => {
                out.push_str("- ");
                out.push_str(a);
                out.push('\n');
                i += 1;
            },
            (None, None) => break,
        }
    }
    out
}

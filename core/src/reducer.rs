//! Reducer module - The core trait for business logic
//!
//! A reducer evolves state in response to an action and describes the
//! effects to run afterwards. Reducers are synchronous and deterministic;
//! everything asynchronous happens in the returned effects.
//!
//! A reducer either implements [`Reducer::reduce`] directly or composes other
//! reducers in [`Reducer::body`]. A direct `reduce` always wins.

use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::composition::{
    Combine, Filter, OnChange, ScopedReducer, TraceChanges, WithDependencies, scope_reducer,
};
use crate::dependencies::{DependencyKey, DependencyValues};
use crate::effect::Effects;
use crate::issue::report_issue;
use crate::navigation::{
    ForEach, ForEachStack, IfCaseLet, IfLet, PresentationAction, PresentationState, Presents,
    StackAction, StackState,
};
use crate::identified::{Identifiable, IdentifiedVec};
use crate::paths::{CasePath, OptionalPath, StatePath};

/// A type-erased reducer.
pub type BoxReducer<S, A> = Box<dyn Reducer<State = S, Action = A>>;

/// The Reducer trait - core abstraction for business logic
///
/// # Example
///
/// ```
/// use composable_arch_core::{smallvec, Effect, Effects, Reducer};
/// use composable_arch_core::dependencies::DependencyValues;
///
/// #[derive(Default)]
/// struct Counter {
///     count: i64,
/// }
///
/// enum CounterAction {
///     Increment,
///     Decrement,
/// }
///
/// struct CounterReducer;
///
/// impl Reducer for CounterReducer {
///     type State = Counter;
///     type Action = CounterAction;
///
///     fn reduce(
///         &self,
///         state: &mut Counter,
///         action: CounterAction,
///         _dependencies: &DependencyValues,
///     ) -> Effects<CounterAction> {
///         match action {
///             CounterAction::Increment => state.count += 1,
///             CounterAction::Decrement => state.count -= 1,
///         }
///         smallvec![Effect::none()]
///     }
/// }
///
/// let mut state = Counter::default();
/// CounterReducer.reduce(&mut state, CounterAction::Increment, &DependencyValues::test());
/// assert_eq!(state.count, 1);
/// ```
pub trait Reducer: Send + Sync {
    /// The state type this reducer operates on
    type State: 'static;

    /// The action type this reducer processes
    type Action: Send + 'static;

    /// Reduce an action into state changes and effects
    ///
    /// Defaults to running [`body`](Self::body).
    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        match self.body() {
            Some(body) => body.reduce(state, action, dependencies),
            None => {
                report_issue(format!(
                    "Reducer `{}` implements neither `reduce` nor `body`",
                    type_name::<Self>()
                ));
                Effects::new()
            },
        }
    }

    /// A composed reducer that does the work of this one.
    ///
    /// Only consulted by the default [`reduce`](Self::reduce).
    fn body(&self) -> Option<BoxReducer<Self::State, Self::Action>> {
        None
    }
}

impl<R: Reducer + ?Sized> Reducer for Box<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        (**self).reduce(state, action, dependencies)
    }
}

impl<R: Reducer + ?Sized> Reducer for Arc<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        (**self).reduce(state, action, dependencies)
    }
}

/// An optional reducer runs only when present.
impl<R: Reducer> Reducer for Option<R> {
    type State = R::State;
    type Action = R::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        match self {
            Some(reducer) => reducer.reduce(state, action, dependencies),
            None => Effects::new(),
        }
    }
}

/// One of two reducers over the same state and action, chosen when built.
#[derive(Debug, Clone)]
pub enum Either<L, R> {
    /// The first reducer
    Left(L),
    /// The second reducer
    Right(R),
}

impl<L, R> Reducer for Either<L, R>
where
    L: Reducer,
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
        match self {
            Self::Left(reducer) => reducer.reduce(state, action, dependencies),
            Self::Right(reducer) => reducer.reduce(state, action, dependencies),
        }
    }
}

/// A reducer from a closure.
///
/// ```
/// use composable_arch_core::{Effects, Reduce, Reducer};
/// use composable_arch_core::dependencies::DependencyValues;
///
/// let double = Reduce::new(|state: &mut i32, _action: (), _| {
///     *state *= 2;
///     Effects::new()
/// });
/// let mut state = 3;
/// double.reduce(&mut state, (), &DependencyValues::test());
/// assert_eq!(state, 6);
/// ```
pub struct Reduce<S, A, F> {
    reduce: F,
    _marker: PhantomData<fn(&mut S, A)>,
}

impl<S, A, F> Reduce<S, A, F>
where
    F: Fn(&mut S, A, &DependencyValues) -> Effects<A> + Send + Sync,
{
    /// Wrap `reduce`.
    pub const fn new(reduce: F) -> Self {
        Self {
            reduce,
            _marker: PhantomData,
        }
    }
}

impl<S, A, F> Reducer for Reduce<S, A, F>
where
    S: 'static,
    A: Send + 'static,
    F: Fn(&mut S, A, &DependencyValues) -> Effects<A> + Send + Sync,
{
    type State = S;
    type Action = A;

    fn reduce(&self, state: &mut S, action: A, dependencies: &DependencyValues) -> Effects<A> {
        (self.reduce)(state, action, dependencies)
    }
}

impl<S, A, F> fmt::Debug for Reduce<S, A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reduce").finish_non_exhaustive()
    }
}

/// A reducer that does nothing.
pub struct EmptyReducer<S, A>(PhantomData<fn(&mut S, A)>);

impl<S, A> EmptyReducer<S, A> {
    /// The empty reducer.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S, A> Default for EmptyReducer<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> fmt::Debug for EmptyReducer<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EmptyReducer")
    }
}

impl<S: 'static, A: Send + 'static> Reducer for EmptyReducer<S, A> {
    type State = S;
    type Action = A;

    fn reduce(&self, _state: &mut S, _action: A, _dependencies: &DependencyValues) -> Effects<A> {
        Effects::new()
    }
}

/// Builder methods for composing reducers.
pub trait ReducerExt: Reducer + Sized {
    /// Run `other` after this reducer on every action.
    fn combine<R>(self, other: R) -> Combine<Self, R>
    where
        R: Reducer<State = Self::State, Action = Self::Action>,
    {
        Combine::new(self, other)
    }

    /// Run this reducer on a field of a larger state, for one case of a
    /// larger action.
    fn scope<PS, PA>(
        self,
        state: StatePath<PS, Self::State>,
        action: CasePath<PA, Self::Action>,
    ) -> ScopedReducer<PS, PA, Self>
    where
        PS: 'static,
        PA: Send + 'static,
    {
        scope_reducer(self, state, action)
    }

    /// Run `child` on optional child state, before this reducer.
    fn if_let<C>(
        self,
        state: StatePath<Self::State, Option<C::State>>,
        action: CasePath<Self::Action, C::Action>,
        child: C,
    ) -> IfLet<Self, C>
    where
        C: Reducer,
        Self::Action: Clone,
    {
        IfLet::new(self, state, action, child)
    }

    /// Like [`if_let`](Self::if_let), but replacing the child with one of a
    /// different id cancels the replaced child's effects.
    fn if_let_identified<C>(
        self,
        state: StatePath<Self::State, Option<C::State>>,
        action: CasePath<Self::Action, C::Action>,
        child: C,
    ) -> IfLet<Self, C>
    where
        C: Reducer,
        C::State: Identifiable,
        <C::State as Identifiable>::Id: Send + Sync + 'static,
        Self::Action: Clone,
    {
        IfLet::identified(self, state, action, child)
    }

    /// Run `child` on one case of an enum held in state, before this reducer.
    fn if_case_let<C>(
        self,
        state: OptionalPath<Self::State, C::State>,
        action: CasePath<Self::Action, C::Action>,
        child: C,
    ) -> IfCaseLet<Self, C>
    where
        C: Reducer,
        Self::Action: Clone,
    {
        IfCaseLet::new(self, state, action, child)
    }

    /// Run `child` on the addressed element of a collection, before this
    /// reducer.
    fn for_each<C>(
        self,
        elements: StatePath<Self::State, IdentifiedVec<C::State>>,
        action: CasePath<Self::Action, (<C::State as Identifiable>::Id, C::Action)>,
        child: C,
    ) -> ForEach<Self, C>
    where
        C: Reducer,
        C::State: Identifiable + Clone,
        <C::State as Identifiable>::Id: Send + Sync + 'static,
        Self::Action: Clone,
    {
        ForEach::new(self, elements, action, child)
    }

    /// Run `child` on presented state, before this reducer, wiring up
    /// dismissal.
    fn presents<C>(
        self,
        state: StatePath<Self::State, PresentationState<C::State>>,
        action: CasePath<Self::Action, PresentationAction<C::Action>>,
        child: C,
    ) -> Presents<Self, C>
    where
        C: Reducer,
        Self::Action: Clone,
    {
        Presents::new(self, state, action, child)
    }

    /// Run `child` on the elements of a navigation stack, before this
    /// reducer, wiring up dismissal for each element.
    fn for_each_stack<C>(
        self,
        stack: StatePath<Self::State, StackState<C::State>>,
        action: CasePath<Self::Action, StackAction<C::Action>>,
        child: C,
    ) -> ForEachStack<Self, C>
    where
        C: Reducer,
        Self::Action: Clone,
    {
        ForEachStack::new(self, stack, action, child)
    }

    /// Run `on_change` after this reducer whenever `value` changes.
    fn on_change<V, F>(self, value: fn(&Self::State) -> V, on_change: F) -> OnChange<Self, V, F>
    where
        V: PartialEq,
        F: Fn(&V, &V, &mut Self::State, &DependencyValues) -> Effects<Self::Action> + Send + Sync,
    {
        OnChange::new(self, value, on_change)
    }

    /// Override `K` for this reducer and the effects it returns.
    fn dependency<K: DependencyKey>(self, value: K::Value) -> WithDependencies<Self> {
        WithDependencies::new(self, move |values| values.set::<K>(value.clone()))
    }

    /// Modify the dependencies this reducer and its effects see.
    fn transform_dependencies(
        self,
        update: impl Fn(&mut DependencyValues) + Send + Sync + 'static,
    ) -> WithDependencies<Self> {
        WithDependencies::new(self, update)
    }

    /// Only reduce actions for which `predicate` holds.
    fn filter(self, predicate: fn(&Self::State, &Self::Action) -> bool) -> Filter<Self> {
        Filter::new(self, predicate)
    }

    /// Log every action and the resulting state changes at debug level.
    fn trace_changes(self, label: &'static str) -> TraceChanges<Self>
    where
        Self::State: Clone + fmt::Debug,
        Self::Action: fmt::Debug,
    {
        TraceChanges::new(self, label)
    }

    /// Erase the reducer's type.
    fn boxed(self) -> BoxReducer<Self::State, Self::Action>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<R: Reducer> ReducerExt for R {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;
    use crate::smallvec;

    #[derive(Debug, Default, PartialEq)]
    struct Counter {
        count: i64,
    }

    #[derive(Debug, Clone)]
    enum CounterAction {
        Increment,
    }

    struct Direct;

    impl Reducer for Direct {
        type State = Counter;
        type Action = CounterAction;

        fn reduce(
            &self,
            state: &mut Counter,
            _action: CounterAction,
            _dependencies: &DependencyValues,
        ) -> Effects<CounterAction> {
            state.count += 1;
            smallvec![Effect::none()]
        }

        fn body(&self) -> Option<BoxReducer<Counter, CounterAction>> {
            Some(Box::new(Reduce::new(|state: &mut Counter, _action: CounterAction, _| {
                state.count += 100;
                Effects::new()
            })))
        }
    }

    struct Composed;

    impl Reducer for Composed {
        type State = Counter;
        type Action = CounterAction;

        fn body(&self) -> Option<BoxReducer<Counter, CounterAction>> {
            Some(
                Reduce::new(|state: &mut Counter, _action: CounterAction, _| {
                    state.count += 10;
                    Effects::new()
                })
                .boxed(),
            )
        }
    }

    struct Neither;

    impl Reducer for Neither {
        type State = Counter;
        type Action = CounterAction;
    }

    #[test]
    fn direct_reduce_wins_over_body() {
        let mut state = Counter::default();
        Direct.reduce(&mut state, CounterAction::Increment, &DependencyValues::test());
        assert_eq!(state.count, 1);
    }

    #[test]
    fn body_is_used_when_reduce_is_not_overridden() {
        let mut state = Counter::default();
        Composed.reduce(&mut state, CounterAction::Increment, &DependencyValues::test());
        assert_eq!(state.count, 10);
    }

    #[test]
    #[should_panic(expected = "implements neither")]
    fn reducer_without_reduce_or_body_reports_issue() {
        let values = DependencyValues::test();
        let mut state = Counter::default();
        values
            .clone()
            .enter(|| Neither.reduce(&mut state, CounterAction::Increment, &values));
    }

    #[test]
    fn optional_and_either_reducers() {
        let values = DependencyValues::test();
        let mut state = Counter::default();

        let absent: Option<Direct> = None;
        absent.reduce(&mut state, CounterAction::Increment, &values);
        assert_eq!(state.count, 0);

        let chosen: Either<Direct, Composed> = Either::Right(Composed);
        chosen.reduce(&mut state, CounterAction::Increment, &values);
        assert_eq!(state.count, 10);
    }
}

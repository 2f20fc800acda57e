//! Navigation-aware composition.
//!
//! These combinators run a child reducer on state that may come and go:
//! optional state ([`IfLet`]), one case of an enum ([`IfCaseLet`]), elements of
//! an [`IdentifiedVec`] ([`ForEach`]), presented features ([`Presents`]) and
//! navigation stacks ([`ForEachStack`]).
//!
//! They share three rules:
//!
//! - the child runs before the parent, so the parent observes the child's
//!   changes;
//! - child effects are tagged with an id derived from the navigation path and
//!   cancelled as soon as the child state disappears;
//! - a child action arriving while the child state is absent is logged and
//!   ignored.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::dependencies::{DependencyKey, DependencyValues, DismissEffect, DismissKey};
use crate::effect::{Effect, EffectId, Effects};
use crate::identified::{Identifiable, IdentifiedVec};
use crate::paths::{CasePath, OptionalPath, StatePath};
use crate::reducer::Reducer;

/// Where a child sits within the navigation tree, from the root down.
struct NavigationPathKey;

impl DependencyKey for NavigationPathKey {
    type Value = Vec<EffectId>;

    fn live_value() -> Option<Self::Value> {
        Some(Vec::new())
    }

    fn test_value() -> Option<Self::Value> {
        Some(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Segment {
    combinator: &'static str,
    path: usize,
}

/// Marks the long-lived effect that waits for a presented child to dismiss
/// itself.
///
/// The test store does not wait for effects tagged with this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresentationListener;

fn child_id(dependencies: &DependencyValues, segment: EffectId) -> (Vec<EffectId>, EffectId) {
    let mut path = dependencies
        .try_get::<NavigationPathKey>()
        .unwrap_or_default();
    path.push(segment);
    let id = EffectId::new(path.clone());
    (path, id)
}

fn child_scope(dependencies: &DependencyValues, segment: EffectId) -> (DependencyValues, EffectId) {
    let (path, id) = child_id(dependencies, segment);
    let mut values = dependencies.clone();
    values.set::<NavigationPathKey>(path);
    (values, id)
}

fn absent_child(combinator: &str) {
    tracing::warn!(
        combinator,
        "A child action was received while its state was absent; the action was ignored"
    );
}

/// Runs a child reducer on optional state.
///
/// Built by [`ReducerExt::if_let`](crate::ReducerExt::if_let) and
/// [`ReducerExt::if_let_identified`](crate::ReducerExt::if_let_identified).
pub struct IfLet<P: Reducer, C: Reducer> {
    parent: P,
    child: C,
    state: StatePath<P::State, Option<C::State>>,
    action: CasePath<P::Action, C::Action>,
    identity: Option<fn(&C::State) -> EffectId>,
}

impl<P: Reducer, C: Reducer> IfLet<P, C> {
    /// Run `child` on `state` for actions in `action`, then `parent`.
    pub const fn new(
        parent: P,
        state: StatePath<P::State, Option<C::State>>,
        action: CasePath<P::Action, C::Action>,
        child: C,
    ) -> Self {
        Self {
            parent,
            child,
            state,
            action,
            identity: None,
        }
    }

    /// Like [`new`](Self::new), but replacing the child with one of a
    /// different id also cancels the replaced child's effects.
    pub fn identified(
        parent: P,
        state: StatePath<P::State, Option<C::State>>,
        action: CasePath<P::Action, C::Action>,
        child: C,
    ) -> Self
    where
        C::State: Identifiable,
        <C::State as Identifiable>::Id: Send + Sync + 'static,
    {
        let identity: fn(&C::State) -> EffectId = |child| EffectId::new(child.id());
        Self {
            identity: Some(identity),
            ..Self::new(parent, state, action, child)
        }
    }

    /// The identity of the child held in `state`: present or not, plus its
    /// id when the child is identified.
    fn child_identity(&self, state: &P::State) -> Option<Option<EffectId>> {
        self.state
            .get(state)
            .as_ref()
            .map(|child| self.identity.map(|identity| identity(child)))
    }

    fn segment(&self, identity: Option<EffectId>) -> EffectId {
        let segment = Segment {
            combinator: "if_let",
            path: self.state.address(),
        };
        match identity {
            Some(identity) => EffectId::new((segment, identity)),
            None => EffectId::new(segment),
        }
    }
}

impl<P, C> Reducer for IfLet<P, C>
where
    P: Reducer,
    P::Action: Clone,
    C: Reducer,
{
    type State = P::State;
    type Action = P::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = Effects::new();

        if let Some(child_action) = self.action.extract(action.clone()) {
            let identity = self.child_identity(state);
            match (identity, self.state.get_mut(state)) {
                (Some(identity), Some(child_state)) => {
                    let (values, id) = child_scope(dependencies, self.segment(identity));
                    let embed = self.action.embedding();
                    let child_effects = values
                        .clone()
                        .enter(|| self.child.reduce(child_state, child_action, &values));
                    effects.extend(
                        child_effects
                            .into_iter()
                            .map(|effect| effect.map(embed).cancellable(id.clone(), false)),
                    );
                },
                _ => absent_child("if_let"),
            }
        }

        let before = self.child_identity(state);
        effects.extend(self.parent.reduce(state, action, dependencies));
        let after = self.child_identity(state);
        if let Some(before) = before.filter(|before| after.as_ref() != Some(before)) {
            let (_, id) = child_id(dependencies, self.segment(before));
            effects.push(Effect::cancel(id));
        }
        effects
    }
}

/// Runs a child reducer on one case of an enum held in state.
///
/// Built by [`ReducerExt::if_case_let`](crate::ReducerExt::if_case_let).
pub struct IfCaseLet<P: Reducer, C: Reducer> {
    parent: P,
    child: C,
    state: OptionalPath<P::State, C::State>,
    action: CasePath<P::Action, C::Action>,
}

impl<P: Reducer, C: Reducer> IfCaseLet<P, C> {
    /// Run `child` on the case `state` selects for actions in `action`,
    /// then `parent`.
    pub const fn new(
        parent: P,
        state: OptionalPath<P::State, C::State>,
        action: CasePath<P::Action, C::Action>,
        child: C,
    ) -> Self {
        Self {
            parent,
            child,
            state,
            action,
        }
    }

    fn segment(&self) -> EffectId {
        EffectId::new(Segment {
            combinator: "if_case_let",
            path: self.state.address(),
        })
    }
}

impl<P, C> Reducer for IfCaseLet<P, C>
where
    P: Reducer,
    P::Action: Clone,
    C: Reducer,
{
    type State = P::State;
    type Action = P::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = Effects::new();

        if let Some(child_action) = self.action.extract(action.clone()) {
            match self.state.get_mut(state) {
                Some(child_state) => {
                    let (values, id) = child_scope(dependencies, self.segment());
                    let embed = self.action.embedding();
                    let child_effects = values
                        .clone()
                        .enter(|| self.child.reduce(child_state, child_action, &values));
                    effects.extend(
                        child_effects
                            .into_iter()
                            .map(|effect| effect.map(embed).cancellable(id.clone(), false)),
                    );
                },
                None => absent_child("if_case_let"),
            }
        }

        let was_present = self.state.get(state).is_some();
        effects.extend(self.parent.reduce(state, action, dependencies));
        if was_present && self.state.get(state).is_none() {
            let (_, id) = child_id(dependencies, self.segment());
            effects.push(Effect::cancel(id));
        }
        effects
    }
}

type ElementId<C> = <<C as Reducer>::State as Identifiable>::Id;

/// Runs a child reducer on elements of a collection.
///
/// Built by [`ReducerExt::for_each`](crate::ReducerExt::for_each).
pub struct ForEach<P: Reducer, C: Reducer>
where
    C::State: Identifiable,
{
    parent: P,
    child: C,
    elements: StatePath<P::State, IdentifiedVec<C::State>>,
    action: CasePath<P::Action, (ElementId<C>, C::Action)>,
}

impl<P: Reducer, C: Reducer> ForEach<P, C>
where
    C::State: Identifiable,
{
    /// Run `child` on the element each action in `action` addresses, then
    /// `parent`.
    pub const fn new(
        parent: P,
        elements: StatePath<P::State, IdentifiedVec<C::State>>,
        action: CasePath<P::Action, (ElementId<C>, C::Action)>,
        child: C,
    ) -> Self {
        Self {
            parent,
            child,
            elements,
            action,
        }
    }
}

impl<P: Reducer, C: Reducer> ForEach<P, C>
where
    C::State: Identifiable,
    ElementId<C>: Send + Sync + 'static,
{
    fn segment(&self, id: ElementId<C>) -> EffectId {
        EffectId::new((
            Segment {
                combinator: "for_each",
                path: self.elements.address(),
            },
            id,
        ))
    }
}

impl<P, C> Reducer for ForEach<P, C>
where
    P: Reducer,
    P::Action: Clone,
    C: Reducer,
    C::State: Identifiable + Clone,
    ElementId<C>: Send + Sync + 'static,
{
    type State = P::State;
    type Action = P::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = Effects::new();

        if let Some((element_id, child_action)) = self.action.extract(action.clone()) {
            match self.elements.get_mut(state).get_mut(&element_id) {
                Some(mut element) => {
                    let (values, id) = child_scope(dependencies, self.segment(element_id.clone()));
                    let embed = self.action.embedding();
                    let child_effects = values
                        .clone()
                        .enter(|| self.child.reduce(&mut element, child_action, &values));
                    drop(element);
                    effects.extend(child_effects.into_iter().map(|effect| {
                        let element_id = element_id.clone();
                        effect
                            .map(move |child| embed((element_id.clone(), child)))
                            .cancellable(id.clone(), false)
                    }));
                },
                None => absent_child("for_each"),
            }
        }

        let before = self.elements.get(state).clone();
        effects.extend(self.parent.reduce(state, action, dependencies));
        let after = self.elements.get(state);
        if !before.ptr_eq(after) {
            for removed in before.ids().filter(|id| !after.contains(id)) {
                let (_, id) = child_id(dependencies, self.segment(removed.clone()));
                effects.push(Effect::cancel(id));
            }
        }
        effects
    }
}

#[derive(Clone)]
struct Presentation {
    id: u64,
    dismiss: Arc<Notify>,
    /// Set while a dismiss listener effect for this presentation exists.
    listening: Arc<AtomicBool>,
}

impl Presentation {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(0);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            dismiss: Arc::new(Notify::new()),
            listening: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the listener slot, unless a listener already holds it.
    fn claim_listener(&self) -> Option<ListenerSlot> {
        (!self.listening.swap(true, Ordering::AcqRel)).then(|| ListenerSlot(Arc::clone(&self.listening)))
    }

    /// A dependency value that asks this presentation to end.
    fn dismiss_effect(&self) -> DismissEffect {
        let notify = Arc::clone(&self.dismiss);
        DismissEffect::new(move || notify.notify_one())
    }

    /// The effect that waits for the child to dismiss itself and then sends
    /// `dismissed`, unless one already exists for this presentation.
    fn listener<A: Send + 'static>(&self, id: EffectId, dismissed: A) -> Option<Effect<A>> {
        let slot = self.claim_listener()?;
        let notify = Arc::clone(&self.dismiss);
        let listener = Effect::run(move |send| async move {
            let _slot = slot;
            notify.notified().await;
            send.send(dismissed);
        });
        Some(
            listener
                .cancellable(id, false)
                .cancellable(PresentationListener, false),
        )
    }
}

/// Frees the listener slot when the listener effect is dropped, whether it
/// finished, was cancelled or never ran.
struct ListenerSlot(Arc<AtomicBool>);

impl Drop for ListenerSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// State for a feature that can be presented and dismissed.
///
/// Every presentation gets a fresh identity, so replacing one presented
/// child with another cancels the first child's effects. Equality compares
/// only the presented state.
pub struct PresentationState<S> {
    state: Option<S>,
    presentation: Option<Presentation>,
}

impl<S> PresentationState<S> {
    /// Nothing presented.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            state: None,
            presentation: None,
        }
    }

    /// `state` presented.
    #[must_use]
    pub fn presented(state: S) -> Self {
        Self {
            state: Some(state),
            presentation: Some(Presentation::next()),
        }
    }

    /// Present `state`, replacing anything presented.
    pub fn present(&mut self, state: S) {
        *self = Self::presented(state);
    }

    /// Dismiss the presented state.
    pub fn dismiss(&mut self) {
        self.state = None;
        self.presentation = None;
    }

    /// Whether something is presented.
    #[must_use]
    pub const fn is_presented(&self) -> bool {
        self.state.is_some()
    }

    /// The presented state.
    #[must_use]
    pub const fn get(&self) -> Option<&S> {
        self.state.as_ref()
    }

    /// The presented state, mutably. Mutation keeps the presentation's
    /// identity.
    pub const fn get_mut(&mut self) -> Option<&mut S> {
        self.state.as_mut()
    }

    /// Dismiss, returning what was presented.
    pub fn take(&mut self) -> Option<S> {
        self.presentation = None;
        self.state.take()
    }

    fn presentation_id(&self) -> Option<u64> {
        self.presentation.as_ref().map(|presentation| presentation.id)
    }
}

impl<S> Default for PresentationState<S> {
    fn default() -> Self {
        Self::none()
    }
}

impl<S: Clone> Clone for PresentationState<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            presentation: self.presentation.clone(),
        }
    }
}

impl<S: PartialEq> PartialEq for PresentationState<S> {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl<S: Eq> Eq for PresentationState<S> {}

impl<S: fmt::Debug> fmt::Debug for PresentationState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PresentationState").field(&self.state).finish()
    }
}

impl<S> From<Option<S>> for PresentationState<S> {
    fn from(state: Option<S>) -> Self {
        state.map_or_else(Self::none, Self::presented)
    }
}

/// Actions for a presented feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationAction<A> {
    /// An action for the presented child.
    Presented(A),
    /// Dismiss the child. The parent sees this action while the child is
    /// still presented; the state is cleared afterwards.
    Dismiss,
}

/// Runs a child reducer on presented state and wires up dismissal.
///
/// While a child is presented its reducer and effects see a working
/// [`DismissEffect`]; calling it feeds [`PresentationAction::Dismiss`] back
/// to the parent.
///
/// Built by [`ReducerExt::presents`](crate::ReducerExt::presents).
pub struct Presents<P: Reducer, C: Reducer> {
    parent: P,
    child: C,
    state: StatePath<P::State, PresentationState<C::State>>,
    action: CasePath<P::Action, PresentationAction<C::Action>>,
}

impl<P: Reducer, C: Reducer> Presents<P, C> {
    /// Run `child` on `state` for actions in `action`, then `parent`.
    pub const fn new(
        parent: P,
        state: StatePath<P::State, PresentationState<C::State>>,
        action: CasePath<P::Action, PresentationAction<C::Action>>,
        child: C,
    ) -> Self {
        Self {
            parent,
            child,
            state,
            action,
        }
    }

    fn segment(&self, presentation: u64) -> EffectId {
        EffectId::new((
            Segment {
                combinator: "presents",
                path: self.state.address(),
            },
            presentation,
        ))
    }
}

impl<P, C> Reducer for Presents<P, C>
where
    P: Reducer,
    P::Action: Clone,
    C: Reducer,
{
    type State = P::State;
    type Action = P::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = Effects::new();
        let before = self.state.get(state).presentation_id();
        let embed = self.action.embedding();

        let mut dismissing = false;
        match self.action.extract(action.clone()) {
            Some(PresentationAction::Presented(child_action)) => {
                let presented = self.state.get_mut(state);
                match (presented.presentation.clone(), presented.state.as_mut()) {
                    (Some(presentation), Some(child_state)) => {
                        let (mut values, id) =
                            child_scope(dependencies, self.segment(presentation.id));
                        values.set::<DismissKey>(presentation.dismiss_effect());
                        let child_effects = values
                            .clone()
                            .enter(|| self.child.reduce(child_state, child_action, &values));
                        effects.extend(child_effects.into_iter().map(|effect| {
                            effect
                                .map(move |child| embed(PresentationAction::Presented(child)))
                                .cancellable(id.clone(), false)
                        }));
                    },
                    _ => absent_child("presents"),
                }
            },
            Some(PresentationAction::Dismiss) => dismissing = true,
            None => {},
        }

        effects.extend(self.parent.reduce(state, action, dependencies));
        if dismissing {
            self.state.get_mut(state).dismiss();
        }

        let after = self.state.get(state).presentation.clone();
        let after_id = after.as_ref().map(|presentation| presentation.id);

        if let Some(before) = before.filter(|&before| Some(before) != after_id) {
            let (_, id) = child_id(dependencies, self.segment(before));
            effects.push(Effect::cancel(id));
        }

        // A presentation that has no listener yet gets one, including one
        // that was already presented in the initial state.
        if let Some(presentation) = after {
            let (_, id) = child_id(dependencies, self.segment(presentation.id));
            effects.extend(presentation.listener(id, embed(PresentationAction::Dismiss)));
        }

        effects
    }
}

/// Identity of an element pushed onto a [`StackState`].
///
/// Ids are never reused, so an action addressed to a popped element cannot
/// reach one pushed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackElementId(u64);

impl fmt::Display for StackElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct StackElement<S> {
    state: S,
    presentation: Presentation,
}

impl<S> StackElement<S> {
    fn id(&self) -> StackElementId {
        StackElementId(self.presentation.id)
    }
}

impl<S: Clone> Clone for StackElement<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            presentation: self.presentation.clone(),
        }
    }
}

/// A navigation stack: features pushed on top of each other, each with its
/// own identity.
///
/// Equality compares only the pushed states, bottom to top.
pub struct StackState<S> {
    elements: Vec<StackElement<S>>,
}

impl<S> StackState<S> {
    /// An empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self { elements: Vec::new() }
    }

    /// Push `state` on top, returning its id.
    pub fn push(&mut self, state: S) -> StackElementId {
        let element = StackElement {
            state,
            presentation: Presentation::next(),
        };
        let id = element.id();
        self.elements.push(element);
        id
    }

    /// Remove the top element.
    pub fn pop(&mut self) -> Option<S> {
        self.elements.pop().map(|element| element.state)
    }

    /// Remove `id` and everything above it. Returns whether `id` was found.
    pub fn pop_from(&mut self, id: StackElementId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.elements.truncate(index);
                true
            },
            None => false,
        }
    }

    /// Remove everything above `id`. Returns whether `id` was found.
    pub fn pop_to(&mut self, id: StackElementId) -> bool {
        match self.position(id) {
            Some(index) => {
                self.elements.truncate(index + 1);
                true
            },
            None => false,
        }
    }

    /// Remove every element.
    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// The state pushed under `id`.
    #[must_use]
    pub fn get(&self, id: StackElementId) -> Option<&S> {
        self.position(id).map(|index| &self.elements[index].state)
    }

    /// The state pushed under `id`, mutably.
    pub fn get_mut(&mut self, id: StackElementId) -> Option<&mut S> {
        self.position(id).map(|index| &mut self.elements[index].state)
    }

    /// The top element's state.
    #[must_use]
    pub fn last(&self) -> Option<&S> {
        self.elements.last().map(|element| &element.state)
    }

    /// Element ids, bottom to top.
    pub fn ids(&self) -> impl Iterator<Item = StackElementId> + '_ {
        self.elements.iter().map(StackElement::id)
    }

    /// Element states, bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.elements.iter().map(|element| &element.state)
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    fn position(&self, id: StackElementId) -> Option<usize> {
        self.elements.iter().position(|element| element.id() == id)
    }

}

impl<S> Default for StackState<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> Clone for StackState<S> {
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
        }
    }
}

impl<S: PartialEq> PartialEq for StackState<S> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl<S: Eq> Eq for StackState<S> {}

impl<S: fmt::Debug> fmt::Debug for StackState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.elements.iter().map(|element| (element.id(), &element.state)))
            .finish()
    }
}

impl<S> FromIterator<S> for StackState<S> {
    fn from_iter<I: IntoIterator<Item = S>>(states: I) -> Self {
        let mut stack = Self::new();
        for state in states {
            stack.push(state);
        }
        stack
    }
}

impl<S> From<Vec<S>> for StackState<S> {
    fn from(states: Vec<S>) -> Self {
        states.into_iter().collect()
    }
}

/// Actions for a navigation stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackAction<A> {
    /// An action for the element with this id.
    Element(StackElementId, A),
    /// Pop this element and everything above it. Sent when an element
    /// dismisses itself.
    PopFrom(StackElementId),
    /// Pop everything above this element.
    PopTo(StackElementId),
    /// Pop every element.
    PopToRoot,
}

/// Runs a child reducer on the elements of a navigation stack and wires up
/// dismissal for each of them.
///
/// The parent sees pop actions while the popped elements are still on the
/// stack; they are removed afterwards. Effects of removed elements are
/// cancelled. An element that calls its [`DismissEffect`] is popped with
/// [`StackAction::PopFrom`].
///
/// Built by [`ReducerExt::for_each_stack`](crate::ReducerExt::for_each_stack).
pub struct ForEachStack<P: Reducer, C: Reducer> {
    parent: P,
    child: C,
    stack: StatePath<P::State, StackState<C::State>>,
    action: CasePath<P::Action, StackAction<C::Action>>,
}

impl<P: Reducer, C: Reducer> ForEachStack<P, C> {
    /// Run `child` on the element each action in `action` addresses, then
    /// `parent`.
    pub const fn new(
        parent: P,
        stack: StatePath<P::State, StackState<C::State>>,
        action: CasePath<P::Action, StackAction<C::Action>>,
        child: C,
    ) -> Self {
        Self {
            parent,
            child,
            stack,
            action,
        }
    }

    fn segment(&self, element: StackElementId) -> EffectId {
        EffectId::new((
            Segment {
                combinator: "for_each_stack",
                path: self.stack.address(),
            },
            element,
        ))
    }
}

impl<P, C> Reducer for ForEachStack<P, C>
where
    P: Reducer,
    P::Action: Clone,
    C: Reducer,
{
    type State = P::State;
    type Action = P::Action;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let mut effects = Effects::new();
        let embed = self.action.embedding();
        let before: Vec<StackElementId> = self.stack.get(state).ids().collect();

        let mut pop = None;
        match self.action.extract(action.clone()) {
            Some(StackAction::Element(element_id, child_action)) => {
                let stack = self.stack.get_mut(state);
                match stack.position(element_id) {
                    Some(index) => {
                        let element = &mut stack.elements[index];
                        let (mut values, id) = child_scope(dependencies, self.segment(element_id));
                        values.set::<DismissKey>(element.presentation.dismiss_effect());
                        let child_state = &mut element.state;
                        let child_effects = values
                            .clone()
                            .enter(|| self.child.reduce(child_state, child_action, &values));
                        effects.extend(child_effects.into_iter().map(|effect| {
                            effect
                                .map(move |child| embed(StackAction::Element(element_id, child)))
                                .cancellable(id.clone(), false)
                        }));
                    },
                    None => absent_child("for_each_stack"),
                }
            },
            Some(other) => pop = Some(other),
            None => {},
        }

        effects.extend(self.parent.reduce(state, action, dependencies));

        let stack = self.stack.get_mut(state);
        let popped = match pop {
            Some(StackAction::PopFrom(id)) => stack.pop_from(id),
            Some(StackAction::PopTo(id)) => stack.pop_to(id),
            Some(StackAction::PopToRoot) => {
                stack.clear();
                true
            },
            Some(StackAction::Element(..)) | None => true,
        };
        if !popped {
            tracing::warn!("A pop action named an element that is not on the stack; the action was ignored");
        }

        let stack = self.stack.get(state);
        for removed in before.iter().filter(|id| stack.position(**id).is_none()) {
            let (_, id) = child_id(dependencies, self.segment(*removed));
            effects.push(Effect::cancel(id));
        }
        for element in &stack.elements {
            let element_id = element.id();
            let (_, id) = child_id(dependencies, self.segment(element_id));
            effects.extend(
                element
                    .presentation
                    .listener(id, embed(StackAction::PopFrom(element_id))),
            );
        }

        effects
    }
}

impl From<PresentationListener> for EffectId {
    fn from(listener: PresentationListener) -> Self {
        Self::new(listener)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::reducer::{Reduce, ReducerExt};
    use crate::{case_path, state_path};

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: u8,
        count: i32,
    }

    impl Identifiable for Row {
        type Id = u8;

        fn id(&self) -> u8 {
            self.id
        }
    }

    #[derive(Debug, Clone)]
    enum RowAction {
        Increment,
        StartTimer,
    }

    fn row_reducer() -> impl Reducer<State = Row, Action = RowAction> {
        Reduce::new(|row: &mut Row, action: RowAction, _| match action {
            RowAction::Increment => {
                row.count += 1;
                Effects::new()
            },
            RowAction::StartTimer => {
                let mut effects = Effects::new();
                effects.push(Effect::run(|_| async {}));
                effects
            },
        })
    }

    #[derive(Debug, Clone, Default)]
    struct List {
        rows: IdentifiedVec<Row>,
        detail: Option<Row>,
        sheet: PresentationState<Row>,
    }

    #[derive(Debug, Clone)]
    enum ListAction {
        Row((u8, RowAction)),
        Remove(u8),
        Detail(RowAction),
        CloseDetail,
        SwapDetail,
        Sheet(PresentationAction<RowAction>),
        OpenSheet,
    }

    fn list_reducer() -> impl Reducer<State = List, Action = ListAction> {
        Reduce::new(|list: &mut List, action: ListAction, _| {
            match action {
                ListAction::Remove(id) => {
                    let _removed = list.rows.remove(&id);
                },
                ListAction::CloseDetail => list.detail = None,
                ListAction::SwapDetail => list.detail = Some(Row { id: 6, count: 0 }),
                ListAction::OpenSheet => list.sheet.present(Row { id: 9, count: 0 }),
                _ => {},
            }
            Effects::new()
        })
    }

    fn cancel_ids<A>(effects: &Effects<A>) -> Vec<EffectId> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Cancel(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    fn cancellable_ids<A>(effects: &Effects<A>) -> Vec<EffectId> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Cancellable { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn for_each_routes_by_id_and_cancels_removed_rows() {
        let reducer = list_reducer().for_each(
            state_path!(List => rows),
            CasePath::new(ListAction::Row, |action| match action {
                ListAction::Row(row) => Some(row),
                _ => None,
            }),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List {
            rows: vec![Row { id: 1, count: 0 }, Row { id: 2, count: 0 }].into(),
            ..List::default()
        };

        reducer.reduce(&mut list, ListAction::Row((2, RowAction::Increment)), &deps);
        assert_eq!(list.rows.get(&2).unwrap().count, 1);
        assert_eq!(list.rows.get(&1).unwrap().count, 0);

        let started = reducer.reduce(&mut list, ListAction::Row((1, RowAction::StartTimer)), &deps);
        let started = cancellable_ids(&started);
        assert_eq!(started.len(), 1);

        let removed = reducer.reduce(&mut list, ListAction::Remove(1), &deps);
        assert_eq!(cancel_ids(&removed), started);

        // Late actions for the removed row are ignored.
        let late = reducer.reduce(&mut list, ListAction::Row((1, RowAction::Increment)), &deps);
        assert!(late.is_empty());
        assert_eq!(list.rows.len(), 1);
    }

    #[test]
    fn if_let_cancels_child_effects_when_state_clears() {
        let reducer = list_reducer().if_let(
            state_path!(List => detail),
            case_path!(ListAction::Detail),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List {
            detail: Some(Row { id: 5, count: 0 }),
            ..List::default()
        };

        let started = reducer.reduce(&mut list, ListAction::Detail(RowAction::StartTimer), &deps);
        let started = cancellable_ids(&started);

        let closed = reducer.reduce(&mut list, ListAction::CloseDetail, &deps);
        assert_eq!(cancel_ids(&closed), started);

        let ignored = reducer.reduce(&mut list, ListAction::Detail(RowAction::Increment), &deps);
        assert!(ignored.is_empty());
    }

    #[test]
    fn if_let_identified_cancels_a_replaced_child() {
        let reducer = list_reducer().if_let_identified(
            state_path!(List => detail),
            case_path!(ListAction::Detail),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List {
            detail: Some(Row { id: 5, count: 0 }),
            ..List::default()
        };

        let started = reducer.reduce(&mut list, ListAction::Detail(RowAction::StartTimer), &deps);
        let started = cancellable_ids(&started);

        // Mutating the same child keeps its effects.
        let kept = reducer.reduce(&mut list, ListAction::Detail(RowAction::Increment), &deps);
        assert!(cancel_ids(&kept).is_empty());

        let swapped = reducer.reduce(&mut list, ListAction::SwapDetail, &deps);
        assert_eq!(cancel_ids(&swapped), started);

        let restarted = reducer.reduce(&mut list, ListAction::Detail(RowAction::StartTimer), &deps);
        assert_ne!(cancellable_ids(&restarted), started);
    }

    #[test]
    fn if_let_without_identity_keeps_effects_across_replacement() {
        let reducer = list_reducer().if_let(
            state_path!(List => detail),
            case_path!(ListAction::Detail),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List {
            detail: Some(Row { id: 5, count: 0 }),
            ..List::default()
        };

        let swapped = reducer.reduce(&mut list, ListAction::SwapDetail, &deps);
        assert!(cancel_ids(&swapped).is_empty());
    }

    #[test]
    fn presents_listens_to_a_child_presented_from_the_start() {
        let reducer = list_reducer().presents(
            state_path!(List => sheet),
            case_path!(ListAction::Sheet),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List {
            sheet: PresentationState::presented(Row { id: 3, count: 0 }),
            ..List::default()
        };

        let first = reducer.reduce(
            &mut list,
            ListAction::Sheet(PresentationAction::Presented(RowAction::Increment)),
            &deps,
        );
        assert_eq!(cancellable_ids(&first), [EffectId::new(PresentationListener)]);

        // Only one listener at a time.
        let second = reducer.reduce(&mut list, ListAction::CloseDetail, &deps);
        assert!(second.is_empty());

        // A listener that is dropped frees its slot.
        drop(first);
        let third = reducer.reduce(&mut list, ListAction::CloseDetail, &deps);
        assert_eq!(cancellable_ids(&third), [EffectId::new(PresentationListener)]);
    }

    #[test]
    fn nested_navigation_ids_include_the_parent_path() {
        let first = child_scope(&DependencyValues::test(), EffectId::new(1)).0;
        let (_, nested_a) = child_id(&first, EffectId::new("child"));

        let second = child_scope(&DependencyValues::test(), EffectId::new(2)).0;
        let (_, nested_b) = child_id(&second, EffectId::new("child"));

        assert_ne!(nested_a, nested_b);
    }

    #[test]
    fn presents_starts_listener_and_dismisses() {
        let reducer = list_reducer().presents(
            state_path!(List => sheet),
            case_path!(ListAction::Sheet),
            row_reducer(),
        );
        let deps = DependencyValues::test();
        let mut list = List::default();

        let opened = reducer.reduce(&mut list, ListAction::OpenSheet, &deps);
        assert!(list.sheet.is_presented());
        assert!(matches!(
            opened.as_slice(),
            [Effect::Cancellable { id, .. }] if id.is::<PresentationListener>()
        ));

        reducer.reduce(
            &mut list,
            ListAction::Sheet(PresentationAction::Presented(RowAction::Increment)),
            &deps,
        );
        assert_eq!(list.sheet.get().unwrap().count, 1);

        let dismissed = reducer.reduce(&mut list, ListAction::Sheet(PresentationAction::Dismiss), &deps);
        assert!(!list.sheet.is_presented());
        assert_eq!(cancel_ids(&dismissed).len(), 1);
    }

    #[derive(Debug, Clone, Default)]
    struct Path {
        stack: StackState<Row>,
    }

    #[derive(Debug, Clone)]
    enum PathAction {
        Push(u8),
        Stack(StackAction<RowAction>),
    }

    fn child_effect_ids<A>(effects: &Effects<A>) -> Vec<EffectId> {
        cancellable_ids(effects)
            .into_iter()
            .filter(|id| !id.is::<PresentationListener>())
            .collect()
    }

    #[test]
    fn for_each_stack_routes_by_element_and_cancels_popped_ones() {
        let reducer = Reduce::new(|path: &mut Path, action: PathAction, _| {
            if let PathAction::Push(id) = action {
                path.stack.push(Row { id, count: 0 });
            }
            Effects::new()
        })
        .for_each_stack(state_path!(Path => stack), case_path!(PathAction::Stack), row_reducer());
        let deps = DependencyValues::test();
        let mut path = Path::default();

        let first_pushed = reducer.reduce(&mut path, PathAction::Push(1), &deps);
        assert_eq!(cancellable_ids(&first_pushed), [EffectId::new(PresentationListener)]);
        let _second_pushed = reducer.reduce(&mut path, PathAction::Push(2), &deps);
        let ids: Vec<StackElementId> = path.stack.ids().collect();
        assert_eq!(ids.len(), 2);

        reducer.reduce(&mut path, PathAction::Stack(StackAction::Element(ids[1], RowAction::Increment)), &deps);
        assert_eq!(path.stack.get(ids[1]).unwrap().count, 1);
        assert_eq!(path.stack.get(ids[0]).unwrap().count, 0);

        let started = reducer.reduce(&mut path, PathAction::Stack(StackAction::Element(ids[0], RowAction::StartTimer)), &deps);
        let started = child_effect_ids(&started);
        assert_eq!(started.len(), 1);

        let popped_to = reducer.reduce(&mut path, PathAction::Stack(StackAction::PopTo(ids[0])), &deps);
        assert_eq!(path.stack.len(), 1);
        assert_eq!(cancel_ids(&popped_to).len(), 1);
        assert_ne!(cancel_ids(&popped_to), started);

        let popped_from = reducer.reduce(&mut path, PathAction::Stack(StackAction::PopFrom(ids[0])), &deps);
        assert!(path.stack.is_empty());
        assert_eq!(cancel_ids(&popped_from), started);

        let late = reducer.reduce(&mut path, PathAction::Stack(StackAction::Element(ids[0], RowAction::Increment)), &deps);
        assert!(late.is_empty());
    }

    #[test]
    fn stack_state_pops_and_compares_by_state() {
        let mut stack: StackState<u8> = vec![1, 2, 3].into();
        let ids: Vec<StackElementId> = stack.ids().collect();

        assert!(stack.pop_to(ids[1]));
        assert_eq!(stack.iter().copied().collect::<Vec<_>>(), [1, 2]);
        assert!(!stack.pop_from(ids[2]));

        let top = stack.push(4);
        assert_ne!(top, ids[2]);
        assert_eq!(stack.last(), Some(&4));
        assert_eq!(stack, StackState::from(vec![1, 2, 4]));

        assert!(stack.pop_from(ids[1]));
        assert_eq!(stack.pop(), Some(1));
        assert!(stack.is_empty());
    }

    #[test]
    fn presentation_equality_ignores_identity() {
        let a = PresentationState::presented(1);
        let b = PresentationState::presented(1);
        assert_eq!(a, b);
        assert_ne!(a.presentation_id(), b.presentation_id());
        assert_eq!(PresentationState::<i32>::none(), PresentationState::from(None));
    }
}

//! Store module - The runtime for reducers
//!
//! A [`Store`] owns a root state, serializes the actions sent to it and runs
//! the effects its reducer returns. Scoped stores are views onto part of a
//! parent store: they read through a state path and forward their actions,
//! embedded, to the parent.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use composable_arch_core::{
    CasePath, DependencyValues, EffectId, Identifiable, IdentifiedVec, PresentationAction,
    PresentationState, Reducer, ReducerExt, StatePath,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::handle::EffectHandle;
use crate::root::RootCore;

/// What a store needs from whatever backs it: the root, or a projection of
/// a parent.
pub(crate) trait StoreCore<S, A>: Send + Sync {
    fn send(&self, action: A) -> Result<EffectHandle, StoreError>;

    /// Visit the current state. Implementations call `visit` exactly once.
    fn read(&self, visit: &mut dyn FnMut(&S));

    fn subscribe_actions(&self) -> ActionSubscription<A>;

    fn changes(&self) -> watch::Receiver<u64>;

    fn cancel(&self, id: &EffectId) -> usize;

    fn cancel_all(&self) -> usize;

    fn in_flight(&self, id: &EffectId) -> usize;

    fn begin_shutdown(&self);

    fn pending_effects(&self) -> usize;

    fn config(&self) -> &StoreConfig;
}

/// The Store - runtime coordinator for a reducer
///
/// The Store manages:
/// 1. State (behind a lock, mutated only by the reducer)
/// 2. Reducer (business logic)
/// 3. Dependencies (resolved when the store is created)
/// 4. Effect execution (with feedback loop)
///
/// Cloning a store is cheap and yields another handle to the same state.
/// When the last handle to the root store is dropped, its in-flight effects
/// are cancelled.
///
/// # Example
///
/// ```
/// use composable_arch_core::{Effects, Reduce};
/// use composable_arch_runtime::Store;
///
/// # fn main() -> Result<(), composable_arch_runtime::StoreError> {
/// let store = Store::new(
///     0_i64,
///     Reduce::new(|count: &mut i64, delta: i64, _| {
///         *count += delta;
///         Effects::new()
///     }),
/// );
///
/// store.send(2)?;
/// store.send(3)?;
/// assert_eq!(store.state(|count| *count), 5);
/// # Ok(())
/// # }
/// ```
pub struct Store<S, A> {
    core: Arc<dyn StoreCore<S, A>>,
}

impl<S, A> Clone for Store<S, A> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S, A> fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("pending_effects", &self.core.pending_effects())
            .finish_non_exhaustive()
    }
}

impl<S, A> Store<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    /// Create a new store with initial state and reducer
    ///
    /// The store resolves dependencies from the values in scope when it is
    /// created.
    #[must_use]
    pub fn new<R>(initial_state: S, reducer: R) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        Self::from_parts(
            initial_state,
            reducer,
            DependencyValues::current(),
            StoreConfig::default(),
        )
    }

    /// Create a new Store with custom configuration
    #[must_use]
    pub fn with_config<R>(initial_state: S, reducer: R, config: StoreConfig) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        Self::from_parts(initial_state, reducer, DependencyValues::current(), config)
    }

    /// Create a store whose reducer and effects see the dependencies in
    /// scope, modified by `prepare`.
    ///
    /// ```
    /// use composable_arch_core::dependencies::{DateGenerator, DateKey};
    /// use composable_arch_core::{DateTime, Effects, Reduce, dependency};
    /// use composable_arch_runtime::Store;
    ///
    /// # fn main() -> Result<(), composable_arch_runtime::StoreError> {
    /// let store = Store::with_dependencies(
    ///     None,
    ///     Reduce::new(|stamp: &mut Option<DateTime<_>>, (): (), _| {
    ///         *stamp = Some(dependency::<DateKey>().now());
    ///         Effects::new()
    ///     }),
    ///     |values| values.set::<DateKey>(DateGenerator::constant(DateTime::UNIX_EPOCH)),
    /// );
    /// store.send(())?;
    /// assert_eq!(store.state(|stamp| *stamp), Some(DateTime::UNIX_EPOCH));
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn with_dependencies<R>(
        initial_state: S,
        reducer: R,
        prepare: impl FnOnce(&mut DependencyValues),
    ) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        let mut dependencies = DependencyValues::current();
        prepare(&mut dependencies);
        Self::from_parts(initial_state, reducer, dependencies, StoreConfig::default())
    }

    /// Create a store from every part explicitly.
    #[must_use]
    pub fn from_parts<R>(
        initial_state: S,
        reducer: R,
        dependencies: DependencyValues,
        config: StoreConfig,
    ) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        Self {
            core: RootCore::new(initial_state, reducer.boxed(), dependencies, config),
        }
    }

    /// Send an action to the store
    ///
    /// The action is queued behind any action being processed and reduced
    /// before this call returns, unless another thread is draining the
    /// queue, in which case that thread reduces it. Effects start as soon as
    /// the reducer returns them and run concurrently with later actions.
    ///
    /// # Returns
    ///
    /// An [`EffectHandle`] that completes when this action's effects finish.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownInProgress`] if the store is shutting down.
    ///
    /// # Panics
    ///
    /// If the reducer panics, the panic propagates to the caller. Reducers
    /// should be pure functions that do not panic.
    #[tracing::instrument(skip(self, action), name = "store_send")]
    pub fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
        self.core.send(action)
    }

    /// Send an action and wait for a matching action fed back by effects
    ///
    /// Subscribes before sending, so no matching action can be missed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Timeout`]: Timeout expired before matching action received
    /// - [`StoreError::ChannelClosed`]: The store was dropped
    /// - [`StoreError::ShutdownInProgress`]: Store is shutting down
    pub async fn send_and_wait_for<F>(
        &self,
        action: A,
        predicate: F,
        timeout: Duration,
    ) -> Result<A, StoreError>
    where
        F: Fn(&A) -> bool,
    {
        let mut actions = self.subscribe_actions();
        self.send(action)?;

        tokio::time::timeout(timeout, async {
            loop {
                match actions.recv().await {
                    Ok(action) if predicate(&action) => return Ok(action),
                    Ok(_) => {},
                    Err(error) => return Err(error),
                }
            }
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    /// Read current state via a closure
    ///
    /// ```ignore
    /// let todo_count = store.state(|s| s.todos.len());
    /// ```
    pub fn state<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&S) -> T,
    {
        let mut f = Some(f);
        let mut output = None;
        self.core.read(&mut |state| {
            if let Some(f) = f.take() {
                output = Some(f(state));
            }
        });
        #[allow(clippy::expect_used)] // every core visits its state exactly once
        output.expect("store cores always visit their state")
    }

    /// A copy of the current state.
    #[must_use]
    pub fn current_state(&self) -> S
    where
        S: Clone,
    {
        self.state(S::clone)
    }

    /// A receiver that changes after every reduced action.
    ///
    /// The value counts the actions the root store has reduced.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.core.changes()
    }

    /// Subscribe to actions fed back by effects
    ///
    /// Actions passed to [`send`](Self::send) are not broadcast. A scoped
    /// store yields only the parent actions that carry one of its actions.
    #[must_use]
    pub fn subscribe_actions(&self) -> ActionSubscription<A> {
        self.core.subscribe_actions()
    }

    /// A store for a field of this store's state and one case of its action.
    #[must_use]
    pub fn scope<CS, CA>(&self, state: StatePath<S, CS>, action: CasePath<A, CA>) -> Store<CS, CA>
    where
        CS: Send + Sync + 'static,
        CA: Clone + Send + 'static,
    {
        self.project(
            projection(move |parent| Some(state.get(parent))),
            move |child| action.embed(child),
            move |parent| action.extract(parent),
            None,
        )
    }

    /// A store for optional child state, if it is currently present.
    ///
    /// After the state becomes absent the child store keeps reading the
    /// last value it saw. Its actions still reach the parent, whose
    /// reducer ignores them.
    #[must_use]
    pub fn scope_if_let<CS, CA>(
        &self,
        state: StatePath<S, Option<CS>>,
        action: CasePath<A, CA>,
    ) -> Option<Store<CS, CA>>
    where
        CS: Clone + Send + Sync + 'static,
        CA: Clone + Send + 'static,
    {
        let initial = self.state(|parent| state.get(parent).clone())?;
        Some(self.project(
            projection(move |parent| state.get(parent).as_ref()),
            move |child| action.embed(child),
            move |parent| action.extract(parent),
            Some(LastValue::new(initial)),
        ))
    }

    /// A store for the element of a collection with `id`, if present.
    #[must_use]
    pub fn scope_element<CS, CA>(
        &self,
        elements: StatePath<S, IdentifiedVec<CS>>,
        id: CS::Id,
        action: CasePath<A, (CS::Id, CA)>,
    ) -> Option<Store<CS, CA>>
    where
        CS: Identifiable + Clone + Send + Sync + 'static,
        CS::Id: Send + Sync + 'static,
        CA: Clone + Send + 'static,
    {
        let initial = self.state(|parent| elements.get(parent).get(&id).cloned())?;
        let embed_id = id.clone();
        let extract_id = id.clone();
        Some(self.project(
            projection(move |parent| elements.get(parent).get(&id)),
            move |child| action.embed((embed_id.clone(), child)),
            move |parent| {
                action
                    .extract(parent)
                    .and_then(|(id, child)| (id == extract_id).then_some(child))
            },
            Some(LastValue::new(initial)),
        ))
    }

    /// A store for a presented child, if one is presented.
    #[must_use]
    pub fn scope_presented<CS, CA>(
        &self,
        state: StatePath<S, PresentationState<CS>>,
        action: CasePath<A, PresentationAction<CA>>,
    ) -> Option<Store<CS, CA>>
    where
        CS: Clone + Send + Sync + 'static,
        CA: Clone + Send + 'static,
    {
        let initial = self.state(|parent| state.get(parent).get().cloned())?;
        Some(self.project(
            projection(move |parent| state.get(parent).get()),
            move |child| action.embed(PresentationAction::Presented(child)),
            move |parent| match action.extract(parent) {
                Some(PresentationAction::Presented(child)) => Some(child),
                _ => None,
            },
            Some(LastValue::new(initial)),
        ))
    }

    fn project<CS, CA>(
        &self,
        project: Projection<S, CS>,
        embed: impl Fn(CA) -> A + Send + Sync + 'static,
        extract: impl Fn(A) -> Option<CA> + Send + Sync + 'static,
        last: Option<LastValue<CS>>,
    ) -> Store<CS, CA>
    where
        CS: Send + Sync + 'static,
        CA: Clone + Send + 'static,
    {
        Store {
            core: Arc::new(ScopedCore {
                parent: Arc::clone(&self.core),
                project,
                embed: Box::new(embed),
                extract: Arc::new(extract),
                last,
            }),
        }
    }

    /// Cancel effects running under `id`. Returns how many were signalled.
    pub fn cancel(&self, id: impl Into<EffectId>) -> usize {
        self.core.cancel(&id.into())
    }

    /// Cancel every running effect, cancellable or not. Returns how many
    /// effect tasks were signalled.
    pub fn cancel_all(&self) -> usize {
        self.core.cancel_all()
    }

    /// Whether an effect is running under `id`.
    #[must_use]
    pub fn is_in_flight(&self, id: impl Into<EffectId>) -> bool {
        self.in_flight(id) > 0
    }

    /// Number of effects running under `id`.
    #[must_use]
    pub fn in_flight(&self, id: impl Into<EffectId>) -> usize {
        self.core.in_flight(&id.into())
    }

    /// Number of effect tasks currently running.
    #[must_use]
    pub fn pending_effects(&self) -> usize {
        self.core.pending_effects()
    }

    /// Initiate graceful shutdown of the store
    ///
    /// This method:
    /// 1. Sets the shutdown flag (rejecting new actions)
    /// 2. Waits for pending effects to complete (with timeout)
    /// 3. Returns when all effects finish or timeout expires
    ///
    /// Effects still running may feed actions back while the store drains.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ShutdownTimeout`] if the timeout expires before all
    /// pending effects complete.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), StoreError> {
        tracing::info!("Initiating graceful shutdown");
        self.core.begin_shutdown();

        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let pending = self.core.pending_effects();

            if pending == 0 {
                tracing::info!("All effects completed, shutdown successful");
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::error!(
                    pending_effects = pending,
                    "Shutdown timeout: {} effects still running",
                    pending
                );
                return Err(StoreError::ShutdownTimeout(pending));
            }

            tracing::debug!(
                pending_effects = pending,
                elapsed_ms = start.elapsed().as_millis(),
                "Waiting for effects to complete"
            );

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// [`shutdown`](Self::shutdown) with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`shutdown`](Self::shutdown).
    pub async fn shutdown_with_default_timeout(&self) -> Result<(), StoreError> {
        let timeout = self.core.config().default_shutdown_timeout;
        self.shutdown(timeout).await
    }
}

type Projection<PS, CS> = Box<dyn Fn(&PS) -> Option<&CS> + Send + Sync>;

fn projection<PS, CS, F>(project: F) -> Projection<PS, CS>
where
    F: Fn(&PS) -> Option<&CS> + Send + Sync + 'static,
{
    Box::new(project)
}

/// The last child state seen through an optional projection.
struct LastValue<CS> {
    value: Mutex<CS>,
    refresh: fn(&CS) -> CS,
}

impl<CS: Clone> LastValue<CS> {
    fn new(value: CS) -> Self {
        Self {
            value: Mutex::new(value),
            refresh: CS::clone,
        }
    }
}

struct ScopedCore<PS, PA, CS, CA> {
    parent: Arc<dyn StoreCore<PS, PA>>,
    project: Projection<PS, CS>,
    embed: Box<dyn Fn(CA) -> PA + Send + Sync>,
    extract: Arc<dyn Fn(PA) -> Option<CA> + Send + Sync>,
    last: Option<LastValue<CS>>,
}

impl<PS, PA, CS, CA> StoreCore<CS, CA> for ScopedCore<PS, PA, CS, CA>
where
    PS: Send + Sync + 'static,
    PA: Send + 'static,
    CS: Send + Sync + 'static,
    CA: Send + 'static,
{
    fn send(&self, action: CA) -> Result<EffectHandle, StoreError> {
        self.parent.send((self.embed)(action))
    }

    fn read(&self, visit: &mut dyn FnMut(&CS)) {
        self.parent.read(&mut |parent| match ((self.project)(parent), &self.last) {
            (Some(state), Some(last)) => {
                *last.value.lock() = (last.refresh)(state);
                visit(state);
            },
            (Some(state), None) => visit(state),
            (None, Some(last)) => visit(&last.value.lock()),
            // Only optional projections can come up empty, and they always
            // carry a last value.
            (None, None) => {},
        });
    }

    fn subscribe_actions(&self) -> ActionSubscription<CA> {
        ActionSubscription {
            source: Box::new(Extracting {
                parent: self.parent.subscribe_actions(),
                extract: Arc::clone(&self.extract),
            }),
        }
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.parent.changes()
    }

    fn cancel(&self, id: &EffectId) -> usize {
        self.parent.cancel(id)
    }

    fn cancel_all(&self) -> usize {
        self.parent.cancel_all()
    }

    fn in_flight(&self, id: &EffectId) -> usize {
        self.parent.in_flight(id)
    }

    fn begin_shutdown(&self) {
        self.parent.begin_shutdown();
    }

    fn pending_effects(&self) -> usize {
        self.parent.pending_effects()
    }

    fn config(&self) -> &StoreConfig {
        self.parent.config()
    }
}

trait ActionSource<A>: Send {
    fn next(&mut self) -> BoxFuture<'_, Result<A, StoreError>>;
}

impl<A: Clone + Send + 'static> ActionSource<A> for broadcast::Receiver<A> {
    fn next(&mut self) -> BoxFuture<'_, Result<A, StoreError>> {
        Box::pin(async move {
            loop {
                match self.recv().await {
                    Ok(action) => return Ok(action),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Action observer lagged, {} actions skipped", skipped);
                    },
                    Err(broadcast::error::RecvError::Closed) => return Err(StoreError::ChannelClosed),
                }
            }
        })
    }
}

struct Extracting<PA, CA> {
    parent: ActionSubscription<PA>,
    extract: Arc<dyn Fn(PA) -> Option<CA> + Send + Sync>,
}

impl<PA: Send + 'static, CA: Send + 'static> ActionSource<CA> for Extracting<PA, CA> {
    fn next(&mut self) -> BoxFuture<'_, Result<CA, StoreError>> {
        Box::pin(async move {
            loop {
                let action = self.parent.recv().await?;
                if let Some(child) = (self.extract)(action) {
                    return Ok(child);
                }
            }
        })
    }
}

/// Receives the actions effects feed back into a store.
///
/// Returned by [`Store::subscribe_actions`]. Slow subscribers skip the
/// actions they lagged behind on, with a warning.
pub struct ActionSubscription<A> {
    source: Box<dyn ActionSource<A>>,
}

impl<A: Clone + Send + 'static> ActionSubscription<A> {
    pub(crate) fn new(receiver: broadcast::Receiver<A>) -> Self {
        Self {
            source: Box::new(receiver),
        }
    }
}

impl<A> ActionSubscription<A> {
    /// Wait for the next action.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ChannelClosed`] once the store is gone.
    pub async fn recv(&mut self) -> Result<A, StoreError> {
        self.source.next().await
    }
}

impl<A> fmt::Debug for ActionSubscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSubscription").finish_non_exhaustive()
    }
}

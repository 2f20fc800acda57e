//! Effect module - Side effect descriptions
//!
//! Effects describe work for the runtime to perform after a reducer returns.
//! They are values: building one never starts anything. The store interprets
//! them, feeding the actions they produce back into the reducer.
//!
//! An effect is one of:
//!
//! - nothing ([`Effect::None`]),
//! - an action delivered immediately ([`Effect::send`]),
//! - an async operation that may emit any number of actions ([`Effect::run`]),
//! - a parallel or sequential combination of other effects,
//! - a cancellable wrapper, tagged with an [`EffectId`],
//! - a cancellation request for an [`EffectId`].
//!
//! Operations capture the [`DependencyValues`] in scope when they are built
//! and run under them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::future::{AbortHandle, BoxFuture};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::dependencies::{ClockKey, DependencyKey, DependencyValues, dependency};
use crate::issue::report_issue;

/// Effects returned from a single reduction.
pub type Effects<Action> = smallvec::SmallVec<[Effect<Action>; 4]>;

trait AnyId: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_id(&self, other: &dyn AnyId) -> bool;
    fn hash_id(&self, state: &mut dyn Hasher);
}

impl<T> AnyId for T
where
    T: Hash + Eq + fmt::Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_id(&self, other: &dyn AnyId) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|other| other == self)
    }

    fn hash_id(&self, mut state: &mut dyn Hasher) {
        std::any::TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// Identifies cancellable effects.
///
/// Any hashable value can serve as an id. Ids of different types never
/// compare equal, so `EffectId::new(1_u32)` and `EffectId::new(1_u64)` are
/// distinct.
#[derive(Clone)]
pub struct EffectId(Arc<dyn AnyId>);

impl EffectId {
    /// Wrap `id`.
    pub fn new<T>(id: T) -> Self
    where
        T: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(id))
    }

    /// Whether the wrapped id is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        (*self.0).as_any().is::<T>()
    }
}

impl PartialEq for EffectId {
    fn eq(&self, other: &Self) -> bool {
        (*self.0).eq_id(&*other.0)
    }
}

impl Eq for EffectId {}

impl Hash for EffectId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (*self.0).hash_id(state);
    }
}

impl fmt::Debug for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EffectId").field(&self.0).finish()
    }
}

impl From<&'static str> for EffectId {
    fn from(id: &'static str) -> Self {
        Self::new(id)
    }
}

/// Delivers actions from a running effect back to the store.
///
/// Once any cancellable scope enclosing the effect is cancelled, further
/// sends are dropped.
pub struct ActionSender<Action> {
    emit: Arc<dyn Fn(Action) + Send + Sync>,
    cancellation: Vec<AbortHandle>,
}

impl<Action> Clone for ActionSender<Action> {
    fn clone(&self) -> Self {
        Self {
            emit: Arc::clone(&self.emit),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<Action: 'static> ActionSender<Action> {
    /// A sender that hands every action to `emit`.
    pub fn new(emit: impl Fn(Action) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
            cancellation: Vec::new(),
        }
    }

    /// Deliver `action` unless the effect has been cancelled.
    pub fn send(&self, action: Action) {
        if self.is_cancelled() {
            tracing::trace!("Dropping action from cancelled effect");
            return;
        }
        (self.emit)(action);
    }

    /// Whether an enclosing cancellable scope was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.iter().any(AbortHandle::is_aborted)
    }

    /// This sender, additionally silenced when `handle` is aborted.
    #[must_use]
    pub fn with_cancellation(&self, handle: AbortHandle) -> Self {
        let mut sender = self.clone();
        sender.cancellation.push(handle);
        sender
    }

    fn contramap<Child: 'static>(
        self,
        transform: Arc<dyn Fn(Child) -> Action + Send + Sync>,
    ) -> ActionSender<Child> {
        let emit = self.emit;
        ActionSender {
            emit: Arc::new(move |action| emit(transform(action))),
            cancellation: self.cancellation,
        }
    }
}

impl<Action> fmt::Debug for ActionSender<Action> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionSender")
            .field("cancellable_scopes", &self.cancellation.len())
            .finish_non_exhaustive()
    }
}

type RunFn<Action> = Box<dyn FnOnce(ActionSender<Action>) -> BoxFuture<'static, ()> + Send>;

/// An async operation together with the dependencies it runs under.
pub struct Operation<Action> {
    run: RunFn<Action>,
    dependencies: DependencyValues,
}

impl<Action: Send + 'static> Operation<Action> {
    /// Start the operation: build its future with `sender`, under the
    /// captured dependencies.
    pub fn start(self, sender: ActionSender<Action>) -> BoxFuture<'static, ()> {
        let Self { run, dependencies } = self;
        let future = dependencies.clone().enter(|| run(sender));
        Box::pin(dependencies.scope(future))
    }

    /// The dependencies captured when the operation was built.
    #[must_use]
    pub const fn dependencies(&self) -> &DependencyValues {
        &self.dependencies
    }

    /// Route every action the operation sends through `gate`.
    fn throttled(self, gate: Arc<Throttle>) -> Self {
        let run = self.run;
        Self {
            run: Box::new(move |sender: ActionSender<Action>| {
                let (tx, mut rx) = mpsc::unbounded();
                let inner = ActionSender {
                    emit: Arc::new(move |action| {
                        let _ = tx.unbounded_send(action);
                    }),
                    cancellation: sender.cancellation.clone(),
                };
                let running = run(inner);
                let throttled: BoxFuture<'static, ()> = Box::pin(async move {
                    let forward = async {
                        while let Some(action) = rx.next().await {
                            gate.pass(action, &sender).await;
                        }
                    };
                    futures::join!(running, forward);
                });
                throttled
            }),
            dependencies: self.dependencies,
        }
    }

    fn map<Parent: Send + 'static>(
        self,
        transform: Arc<dyn Fn(Action) -> Parent + Send + Sync>,
    ) -> Operation<Parent> {
        let run = self.run;
        Operation {
            run: Box::new(move |sender: ActionSender<Parent>| run(sender.contramap(transform))),
            dependencies: self.dependencies,
        }
    }
}

/// Throttle windows by effect id, one table per root dependency scope.
struct ThrottleWindowsKey;

impl DependencyKey for ThrottleWindowsKey {
    type Value = Arc<Mutex<HashMap<EffectId, ThrottleWindow>>>;

    fn live_value() -> Option<Self::Value> {
        Some(Arc::default())
    }

    fn test_value() -> Option<Self::Value> {
        Some(Arc::default())
    }
}

#[derive(Default)]
struct ThrottleWindow {
    /// When an action last went out under this id.
    opened: Option<DateTime<Utc>>,
    /// The action waiting for the window to close.
    pending: Option<Box<dyn Any + Send>>,
}

/// Lets at most one action per `interval` through under `id`.
struct Throttle {
    id: EffectId,
    interval: Duration,
    latest: bool,
}

impl Throttle {
    async fn pass<Action: Send + 'static>(&self, action: Action, send: &ActionSender<Action>) {
        let clock = dependency::<ClockKey>();
        let windows = dependency::<ThrottleWindowsKey>();

        let wait = {
            let mut table = windows.lock();
            let now = clock.now();
            let window = table.entry(self.id.clone()).or_default();
            let Some(opened) = window.opened else {
                window.opened = Some(now);
                window.pending = None;
                drop(table);
                send.send(action);
                return;
            };
            let holds_first = window
                .pending
                .as_ref()
                .is_some_and(|pending| pending.is::<Action>());
            if self.latest || !holds_first {
                window.pending = Some(Box::new(action));
            }
            let elapsed = (now - opened).to_std().unwrap_or(Duration::ZERO);
            self.interval.saturating_sub(elapsed)
        };

        if !wait.is_zero() {
            clock.sleep(wait).await;
        }

        let pending = {
            let mut table = windows.lock();
            let window = table.entry(self.id.clone()).or_default();
            window.opened = Some(clock.now());
            window.pending.take()
        };
        if let Some(action) = pending.and_then(|pending| pending.downcast::<Action>().ok()) {
            send.send(*action);
        }
    }
}

/// Runs once when the effect it guards completes or is dropped.
pub struct FinishCallback(Option<Box<dyn FnOnce() + Send>>);

impl FinishCallback {
    /// Guard that runs `callback` when dropped.
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(callback)))
    }
}

impl Drop for FinishCallback {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback();
        }
    }
}

/// Effect type - describes a side effect to be executed
///
/// Effects are NOT executed immediately. They are descriptions of what should
/// happen, returned from reducers and executed by the store runtime.
///
/// Prefer the constructor functions over building variants by hand.
pub enum Effect<Action> {
    /// No-op effect
    None,

    /// Deliver an action immediately, before any async work starts.
    Emit(Action),

    /// Arbitrary async work that may emit actions.
    Run(Operation<Action>),

    /// Run effects in parallel
    Merge(Vec<Effect<Action>>),

    /// Run effects one after another
    Concatenate(Vec<Effect<Action>>),

    /// Run `effect` so that it can be cancelled through `id`.
    Cancellable {
        /// Cancellation identifier
        id: EffectId,
        /// Cancel effects already running under `id` first.
        cancel_in_flight: bool,
        /// The wrapped effect
        effect: Box<Effect<Action>>,
    },

    /// Cancel every in-flight effect registered under the id.
    Cancel(EffectId),

    /// Run `effect`, then drop `on_finish`.
    Finally {
        /// The wrapped effect
        effect: Box<Effect<Action>>,
        /// Runs when the effect completes or is cancelled.
        on_finish: FinishCallback,
    },
}

impl<Action> fmt::Debug for Effect<Action>
where
    Action: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::None => write!(f, "Effect::None"),
            Effect::Emit(action) => f.debug_tuple("Effect::Emit").field(action).finish(),
            Effect::Run(_) => write!(f, "Effect::Run(<operation>)"),
            Effect::Merge(effects) => f.debug_tuple("Effect::Merge").field(effects).finish(),
            Effect::Concatenate(effects) => {
                f.debug_tuple("Effect::Concatenate").field(effects).finish()
            },
            Effect::Cancellable {
                id,
                cancel_in_flight,
                effect,
            } => f
                .debug_struct("Effect::Cancellable")
                .field("id", id)
                .field("cancel_in_flight", cancel_in_flight)
                .field("effect", effect)
                .finish(),
            Effect::Cancel(id) => f.debug_tuple("Effect::Cancel").field(id).finish(),
            Effect::Finally { effect, .. } => {
                f.debug_struct("Effect::Finally").field("effect", effect).finish_non_exhaustive()
            },
        }
    }
}

impl<Action> Default for Effect<Action> {
    fn default() -> Self {
        Self::None
    }
}

impl<Action: Send + 'static> Effect<Action> {
    /// An effect that does nothing.
    #[must_use]
    pub const fn none() -> Self {
        Self::None
    }

    /// Deliver `action` immediately.
    #[must_use]
    pub const fn send(action: Action) -> Self {
        Self::Emit(action)
    }

    /// Run an async operation that emits actions through its sender.
    ///
    /// # Example
    ///
    /// ```
    /// use composable_arch_core::effect::Effect;
    ///
    /// #[derive(Debug)]
    /// enum Action {
    ///     Loaded(u32),
    /// }
    ///
    /// let effect = Effect::run(|send| async move {
    ///     send.send(Action::Loaded(42));
    /// });
    /// assert!(matches!(effect, Effect::Run(_)));
    /// ```
    pub fn run<F, Fut>(operation: F) -> Self
    where
        F: FnOnce(ActionSender<Action>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::Run(Operation {
            run: Box::new(move |sender| Box::pin(operation(sender))),
            dependencies: DependencyValues::current(),
        })
    }

    /// Run a fallible operation. An error nobody handles is reported as an
    /// issue.
    pub fn try_run<F, Fut, E>(operation: F) -> Self
    where
        F: FnOnce(ActionSender<Action>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::run(move |send| async move {
            if let Err(error) = operation(send).await {
                report_issue(format!(
                    "An effect returned an error that was not handled: {error}. \
                     Use `Effect::try_run_catching` to turn errors into actions."
                ));
            }
        })
    }

    /// Run a fallible operation, handing any error to `catch`.
    pub fn try_run_catching<F, Fut, E, C, CFut>(operation: F, catch: C) -> Self
    where
        F: FnOnce(ActionSender<Action>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Send + 'static,
        C: FnOnce(E, ActionSender<Action>) -> CFut + Send + 'static,
        CFut: Future<Output = ()> + Send + 'static,
    {
        Self::run(move |send| async move {
            if let Err(error) = operation(send.clone()).await {
                catch(error, send).await;
            }
        })
    }

    /// Await `future` and feed back the action it produces, if any.
    pub fn future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Option<Action>> + Send + 'static,
    {
        Self::run(move |send| async move {
            if let Some(action) = future.await {
                send.send(action);
            }
        })
    }

    /// Await a fallible `future` and turn its result into an action.
    pub fn result<Fut, T, E, M>(future: Fut, into_action: M) -> Self
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        M: FnOnce(Result<T, E>) -> Action + Send + 'static,
    {
        Self::run(move |send| async move {
            send.send(into_action(future.await));
        })
    }

    /// Emit every item of `stream`. Cancelling the effect drops the stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Action> + Send + 'static,
    {
        Self::run(move |send| async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(action) = stream.next().await {
                send.send(action);
            }
        })
    }

    /// Deliver `action` after `duration` on the clock in scope.
    pub fn delay(duration: Duration, action: Action) -> Self {
        Self::run(move |send| async move {
            dependency::<ClockKey>().sleep(duration).await;
            send.send(action);
        })
    }

    /// Run all `effects` in parallel.
    #[must_use]
    pub fn merge(effects: impl IntoIterator<Item = Self>) -> Self {
        let mut effects: Vec<Self> = effects.into_iter().filter(|e| !e.is_none()).collect();
        match effects.len() {
            0 => Self::None,
            1 => effects.swap_remove(0),
            _ => Self::Merge(effects),
        }
    }

    /// Run `effects` one after another, each starting when the previous
    /// completes.
    #[must_use]
    pub fn concatenate(effects: impl IntoIterator<Item = Self>) -> Self {
        let mut effects: Vec<Self> = effects.into_iter().filter(|e| !e.is_none()).collect();
        match effects.len() {
            0 => Self::None,
            1 => effects.swap_remove(0),
            _ => Self::Concatenate(effects),
        }
    }

    /// Run this effect in parallel with `other`.
    #[must_use]
    pub fn merge_with(self, other: Self) -> Self {
        Self::merge([self, other])
    }

    /// Run `other` after this effect completes.
    #[must_use]
    pub fn concatenate_with(self, other: Self) -> Self {
        Self::concatenate([self, other])
    }

    /// Transform the actions this effect produces.
    #[must_use]
    pub fn map<Parent, F>(self, transform: F) -> Effect<Parent>
    where
        Parent: Send + 'static,
        F: Fn(Action) -> Parent + Send + Sync + 'static,
    {
        self.map_shared(Arc::new(transform))
    }

    fn map_shared<Parent: Send + 'static>(
        self,
        transform: Arc<dyn Fn(Action) -> Parent + Send + Sync>,
    ) -> Effect<Parent> {
        match self {
            Self::None => Effect::None,
            Self::Emit(action) => Effect::Emit(transform(action)),
            Self::Run(operation) => Effect::Run(operation.map(transform)),
            Self::Merge(effects) => Effect::Merge(
                effects
                    .into_iter()
                    .map(|e| e.map_shared(Arc::clone(&transform)))
                    .collect(),
            ),
            Self::Concatenate(effects) => Effect::Concatenate(
                effects
                    .into_iter()
                    .map(|e| e.map_shared(Arc::clone(&transform)))
                    .collect(),
            ),
            Self::Cancellable {
                id,
                cancel_in_flight,
                effect,
            } => Effect::Cancellable {
                id,
                cancel_in_flight,
                effect: Box::new(effect.map_shared(transform)),
            },
            Self::Cancel(id) => Effect::Cancel(id),
            Self::Finally { effect, on_finish } => Effect::Finally {
                effect: Box::new(effect.map_shared(transform)),
                on_finish,
            },
        }
    }

    /// Make this effect cancellable through `id`.
    ///
    /// With `cancel_in_flight`, effects already running under `id` are
    /// cancelled before this one starts. A no-op effect stays a no-op.
    #[must_use]
    pub fn cancellable(self, id: impl Into<EffectId>, cancel_in_flight: bool) -> Self {
        if self.is_none() {
            return self;
        }
        Self::Cancellable {
            id: id.into(),
            cancel_in_flight,
            effect: Box::new(self),
        }
    }

    /// Cancel in-flight effects registered under `id`.
    #[must_use]
    pub fn cancel(id: impl Into<EffectId>) -> Self {
        Self::Cancel(id.into())
    }

    /// Wait `duration` on the clock in scope before running this effect,
    /// restarting the wait whenever another effect is debounced under `id`.
    #[must_use]
    pub fn debounce(self, id: impl Into<EffectId>, duration: Duration) -> Self {
        if self.is_none() {
            return self;
        }
        let wait = Self::run(move |_| async move {
            dependency::<ClockKey>().sleep(duration).await;
        });
        wait.concatenate_with(self).cancellable(id, true)
    }

    /// Let at most one action from effects throttled under `id` reach the
    /// store per `interval` on the clock in scope.
    ///
    /// The first action goes out at once. Actions arriving before the
    /// interval has passed are held until it has, and then only one is
    /// delivered: the most recent with `latest`, otherwise the first.
    /// Throttling under `id` cancels the previous effect still waiting.
    #[must_use]
    pub fn throttle(self, id: impl Into<EffectId>, interval: Duration, latest: bool) -> Self {
        if self.is_none() {
            return self;
        }
        let id = id.into();
        let gate = Arc::new(Throttle {
            id: id.clone(),
            interval,
            latest,
        });
        self.throttled(&gate).cancellable(id, true)
    }

    fn throttled(self, gate: &Arc<Throttle>) -> Self {
        match self {
            Self::None => Self::None,
            Self::Emit(action) => {
                let gate = Arc::clone(gate);
                Self::run(move |send| async move { gate.pass(action, &send).await })
            },
            Self::Run(operation) => Self::Run(operation.throttled(Arc::clone(gate))),
            Self::Merge(effects) => Self::Merge(effects.into_iter().map(|e| e.throttled(gate)).collect()),
            Self::Concatenate(effects) => {
                Self::Concatenate(effects.into_iter().map(|e| e.throttled(gate)).collect())
            },
            Self::Cancellable {
                id,
                cancel_in_flight,
                effect,
            } => Self::Cancellable {
                id,
                cancel_in_flight,
                effect: Box::new(effect.throttled(gate)),
            },
            Self::Cancel(id) => Self::Cancel(id),
            Self::Finally { effect, on_finish } => Self::Finally {
                effect: Box::new(effect.throttled(gate)),
                on_finish,
            },
        }
    }

    /// Run `callback` once this effect finishes or is cancelled.
    #[must_use]
    pub fn on_finish(self, callback: impl FnOnce() + Send + 'static) -> Self {
        Self::Finally {
            effect: Box::new(self),
            on_finish: FinishCallback::new(callback),
        }
    }

    /// Whether this is [`Effect::None`].
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    enum Child {
        Tick(u32),
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Parent {
        Child(Child),
    }

    fn recording_sender<A: Send + 'static>() -> (ActionSender<A>, Arc<Mutex<Vec<A>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        (ActionSender::new(move |action| sink.lock().push(action)), received)
    }

    #[test]
    fn ids_compare_by_type_and_value() {
        assert_eq!(EffectId::new("timer"), EffectId::from("timer"));
        assert_ne!(EffectId::new(1_u32), EffectId::new(1_u64));

        let mut set = HashSet::new();
        set.insert(EffectId::new(("row", 3)));
        assert!(set.contains(&EffectId::new(("row", 3))));
        assert!(!set.contains(&EffectId::new(("row", 4))));
    }

    #[test]
    fn merge_and_concatenate_drop_no_ops() {
        let merged: Effect<Child> = Effect::merge([Effect::none(), Effect::none()]);
        assert!(merged.is_none());

        let single = Effect::concatenate([Effect::none(), Effect::send(Child::Tick(1))]);
        assert!(matches!(single, Effect::Emit(Child::Tick(1))));
    }

    #[test]
    fn cancellable_no_op_stays_no_op() {
        let effect: Effect<Child> = Effect::none().cancellable("id", true);
        assert!(effect.is_none());
    }

    #[test]
    fn map_transforms_emitted_actions() {
        let effect = Effect::send(Child::Tick(2)).map(Parent::Child);
        assert!(matches!(effect, Effect::Emit(Parent::Child(Child::Tick(2)))));
    }

    #[tokio::test]
    async fn mapped_operation_sends_parent_actions() {
        let effect = Effect::run(|send| async move { send.send(Child::Tick(7)) }).map(Parent::Child);
        let Effect::Run(operation) = effect else {
            panic!("expected a run effect");
        };
        let (sender, received) = recording_sender();
        operation.start(sender).await;
        assert_eq!(*received.lock(), vec![Parent::Child(Child::Tick(7))]);
    }

    #[tokio::test]
    async fn cancelled_sender_drops_actions() {
        let (sender, received) = recording_sender();
        let (handle, _registration) = AbortHandle::new_pair();
        let sender = sender.with_cancellation(handle.clone());

        sender.send(Child::Tick(1));
        handle.abort();
        sender.send(Child::Tick(2));

        assert!(sender.is_cancelled());
        assert_eq!(*received.lock(), vec![Child::Tick(1)]);
    }

    #[tokio::test]
    async fn operation_runs_under_captured_dependencies() {
        use crate::dependencies::DependencyKey;

        struct Answer;
        impl DependencyKey for Answer {
            type Value = u32;
        }

        let effect = DependencyValues::test()
            .with::<Answer>(42)
            .enter(|| Effect::run(|send| async move { send.send(Child::Tick(dependency::<Answer>())) }));
        let Effect::Run(operation) = effect else {
            panic!("expected a run effect");
        };
        let (sender, received) = recording_sender();
        operation.start(sender).await;
        assert_eq!(*received.lock(), vec![Child::Tick(42)]);
    }

    /// A clock stopped at the epoch.
    struct StoppedClock;

    impl crate::dependencies::Clock for StoppedClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::UNIX_EPOCH
        }

        fn sleep(&self, _duration: Duration) -> BoxFuture<'static, ()> {
            Box::pin(futures::future::pending())
        }
    }

    #[tokio::test]
    async fn throttle_passes_the_first_action_and_holds_the_rest() {
        let values = DependencyValues::test().with::<ClockKey>(Arc::new(StoppedClock));
        let effect = values.clone().enter(|| {
            Effect::run(|send| async move {
                send.send(Child::Tick(1));
                send.send(Child::Tick(2));
            })
            .throttle("ticks", Duration::from_secs(1), true)
        });
        let Effect::Cancellable {
            id,
            cancel_in_flight,
            effect,
        } = effect
        else {
            panic!("expected a cancellable effect");
        };
        assert_eq!(id, EffectId::from("ticks"));
        assert!(cancel_in_flight);
        let Effect::Run(operation) = *effect else {
            panic!("expected a run effect");
        };

        let (sender, received) = recording_sender();
        let held = tokio::time::timeout(Duration::from_millis(50), operation.start(sender)).await;
        assert!(held.is_err());
        assert_eq!(*received.lock(), vec![Child::Tick(1)]);
    }

    #[test]
    fn throttled_no_op_stays_no_op() {
        let effect: Effect<Child> = Effect::none().throttle("id", Duration::from_secs(1), false);
        assert!(effect.is_none());
    }

    #[tokio::test]
    async fn stream_effect_emits_every_item() {
        let effect = Effect::stream(async_stream::stream! {
            for n in 0..3 {
                yield Child::Tick(n);
            }
        });
        let Effect::Run(operation) = effect else {
            panic!("expected a run effect");
        };
        let (sender, received) = recording_sender();
        operation.start(sender).await;
        assert_eq!(
            *received.lock(),
            vec![Child::Tick(0), Child::Tick(1), Child::Tick(2)]
        );
    }

    #[test]
    fn finish_callback_runs_on_drop() {
        let finished = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&finished);
        let effect: Effect<Child> = Effect::none().on_finish(move || *flag.lock() = true);
        drop(effect);
        assert!(*finished.lock());
    }
}

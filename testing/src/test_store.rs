//! Exhaustive testing of features: state, effects and shared state.

#![allow(clippy::module_name_repetitions)] // TestStore is the natural name

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use composable_arch_core::issue::{Issue, IssueReporter};
use composable_arch_core::navigation::PresentationListener;
use composable_arch_core::{DependencyValues, Effects, Reducer};
use composable_arch_runtime::{EffectHandle, Store, StoreConfig};
use composable_arch_shared::SharedChangeTracker;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

/// How strictly a [`TestStore`] checks what happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exhaustivity {
    /// Every state change and every received action must be asserted, and
    /// no effect may outlive the test.
    #[default]
    On,
    /// Received actions may be skipped and effects may outlive the test.
    /// Asserted state changes must still match.
    Off,
}

/// Configuration for [`TestStore`].
#[derive(Debug, Clone)]
pub struct TestStoreConfig {
    /// How long to wait for an expected action, or for effects to finish.
    pub timeout: Duration,
    /// How strictly to check.
    pub exhaustivity: Exhaustivity,
}

impl Default for TestStoreConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            exhaustivity: Exhaustivity::On,
        }
    }
}

impl TestStoreConfig {
    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the exhaustivity.
    #[must_use]
    pub const fn with_exhaustivity(mut self, exhaustivity: Exhaustivity) -> Self {
        self.exhaustivity = exhaustivity;
        self
    }
}

/// An action as seen by the wrapped store: sent by the test, or fed back by
/// an effect.
#[derive(Debug, Clone)]
enum Origin<A> {
    Sent(A),
    Received(A),
}

/// A reduced action and the state it left behind.
struct Step<S, A> {
    action: A,
    sent: bool,
    state: S,
}

struct StepLog<S, A> {
    steps: Mutex<VecDeque<Step<S, A>>>,
    progress: watch::Sender<u64>,
}

impl<S, A> StepLog<S, A> {
    fn push(&self, step: Step<S, A>) {
        self.steps.lock().push_back(step);
        self.progress.send_modify(|count| *count += 1);
    }

    fn take_sent(&self) -> Option<Step<S, A>> {
        let mut steps = self.steps.lock();
        let index = steps.iter().position(|step| step.sent)?;
        steps.remove(index)
    }

    /// The first received step matching `matches`, and the received steps
    /// before it.
    fn take_received(&self, matches: &dyn Fn(&A) -> bool) -> Option<(Vec<Step<S, A>>, Step<S, A>)> {
        let mut steps = self.steps.lock();
        let index = steps
            .iter()
            .position(|step| !step.sent && matches(&step.action))?;
        let mut skipped = Vec::new();
        let mut kept = Vec::new();
        for step in steps.drain(..index) {
            if step.sent {
                kept.push(step);
            } else {
                skipped.push(step);
            }
        }
        let found = steps.pop_front()?;
        for step in kept.into_iter().rev() {
            steps.push_front(step);
        }
        Some((skipped, found))
    }

    fn take_all_received(&self) -> Vec<Step<S, A>> {
        let mut steps = self.steps.lock();
        let (received, sent): (VecDeque<_>, VecDeque<_>) = steps.drain(..).partition(|step| !step.sent);
        *steps = sent;
        received.into()
    }

    fn received_actions(&self) -> Vec<String>
    where
        A: fmt::Debug,
    {
        self.steps
            .lock()
            .iter()
            .filter(|step| !step.sent)
            .map(|step| format!("{:?}", step.action))
            .collect()
    }
}

/// Runs the feature's reducer and records every step.
struct Recording<R: Reducer> {
    inner: R,
    log: Arc<StepLog<R::State, R::Action>>,
}

impl<R> Reducer for Recording<R>
where
    R: Reducer,
    R::State: Clone + Send,
    R::Action: Clone,
{
    type State = R::State;
    type Action = Origin<R::Action>;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        dependencies: &DependencyValues,
    ) -> Effects<Self::Action> {
        let (action, sent) = match action {
            Origin::Sent(action) => (action, true),
            Origin::Received(action) => (action, false),
        };
        let effects = self.inner.reduce(state, action.clone(), dependencies);
        self.log.push(Step {
            action,
            sent,
            state: state.clone(),
        });
        effects
            .into_iter()
            .map(|effect| effect.map(Origin::Received))
            .collect()
    }
}

/// Collects issues raised while the feature runs, often on effect tasks,
/// so the test thread can fail on them.
#[derive(Default)]
struct TestIssues {
    pending: Mutex<Vec<Issue>>,
    forward: Option<Arc<dyn IssueReporter>>,
}

impl IssueReporter for TestIssues {
    fn report(&self, issue: &Issue) {
        match &self.forward {
            Some(forward) => forward.report(issue),
            None => self.pending.lock().push(issue.clone()),
        }
    }
}

/// A store for tests that asserts on every step a feature takes.
///
/// Each [`send`](Self::send) and [`receive`](Self::receive) takes a closure
/// that applies the expected change to the previous state; a mismatch fails
/// the test with a diff. In [`Exhaustivity::On`] mode:
///
/// - every action effects feed back must be received before the next send,
/// - [`finish`](Self::finish) fails when effects are still running or
///   actions were left unreceived,
/// - changes to [`Shared`](composable_arch_shared::Shared) values must be
///   asserted too.
///
/// Failures are reported as issues. Without an issue reporter installed in
/// the store's dependencies they panic, failing the test.
///
/// # Example
///
/// ```
/// use composable_arch_core::{Effect, Reduce, smallvec};
/// use composable_arch_testing::TestStore;
///
/// #[derive(Debug, Clone, PartialEq)]
/// enum Action {
///     Increment,
///     IncrementTwice,
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut store = TestStore::new(
///     0_i32,
///     Reduce::new(|count: &mut i32, action: Action, _| match action {
///         Action::Increment => {
///             *count += 1;
///             smallvec![]
///         },
///         Action::IncrementTwice => smallvec![Effect::send(Action::Increment), Effect::send(Action::Increment)],
///     }),
/// );
///
/// store.send(Action::IncrementTwice, |_| {}).await;
/// store.receive(Action::Increment, |count| *count = 1).await;
/// store.receive(Action::Increment, |count| *count = 2).await;
/// store.finish().await;
/// # }
/// ```
pub struct TestStore<S, A>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    store: Store<S, Origin<A>>,
    log: Arc<StepLog<S, A>>,
    progress: watch::Receiver<u64>,
    state: S,
    dependencies: DependencyValues,
    tracker: SharedChangeTracker,
    issues: Arc<TestIssues>,
    config: TestStoreConfig,
    finished: bool,
}

impl<S, A> TestStore<S, A>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    /// A test store running `reducer` on `initial_state` under test
    /// dependencies.
    #[must_use]
    pub fn new<R>(initial_state: S, reducer: R) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        Self::with_dependencies(initial_state, reducer, |_| {})
    }

    /// A test store whose test dependencies are modified by `prepare`.
    ///
    /// An issue reporter installed by `prepare` receives every failure
    /// instead of the failure panicking.
    #[must_use]
    pub fn with_dependencies<R>(
        initial_state: S,
        reducer: R,
        prepare: impl FnOnce(&mut DependencyValues),
    ) -> Self
    where
        R: Reducer<State = S, Action = A> + 'static,
    {
        let mut dependencies = DependencyValues::test();
        prepare(&mut dependencies);

        let issues = Arc::new(TestIssues {
            pending: Mutex::new(Vec::new()),
            forward: dependencies.issue_reporter().cloned(),
        });
        dependencies.set_issue_reporter(issues.clone());

        let tracker = SharedChangeTracker::new();
        tracker.install(&mut dependencies);

        let (progress_tx, progress) = watch::channel(0);
        let log = Arc::new(StepLog {
            steps: Mutex::new(VecDeque::new()),
            progress: progress_tx,
        });
        let store = Store::from_parts(
            initial_state.clone(),
            Recording {
                inner: reducer,
                log: Arc::clone(&log),
            },
            dependencies.clone(),
            StoreConfig::default(),
        );

        Self {
            store,
            log,
            progress,
            state: initial_state,
            dependencies,
            tracker,
            issues,
            config: TestStoreConfig::default(),
            finished: false,
        }
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: TestStoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Change how strictly the rest of the test is checked.
    pub fn set_exhaustivity(&mut self, exhaustivity: Exhaustivity) {
        self.config.exhaustivity = exhaustivity;
    }

    /// Change how long to wait for actions and effects.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// The state after the last asserted step.
    #[must_use]
    pub const fn state(&self) -> &S {
        &self.state
    }

    /// The dependencies the feature runs under.
    #[must_use]
    pub const fn dependencies(&self) -> &DependencyValues {
        &self.dependencies
    }

    /// Send `action` and assert the state change it causes.
    ///
    /// `update` receives the previous state and must turn it into the
    /// expected one. The returned handle completes when the action's
    /// effects finish.
    pub async fn send(&mut self, action: A, update: impl FnOnce(&mut S)) -> EffectHandle {
        self.raise_pending_issues();

        let unreceived = self.log.received_actions();
        if !unreceived.is_empty() {
            if self.config.exhaustivity == Exhaustivity::On {
                self.fail(format!(
                    "Must handle {} received action(s) before sending an action:\n\n  {}",
                    unreceived.len(),
                    unreceived.join("\n  "),
                ));
            }
            self.skip_steps(self.log.take_all_received());
        }

        tracing::debug!(?action, "Test store sending action");
        let handle = match self.store.send(Origin::Sent(action.clone())) {
            Ok(handle) => handle,
            Err(error) => {
                self.fail(format!("Could not send {action:?}: {error}"));
                return EffectHandle::completed();
            },
        };

        let log = Arc::clone(&self.log);
        match self.wait_for(move || log.take_sent()).await {
            Some(step) => self.assert_step(step.state, update),
            None => self.fail(format!(
                "{action:?} was not processed within {:?}",
                self.config.timeout
            )),
        }
        self.raise_pending_issues();
        handle
    }

    /// Receive `expected` from an effect and assert the state change it
    /// causes.
    ///
    /// In exhaustive mode the next received action must equal `expected`.
    /// Otherwise earlier received actions that differ are skipped.
    pub async fn receive(&mut self, expected: A, update: impl FnOnce(&mut S))
    where
        A: PartialEq,
    {
        let wanted = expected.clone();
        let Some(received) = self
            .next_received(&format!("{expected:?}"), move |action| *action == wanted)
            .await
        else {
            return;
        };

        if received.action != expected {
            self.fail(format!(
                "Received unexpected action: (-expected, +received)\n\n{}",
                pretty_assertions::Comparison::new(&expected, &received.action),
            ));
        }
        self.assert_step(received.state, update);
        self.raise_pending_issues();
    }

    /// Receive an action matching `matches` from an effect and assert the
    /// state change it causes.
    pub async fn receive_matching(
        &mut self,
        matches: impl Fn(&A) -> bool,
        update: impl FnOnce(&mut S),
    ) {
        let Some(received) = self
            .next_received("an action matching the predicate", |action| matches(action))
            .await
        else {
            return;
        };

        if !matches(&received.action) {
            self.fail(format!(
                "Received {:?}, which does not match the predicate",
                received.action
            ));
        }
        self.assert_step(received.state, update);
        self.raise_pending_issues();
    }

    /// Discard received actions without asserting on them. The state moves
    /// to the state after the last one.
    ///
    /// With `strict`, having nothing to skip is a failure.
    pub async fn skip_received_actions(&mut self, strict: bool) {
        tokio::task::yield_now().await;
        let skipped = self.log.take_all_received();
        if skipped.is_empty() && strict {
            self.fail("There were no received actions to skip.");
        }
        self.skip_steps(skipped);
        self.raise_pending_issues();
    }

    /// Cancel every running effect.
    ///
    /// With `strict`, having nothing to cancel is a failure.
    pub async fn skip_in_flight_effects(&mut self, strict: bool) {
        let cancelled = self.store.cancel_all();
        if cancelled == 0 && strict {
            self.fail("There were no in-flight effects to skip.");
        }
        tracing::debug!(cancelled, "Test store skipped in-flight effects");
        self.wait_for_effects().await;
        self.raise_pending_issues();
    }

    /// Wait for effects to finish, then fail on anything left unasserted.
    pub async fn finish(&mut self) {
        self.finished = true;
        let settled = self.wait_for_effects().await;

        match self.config.exhaustivity {
            Exhaustivity::On => {
                let unreceived = self.log.received_actions();
                if !unreceived.is_empty() {
                    self.fail(format!(
                        "The store received {} unexpected action(s):\n\n  {}",
                        unreceived.len(),
                        unreceived.join("\n  "),
                    ));
                }
                if !settled {
                    self.fail(format!(
                        "{} effect(s) still running after {:?}. Advance the clock, receive \
                         their actions or cancel them before the test ends.",
                        self.running_effects(),
                        self.config.timeout,
                    ));
                }
            },
            Exhaustivity::Off => {
                self.skip_steps(self.log.take_all_received());
                self.store.cancel_all();
            },
        }
        self.raise_pending_issues();
    }

    async fn next_received(
        &mut self,
        description: &str,
        matches: impl Fn(&A) -> bool,
    ) -> Option<Step<S, A>> {
        self.raise_pending_issues();
        let exhaustive = self.config.exhaustivity == Exhaustivity::On;
        let log = Arc::clone(&self.log);
        let found = self
            .wait_for(move || {
                if exhaustive {
                    log.take_received(&|_| true)
                } else {
                    log.take_received(&matches)
                }
            })
            .await;

        match found {
            Some((skipped, step)) => {
                self.skip_steps(skipped);
                Some(step)
            },
            None => {
                self.fail(format!(
                    "Expected to receive {description}, but received none after {:?}",
                    self.config.timeout,
                ));
                None
            },
        }
    }

    /// Poll `take` until it yields or the timeout passes.
    async fn wait_for<T>(&mut self, mut take: impl FnMut() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            self.progress.mark_unchanged();
            if let Some(found) = take() {
                return Some(found);
            }
            let changed = tokio::time::timeout_at(deadline, self.progress.changed()).await;
            if !matches!(changed, Ok(Ok(()))) {
                return take();
            }
        }
    }

    /// Running effects, except listeners waiting for a presented child to
    /// dismiss itself.
    fn running_effects(&self) -> usize {
        self.store
            .pending_effects()
            .saturating_sub(self.store.in_flight(PresentationListener))
    }

    /// Wait for running effects to finish. Returns whether they did.
    async fn wait_for_effects(&self) -> bool {
        let deadline = Instant::now() + self.config.timeout;
        while self.running_effects() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        true
    }

    fn skip_steps(&mut self, skipped: Vec<Step<S, A>>) {
        for step in skipped {
            tracing::debug!(action = ?step.action, "Test store skipped received action");
            self.state = step.state;
        }
        self.tracker.reset();
    }

    /// Compare the expected state, built by `update` from the previous one,
    /// with `actual`.
    fn assert_step(&mut self, actual: S, update: impl FnOnce(&mut S)) {
        let tracker = self.tracker.clone();
        let previous = &self.state;
        let expected_text = self.dependencies.clone().enter(|| {
            tracker.asserting(|| {
                let mut expected = previous.clone();
                update(&mut expected);
                (expected != actual).then(|| format!("{expected:#?}"))
            })
        });

        if let Some(expected_text) = expected_text {
            let actual_text = format!("{actual:#?}");
            self.fail(format!(
                "A state change does not match expectation: (-expected, +actual)\n\n{}",
                pretty_assertions::StrComparison::new(&expected_text, &actual_text),
            ));
            self.tracker.reset();
        } else {
            self.dependencies
                .clone()
                .enter(|| tracker.assert_unchanged());
        }
        self.state = actual;
    }

    fn fail(&self, message: impl Into<String>) {
        self.issues.report(&Issue::new(message));
        self.raise_pending_issues();
    }

    /// Fail the test with every issue collected so far.
    fn raise_pending_issues(&self) {
        let issues = std::mem::take(&mut *self.issues.pending.lock());
        if issues.is_empty() || std::thread::panicking() {
            return;
        }
        let messages: Vec<String> = issues.iter().map(ToString::to_string).collect();
        #[allow(clippy::panic)] // Test store failures fail the test
        {
            panic!("{}", messages.join("\n\n"));
        }
    }
}

impl<S, A> fmt::Debug for TestStore<S, A>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestStore")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Drop cannot wait for effects: actions already received and effects still
/// running at that moment are failures, and the effects are cancelled. Call
/// [`TestStore::finish`] to give effects time to complete.
impl<S, A> Drop for TestStore<S, A>
where
    S: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    A: Clone + fmt::Debug + Send + 'static,
{
    fn drop(&mut self) {
        if self.finished || std::thread::panicking() || self.config.exhaustivity == Exhaustivity::Off {
            return;
        }
        let running = self.running_effects();
        self.store.cancel_all();

        let unreceived = self.log.received_actions();
        if !unreceived.is_empty() {
            self.fail(format!(
                "The store received {} unexpected action(s) before it was dropped:\n\n  {}",
                unreceived.len(),
                unreceived.join("\n  "),
            ));
        }
        if running > 0 {
            self.fail(format!(
                "{running} effect(s) still running when the store was dropped. Receive their \
                 actions, cancel them or call `finish` before the test ends.",
            ));
        }
        self.raise_pending_issues();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn step(action: &'static str, sent: bool) -> Step<u8, &'static str> {
        Step { action, sent, state: 0 }
    }

    fn log() -> StepLog<u8, &'static str> {
        StepLog {
            steps: Mutex::new(VecDeque::new()),
            progress: watch::channel(0).0,
        }
    }

    #[test]
    fn take_received_skips_earlier_received_and_keeps_sent() {
        let log = log();
        log.push(step("a", false));
        log.push(step("sent", true));
        log.push(step("b", false));
        log.push(step("c", false));

        let (skipped, found) = log.take_received(&|action| *action == "b").unwrap();
        assert_eq!(skipped.iter().map(|step| step.action).collect::<Vec<_>>(), ["a"]);
        assert_eq!(found.action, "b");
        assert_eq!(log.received_actions(), ["\"c\""]);
        assert_eq!(log.take_sent().map(|step| step.action), Some("sent"));
    }

    #[test]
    fn take_all_received_leaves_sent_steps() {
        let log = log();
        log.push(step("a", false));
        log.push(step("sent", true));
        assert_eq!(log.take_all_received().len(), 1);
        assert!(log.received_actions().is_empty());
        assert!(log.take_sent().is_some());
    }
}

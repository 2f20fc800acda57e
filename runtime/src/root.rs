//! The root store: state storage, the action queue and the effect executor.
//!
//! Actions are processed one at a time in FIFO order. Whoever finds the
//! queue idle drains it; everyone else only enqueues. Actions fed back by
//! effects, including synchronous ones, take the same path, so every action
//! sees the state left by the previous one.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use composable_arch_core::issue::{self, Issue};
use composable_arch_core::{ActionSender, BoxReducer, DependencyValues, Effect, EffectId};
use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};

use crate::cancellation::CancellationRegistry;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::handle::{AtomicCounterGuard, DecrementGuard, EffectHandle, EffectTracking};
use crate::metrics::{EffectMetrics, ReducerMetrics, StoreMetrics};
use crate::store::{ActionSubscription, StoreCore};

struct Queued<A> {
    action: A,
    tracking: Option<EffectTracking>,
}

/// Resets the sending flag, even when the reducer panics.
struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct RootCore<S, A> {
    this: Weak<Self>,
    state: RwLock<S>,
    reducer: BoxReducer<S, A>,
    dependencies: DependencyValues,
    config: StoreConfig,
    queue: Mutex<VecDeque<Queued<A>>>,
    is_sending: AtomicBool,
    cancellations: Arc<CancellationRegistry>,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    next_task: AtomicU64,
    pending_effects: Arc<AtomicUsize>,
    shutdown: AtomicBool,
    version: watch::Sender<u64>,
    actions: broadcast::Sender<A>,
}

impl<S, A> RootCore<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    pub(crate) fn new(
        state: S,
        reducer: BoxReducer<S, A>,
        dependencies: DependencyValues,
        config: StoreConfig,
    ) -> Arc<Self> {
        let (actions, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let (version, _) = watch::channel(0);

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            state: RwLock::new(state),
            reducer,
            dependencies,
            config,
            queue: Mutex::new(VecDeque::new()),
            is_sending: AtomicBool::new(false),
            cancellations: Arc::new(CancellationRegistry::default()),
            tasks: Mutex::new(HashMap::new()),
            next_task: AtomicU64::new(0),
            pending_effects: Arc::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            version,
            actions,
        })
    }

    fn enqueue(&self, action: A, tracking: Option<EffectTracking>) {
        self.queue.lock().push_back(Queued { action, tracking });
        self.drain();
    }

    /// Actions fed back by effects are broadcast to subscribers and then
    /// queued like any other.
    fn receive_from_effect(&self, action: A) {
        let _ = self.actions.send(action.clone());
        self.enqueue(action, None);
    }

    fn drain(&self) {
        loop {
            if self
                .is_sending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let sending = SendingGuard(&self.is_sending);
            loop {
                let next = self.queue.lock().pop_front();
                let Some(queued) = next else { break };
                self.process(queued);
            }
            drop(sending);

            // An action may have been queued between the last pop and the reset.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn process(&self, queued: Queued<A>) {
        let Queued { action, tracking } = queued;
        let tracking = tracking.map(DecrementGuard);

        let effects = {
            let mut state = self.state.write();
            let span = tracing::debug_span!("reducer_execution");
            let _enter = span.enter();

            let start = Instant::now();
            let effects = self
                .dependencies
                .clone()
                .enter(|| self.reducer.reduce(&mut state, action, &self.dependencies));
            ReducerMetrics::record_action(start.elapsed());

            tracing::trace!("Reducer completed, returned {} effects", effects.len());
            effects
        };
        self.version.send_modify(|version| *version += 1);

        for effect in effects {
            if let Some(running) = self.start(effect, &[]) {
                self.spawn(running, tracking.as_ref().map(|guard| guard.0.clone()));
            }
        }
    }

    /// Perform the synchronous part of `effect` now and return the rest as a
    /// future that completes when the effect does.
    ///
    /// `scopes` are the abort handles of the cancellable effects enclosing
    /// this one.
    fn start(&self, effect: Effect<A>, scopes: &[AbortHandle]) -> Option<BoxFuture<'static, ()>> {
        match effect {
            Effect::None => None,
            Effect::Emit(action) => {
                self.receive_from_effect(action);
                None
            },
            Effect::Run(operation) => {
                let this = self.this.clone();
                let mut sender = ActionSender::new(move |action| {
                    if let Some(core) = this.upgrade() {
                        core.receive_from_effect(action);
                    }
                });
                for scope in scopes {
                    sender = sender.with_cancellation(scope.clone());
                }
                Some(operation.start(sender))
            },
            Effect::Merge(effects) => {
                let mut running: Vec<_> = effects
                    .into_iter()
                    .filter_map(|effect| self.start(effect, scopes))
                    .collect();
                match running.len() {
                    0 => None,
                    1 => running.pop(),
                    _ => Some(Box::pin(join_all(running).map(|_| ()))),
                }
            },
            Effect::Concatenate(effects) => {
                let mut effects = effects.into_iter();
                // Leading synchronous effects finish immediately.
                let head = loop {
                    if let Some(running) = self.start(effects.next()?, scopes) {
                        break running;
                    }
                };
                let rest: Vec<_> = effects.collect();
                if rest.is_empty() {
                    return Some(head);
                }

                let this = self.this.clone();
                let scopes = scopes.to_vec();
                Some(Box::pin(async move {
                    head.await;
                    for effect in rest {
                        if scopes.iter().any(AbortHandle::is_aborted) {
                            return;
                        }
                        let Some(core) = this.upgrade() else { return };
                        let running = core.start(effect, &scopes);
                        drop(core);
                        if let Some(running) = running {
                            running.await;
                        }
                    }
                }))
            },
            Effect::Cancellable {
                id,
                cancel_in_flight,
                effect,
            } => {
                if cancel_in_flight {
                    self.cancellations.cancel(&id);
                }
                let (handle, registration) = AbortHandle::new_pair();
                let mut nested = scopes.to_vec();
                nested.push(handle.clone());

                let running = self.start(*effect, &nested)?;
                let registered = self.cancellations.register(id, handle);
                Some(Box::pin(async move {
                    let _registered = registered;
                    let _ = Abortable::new(running, registration).await;
                }))
            },
            Effect::Cancel(id) => {
                self.cancellations.cancel(&id);
                None
            },
            Effect::Finally { effect, on_finish } => {
                let running = self.start(*effect, scopes)?;
                Some(Box::pin(async move {
                    let _on_finish = on_finish;
                    running.await;
                }))
            },
        }
    }

    fn spawn(&self, running: BoxFuture<'static, ()>, tracking: Option<EffectTracking>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            issue::report(
                Issue::new("An effect was returned outside a Tokio runtime and could not run"),
                &self.dependencies,
            );
            return;
        };

        if let Some(tracking) = &tracking {
            tracking.increment();
        }
        self.pending_effects.fetch_add(1, Ordering::SeqCst);
        let pending = AtomicCounterGuard(Arc::clone(&self.pending_effects));
        EffectMetrics::record_started();

        let (abort, registration) = AbortHandle::new_pair();
        let task = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(task, abort);

        let this = self.this.clone();
        let dependencies = self.dependencies.clone();
        tracing::trace!(task, "Spawning effect");

        runtime.spawn(async move {
            let _tracking = tracking.map(DecrementGuard);
            let _pending = pending;

            let outcome = AssertUnwindSafe(Abortable::new(running, registration))
                .catch_unwind()
                .await;
            EffectMetrics::record_finished();

            if let Some(core) = this.upgrade() {
                core.tasks.lock().remove(&task);
            }
            if let Err(panic) = outcome {
                report_panic(&*panic, &dependencies);
            }
        });
    }
}

/// A panicking effect is an issue for the store's reporter, never a second
/// panic on the runtime's worker.
fn report_panic(panic: &(dyn Any + Send), dependencies: &DependencyValues) {
    EffectMetrics::record_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());

    tracing::error!(%message, "An effect panicked");
    if let Some(reporter) = dependencies.issue_reporter() {
        reporter.report(&Issue::new(format!("An effect panicked: {message}")));
    }
}

impl<S, A> StoreCore<S, A> for RootCore<S, A>
where
    S: Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    fn send(&self, action: A) -> Result<EffectHandle, StoreError> {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!("Rejected action: store is shutting down");
            StoreMetrics::record_rejected();
            return Err(StoreError::ShutdownInProgress);
        }

        let (handle, tracking) = EffectHandle::new();
        self.enqueue(action, Some(tracking));
        Ok(handle)
    }

    fn read(&self, visit: &mut dyn FnMut(&S)) {
        visit(&self.state.read());
    }

    fn subscribe_actions(&self) -> ActionSubscription<A> {
        ActionSubscription::new(self.actions.subscribe())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn cancel(&self, id: &EffectId) -> usize {
        self.cancellations.cancel(id)
    }

    fn cancel_all(&self) -> usize {
        let tasks: Vec<AbortHandle> = self.tasks.lock().values().cloned().collect();
        for handle in &tasks {
            handle.abort();
        }
        self.cancellations.cancel_all();
        tracing::debug!(tasks = tasks.len(), "Cancelled every in-flight effect");
        tasks.len()
    }

    fn in_flight(&self, id: &EffectId) -> usize {
        self.cancellations.in_flight(id)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn pending_effects(&self) -> usize {
        self.pending_effects.load(Ordering::Acquire)
    }

    fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl<S, A> Drop for RootCore<S, A> {
    fn drop(&mut self) {
        let tasks = std::mem::take(self.tasks.get_mut());
        if !tasks.is_empty() {
            tracing::debug!(tasks = tasks.len(), "Store dropped, cancelling in-flight effects");
        }
        for handle in tasks.values() {
            handle.abort();
        }
        self.cancellations.cancel_all();
    }
}

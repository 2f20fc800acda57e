//! A clock that only moves when the test moves it.

use std::fmt;
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use composable_arch_core::dependencies::Clock;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::oneshot;

/// Scheduler passes given to woken effects before time moves on.
const SETTLE_ROUNDS: usize = 32;

/// Upper bound on the sleeps [`TestClock::run`] will fire.
const RUN_LIMIT: usize = 10_000;

struct Sleeper {
    deadline: Duration,
    order: u64,
    wake: oneshot::Sender<()>,
}

struct ClockState {
    start: DateTime<Utc>,
    elapsed: Duration,
    sleepers: Vec<Sleeper>,
    next_order: u64,
}

impl ClockState {
    /// Remove the earliest live sleeper due at or before `limit`.
    fn take_due(&mut self, limit: Duration) -> Option<Sleeper> {
        self.sleepers.retain(|sleeper| !sleeper.wake.is_closed());
        let index = self
            .sleepers
            .iter()
            .enumerate()
            .filter(|(_, sleeper)| sleeper.deadline <= limit)
            .min_by_key(|(_, sleeper)| (sleeper.deadline, sleeper.order))
            .map(|(index, _)| index)?;
        Some(self.sleepers.swap_remove(index))
    }
}

/// Virtual time for effects under test.
///
/// Install it as the clock dependency and effects that sleep through the
/// clock wait until the test calls [`advance`](Self::advance) or
/// [`run`](Self::run). Clones share the same time.
///
/// Woken effects get a few scheduler passes to run before time moves again,
/// which is enough on a current-thread runtime, the `#[tokio::test]`
/// default.
///
/// ```
/// use composable_arch_core::dependencies::Clock;
/// use composable_arch_testing::TestClock;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let clock = TestClock::new();
/// let sleeping = tokio::spawn(clock.sleep(Duration::from_secs(5)));
///
/// clock.advance(Duration::from_secs(4)).await;
/// assert!(!sleeping.is_finished());
///
/// clock.advance(Duration::from_secs(1)).await;
/// sleeping.await.unwrap();
/// assert_eq!(clock.elapsed(), Duration::from_secs(5));
/// # }
/// ```
#[derive(Clone)]
pub struct TestClock {
    state: Arc<Mutex<ClockState>>,
}

impl TestClock {
    /// A clock reading the Unix epoch.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(DateTime::UNIX_EPOCH)
    }

    /// A clock reading `start`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                start,
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
                next_order: 0,
            })),
        }
    }

    /// Time advanced since the clock was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// Sleeps waiting for time to advance.
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock();
        state.sleepers.retain(|sleeper| !sleeper.wake.is_closed());
        state.sleepers.len()
    }

    /// Move time forward by `duration`, waking every sleep due on the way
    /// in deadline order.
    ///
    /// Woken effects run before the next sleep is woken only on a
    /// current-thread runtime. On a multi-thread runtime they may still be
    /// running when this returns, and a warning is logged.
    pub async fn advance(&self, duration: Duration) {
        warn_unless_current_thread();
        let target = self.elapsed() + duration;
        loop {
            settle().await;
            let Some(sleeper) = ({
                let mut state = self.state.lock();
                let due = state.take_due(target);
                if let Some(sleeper) = &due {
                    state.elapsed = state.elapsed.max(sleeper.deadline);
                }
                due
            }) else {
                break;
            };
            let _ = sleeper.wake.send(());
        }

        {
            let mut state = self.state.lock();
            state.elapsed = state.elapsed.max(target);
        }
        settle().await;
        tracing::trace!(elapsed = ?self.elapsed(), "Test clock advanced");
    }

    /// Advance until no sleep is pending.
    ///
    /// Effects that keep rescheduling themselves never run out; `run` stops
    /// after a bounded number of wakeups and logs a warning. Needs a
    /// current-thread runtime, like [`advance`](Self::advance).
    pub async fn run(&self) {
        for _ in 0..RUN_LIMIT {
            settle().await;
            let next = {
                let mut state = self.state.lock();
                state.sleepers.retain(|sleeper| !sleeper.wake.is_closed());
                state.sleepers.iter().map(|sleeper| sleeper.deadline).min()
            };
            let Some(deadline) = next else { return };
            let now = self.elapsed();
            self.advance(deadline.saturating_sub(now)).await;
        }
        tracing::warn!(limit = RUN_LIMIT, "Test clock still has pending sleeps after the run limit");
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TestClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TestClock")
            .field("elapsed", &state.elapsed)
            .field("sleepers", &state.sleepers.len())
            .finish()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let state = self.state.lock();
        TimeDelta::from_std(state.elapsed)
            .ok()
            .and_then(|elapsed| state.start.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return Box::pin(std::future::ready(()));
        }

        let (wake, woken) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let deadline = state.elapsed + duration;
            let order = state.next_order;
            state.next_order += 1;
            state.sleepers.push(Sleeper {
                deadline,
                order,
                wake,
            });
        }
        Box::pin(async move {
            let _ = woken.await;
        })
    }
}

/// Whether yielding lets every woken task run, which only holds when this
/// task shares its thread with them.
fn settles_reliably() -> bool {
    tokio::runtime::Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::CurrentThread)
}

fn warn_unless_current_thread() {
    static WARNED: Once = Once::new();
    if !settles_reliably() {
        WARNED.call_once(|| {
            tracing::warn!(
                "TestClock is advancing on a multi-thread runtime; woken effects may not have run \
                 when it returns. Use #[tokio::test] with the default current-thread flavor."
            );
        });
    }
}

async fn settle() {
    for _ in 0..SETTLE_ROUNDS {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn sleeps_wake_in_deadline_order() {
        let clock = TestClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, seconds) in [("late", 3), ("early", 1), ("middle", 2)] {
            let sleep = clock.sleep(Duration::from_secs(seconds));
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                sleep.await;
                order.lock().push(label);
            });
        }

        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(*order.lock(), ["early", "middle"]);
        assert_eq!(clock.pending(), 1);

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(*order.lock(), ["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn now_follows_elapsed_time() {
        let clock = TestClock::new();
        clock.advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), DateTime::UNIX_EPOCH + TimeDelta::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn rescheduled_sleeps_fire_within_one_advance() {
        let clock = TestClock::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let ticking = clock.clone();
        let task = tokio::spawn(async move {
            loop {
                ticking.sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(3)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        task.abort();
    }

    #[tokio::test]
    async fn run_fires_everything_scheduled() {
        let clock = TestClock::new();
        let done = tokio::spawn(clock.sleep(Duration::from_secs(60)));

        clock.run().await;
        assert!(done.await.is_ok());
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
        assert_eq!(clock.pending(), 0);
    }

    #[tokio::test]
    async fn dropped_sleeps_are_forgotten() {
        let clock = TestClock::new();
        drop(clock.sleep(Duration::from_secs(1)));
        assert_eq!(clock.pending(), 0);
    }

    #[tokio::test]
    async fn current_thread_runtime_settles() {
        assert!(settles_reliably());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multi_thread_runtime_is_detected_and_still_advances() {
        assert!(!settles_reliably());

        let clock = TestClock::new();
        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }
}

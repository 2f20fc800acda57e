//! Time as a dependency.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use super::DependencyKey;

/// Clock trait - abstracts time operations for testability
///
/// Effects must sleep through the clock in scope rather than calling
/// `tokio::time::sleep` directly, so tests can control time.
///
/// # Examples
///
/// ```
/// use composable_arch_core::dependencies::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let _now = clock.now();
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;

    /// Suspend for `duration` as measured by this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Wall-clock time, sleeping on the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// The clock effects sleep on.
///
/// Has no test value: tests install a controllable clock explicitly.
pub struct ClockKey;

impl DependencyKey for ClockKey {
    type Value = Arc<dyn Clock>;

    fn live_value() -> Option<Self::Value> {
        Some(Arc::new(SystemClock))
    }
}

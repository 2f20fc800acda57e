//! # Composable Architecture Testing
//!
//! Tools for testing features built on the Composable Architecture.
//!
//! - [`TestStore`]: runs a feature for real and makes the test assert every
//!   state change, every action its effects feed back, and every shared
//!   state write.
//! - [`TestClock`]: virtual time. Install it as the clock dependency and
//!   delays, debounces and timers only fire when the test advances it.
//! - [`ReducerTest`]: Given-When-Then checks of a single reducer call, with
//!   [`assertions`] for the effects it returns.
//!
//! ## Example
//!
//! ```
//! use composable_arch_core::dependencies::ClockKey;
//! use composable_arch_core::{Effect, Reduce, smallvec};
//! use composable_arch_testing::{TestClock, TestStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum Action {
//!     Start,
//!     Tick,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let clock = TestClock::new();
//! let mut store = TestStore::with_dependencies(
//!     0_u32,
//!     Reduce::new(|ticks: &mut u32, action: Action, _| match action {
//!         Action::Start => smallvec![Effect::delay(Duration::from_secs(1), Action::Tick)],
//!         Action::Tick => {
//!             *ticks += 1;
//!             smallvec![]
//!         },
//!     }),
//!     |values| values.set::<ClockKey>(Arc::new(clock.clone())),
//! );
//!
//! store.send(Action::Start, |_| {}).await;
//! clock.advance(Duration::from_secs(1)).await;
//! store.receive(Action::Tick, |ticks| *ticks = 1).await;
//! store.finish().await;
//! # }
//! ```

mod clock;
mod test_store;

pub use clock::TestClock;
pub use reducer_test::{ReducerTest, assertions};
pub use test_store::{Exhaustivity, TestStore, TestStoreConfig};

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG`, defaulting to `warn`. Calling it more than
/// once is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

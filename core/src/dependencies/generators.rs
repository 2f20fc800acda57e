//! Non-deterministic inputs: dates, UUIDs and randomness.
//!
//! None of these keys has a test value. A test that reaches for one without
//! overriding it fails, naming the key.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use uuid::Uuid;

use super::DependencyKey;

/// Produces the current date.
#[derive(Clone)]
pub struct DateGenerator {
    generate: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl DateGenerator {
    /// A generator backed by `generate`.
    pub fn new(generate: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            generate: Arc::new(generate),
        }
    }

    /// The system time.
    #[must_use]
    pub fn live() -> Self {
        Self::new(Utc::now)
    }

    /// Always `date`.
    #[must_use]
    pub fn constant(date: DateTime<Utc>) -> Self {
        Self::new(move || date)
    }

    /// The next date.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        (self.generate)()
    }
}

impl fmt::Debug for DateGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DateGenerator")
    }
}

/// Key for [`DateGenerator`].
pub struct DateKey;

impl DependencyKey for DateKey {
    type Value = DateGenerator;

    fn live_value() -> Option<Self::Value> {
        Some(DateGenerator::live())
    }
}

/// Produces UUIDs.
#[derive(Clone)]
pub struct UuidGenerator {
    generate: Arc<dyn Fn() -> Uuid + Send + Sync>,
}

impl UuidGenerator {
    /// A generator backed by `generate`.
    pub fn new(generate: impl Fn() -> Uuid + Send + Sync + 'static) -> Self {
        Self {
            generate: Arc::new(generate),
        }
    }

    /// Random v4 UUIDs.
    #[must_use]
    pub fn live() -> Self {
        Self::new(Uuid::new_v4)
    }

    /// `00000000-0000-0000-0000-000000000000`, then `...0001`, and so on.
    #[must_use]
    pub fn incrementing() -> Self {
        let next = AtomicU64::new(0);
        Self::new(move || Uuid::from_u128(u128::from(next.fetch_add(1, Ordering::Relaxed))))
    }

    /// Always `uuid`.
    #[must_use]
    pub fn constant(uuid: Uuid) -> Self {
        Self::new(move || uuid)
    }

    /// The next UUID.
    #[must_use]
    pub fn generate(&self) -> Uuid {
        (self.generate)()
    }
}

impl fmt::Debug for UuidGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UuidGenerator")
    }
}

/// Key for [`UuidGenerator`].
pub struct UuidKey;

impl DependencyKey for UuidKey {
    type Value = UuidGenerator;

    fn live_value() -> Option<Self::Value> {
        Some(UuidGenerator::live())
    }
}

/// Shared access to a random number generator.
#[derive(Clone, Debug)]
pub struct WithRandom {
    rng: Arc<Mutex<StdRng>>,
}

impl WithRandom {
    /// Seeded from system entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Deterministic from `seed`.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Run `operation` with exclusive access to the generator.
    pub fn with<R>(&self, operation: impl FnOnce(&mut StdRng) -> R) -> R {
        operation(&mut self.rng.lock())
    }
}

/// Key for [`WithRandom`].
pub struct RandomKey;

impl DependencyKey for RandomKey {
    type Value = WithRandom;

    fn live_value() -> Option<Self::Value> {
        Some(WithRandom::from_entropy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::DependencyValues;
    use rand::Rng;

    #[test]
    fn incrementing_uuids_count_up() {
        let uuids = UuidGenerator::incrementing();
        assert_eq!(uuids.generate().to_string(), "00000000-0000-0000-0000-000000000000");
        assert_eq!(uuids.generate().to_string(), "00000000-0000-0000-0000-000000000001");
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let a = WithRandom::seeded(42).with(|rng| rng.r#gen::<u64>());
        let b = WithRandom::seeded(42).with(|rng| rng.r#gen::<u64>());
        assert_eq!(a, b);
    }

    #[test]
    fn generators_have_no_test_default() {
        let values = DependencyValues::test();
        assert!(values.try_get::<UuidKey>().is_err());
        assert!(values.try_get::<DateKey>().is_err());
        assert!(values.try_get::<RandomKey>().is_err());
    }
}

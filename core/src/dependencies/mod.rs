//! Dependency registry.
//!
//! Dependencies are values looked up by a [`DependencyKey`]. Each key names
//! the value type and may provide a live, preview and test default. A
//! [`DependencyValues`] holds overrides layered on top of those defaults,
//! together with the [`DependencyContext`] that selects which default is used.
//!
//! Lookups are scoped. The values in effect are found, innermost first, in:
//!
//! 1. a synchronous scope entered with [`DependencyValues::enter`] or
//!    [`with_dependencies`],
//! 2. the task-local scope of an async task ([`DependencyValues::scope`]),
//! 3. the process root, whose context is read from the
//!    `COMPOSABLE_DEPENDENCY_CONTEXT` environment variable.
//!
//! Effects capture the values in scope when they are created and run under
//! them, so overrides made by a reducer modifier follow the effects that
//! reducer returns.
//!
//! # Example
//!
//! ```
//! use composable_arch_core::dependencies::{dependency, with_dependencies, DependencyKey};
//!
//! struct ApiBase;
//!
//! impl DependencyKey for ApiBase {
//!     type Value = &'static str;
//!
//!     fn live_value() -> Option<Self::Value> {
//!         Some("https://api.example.com")
//!     }
//!
//!     fn test_value() -> Option<Self::Value> {
//!         Some("http://localhost")
//!     }
//! }
//!
//! let url = with_dependencies(
//!     |values| values.set::<ApiBase>("http://staging"),
//!     || dependency::<ApiBase>(),
//! );
//! assert_eq!(url, "http://staging");
//! ```

mod clock;
mod dismiss;
mod generators;

pub use clock::{Clock, ClockKey, SystemClock};
pub use dismiss::{DismissEffect, DismissKey};
pub use generators::{DateGenerator, DateKey, RandomKey, UuidGenerator, UuidKey, WithRandom};

use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::task::futures::TaskLocalFuture;

use crate::issue::IssueReporter;

/// Environment variable selecting the process-wide default context.
pub const CONTEXT_ENV_VAR: &str = "COMPOSABLE_DEPENDENCY_CONTEXT";

/// Which family of default values dependency lookups resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DependencyContext {
    /// Production values.
    #[default]
    Live,
    /// Values for previews and demos. Falls back to live, then test values.
    Preview,
    /// Values for tests. A key without a test value fails loudly.
    Test,
}

impl DependencyContext {
    /// The context configured through [`CONTEXT_ENV_VAR`], read once.
    ///
    /// Unset or unrecognised values select [`DependencyContext::Live`].
    #[must_use]
    pub fn from_env() -> Self {
        static CONTEXT: OnceLock<DependencyContext> = OnceLock::new();
        *CONTEXT.get_or_init(|| match std::env::var(CONTEXT_ENV_VAR) {
            Ok(raw) => raw.parse().unwrap_or_else(|error| {
                tracing::warn!(%error, "Falling back to the live dependency context");
                Self::Live
            }),
            Err(_) => Self::Live,
        })
    }
}

impl FromStr for DependencyContext {
    type Err = DependencyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "preview" => Ok(Self::Preview),
            "test" => Ok(Self::Test),
            _ => Err(DependencyError::UnknownContext(raw.to_string())),
        }
    }
}

impl fmt::Display for DependencyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Live => "live",
            Self::Preview => "preview",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Errors raised while resolving dependencies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// The key has no value for the requested context and was not overridden.
    #[error("dependency `{key}` has no {context} value; override it before use")]
    Unresolved {
        /// Type name of the key.
        key: &'static str,
        /// The context the lookup ran in.
        context: DependencyContext,
    },

    /// The environment named a context that does not exist.
    #[error("unknown dependency context `{0}` (expected live, preview or test)")]
    UnknownContext(String),
}

/// Identifies a dependency and its default values.
///
/// Every default is optional. Resolution picks, by context:
///
/// - live: `live_value`, then `test_value`
/// - preview: `preview_value`, then `live_value`, then `test_value`
/// - test: `test_value` only
pub trait DependencyKey: 'static {
    /// The dependency's value type.
    type Value: Clone + Send + Sync + 'static;

    /// Production default.
    fn live_value() -> Option<Self::Value> {
        None
    }

    /// Preview default.
    fn preview_value() -> Option<Self::Value> {
        None
    }

    /// Test default.
    fn test_value() -> Option<Self::Value> {
        None
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

/// A set of dependency overrides plus the context used for defaults.
///
/// Cloning is cheap. Setting a value on a clone never affects the original.
/// Default values are resolved once and cached; clones share that cache
/// until the context changes.
#[derive(Clone)]
pub struct DependencyValues {
    context: DependencyContext,
    overrides: Arc<HashMap<TypeId, Entry>>,
    resolved: Arc<Mutex<HashMap<TypeId, Entry>>>,
    issue_reporter: Option<Arc<dyn IssueReporter>>,
}

thread_local! {
    static SCOPED: RefCell<Vec<DependencyValues>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_SCOPED: DependencyValues;
}

impl DependencyValues {
    /// Empty values resolving defaults in `context`.
    #[must_use]
    pub fn new(context: DependencyContext) -> Self {
        Self {
            context,
            overrides: Arc::new(HashMap::new()),
            resolved: Arc::new(Mutex::new(HashMap::new())),
            issue_reporter: None,
        }
    }

    /// Empty values in the live context.
    #[must_use]
    pub fn live() -> Self {
        Self::new(DependencyContext::Live)
    }

    /// Empty values in the preview context.
    #[must_use]
    pub fn preview() -> Self {
        Self::new(DependencyContext::Preview)
    }

    /// Empty values in the test context.
    #[must_use]
    pub fn test() -> Self {
        Self::new(DependencyContext::Test)
    }

    /// The process root values, created on first use.
    pub fn root() -> &'static Self {
        static ROOT: OnceLock<DependencyValues> = OnceLock::new();
        ROOT.get_or_init(|| Self::new(DependencyContext::from_env()))
    }

    /// The values in effect for the caller.
    #[must_use]
    pub fn current() -> Self {
        if let Some(values) = SCOPED.with(|stack| stack.borrow().last().cloned()) {
            return values;
        }
        TASK_SCOPED
            .try_with(Clone::clone)
            .unwrap_or_else(|_| Self::root().clone())
    }

    /// The context defaults are resolved in.
    #[must_use]
    pub const fn context(&self) -> DependencyContext {
        self.context
    }

    /// Switch the context. Overrides are kept; cached defaults are not.
    pub fn set_context(&mut self, context: DependencyContext) {
        if self.context != context {
            self.context = context;
            self.resolved = Arc::new(Mutex::new(HashMap::new()));
        }
    }

    /// Override the value for `K`.
    pub fn set<K: DependencyKey>(&mut self, value: K::Value) {
        Arc::make_mut(&mut self.overrides).insert(TypeId::of::<K>(), Arc::new(value));
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn with<K: DependencyKey>(mut self, value: K::Value) -> Self {
        self.set::<K>(value);
        self
    }

    /// Whether `K` has been overridden on these values.
    #[must_use]
    pub fn is_overridden<K: DependencyKey>(&self) -> bool {
        self.overrides.contains_key(&TypeId::of::<K>())
    }

    /// Route issues reported under these values to `reporter`.
    pub fn set_issue_reporter(&mut self, reporter: Arc<dyn IssueReporter>) {
        self.issue_reporter = Some(reporter);
    }

    /// The installed issue reporter, if any.
    #[must_use]
    pub fn issue_reporter(&self) -> Option<&Arc<dyn IssueReporter>> {
        self.issue_reporter.as_ref()
    }

    /// Resolve `K`: the override if present, else the context default.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyError::Unresolved`] when `K` was not overridden and
    /// has no default for this context.
    pub fn try_get<K: DependencyKey>(&self) -> Result<K::Value, DependencyError> {
        let id = TypeId::of::<K>();
        if let Some(value) = self.overrides.get(&id).and_then(|entry| entry.downcast_ref::<K::Value>()) {
            return Ok(value.clone());
        }

        if let Some(value) = self.resolved.lock().get(&id).and_then(|entry| entry.downcast_ref::<K::Value>()) {
            return Ok(value.clone());
        }

        // Resolve outside the cache lock: defaults may look up other keys.
        let resolved = match self.context {
            DependencyContext::Live => K::live_value().or_else(K::test_value),
            DependencyContext::Preview => K::preview_value()
                .or_else(K::live_value)
                .or_else(K::test_value),
            DependencyContext::Test => K::test_value(),
        }
        .ok_or(DependencyError::Unresolved {
            key: type_name::<K>(),
            context: self.context,
        })?;

        let mut cache = self.resolved.lock();
        let entry = cache.entry(id).or_insert_with(|| Arc::new(resolved.clone()));
        Ok(entry.downcast_ref::<K::Value>().cloned().unwrap_or(resolved))
    }

    /// Resolve `K`, failing loudly when it cannot be resolved.
    ///
    /// # Panics
    ///
    /// Panics when [`try_get`](Self::try_get) fails. Inside an effect the
    /// runtime turns the panic into a reported issue.
    #[must_use]
    #[track_caller]
    pub fn get<K: DependencyKey>(&self) -> K::Value {
        match self.try_get::<K>() {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(%error, "Unresolved dependency");
                #[allow(clippy::panic)] // Unresolved dependencies are programmer errors
                {
                    panic!("{error}");
                }
            },
        }
    }

    /// Run `operation` with these values in scope on the current thread.
    pub fn enter<R>(self, operation: impl FnOnce() -> R) -> R {
        struct PopOnDrop;

        impl Drop for PopOnDrop {
            fn drop(&mut self) {
                let _ = SCOPED.try_with(|stack| stack.borrow_mut().pop());
            }
        }

        SCOPED.with(|stack| stack.borrow_mut().push(self));
        let _pop = PopOnDrop;
        operation()
    }

    /// Run `future` with these values in scope for every poll.
    pub fn scope<F: Future>(self, future: F) -> TaskLocalFuture<Self, F> {
        TASK_SCOPED.scope(self, future)
    }
}

impl Default for DependencyValues {
    fn default() -> Self {
        Self::new(DependencyContext::from_env())
    }
}

impl fmt::Debug for DependencyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyValues")
            .field("context", &self.context)
            .field("overrides", &self.overrides.len())
            .field("issue_reporter", &self.issue_reporter.is_some())
            .finish_non_exhaustive()
    }
}

/// Resolve `K` against the values in scope.
///
/// # Panics
///
/// Panics when the key cannot be resolved; see [`DependencyValues::get`].
#[must_use]
#[track_caller]
pub fn dependency<K: DependencyKey>() -> K::Value {
    DependencyValues::current().get::<K>()
}

/// Run `operation` with the current values, modified by `update`, in scope.
pub fn with_dependencies<R>(
    update: impl FnOnce(&mut DependencyValues),
    operation: impl FnOnce() -> R,
) -> R {
    let mut values = DependencyValues::current();
    update(&mut values);
    values.enter(operation)
}

/// Async form of [`with_dependencies`]: every poll of `future` sees the
/// modified values.
pub fn with_dependencies_async<F: Future>(
    update: impl FnOnce(&mut DependencyValues),
    future: F,
) -> TaskLocalFuture<DependencyValues, F> {
    let mut values = DependencyValues::current();
    update(&mut values);
    values.scope(future)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    struct Greeting;

    impl DependencyKey for Greeting {
        type Value = String;

        fn live_value() -> Option<String> {
            Some("live".into())
        }

        fn test_value() -> Option<String> {
            Some("test".into())
        }
    }

    struct LiveOnly;

    impl DependencyKey for LiveOnly {
        type Value = u32;

        fn live_value() -> Option<u32> {
            Some(7)
        }
    }

    struct TestOnly;

    impl DependencyKey for TestOnly {
        type Value = u32;

        fn test_value() -> Option<u32> {
            Some(3)
        }
    }

    #[test]
    fn resolves_default_for_context() {
        assert_eq!(DependencyValues::live().get::<Greeting>(), "live");
        assert_eq!(DependencyValues::test().get::<Greeting>(), "test");
        assert_eq!(DependencyValues::preview().get::<Greeting>(), "live");
    }

    #[test]
    fn live_falls_back_to_test_value() {
        assert_eq!(DependencyValues::live().get::<TestOnly>(), 3);
        assert_eq!(DependencyValues::preview().get::<TestOnly>(), 3);
    }

    #[test]
    fn test_context_without_test_value_is_an_error() {
        let error = DependencyValues::test().try_get::<LiveOnly>().unwrap_err();
        match error {
            DependencyError::Unresolved { key, context } => {
                assert!(key.ends_with("LiveOnly"));
                assert_eq!(context, DependencyContext::Test);
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    #[should_panic(expected = "LiveOnly")]
    fn get_panics_naming_the_key() {
        let _ = DependencyValues::test().get::<LiveOnly>();
    }

    #[test]
    fn override_wins_and_does_not_leak_to_original() {
        let base = DependencyValues::test();
        let overridden = base.clone().with::<LiveOnly>(42);

        assert_eq!(overridden.get::<LiveOnly>(), 42);
        assert!(base.try_get::<LiveOnly>().is_err());
        assert!(overridden.is_overridden::<LiveOnly>());
    }

    #[test]
    fn nested_scopes_restore_outer_values() {
        DependencyValues::test().enter(|| {
            assert_eq!(dependency::<Greeting>(), "test");
            with_dependencies(
                |values| values.set::<Greeting>("inner".into()),
                || assert_eq!(dependency::<Greeting>(), "inner"),
            );
            assert_eq!(dependency::<Greeting>(), "test");
        });
    }

    #[test]
    fn context_parses_from_strings() {
        assert_eq!("Test".parse::<DependencyContext>().unwrap(), DependencyContext::Test);
        assert_eq!(" preview ".parse::<DependencyContext>().unwrap(), DependencyContext::Preview);
        assert!("staging".parse::<DependencyContext>().is_err());
    }

    #[test]
    fn changing_context_drops_cached_defaults() {
        let mut values = DependencyValues::live();
        assert_eq!(values.get::<Greeting>(), "live");
        values.set_context(DependencyContext::Test);
        assert_eq!(values.get::<Greeting>(), "test");
    }

    #[tokio::test]
    async fn task_scope_is_visible_across_awaits() {
        let values = DependencyValues::test().with::<LiveOnly>(9);
        let seen = values
            .scope(async {
                tokio::task::yield_now().await;
                dependency::<LiveOnly>()
            })
            .await;
        assert_eq!(seen, 9);
    }

    #[tokio::test]
    async fn async_override_applies_inside_future() {
        let seen = with_dependencies_async(
            |values| values.set::<Greeting>("async".into()),
            async { dependency::<Greeting>() },
        )
        .await;
        assert_eq!(seen, "async");
    }
}

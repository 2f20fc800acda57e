//! Declarative macros for ergonomic effect construction

/// Build an effect from an async block producing `Option<Action>`.
///
/// # Example
///
/// ```
/// use composable_arch_core::{async_effect, effect::Effect};
///
/// #[derive(Debug)]
/// enum Action {
///     Loaded(u32),
/// }
///
/// let effect: Effect<Action> = async_effect! {
///     Some(Action::Loaded(7))
/// };
/// assert!(matches!(effect, Effect::Run(_)));
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::future(async move { $($body)* })
    };
}

/// Deliver an action after a delay on the clock in scope.
///
/// # Example
///
/// ```
/// use composable_arch_core::delay;
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// enum Action {
///     TimerTicked,
/// }
///
/// let effect = delay! {
///     duration: Duration::from_secs(1),
///     action: Action::TimerTicked
/// };
/// assert!(!effect.is_none());
/// ```
#[macro_export]
macro_rules! delay {
    (
        duration: $duration:expr,
        action: $action:expr
    ) => {
        $crate::effect::Effect::delay($duration, $action)
    };
}

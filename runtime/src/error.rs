//! Error types for the Store runtime

use thiserror::Error;

/// Errors that can occur during Store operations
///
/// Effects never fail the store: their errors are either mapped to actions
/// by the reducer's author or reported as issues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Store is shutting down and not accepting new actions
    ///
    /// This error is returned when `send()` is called after shutdown initiated.
    #[error("Store is shutting down")]
    ShutdownInProgress,

    /// Shutdown timed out waiting for effects to complete
    ///
    /// Some effects were still running when the timeout elapsed.
    #[error("Shutdown timed out with {0} effects still running")]
    ShutdownTimeout(usize),

    /// Timeout waiting for an action
    ///
    /// Returned by `send_and_wait_for` when the timeout expires before
    /// a matching action is received.
    #[error("Timeout waiting for action")]
    Timeout,

    /// Action broadcast channel closed
    ///
    /// The store was dropped while a subscriber was waiting.
    #[error("Action broadcast channel closed")]
    ChannelClosed,
}

//! Programmer-error reporting.
//!
//! Misuse of the architecture (a dependency accessed in the test context
//! without a test value, a reducer that defines neither `reduce` nor `body`,
//! an effect that fails without a handler) is reported as an [`Issue`].
//!
//! Every issue is logged with `tracing::error!`. What happens next depends on
//! the ambient [`DependencyValues`]:
//!
//! - An installed [`IssueReporter`] receives the issue. The test store
//!   installs one that collects issues and fails the next assertion.
//! - Otherwise, in the test context, the issue panics so the test fails.
//! - Otherwise the log line is the only trace.

use std::fmt;
use std::panic::Location;

use crate::dependencies::{DependencyContext, DependencyValues};

/// A reported programmer error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    message: String,
    location: &'static Location<'static>,
}

impl Issue {
    /// Creates an issue at the caller's location.
    #[must_use]
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
        }
    }

    /// The issue description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Where the issue was reported.
    #[must_use]
    pub const fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.message, self.location)
    }
}

/// Receives issues reported under a [`DependencyValues`] scope.
pub trait IssueReporter: Send + Sync {
    /// Handle a reported issue.
    fn report(&self, issue: &Issue);
}

/// Report a programmer error through the ambient dependency scope.
///
/// # Panics
///
/// Panics in the test context when no [`IssueReporter`] is installed.
#[track_caller]
pub fn report_issue(message: impl Into<String>) {
    report(Issue::new(message), &DependencyValues::current());
}

/// Report an already-built issue against explicit dependency values.
///
/// The runtime uses this for failures captured on effect tasks, where the
/// scope that launched the effect is known but may not be ambient.
///
/// # Panics
///
/// Panics in the test context when no [`IssueReporter`] is installed.
pub fn report(issue: Issue, dependencies: &DependencyValues) {
    tracing::error!(location = %issue.location, "{}", issue.message);

    if let Some(reporter) = dependencies.issue_reporter() {
        reporter.report(&issue);
    } else if dependencies.context() == DependencyContext::Test {
        #[allow(clippy::panic)] // Unhandled issues must fail the test
        {
            panic!("{issue}");
        }
    }
}

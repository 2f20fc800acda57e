//! Self-dismissal for presented features.

use std::fmt;
use std::sync::Arc;

use super::DependencyKey;

/// Asks the presenting parent to dismiss the current feature.
///
/// The presentation reducer installs a working value for the child reducer
/// and its effects. Anywhere else the value is inert: calling it logs a
/// warning and does nothing.
#[derive(Clone, Default)]
pub struct DismissEffect {
    dismiss: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl DismissEffect {
    /// A dismissal that runs `dismiss`.
    pub fn new(dismiss: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            dismiss: Some(Arc::new(dismiss)),
        }
    }

    /// Whether this value is connected to a presentation.
    #[must_use]
    pub const fn is_presented(&self) -> bool {
        self.dismiss.is_some()
    }

    /// Request dismissal.
    pub fn dismiss(&self) {
        match &self.dismiss {
            Some(dismiss) => dismiss(),
            None => tracing::warn!(
                "Dismiss was invoked outside of a presented feature; nothing will be dismissed"
            ),
        }
    }
}

impl fmt::Debug for DismissEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DismissEffect")
            .field("is_presented", &self.is_presented())
            .finish()
    }
}

/// Key for [`DismissEffect`]. Defaults to the inert value in every context.
pub struct DismissKey;

impl DependencyKey for DismissKey {
    type Value = DismissEffect;

    fn live_value() -> Option<Self::Value> {
        Some(DismissEffect::default())
    }

    fn test_value() -> Option<Self::Value> {
        Some(DismissEffect::default())
    }
}

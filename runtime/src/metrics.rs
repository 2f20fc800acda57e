//! Prometheus metrics for the store runtime.
//!
//! The store records metrics through the [`metrics`] facade whether or not a
//! recorder is installed. Install the Prometheus recorder once at startup to
//! collect them:
//!
//! ```rust,no_run
//! use composable_arch_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! if let Some(text) = exporter.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs a Prometheus recorder and renders what it collected.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// An exporter that has not been installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe the store metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// Only one recorder can be installed per process. If one already is
    /// (e.g., in tests), this logs a warning and succeeds without a handle.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Install the Prometheus recorder and return its handle, if this call
/// installed it.
///
/// # Errors
///
/// See [`MetricsExporter::install`].
pub fn install_prometheus_recorder() -> Result<Option<PrometheusHandle>, MetricsError> {
    let mut exporter = MetricsExporter::new();
    exporter.install()?;
    Ok(exporter.handle)
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        "store_actions_total",
        "Total number of actions reduced by stores"
    );
    describe_histogram!(
        "store_reducer_duration_seconds",
        "Time spent running the reducer for one action"
    );
    describe_counter!(
        "store_effects_started_total",
        "Total number of effect tasks spawned"
    );
    describe_counter!(
        "store_effects_cancelled_total",
        "Total number of in-flight effects cancelled by id"
    );
    describe_counter!(
        "store_effects_panicked_total",
        "Total number of effect tasks that panicked"
    );
    describe_gauge!(
        "store_effects_in_flight",
        "Number of effect tasks currently running"
    );
    describe_counter!(
        "store_shutdown_rejected_actions_total",
        "Actions rejected because the store was shutting down"
    );
}

/// Reducer metrics recorder.
pub struct ReducerMetrics;

impl ReducerMetrics {
    /// Record an action processed.
    pub fn record_action(duration: Duration) {
        counter!("store_actions_total").increment(1);
        histogram!("store_reducer_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Effect metrics recorder.
pub struct EffectMetrics;

impl EffectMetrics {
    /// Record an effect task spawned.
    pub fn record_started() {
        counter!("store_effects_started_total").increment(1);
        gauge!("store_effects_in_flight").increment(1.0);
    }

    /// Record an effect task finished, cancelled or not.
    pub fn record_finished() {
        gauge!("store_effects_in_flight").decrement(1.0);
    }

    /// Record effects cancelled through an id.
    pub fn record_cancelled(count: usize) {
        counter!("store_effects_cancelled_total").increment(count as u64);
    }

    /// Record an effect task panic.
    pub fn record_panic() {
        counter!("store_effects_panicked_total").increment(1);
    }
}

/// Store lifecycle metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record an action rejected during shutdown.
    pub fn record_rejected() {
        counter!("store_shutdown_rejected_actions_total").increment(1);
    }
}

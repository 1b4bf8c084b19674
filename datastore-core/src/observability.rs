/*!
Observability infrastructure for the data store.

This module provides:
- Structured logging setup through `tracing-subscriber`
- Prometheus metrics for save chains and merges (behind the `metrics` feature)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{DataStoreError, Result};

/// Default filter directive when `RUST_LOG` is unset
pub const DEFAULT_LOG_DIRECTIVE: &str = "datastore=info";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<DataStoreMetrics>> = OnceLock::new();

/// Metrics collection for save chains and change propagation
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct DataStoreMetrics {
    pub saves_total: Counter,
    pub save_failures_total: Counter,
    pub merges_total: Counter,
    pub save_duration_seconds: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
impl DataStoreMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let saves_total = Counter::new(
            "datastore_saves_total",
            "Total full save chains started",
        )
        .map_err(|e| DataStoreError::storage(format!("Failed to create saves_total metric: {e}")))?;

        let save_failures_total = Counter::new(
            "datastore_save_failures_total",
            "Total full save chains that ended with an error",
        )
        .map_err(|e| {
            DataStoreError::storage(format!("Failed to create save_failures_total metric: {e}"))
        })?;

        let merges_total = Counter::new(
            "datastore_merges_total",
            "Total sibling merges applied by change propagation",
        )
        .map_err(|e| DataStoreError::storage(format!("Failed to create merges_total metric: {e}")))?;

        let save_duration_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "datastore_save_duration_seconds",
            "Duration of full save chains in seconds",
        ))
        .map_err(|e| {
            DataStoreError::storage(format!("Failed to create save_duration_seconds metric: {e}"))
        })?;

        for collector in [
            Box::new(saves_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(save_failures_total.clone()),
            Box::new(merges_total.clone()),
            Box::new(save_duration_seconds.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| DataStoreError::storage(format!("Failed to register metric: {e}")))?;
        }

        Ok(Self {
            saves_total,
            save_failures_total,
            merges_total,
            save_duration_seconds,
            registry,
        })
    }

    /// Get or initialize the global metrics instance
    ///
    /// `None` when the metrics could not be registered; the failure is logged once.
    pub fn global() -> Option<&'static DataStoreMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(error) => {
                    tracing::error!(%error, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_save(&self, duration: Duration, success: bool) {
        self.saves_total.inc();
        if !success {
            self.save_failures_total.inc();
        }
        self.save_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_merge(&self) {
        self.merges_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| DataStoreError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| DataStoreError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Record the outcome of a full save chain
pub(crate) fn record_save(duration: Duration, success: bool) {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = DataStoreMetrics::global() {
            metrics.record_save(duration, success);
        }
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (duration, success);
}

pub(crate) fn record_merge() {
    #[cfg(feature = "metrics")]
    {
        if let Some(metrics) = DataStoreMetrics::global() {
            metrics.record_merge();
        }
    }
}

/// Install the global tracing subscriber
///
/// Log filtering follows `RUST_LOG`, falling back to `datastore=info`.
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of plain text
///
/// # Returns
/// Result indicating success or failure of initialization
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    DataStoreMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_DIRECTIVE))
        .map_err(|e| DataStoreError::storage(format!("Invalid log filter: {e}")))?;
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            ),
        )
    } else {
        set_global_default(registry.with(tracing_subscriber::fmt::layer().with_target(false)))
    };
    installed.map_err(|e| {
        DataStoreError::storage(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("Data store observability initialized");
    Ok(())
}

/// Initialize observability with plain-text output
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}

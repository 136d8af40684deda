use crate::api::v1::integration::Integration;
use crate::api::v1::integrationtarget::IntegrationTarget;
use crate::api::v1::ToolKind;
use crate::util::errors::Error;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub tool_health: IntGaugeVec,
    pub connectivity: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations").unwrap();
        let tool_health = IntGaugeVec::new(
            opts!(
                "integration_tool_health",
                "Whether the tool passed its most recent health check on the cluster (1/0)",
            ),
            &["cluster", "tool"],
        )
        .unwrap();
        let connectivity = IntGaugeVec::new(
            opts!(
                "integration_target_connectivity",
                "Whether the target cluster's API was reachable on the most recent reconcile (1/0)",
            ),
            &["target"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            tool_health,
            connectivity,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.tool_health.clone()))?;
        registry.register(Box::new(self.connectivity.clone()))?;
        Ok(self)
    }

    pub fn reconcile_integration_failure(&self, integration: &Integration, e: &Error) {
        self.failures
            .with_label_values(&[integration.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn reconcile_target_failure(&self, target: &IntegrationTarget, e: &Error) {
        self.failures
            .with_label_values(&[target.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn set_tool_health(&self, cluster: &str, tool: ToolKind, healthy: bool) {
        self.tool_health
            .with_label_values(&[cluster, tool.to_string().as_str()])
            .set(i64::from(healthy))
    }

    pub fn set_connectivity(&self, target: &str, reachable: bool) {
        self.connectivity
            .with_label_values(&[target])
            .set(i64::from(reachable))
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}

use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Recorder, Reporter},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::v1::ToolKind;
use crate::health::{checker_for, Checker};
use crate::install::{installer_for, Installer};
use crate::registry::TargetRegistry;
use crate::util::metrics::Metrics;

pub mod integration_controller;
pub mod target_controller;

/// Installer lookup by tool kind, swappable in tests.
pub type InstallerFactory = Arc<dyn Fn(ToolKind) -> Box<dyn Installer> + Send + Sync>;

/// Checker lookup by tool kind.
pub type CheckerFactory = Arc<dyn Fn(ToolKind) -> Box<dyn Checker> + Send + Sync>;

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    /// Metrics handles, registered once at startup
    metrics: Metrics,
    /// Connection descriptors for the registered target clusters
    targets: Arc<TargetRegistry>,
}

impl Default for State {
    fn default() -> Self {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::default().register(&registry).unwrap();
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry,
            metrics,
            targets: Arc::new(TargetRegistry::default()),
        }
    }
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Registry getter, for the stale sweeper
    pub fn targets(&self) -> Arc<TargetRegistry> {
        self.targets.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            targets: self.targets.clone(),
            installers: Arc::new(installer_for),
            checkers: Arc::new(checker_for),
        })
    }
}

// Context for our reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for the management cluster
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Connection descriptors for the registered target clusters
    pub targets: Arc<TargetRegistry>,
    /// Installer lookup by tool kind
    pub installers: InstallerFactory,
    /// Checker lookup by tool kind
    pub checkers: CheckerFactory,
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "integration-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

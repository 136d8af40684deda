use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod};
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::api::v1::integration::Integration;
use crate::api::v1::ToolKind;
use crate::registry::ConnectionDescriptor;
use crate::util::errors::{Error, Result, StdError};

/// Per-call budget against the remote API. A slow cluster reads as
/// unhealthy, never as a hung reconcile.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Workload shape a tool ships as. Fluent Bit is the one daemonset in the
/// supported set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Workload {
    Deployment(&'static str),
    DaemonSet(&'static str),
}

impl Workload {
    pub fn name(&self) -> &'static str {
        match self {
            Workload::Deployment(name) | Workload::DaemonSet(name) => name,
        }
    }
}

/// What "healthy" means for one tool: the workload that must be up, the
/// companions that only warrant a warning, and the service whose endpoints
/// must be populated.
pub struct CheckProfile {
    pub critical: Workload,
    pub companions: &'static [Workload],
    pub service: Option<&'static str>,
}

pub fn check_profile(kind: ToolKind) -> &'static CheckProfile {
    match kind {
        ToolKind::Prometheus => &CheckProfile {
            critical: Workload::Deployment("prometheus-server"),
            companions: &[
                Workload::Deployment("prometheus-alertmanager"),
                Workload::Deployment("prometheus-kube-state-metrics"),
                Workload::Deployment("prometheus-prometheus-pushgateway"),
            ],
            service: Some("prometheus-server"),
        },
        ToolKind::Grafana => &CheckProfile {
            critical: Workload::Deployment("grafana"),
            companions: &[],
            service: Some("grafana"),
        },
        ToolKind::FluentBit => &CheckProfile {
            critical: Workload::DaemonSet("fluent-bit"),
            companions: &[],
            service: None,
        },
        ToolKind::CertManager => &CheckProfile {
            critical: Workload::Deployment("cert-manager"),
            companions: &[
                Workload::Deployment("cert-manager-webhook"),
                Workload::Deployment("cert-manager-cainjector"),
            ],
            service: Some("cert-manager-webhook"),
        },
    }
}

/// Namespace the tool is expected in: the per-Integration `namespace` config
/// key when set, the tool's conventional namespace otherwise.
pub fn effective_namespace(integration: &Integration) -> String {
    integration
        .spec
        .config
        .get("namespace")
        .cloned()
        .unwrap_or_else(|| integration.spec.tool.default_namespace().to_string())
}

/// Capability interface answering "is this tool healthy on that cluster".
#[async_trait]
pub trait Checker: Send + Sync {
    async fn check(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<()>;
}

/// Checker registry keyed by tool kind. The probe sequence is shared; the
/// profile carries everything tool-specific.
pub fn checker_for(kind: ToolKind) -> Box<dyn Checker> {
    Box::new(ToolChecker { kind })
}

pub struct ToolChecker {
    kind: ToolKind,
}

fn unhealthy(cluster: &str, message: String) -> Error {
    Error::StdError(StdError::HealthCheckError {
        cluster: cluster.to_string(),
        message,
    })
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

async fn bounded<T>(
    cluster: &str,
    what: &str,
    fut: impl std::future::Future<Output = kube::Result<T>> + Send,
) -> Result<Option<T>> {
    match tokio::time::timeout(CHECK_TIMEOUT, fut).await {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(e)) if is_not_found(&e) => Ok(None),
        Ok(Err(e)) => Err(unhealthy(cluster, format!("{what} lookup failed: {e}"))),
        Err(_) => Err(unhealthy(
            cluster,
            format!("{what} lookup timed out after {}s", CHECK_TIMEOUT.as_secs()),
        )),
    }
}

impl ToolChecker {
    /// Returns the number of ready replicas, or None when the workload does
    /// not exist.
    async fn workload_ready(
        client: &Client,
        cluster: &str,
        namespace: &str,
        workload: &Workload,
    ) -> Result<Option<i32>> {
        match workload {
            Workload::Deployment(name) => {
                let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
                let deployment =
                    bounded(cluster, &format!("deployment '{name}'"), api.get(name)).await?;
                Ok(deployment.map(|d| {
                    d.status
                        .and_then(|s| s.available_replicas)
                        .unwrap_or_default()
                }))
            }
            Workload::DaemonSet(name) => {
                let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
                let daemonset =
                    bounded(cluster, &format!("daemonset '{name}'"), api.get(name)).await?;
                Ok(daemonset.map(|d| d.status.map(|s| s.number_ready).unwrap_or_default()))
            }
        }
    }

    async fn check_service_endpoints(
        client: &Client,
        cluster: &str,
        namespace: &str,
        service: &str,
    ) -> Result<()> {
        let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
        let endpoints = bounded(cluster, &format!("endpoints '{service}'"), api.get(service))
            .await?
            .ok_or_else(|| {
                unhealthy(
                    cluster,
                    format!("service '{service}' has no endpoints object in namespace '{namespace}'"),
                )
            })?;

        let addresses = endpoints
            .subsets
            .unwrap_or_default()
            .into_iter()
            .flat_map(|s| s.addresses.unwrap_or_default())
            .count();
        if addresses == 0 {
            return Err(unhealthy(
                cluster,
                format!("service '{service}' has no ready endpoint addresses"),
            ));
        }
        Ok(())
    }

    async fn check_running_pod(client: &Client, cluster: &str, namespace: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let pods = bounded(cluster, "pod listing", api.list(&ListParams::default()))
            .await?
            .ok_or_else(|| unhealthy(cluster, format!("namespace '{namespace}' not listable")))?;

        let running = pods.items.iter().any(|pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|phase| phase == "Running")
                .unwrap_or(false)
        });
        if !running {
            return Err(unhealthy(
                cluster,
                format!("no running pods in namespace '{namespace}'"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Checker for ToolChecker {
    /// Ordered, fail-fast probe sequence. The first failing check names the
    /// cluster and what was missing; later checks never run.
    async fn check(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<()> {
        let cluster = descriptor.cluster.as_str();
        let client = descriptor.client()?;
        let namespace = effective_namespace(integration);
        let profile = check_profile(self.kind);

        let namespaces: Api<Namespace> = Api::all(client.clone());
        bounded(cluster, &format!("namespace '{namespace}'"), namespaces.get(&namespace))
            .await?
            .ok_or_else(|| {
                unhealthy(cluster, format!("namespace '{namespace}' does not exist"))
            })?;

        let critical = profile.critical.name();
        let ready = Self::workload_ready(&client, cluster, &namespace, &profile.critical)
            .await?
            .ok_or_else(|| {
                unhealthy(
                    cluster,
                    format!("workload '{critical}' not found in namespace '{namespace}'"),
                )
            })?;
        if ready < 1 {
            return Err(unhealthy(
                cluster,
                format!("workload '{critical}' has no ready replicas"),
            ));
        }

        for companion in profile.companions {
            match Self::workload_ready(&client, cluster, &namespace, companion).await {
                Ok(Some(ready)) if ready >= 1 => {}
                Ok(_) => warn!(
                    "Companion workload '{}' degraded on cluster '{}'",
                    companion.name(),
                    cluster
                ),
                Err(e) => warn!(
                    "Companion workload '{}' unreadable on cluster '{}': {}",
                    companion.name(),
                    cluster,
                    e
                ),
            }
        }

        if let Some(service) = profile.service {
            Self::check_service_endpoints(&client, cluster, &namespace, service).await?;
        }

        Self::check_running_pod(&client, cluster, &namespace).await?;

        debug!(
            "Tool '{}' healthy on cluster '{}' in namespace '{}'",
            self.kind, cluster, namespace
        );
        Ok(())
    }
}

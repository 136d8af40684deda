use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, time_schema, ToolKind};

pub static INTEGRATION_FINALIZER: &str = "integration.integrations.tooling.dev";

/// Generate the Kubernetes wrapper struct `Integration` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "Integration", group = "integrations.tooling.dev", version = "v1", namespaced)]
#[kube(status = "IntegrationStatus", shortname = "intg")]
#[serde(rename_all = "camelCase")]
pub struct IntegrationSpec {
    /// Which tool this Integration monitors (and optionally installs).
    #[serde(rename = "type")]
    pub tool: ToolKind,

    /// Disabled Integrations are short-circuited: no install, no health check.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Cluster names resolved through the target registry at reconcile time.
    /// Duplicates and empty strings are rejected during reconciliation.
    pub target_clusters: Vec<String>,

    /// Tool-specific configuration, e.g. a `namespace` override.
    #[serde(default)]
    pub config: BTreeMap<String, String>,

    pub auto_install: Option<AutoInstallSpec>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoInstallSpec {
    pub enabled: bool,
    /// Installation mechanism; only the Helm method is implemented.
    #[serde(default)]
    pub method: InstallMethod,
    pub helm: Option<HelmSpec>,
}

#[derive(Default, Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum InstallMethod {
    #[default]
    Helm,
}

/// Helm parameters. Anything left unset falls back to the per-tool default.
#[derive(Default, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmSpec {
    /// Chart repository URL.
    pub repository: Option<String>,
    /// Chart name within the repository.
    pub chart: Option<String>,
    pub version: Option<String>,
    pub release_name: Option<String>,
    /// Value overrides, merged on top of the tool defaults.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// The status object of `Integration`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStatus {
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    pub phase: Option<String>,
    pub message: Option<String>,
    #[schemars(schema_with = "time_schema")]
    pub last_reconcile_time: Option<Time>,
    pub observed_generation: Option<i64>,
    /// Per-cluster health breakdown from the most recent reconcile.
    #[serde(default)]
    pub clusters: Vec<ClusterStatus>,
}

/// Health of one tool on one target cluster.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster: String,
    pub healthy: bool,
    pub message: Option<String>,
}

impl Integration {
    /// True when the spec asks for the tool to be installed before checking.
    pub fn wants_auto_install(&self) -> bool {
        self.spec.auto_install.as_ref().is_some_and(|a| a.enabled)
    }

    pub fn helm_spec(&self) -> Option<&HelmSpec> {
        self.spec.auto_install.as_ref().and_then(|a| a.helm.as_ref())
    }
}

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::api::v1::{conditions_schema, time_schema};

pub static TARGET_FINALIZER: &str = "integrationtarget.integrations.tooling.dev";

/// Well-known key inside the credential secret holding serialized kubeconfig
/// material.
pub static TARGET_KUBECONFIG_KEY: &str = "kubeconfig";

/// Generate the Kubernetes wrapper struct `IntegrationTarget` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "IntegrationTarget",
    group = "integrations.tooling.dev",
    version = "v1",
    namespaced
)]
#[kube(status = "IntegrationTargetStatus", shortname = "intgtarget")]
#[serde(rename_all = "camelCase")]
pub struct IntegrationTargetSpec {
    /// Name of the secret holding the cluster's kubeconfig. Defaults to
    /// `<name>-kubeconfig` in the target's own namespace.
    pub secret_ref: Option<String>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// The status object of `IntegrationTarget`
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationTargetStatus {
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    /// True only when the registered connection has been round-trip-verified
    /// since the last reconcile.
    pub ready: bool,
    pub message: Option<String>,
    #[schemars(schema_with = "time_schema")]
    pub last_sync_time: Option<Time>,
}

impl IntegrationTarget {
    pub fn secret_name(&self) -> String {
        self.spec
            .secret_ref
            .clone()
            .unwrap_or_else(|| format!("{}-kubeconfig", self.name_any()))
    }
}

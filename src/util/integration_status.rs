use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::info;

use crate::api::v1::integration::{ClusterStatus, Integration};
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::set_status_condition;

pub const READY_CONDITION: &str = "Ready";

pub const STATUS_FIELD_MANAGER: &str = "integration-status-manager";

// Phase represents the high-level status of an Integration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IntegrationPhase {
    Initializing,
    // Transient sub-step during auto-install; never persisted as a terminal value
    Installing,
    Running,
    Failed,
    // Reserved; not reached by the monitoring path
    Succeeded,
}

impl fmt::Display for IntegrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IntegrationPhase::Initializing => write!(f, "Initializing"),
            IntegrationPhase::Installing => write!(f, "Installing"),
            IntegrationPhase::Running => write!(f, "Running"),
            IntegrationPhase::Failed => write!(f, "Failed"),
            IntegrationPhase::Succeeded => write!(f, "Succeeded"),
        }
    }
}

// Status reasons for the Ready condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusReason {
    ReconcileSucceeded,
    ReconcileFailed,
    IntegrationDisabled,
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusReason::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            StatusReason::ReconcileFailed => write!(f, "ReconcileFailed"),
            StatusReason::IntegrationDisabled => write!(f, "IntegrationDisabled"),
        }
    }
}

pub struct IntegrationStatusManager<'a> {
    integration: &'a Integration,
    client: kube::Client,
}

impl<'a> IntegrationStatusManager<'a> {
    pub fn new(client: &kube::Client, integration: &'a Integration) -> Result<Self> {
        Ok(Self {
            integration,
            client: client.clone(),
        })
    }

    /// Updates only the phase. The apply carries the current values of every
    /// other status field this manager owns; sending a partial apply would
    /// strip them for the duration of a slow install.
    pub async fn update_phase(&self, phase: IntegrationPhase) -> Result<()> {
        let name = self.integration.name_any();
        let namespace = self.integration.namespace().unwrap();
        let api: Api<Integration> = Api::namespaced(self.client.clone(), &namespace);

        let current = api
            .get(&name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        let mut status = current.status.clone().unwrap_or_default();
        status.phase = Some(phase.to_string());

        let patch = Patch::Apply(json!({
            "apiVersion": "integrations.tooling.dev/v1",
            "kind": "Integration",
            "metadata": {
                "name": name,
                "namespace": namespace
            },
            "status": status
        }));

        let patch_params = PatchParams::apply(STATUS_FIELD_MANAGER);
        api.patch_status(&name, &patch_params, &patch)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        info!("Updated integration {} phase to {}", name, phase);
        Ok(())
    }

    /// Writes the full outcome of one reconcile pass: phase, message, Ready
    /// condition, per-cluster breakdown, lastReconcileTime and
    /// observedGeneration.
    pub async fn publish(
        &self,
        phase: IntegrationPhase,
        reason: StatusReason,
        message: &str,
        clusters: Vec<ClusterStatus>,
    ) -> Result<()> {
        let name = self.integration.name_any();
        let namespace = self.integration.namespace().unwrap();
        let api: Api<Integration> = Api::namespaced(self.client.clone(), &namespace);

        let current = api
            .get(&name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        let current_conditions = current
            .status
            .as_ref()
            .map_or_else(Vec::new, |s| s.conditions.clone());

        let ready = phase == IntegrationPhase::Running;
        let new_condition = Condition {
            type_: READY_CONDITION.to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: current.metadata.generation,
        };
        let (new_conditions, _changed) = set_status_condition(&current_conditions, new_condition);

        let patch = Patch::Apply(json!({
            "apiVersion": "integrations.tooling.dev/v1",
            "kind": "Integration",
            "metadata": {
                "name": name,
                "namespace": namespace
            },
            "status": {
                "phase": phase.to_string(),
                "message": message,
                "conditions": new_conditions,
                "lastReconcileTime": Time(chrono::Utc::now()),
                "observedGeneration": current.metadata.generation,
                "clusters": clusters
            }
        }));

        let patch_params = PatchParams::apply(STATUS_FIELD_MANAGER);
        api.patch_status(&name, &patch_params, &patch)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        info!("Updated integration {} phase to {} ({})", name, phase, reason);
        Ok(())
    }
}

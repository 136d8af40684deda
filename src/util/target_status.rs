use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use std::fmt;
use serde_json::json;
use tracing::info;

use crate::api::v1::integrationtarget::IntegrationTarget;
use crate::util::errors::{Error, Result, StdError};
use crate::util::status::set_status_condition;

pub const TARGET_READY_CONDITION: &str = "Ready";

pub const STATUS_FIELD_MANAGER: &str = "integration-target-status-manager";

// Status reasons for the target Ready condition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetStatusReason {
    ReconcileSucceeded,
    SecretNotFound,
    InvalidSecret,
    ConnectionFailed,
}

impl fmt::Display for TargetStatusReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TargetStatusReason::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            TargetStatusReason::SecretNotFound => write!(f, "SecretNotFound"),
            TargetStatusReason::InvalidSecret => write!(f, "InvalidSecret"),
            TargetStatusReason::ConnectionFailed => write!(f, "ConnectionFailed"),
        }
    }
}

pub struct TargetStatusManager<'a> {
    target: &'a IntegrationTarget,
    client: kube::Client,
}

impl<'a> TargetStatusManager<'a> {
    pub fn new(client: &kube::Client, target: &'a IntegrationTarget) -> Result<Self> {
        Ok(Self {
            target,
            client: client.clone(),
        })
    }

    /// Writes readiness, message, the Ready condition and lastSyncTime in one
    /// status patch.
    pub async fn set_ready(
        &self,
        ready: bool,
        reason: TargetStatusReason,
        message: &str,
    ) -> Result<()> {
        let name = self.target.name_any();
        let namespace = self.target.namespace().unwrap();
        let api: Api<IntegrationTarget> = Api::namespaced(self.client.clone(), &namespace);

        let current = api
            .get(&name)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;
        let current_conditions = current
            .status
            .as_ref()
            .map_or_else(Vec::new, |s| s.conditions.clone());

        let new_condition = Condition {
            type_: TARGET_READY_CONDITION.to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: current.metadata.generation,
        };
        let (new_conditions, _changed) = set_status_condition(&current_conditions, new_condition);

        let patch = Patch::Apply(json!({
            "apiVersion": "integrations.tooling.dev/v1",
            "kind": "IntegrationTarget",
            "metadata": {
                "name": name,
                "namespace": namespace
            },
            "status": {
                "ready": ready,
                "message": message,
                "conditions": new_conditions,
                "lastSyncTime": Time(chrono::Utc::now())
            }
        }));

        let patch_params = PatchParams::apply(STATUS_FIELD_MANAGER);
        api.patch_status(&name, &patch_params, &patch)
            .await
            .map_err(|e| Error::StdError(StdError::KubeError(e)))?;

        info!("Updated target {} ready={} ({})", name, ready, reason);
        Ok(())
    }
}

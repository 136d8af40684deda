use crate::api::v1::integrationtarget::{
    IntegrationTarget, TARGET_FINALIZER, TARGET_KUBECONFIG_KEY,
};
use crate::controllers::Context;
use crate::util::target_status::{TargetStatusManager, TargetStatusReason};
use crate::util::{errors, errors::Result};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        finalizer::{finalizer, Event as Finalizer},
        watcher::Config,
    },
    Resource,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

/// Steady-state cadence once the connection is verified.
const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Shortened cadence while waiting on a missing secret or an unreachable
/// cluster.
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

impl IntegrationTarget {
    // Reconcile (for non-finalizer related changes)
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        let namespace = self.namespace().ok_or_else(|| {
            errors::Error::StdError(errors::StdError::MetadataMissing(format!(
                "target '{name}' has no namespace"
            )))
        })?;
        let status_manager = TargetStatusManager::new(&ctx.client, self)?;

        let secret = match self.load_credential_secret(&ctx.client, &namespace).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                ctx.metrics.set_connectivity(&name, false);
                status_manager
                    .set_ready(
                        false,
                        TargetStatusReason::SecretNotFound,
                        &format!("credential secret '{}' not found", self.secret_name()),
                    )
                    .await?;
                return Ok(Action::requeue(RETRY_INTERVAL));
            }
            Err(errors::Error::ErrorWithRequeue(e)) => {
                warn!("failed to read credential secret for target '{}': {}", name, e);
                return Ok(Action::requeue(e.duration));
            }
            Err(e) => return Err(e),
        };

        let material = match secret
            .data
            .as_ref()
            .and_then(|data| data.get(TARGET_KUBECONFIG_KEY))
        {
            Some(bytes) => bytes.0.clone(),
            None => {
                ctx.metrics.set_connectivity(&name, false);
                status_manager
                    .set_ready(
                        false,
                        TargetStatusReason::InvalidSecret,
                        &format!(
                            "secret '{}' has no '{}' key",
                            self.secret_name(),
                            TARGET_KUBECONFIG_KEY
                        ),
                    )
                    .await?;
                // A malformed secret will not fix itself; no point in a
                // tighter retry loop
                return Ok(Action::requeue(SYNC_INTERVAL));
            }
        };

        if let Err(e) = ctx.targets.add_or_update(&name, &namespace, &material).await {
            ctx.metrics.set_connectivity(&name, false);
            status_manager
                .set_ready(false, TargetStatusReason::InvalidSecret, &e.to_string())
                .await?;
            return Ok(Action::requeue(SYNC_INTERVAL));
        }

        match ctx.targets.verify_connectivity(&name, &namespace).await {
            Ok(()) => {
                ctx.metrics.set_connectivity(&name, true);
                status_manager
                    .set_ready(
                        true,
                        TargetStatusReason::ReconcileSucceeded,
                        "cluster API reachable",
                    )
                    .await?;
                Ok(Action::requeue(SYNC_INTERVAL))
            }
            Err(e) => {
                ctx.metrics.set_connectivity(&name, false);
                status_manager
                    .set_ready(false, TargetStatusReason::ConnectionFailed, &e.to_string())
                    .await?;
                Ok(Action::requeue(RETRY_INTERVAL))
            }
        }
    }

    /// Ok(None) when the secret does not exist; transport failures carry a
    /// retry hint.
    async fn load_credential_secret(
        &self,
        client: &Client,
        namespace: &str,
    ) -> Result<Option<Secret>> {
        let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
        secrets.get_opt(&self.secret_name()).await.map_err(|e| {
            errors::Error::ErrorWithRequeue(errors::ErrorWithRequeue::new(
                errors::StdError::KubeError(e),
                RETRY_INTERVAL,
            ))
        })
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        let name = self.name_any();
        if let Some(namespace) = self.namespace() {
            ctx.targets.remove(&name, &namespace);
        }
        ctx.metrics.set_connectivity(&name, false);

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{name}`")),
                    action: "Deleting".into(),
                    secondary: None,
                },
                &self.object_ref(&()),
            )
            .await
            .map_err(|e| errors::Error::StdError(errors::StdError::KubeError(e)))?;
        Ok(Action::await_change())
    }
}

pub async fn reconcile(target: Arc<IntegrationTarget>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("target");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = target.namespace().unwrap(); // target is namespace scoped
    let targets: Api<IntegrationTarget> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling IntegrationTarget \"{}\" in {}", target.name_any(), ns);
    finalizer(&targets, TARGET_FINALIZER, target.clone(), |event| async {
        match event {
            Finalizer::Apply(target) => target.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(target) => target.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| errors::Error::StdError(errors::StdError::FinalizerError(Box::new(e))))
}

fn error_policy(target: Arc<IntegrationTarget>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_target_failure(&target, error);
    Action::requeue(SYNC_INTERVAL)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: crate::controllers::State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let targets = Api::<IntegrationTarget>::all(client.clone());
    if let Err(e) = targets.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(targets, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

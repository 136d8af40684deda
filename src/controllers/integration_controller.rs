use crate::api::v1::integration::{ClusterStatus, Integration, INTEGRATION_FINALIZER};
use crate::api::v1::ToolKind;
use crate::controllers::Context;
use crate::util::integration_status::{IntegrationPhase, IntegrationStatusManager, StatusReason};
use crate::util::{errors, errors::Result};
use chrono::Utc;
use futures::StreamExt;
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

/// Fixed cadence: periodic health checks keep running even when nothing
/// changes on the resource.
const CHECK_INTERVAL: Duration = Duration::from_secs(30);

impl Integration {
    // Reconcile (for non-finalizer related changes)
    pub async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        let client = ctx.client.clone();
        let status_manager = IntegrationStatusManager::new(&client, self)?;

        if !self.spec.enabled {
            status_manager
                .publish(
                    IntegrationPhase::Failed,
                    StatusReason::IntegrationDisabled,
                    "integration is disabled",
                    Vec::new(),
                )
                .await?;
            // Nothing to watch over until the spec changes
            return Ok(Action::await_change());
        }

        if let Err(e) = validate_target_clusters(&self.spec.target_clusters) {
            status_manager
                .publish(
                    IntegrationPhase::Failed,
                    StatusReason::ReconcileFailed,
                    &e.to_string(),
                    Vec::new(),
                )
                .await?;
            return Err(e);
        }

        let phase_is_unset = self
            .status
            .as_ref()
            .map_or(true, |s| s.phase.is_none());
        if phase_is_unset {
            status_manager.update_phase(IntegrationPhase::Initializing).await?;
        }

        let namespace = self.namespace().ok_or_else(|| {
            errors::Error::StdError(errors::StdError::MetadataMissing(format!(
                "integration '{}' has no namespace",
                self.name_any()
            )))
        })?;

        // Each cluster is reconciled independently; a failure on one never
        // blocks the health check of another.
        let mut clusters = Vec::with_capacity(self.spec.target_clusters.len());
        for cluster in &self.spec.target_clusters {
            match self.reconcile_cluster(cluster, &namespace, &ctx).await {
                Ok(()) => {
                    ctx.metrics.set_tool_health(cluster, self.spec.tool, true);
                    clusters.push(ClusterStatus {
                        cluster: cluster.clone(),
                        healthy: true,
                        message: None,
                    });
                }
                Err(e) => {
                    warn!(
                        "Integration '{}' unhealthy on cluster '{}': {}",
                        self.name_any(),
                        cluster,
                        e
                    );
                    ctx.metrics.set_tool_health(cluster, self.spec.tool, false);
                    clusters.push(ClusterStatus {
                        cluster: cluster.clone(),
                        healthy: false,
                        message: Some(e.to_string()),
                    });
                }
            }
        }

        let (phase, reason, message) = aggregate_outcome(self.spec.tool, &clusters);
        status_manager.publish(phase, reason, &message, clusters).await?;

        Ok(Action::requeue(CHECK_INTERVAL))
    }

    /// Install-if-asked, then health-check, on one target cluster.
    async fn reconcile_cluster(&self, cluster: &str, namespace: &str, ctx: &Arc<Context>) -> Result<()> {
        let descriptor = ctx.targets.get(cluster, namespace)?;

        if self.wants_auto_install() {
            let installer = (ctx.installers)(self.spec.tool);
            if !installer.is_installed(&descriptor, self).await? {
                info!(
                    "Tool '{}' absent on cluster '{}', installing",
                    self.spec.tool, cluster
                );
                let status_manager = IntegrationStatusManager::new(&ctx.client, self)?;
                status_manager.update_phase(IntegrationPhase::Installing).await?;
                installer.install(&descriptor, self).await?;
            }
        }

        (ctx.checkers)(self.spec.tool).check(&descriptor, self).await
    }

    // Finalizer cleanup (the object was deleted, ensure nothing is orphaned)
    async fn cleanup(&self, ctx: Arc<Context>) -> Result<Action> {
        // The tool itself is left on the target clusters; only our own
        // observations are retracted.
        for cluster in &self.spec.target_clusters {
            ctx.metrics.set_tool_health(cluster, self.spec.tool, false);
        }

        let recorder = ctx.diagnostics.read().await.recorder(ctx.client.clone());
        recorder
            .publish(
                &Event {
                    type_: EventType::Normal,
                    reason: "DeleteRequested".into(),
                    note: Some(format!("Delete `{}`", self.name_any())),
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

/// Rejects empty lists, empty names, and duplicates before any cluster work
/// starts.
pub fn validate_target_clusters(clusters: &[String]) -> Result<()> {
    if clusters.is_empty() {
        return Err(errors::Error::StdError(errors::StdError::InvalidArgument(
            "targetClusters must name at least one cluster".to_string(),
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for cluster in clusters {
        if cluster.is_empty() {
            return Err(errors::Error::StdError(errors::StdError::InvalidArgument(
                "targetClusters must not contain empty names".to_string(),
            )));
        }
        if !seen.insert(cluster.as_str()) {
            return Err(errors::Error::StdError(errors::StdError::InvalidArgument(
                format!("targetClusters lists '{cluster}' more than once"),
            )));
        }
    }
    Ok(())
}

/// Best-effort aggregation: Running only when every cluster passed, Failed
/// with a message naming each failing cluster otherwise.
pub fn aggregate_outcome(
    tool: ToolKind,
    clusters: &[ClusterStatus],
) -> (IntegrationPhase, StatusReason, String) {
    let failing: Vec<&ClusterStatus> = clusters.iter().filter(|c| !c.healthy).collect();
    if failing.is_empty() {
        return (
            IntegrationPhase::Running,
            StatusReason::ReconcileSucceeded,
            format!("{} healthy on {} cluster(s)", tool, clusters.len()),
        );
    }

    let details: Vec<String> = failing
        .iter()
        .map(|c| {
            format!(
                "cluster {}: {}",
                c.cluster,
                c.message.as_deref().unwrap_or("unhealthy")
            )
        })
        .collect();
    (
        IntegrationPhase::Failed,
        StatusReason::ReconcileFailed,
        details.join("; "),
    )
}

pub async fn reconcile(integration: Arc<Integration>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure("integration");
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = integration.namespace().unwrap(); // integration is namespace scoped
    let integrations: Api<Integration> = Api::namespaced(ctx.client.clone(), &ns);

    info!("Reconciling Integration \"{}\" in {}", integration.name_any(), ns);
    finalizer(&integrations, INTEGRATION_FINALIZER, integration.clone(), |event| async {
        match event {
            Finalizer::Apply(integration) => integration.reconcile(ctx.clone()).await,
            Finalizer::Cleanup(integration) => integration.cleanup(ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| errors::Error::StdError(errors::StdError::FinalizerError(Box::new(e))))
}

fn error_policy(integration: Arc<Integration>, error: &errors::Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_integration_failure(&integration, error);
    Action::requeue(CHECK_INTERVAL)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: crate::controllers::State) {
    let client = Client::try_default().await.expect("failed to create kube Client");

    let integrations = Api::<Integration>::all(client.clone());
    if let Err(e) = integrations.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(integrations, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::integration::{AutoInstallSpec, InstallMethod, IntegrationSpec};
    use crate::controllers::{CheckerFactory, Diagnostics, InstallerFactory};
    use crate::fixtures::mock_client;
    use crate::health::Checker;
    use crate::install::Installer;
    use crate::registry::{ConnectionDescriptor, TargetRegistry};
    use crate::util::errors::{Error, InstallStep, StdError};
    use crate::util::metrics::Metrics;
    use async_trait::async_trait;
    use kube::api::ObjectMeta;
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    fn sample_kubeconfig(cluster: &str) -> String {
        format!(
            r#"
apiVersion: v1
kind: Config
clusters:
  - name: {cluster}
    cluster:
      server: https://{cluster}.example.dev:6443
contexts:
  - name: {cluster}
    context:
      cluster: {cluster}
      user: {cluster}-admin
current-context: {cluster}
users:
  - name: {cluster}-admin
    user:
      token: abcdef0123456789
"#
        )
    }

    fn integration(enabled: bool, clusters: &[&str]) -> Integration {
        Integration {
            metadata: ObjectMeta {
                name: Some("test-integration".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: IntegrationSpec {
                tool: ToolKind::Grafana,
                enabled,
                target_clusters: clusters.iter().map(|c| c.to_string()).collect(),
                config: Default::default(),
                auto_install: Some(AutoInstallSpec {
                    enabled: true,
                    method: InstallMethod::Helm,
                    helm: None,
                }),
            },
            status: None,
        }
    }

    /// Reports the tool present only on c2; install calls are recorded and
    /// always fail.
    struct FakeInstaller {
        installs: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Installer for FakeInstaller {
        async fn is_installed(
            &self,
            descriptor: &ConnectionDescriptor,
            _integration: &Integration,
        ) -> crate::util::errors::Result<bool> {
            Ok(descriptor.cluster == "c2")
        }

        async fn install(
            &self,
            descriptor: &ConnectionDescriptor,
            _integration: &Integration,
        ) -> crate::util::errors::Result<()> {
            self.installs.lock().unwrap().push(descriptor.cluster.clone());
            Err(Error::StdError(StdError::InstallError {
                step: InstallStep::InstallUpgrade,
                message: format!("install blew up on {}", descriptor.cluster),
            }))
        }

        async fn uninstall(
            &self,
            _descriptor: &ConnectionDescriptor,
            _integration: &Integration,
        ) -> crate::util::errors::Result<()> {
            Ok(())
        }
    }

    struct FakeChecker {
        checks: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Checker for FakeChecker {
        async fn check(
            &self,
            descriptor: &ConnectionDescriptor,
            _integration: &Integration,
        ) -> crate::util::errors::Result<()> {
            self.checks.lock().unwrap().push(descriptor.cluster.clone());
            Ok(())
        }
    }

    fn test_context(
        client: kube::Client,
        targets: Arc<TargetRegistry>,
        installs: Arc<Mutex<Vec<String>>>,
        checks: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Context> {
        let installers: InstallerFactory = Arc::new(move |_| {
            Box::new(FakeInstaller {
                installs: installs.clone(),
            }) as Box<dyn Installer>
        });
        let checkers: CheckerFactory = Arc::new(move |_| {
            Box::new(FakeChecker {
                checks: checks.clone(),
            }) as Box<dyn Checker>
        });
        Arc::new(Context {
            client,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default().register(&prometheus::Registry::default()).unwrap(),
            targets,
            installers,
            checkers,
        })
    }

    #[tokio::test]
    async fn disabled_integration_never_installs_or_checks() {
        let (client, api_server) = mock_client();
        let integration = integration(false, &["c1"]);
        let handle = api_server.serve_object(integration.clone());

        let installs = Arc::new(Mutex::new(Vec::new()));
        let checks = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(
            client,
            Arc::new(TargetRegistry::default()),
            installs.clone(),
            checks.clone(),
        );

        integration.reconcile(ctx.clone()).await.unwrap();
        drop(ctx);

        let patches = handle.await.unwrap();
        assert!(installs.lock().unwrap().is_empty());
        assert!(checks.lock().unwrap().is_empty());

        let status = &patches.last().unwrap()["status"];
        assert_eq!(status["phase"], "Failed");
        assert_eq!(status["message"], "integration is disabled");
    }

    #[tokio::test]
    async fn failed_install_skips_check_only_on_that_cluster() {
        let (client, api_server) = mock_client();
        let targets = Arc::new(TargetRegistry::default());
        targets
            .add_or_update("c1", "default", sample_kubeconfig("c1").as_bytes())
            .await
            .unwrap();
        targets
            .add_or_update("c2", "default", sample_kubeconfig("c2").as_bytes())
            .await
            .unwrap();

        let integration = integration(true, &["c1", "c2"]);
        let handle = api_server.serve_object(integration.clone());

        let installs = Arc::new(Mutex::new(Vec::new()));
        let checks = Arc::new(Mutex::new(Vec::new()));
        let ctx = test_context(client, targets, installs.clone(), checks.clone());

        integration.reconcile(ctx.clone()).await.unwrap();
        drop(ctx);

        let patches = handle.await.unwrap();
        // c1's install failed, so c1 was never health-checked; c2 was
        // already installed and got its check regardless
        assert_eq!(*installs.lock().unwrap(), vec!["c1".to_string()]);
        assert_eq!(*checks.lock().unwrap(), vec!["c2".to_string()]);

        let status = &patches.last().unwrap()["status"];
        assert_eq!(status["phase"], "Failed");
        let message = status["message"].as_str().unwrap();
        assert!(message.contains("cluster c1"));
        assert!(message.contains("install blew up on c1"));
        assert!(!message.contains("cluster c2"));
    }

    fn status(cluster: &str, healthy: bool, message: Option<&str>) -> ClusterStatus {
        ClusterStatus {
            cluster: cluster.to_string(),
            healthy,
            message: message.map(String::from),
        }
    }

    #[test]
    fn validation_rejects_empty_list() {
        let err = validate_target_clusters(&[]).unwrap_err();
        assert!(err.to_string().contains("at least one cluster"));
    }

    #[test]
    fn validation_rejects_blank_and_duplicate_names() {
        let blank = vec!["c1".to_string(), String::new()];
        assert!(validate_target_clusters(&blank).is_err());

        let duplicated = vec!["c1".to_string(), "c2".to_string(), "c1".to_string()];
        let err = validate_target_clusters(&duplicated).unwrap_err();
        assert!(err.to_string().contains("'c1'"));
    }

    #[test]
    fn validation_accepts_distinct_names() {
        let clusters = vec!["c1".to_string(), "c2".to_string()];
        assert!(validate_target_clusters(&clusters).is_ok());
    }

    #[test]
    fn all_healthy_aggregates_to_running() {
        let clusters = vec![status("c1", true, None), status("c2", true, None)];
        let (phase, reason, message) = aggregate_outcome(ToolKind::Prometheus, &clusters);
        assert_eq!(phase, IntegrationPhase::Running);
        assert_eq!(reason, StatusReason::ReconcileSucceeded);
        assert!(message.contains("2 cluster(s)"));
    }

    #[test]
    fn one_failure_fails_the_integration_but_names_only_failing_clusters() {
        let clusters = vec![
            status("c1", true, None),
            status("c2", false, Some("no running pods in namespace 'monitoring'")),
            status("c3", false, Some("namespace 'monitoring' does not exist")),
        ];
        let (phase, reason, message) = aggregate_outcome(ToolKind::Grafana, &clusters);
        assert_eq!(phase, IntegrationPhase::Failed);
        assert_eq!(reason, StatusReason::ReconcileFailed);
        assert!(message.contains("cluster c2: no running pods"));
        assert!(message.contains("cluster c3: namespace 'monitoring'"));
        assert!(!message.contains("c1"));
    }
}

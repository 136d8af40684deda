use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::api::v1::integration::Integration;
use crate::api::v1::ToolKind;
use crate::registry::ConnectionDescriptor;
use crate::util::errors::{Error, InstallStep, Result, StdError};

pub mod helm;

use helm::{CommandOutput, HelmCli, HelmCommand};

/// Upper bound for one install/upgrade invocation. Chart installs can be
/// slow; read-only steps stay on much shorter budgets.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(6 * 60);

const HELM_STEP_TIMEOUT: &str = "5m";

/// Compiled-in chart coordinates per tool.
pub struct ChartDefaults {
    pub repository: &'static str,
    pub chart: &'static str,
    pub release: &'static str,
    pub values: &'static [(&'static str, &'static str)],
}

pub fn chart_defaults(kind: ToolKind) -> &'static ChartDefaults {
    match kind {
        ToolKind::Prometheus => &ChartDefaults {
            repository: "https://prometheus-community.github.io/helm-charts",
            chart: "prometheus",
            release: "prometheus",
            values: &[],
        },
        ToolKind::Grafana => &ChartDefaults {
            repository: "https://grafana.github.io/helm-charts",
            chart: "grafana",
            release: "grafana",
            values: &[],
        },
        ToolKind::FluentBit => &ChartDefaults {
            repository: "https://fluent.github.io/helm-charts",
            chart: "fluent-bit",
            release: "fluent-bit",
            values: &[],
        },
        ToolKind::CertManager => &ChartDefaults {
            repository: "https://charts.jetstack.io",
            chart: "cert-manager",
            release: "cert-manager",
            values: &[("installCRDs", "true")],
        },
    }
}

/// Repository identifier derived from the repository URL, never from the
/// chart name. Repositories and charts are distinct namespaces in helm and
/// conflating them is a known failure mode.
pub fn repository_id(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

/// Fully resolved install parameters: explicit per-Integration configuration
/// layered over the per-tool defaults.
#[derive(Debug, Clone)]
pub struct EffectiveChart {
    pub repository: String,
    pub repo_id: String,
    pub chart: String,
    pub version: Option<String>,
    pub release: String,
    pub namespace: String,
    pub values: BTreeMap<String, String>,
}

impl EffectiveChart {
    pub fn chart_ref(&self) -> String {
        format!("{}/{}", self.repo_id, self.chart)
    }
}

pub fn resolve_chart(integration: &Integration) -> EffectiveChart {
    let defaults = chart_defaults(integration.spec.tool);
    let helm_spec = integration.helm_spec();

    let repository = helm_spec
        .and_then(|h| h.repository.clone())
        .unwrap_or_else(|| defaults.repository.to_string());
    let chart = helm_spec
        .and_then(|h| h.chart.clone())
        .unwrap_or_else(|| defaults.chart.to_string());
    let release = helm_spec
        .and_then(|h| h.release_name.clone())
        .unwrap_or_else(|| defaults.release.to_string());
    let version = helm_spec.and_then(|h| h.version.clone());

    let mut values: BTreeMap<String, String> = defaults
        .values
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    if let Some(helm_spec) = helm_spec {
        for (k, v) in &helm_spec.values {
            values.insert(k.clone(), v.clone());
        }
    }

    EffectiveChart {
        repo_id: repository_id(&repository),
        repository,
        chart,
        version,
        release,
        namespace: crate::health::effective_namespace(integration),
        values,
    }
}

/// Capability interface making a tool idempotently present/absent on one
/// cluster.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Side-effect free: lists releases in the expected namespace and
    /// matches by release name.
    async fn is_installed(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<bool>;

    /// Idempotent: absent release installs, present release upgrades in
    /// place. Never errors with "already exists".
    async fn install(&self, descriptor: &ConnectionDescriptor, integration: &Integration)
        -> Result<()>;

    /// Removing an absent release is not an error.
    async fn uninstall(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<()>;
}

/// Installer registry keyed by tool kind. All four tools currently share the
/// helm mechanism and differ only in their chart defaults.
pub fn installer_for(kind: ToolKind) -> Box<dyn Installer> {
    match kind {
        ToolKind::Prometheus | ToolKind::Grafana | ToolKind::FluentBit | ToolKind::CertManager => {
            Box::new(HelmInstaller::default())
        }
    }
}

pub struct HelmInstaller {
    cli: Arc<dyn HelmCli>,
}

impl Default for HelmInstaller {
    fn default() -> Self {
        Self {
            cli: Arc::new(HelmCommand),
        }
    }
}

impl HelmInstaller {
    pub fn with_cli(cli: Arc<dyn HelmCli>) -> Self {
        Self { cli }
    }

    async fn run_step(&self, step: InstallStep, args: Vec<String>) -> Result<CommandOutput> {
        debug!("helm {}", args.join(" "));
        let output = self.cli.run(&args).await.map_err(|e| {
            Error::StdError(StdError::InstallError {
                step,
                message: format!("failed to invoke helm: {e}"),
            })
        })?;
        if !output.success {
            return Err(Error::StdError(StdError::InstallError {
                step,
                message: output.stderr.trim().to_string(),
            }));
        }
        Ok(output)
    }

    /// Single-use credential file for the target cluster. The returned
    /// handle must stay alive until the install/upgrade completes; helm
    /// reads it lazily.
    fn materialize_kubeconfig(descriptor: &ConnectionDescriptor) -> Result<NamedTempFile> {
        let mut file = NamedTempFile::new().map_err(|e| {
            Error::StdError(StdError::InvalidCredential(format!(
                "could not materialize kubeconfig for cluster '{}': {e}",
                descriptor.cluster
            )))
        })?;
        file.write_all(descriptor.kubeconfig.as_bytes()).map_err(|e| {
            Error::StdError(StdError::InvalidCredential(format!(
                "could not write kubeconfig for cluster '{}': {e}",
                descriptor.cluster
            )))
        })?;
        Ok(file)
    }

    async fn list_releases(&self, namespace: &str, kubeconfig_path: &str) -> Result<Vec<String>> {
        let output = self
            .run_step(
                InstallStep::ReleaseList,
                vec![
                    "list".to_string(),
                    "--namespace".to_string(),
                    namespace.to_string(),
                    "--output".to_string(),
                    "json".to_string(),
                    "--kubeconfig".to_string(),
                    kubeconfig_path.to_string(),
                ],
            )
            .await?;

        let releases: Vec<serde_json::Value> =
            serde_json::from_str(output.stdout.trim()).map_err(|e| {
                Error::StdError(StdError::InstallError {
                    step: InstallStep::ReleaseList,
                    message: format!("unparseable release listing: {e}"),
                })
            })?;
        Ok(releases
            .iter()
            .filter_map(|r| r.get("name").and_then(|n| n.as_str()).map(String::from))
            .collect())
    }

    /// Registers the repository locally and fetches its index before any
    /// chart resolution. Resolving against an unindexed repository is a hard
    /// failure, not a retryable one, so the index fetch is synchronous and
    /// checked.
    async fn ensure_repository(&self, chart: &EffectiveChart) -> Result<()> {
        self.run_step(
            InstallStep::RepoAdd,
            vec![
                "repo".to_string(),
                "add".to_string(),
                chart.repo_id.clone(),
                chart.repository.clone(),
                "--force-update".to_string(),
            ],
        )
        .await?;

        self.run_step(
            InstallStep::RepoIndex,
            vec!["repo".to_string(), "update".to_string(), chart.repo_id.clone()],
        )
        .await?;
        Ok(())
    }

    async fn resolve_chart_ref(&self, chart: &EffectiveChart) -> Result<()> {
        let mut args = vec!["show".to_string(), "chart".to_string(), chart.chart_ref()];
        if let Some(version) = &chart.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        self.run_step(InstallStep::ChartResolve, args).await?;
        Ok(())
    }
}

#[async_trait]
impl Installer for HelmInstaller {
    async fn is_installed(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<bool> {
        let chart = resolve_chart(integration);
        let creds = Self::materialize_kubeconfig(descriptor)?;
        let releases = self
            .list_releases(&chart.namespace, &creds.path().to_string_lossy())
            .await?;
        Ok(releases.iter().any(|r| r == &chart.release))
    }

    async fn install(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<()> {
        let chart = resolve_chart(integration);
        // Dropped at function exit, after the install/upgrade has completed
        let creds = Self::materialize_kubeconfig(descriptor)?;
        let kubeconfig_path = creds.path().to_string_lossy().to_string();

        self.ensure_repository(&chart).await?;
        self.resolve_chart_ref(&chart).await?;

        let releases = self.list_releases(&chart.namespace, &kubeconfig_path).await?;
        let exists = releases.iter().any(|r| r == &chart.release);

        let mut args = if exists {
            info!(
                "Release '{}' exists on cluster '{}', upgrading in place",
                chart.release, descriptor.cluster
            );
            vec!["upgrade".to_string(), chart.release.clone(), chart.chart_ref()]
        } else {
            info!(
                "Installing release '{}' on cluster '{}'",
                chart.release, descriptor.cluster
            );
            vec![
                "install".to_string(),
                chart.release.clone(),
                chart.chart_ref(),
                "--create-namespace".to_string(),
            ]
        };
        args.push("--namespace".to_string());
        args.push(chart.namespace.clone());
        args.push("--kubeconfig".to_string());
        args.push(kubeconfig_path);
        args.push("--timeout".to_string());
        args.push(HELM_STEP_TIMEOUT.to_string());
        if let Some(version) = &chart.version {
            args.push("--version".to_string());
            args.push(version.clone());
        }
        for (k, v) in &chart.values {
            args.push("--set".to_string());
            args.push(format!("{k}={v}"));
        }

        match tokio::time::timeout(INSTALL_TIMEOUT, self.run_step(InstallStep::InstallUpgrade, args))
            .await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(Error::StdError(StdError::InstallError {
                step: InstallStep::InstallUpgrade,
                message: format!(
                    "install/upgrade of release '{}' did not finish within {}s",
                    chart.release,
                    INSTALL_TIMEOUT.as_secs()
                ),
            })),
        }
    }

    async fn uninstall(
        &self,
        descriptor: &ConnectionDescriptor,
        integration: &Integration,
    ) -> Result<()> {
        let chart = resolve_chart(integration);
        let creds = Self::materialize_kubeconfig(descriptor)?;
        let kubeconfig_path = creds.path().to_string_lossy().to_string();

        let releases = self.list_releases(&chart.namespace, &kubeconfig_path).await?;
        if !releases.iter().any(|r| r == &chart.release) {
            debug!(
                "Release '{}' absent on cluster '{}', nothing to uninstall",
                chart.release, descriptor.cluster
            );
            return Ok(());
        }

        self.run_step(
            InstallStep::Uninstall,
            vec![
                "uninstall".to_string(),
                chart.release.clone(),
                "--namespace".to_string(),
                chart.namespace,
                "--kubeconfig".to_string(),
                kubeconfig_path,
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::integration::{AutoInstallSpec, HelmSpec, InstallMethod, IntegrationSpec};
    use crate::registry::TargetRegistry;
    use kube::api::ObjectMeta;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const SAMPLE_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: c1
    cluster:
      server: https://c1.example.dev:6443
contexts:
  - name: c1
    context:
      cluster: c1
      user: c1-admin
current-context: c1
users:
  - name: c1-admin
    user:
      token: abcdef0123456789
"#;

    async fn descriptor() -> ConnectionDescriptor {
        let registry = TargetRegistry::default();
        registry
            .add_or_update("c1", "default", SAMPLE_KUBECONFIG.as_bytes())
            .await
            .unwrap();
        registry.get("c1", "default").unwrap()
    }

    fn integration(kind: ToolKind, helm: Option<HelmSpec>) -> Integration {
        Integration {
            metadata: ObjectMeta {
                name: Some("test-integration".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: IntegrationSpec {
                tool: kind,
                enabled: true,
                target_clusters: vec!["c1".to_string()],
                config: Default::default(),
                auto_install: Some(AutoInstallSpec {
                    enabled: true,
                    method: InstallMethod::Helm,
                    helm,
                }),
            },
            status: None,
        }
    }

    /// Scripted helm double: tracks releases, records every invocation, and
    /// can be told to fail one subcommand.
    struct FakeHelm {
        calls: Mutex<Vec<Vec<String>>>,
        releases: Mutex<HashSet<String>>,
        fail_on: Option<&'static str>,
    }

    impl FakeHelm {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                releases: Mutex::new(HashSet::new()),
                fail_on: None,
            }
        }

        fn failing_on(subcommand: &'static str) -> Self {
            Self {
                fail_on: Some(subcommand),
                ..Self::new()
            }
        }

        fn with_release(self, name: &str) -> Self {
            self.releases.lock().unwrap().insert(name.to_string());
            self
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        fn subcommands(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|c| {
                    if c[0] == "repo" {
                        format!("repo {}", c[1])
                    } else {
                        c[0].clone()
                    }
                })
                .collect()
        }
    }

    #[async_trait]
    impl HelmCli for FakeHelm {
        async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());

            let subcommand = if args[0] == "repo" {
                format!("repo {}", args[1])
            } else {
                args[0].clone()
            };
            if self.fail_on == Some(subcommand.as_str()) {
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("fake helm: {subcommand} exploded"),
                });
            }

            let stdout = match args[0].as_str() {
                "list" => {
                    let entries: Vec<serde_json::Value> = self
                        .releases
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|name| serde_json::json!({"name": name, "revision": "1"}))
                        .collect();
                    serde_json::to_string(&entries).unwrap()
                }
                "install" | "upgrade" => {
                    self.releases.lock().unwrap().insert(args[1].clone());
                    String::new()
                }
                "uninstall" => {
                    self.releases.lock().unwrap().remove(&args[1]);
                    String::new()
                }
                _ => String::new(),
            };
            Ok(CommandOutput {
                success: true,
                stdout,
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn repository_id_uses_last_path_segment() {
        assert_eq!(
            repository_id("https://prometheus-community.github.io/helm-charts"),
            "helm-charts"
        );
        assert_eq!(repository_id("https://charts.jetstack.io"), "charts.jetstack.io");
        assert_eq!(repository_id("https://charts.jetstack.io/"), "charts.jetstack.io");
    }

    #[test]
    fn resolve_chart_uses_tool_defaults() {
        let chart = resolve_chart(&integration(ToolKind::CertManager, None));
        assert_eq!(chart.repository, "https://charts.jetstack.io");
        assert_eq!(chart.chart, "cert-manager");
        assert_eq!(chart.release, "cert-manager");
        assert_eq!(chart.namespace, "cert-manager");
        assert_eq!(chart.values.get("installCRDs").unwrap(), "true");
        assert_eq!(chart.chart_ref(), "charts.jetstack.io/cert-manager");
    }

    #[test]
    fn resolve_chart_prefers_explicit_parameters() {
        let chart = resolve_chart(&integration(
            ToolKind::Prometheus,
            Some(HelmSpec {
                repository: Some("https://example.dev/mirror".to_string()),
                chart: Some("prom-fork".to_string()),
                version: Some("25.0.0".to_string()),
                release_name: Some("prom-main".to_string()),
                values: [("server.retention".to_string(), "30d".to_string())].into(),
            }),
        ));
        assert_eq!(chart.repo_id, "mirror");
        assert_eq!(chart.chart_ref(), "mirror/prom-fork");
        assert_eq!(chart.version.as_deref(), Some("25.0.0"));
        assert_eq!(chart.release, "prom-main");
        assert_eq!(chart.values.get("server.retention").unwrap(), "30d");
    }

    #[tokio::test]
    async fn is_installed_matches_by_release_name() {
        let descriptor = descriptor().await;
        let integration = integration(ToolKind::Grafana, None);

        let helm = Arc::new(FakeHelm::new().with_release("grafana"));
        let installer = HelmInstaller::with_cli(helm.clone());
        assert!(installer.is_installed(&descriptor, &integration).await.unwrap());
        // Only a read-only listing happened
        assert_eq!(helm.subcommands(), vec!["list"]);

        let helm = Arc::new(FakeHelm::new());
        let installer = HelmInstaller::with_cli(helm);
        assert!(!installer.is_installed(&descriptor, &integration).await.unwrap());
    }

    #[tokio::test]
    async fn install_takes_create_branch_when_release_absent() {
        let descriptor = descriptor().await;
        let integration = integration(ToolKind::Grafana, None);

        let helm = Arc::new(FakeHelm::new());
        let installer = HelmInstaller::with_cli(helm.clone());
        installer.install(&descriptor, &integration).await.unwrap();

        assert_eq!(
            helm.subcommands(),
            vec!["repo add", "repo update", "show", "list", "install"]
        );
        let install_call = helm.calls().into_iter().last().unwrap();
        assert_eq!(install_call[1], "grafana");
        assert!(install_call.contains(&"--create-namespace".to_string()));
        assert!(install_call.contains(&"monitoring".to_string()));
    }

    #[tokio::test]
    async fn install_is_idempotent_second_call_upgrades() {
        let descriptor = descriptor().await;
        let integration = integration(ToolKind::Grafana, None);

        let helm = Arc::new(FakeHelm::new());
        let installer = HelmInstaller::with_cli(helm.clone());
        installer.install(&descriptor, &integration).await.unwrap();
        installer.install(&descriptor, &integration).await.unwrap();

        let installs: Vec<_> = helm
            .calls()
            .into_iter()
            .filter(|c| c[0] == "install" || c[0] == "upgrade")
            .collect();
        // Exactly one install ever; the second pass upgrades in place
        assert_eq!(installs.len(), 2);
        assert_eq!(installs[0][0], "install");
        assert_eq!(installs[1][0], "upgrade");
        assert!(!installs[1].contains(&"--create-namespace".to_string()));
    }

    #[tokio::test]
    async fn failed_index_fetch_is_wrapped_with_step_name() {
        let descriptor = descriptor().await;
        let integration = integration(ToolKind::Prometheus, None);

        let helm = Arc::new(FakeHelm::failing_on("repo update"));
        let installer = HelmInstaller::with_cli(helm.clone());
        let err = installer.install(&descriptor, &integration).await.unwrap_err();

        assert!(err.to_string().contains("repository index fetch"));
        // Failure happened before any chart resolution or cluster mutation
        assert_eq!(helm.subcommands(), vec!["repo add", "repo update"]);
    }

    #[tokio::test]
    async fn uninstall_of_absent_release_is_a_no_op() {
        let descriptor = descriptor().await;
        let integration = integration(ToolKind::FluentBit, None);

        let helm = Arc::new(FakeHelm::new());
        let installer = HelmInstaller::with_cli(helm.clone());
        installer.uninstall(&descriptor, &integration).await.unwrap();
        assert_eq!(helm.subcommands(), vec!["list"]);

        let helm = Arc::new(FakeHelm::new().with_release("fluent-bit"));
        let installer = HelmInstaller::with_cli(helm.clone());
        installer.uninstall(&descriptor, &integration).await.unwrap();
        assert_eq!(helm.subcommands(), vec!["list", "uninstall"]);
    }
}

use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;

/// Captured output of one helm invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Seam over the helm binary so installer logic is testable without a
/// cluster or a helm installation.
#[async_trait]
pub trait HelmCli: Send + Sync {
    async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Real runner shelling out to `helm`.
#[derive(Default, Clone)]
pub struct HelmCommand;

#[async_trait]
impl HelmCli for HelmCommand {
    async fn run(&self, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new("helm").args(args).output().await?;
        Ok(CommandOutput::from(output))
    }
}

use std::os::unix::process::CommandExt;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::info;

use crate::config::SandboxConfig;
use crate::probe::LiveHost;
use crate::sandbox::EnvVar;
use crate::sandbox::guard;

/// Check the boundary, then replace this process with the agent.
/// Only returns on failure.
pub fn run(allow_ephemeral_workspace: bool, command: &[String]) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("entry requires a command to run"))?;

    let host = LiveHost::new(SandboxConfig::default().probe_timeout());
    let contract = guard::check_boundary(&host, allow_ephemeral_workspace)
        .context("Sandbox boundary check failed; not starting the agent")?;

    let memory = contract.path(EnvVar::MemoryDir);
    std::fs::create_dir_all(memory)
        .with_context(|| format!("Failed to create memory directory {}", memory.display()))?;

    info!(program = %program, ?args, "entry:exec agent");
    let err = Command::new(program).args(args).exec();
    Err(err).with_context(|| format!("Failed to exec {}", program))
}

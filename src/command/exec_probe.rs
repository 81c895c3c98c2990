use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

use crate::config::SandboxConfig;
use crate::sandbox::container;

/// Run the probe inside an already running container.
pub fn run(project: Option<&Path>, container_name: &str, json: bool) -> Result<()> {
    let config = SandboxConfig::load(project)?;
    let args = container::probe_exec_args(&config, container_name, json);
    debug!(args = ?args, "exec-probe");

    let status = Command::new(&args[0])
        .args(&args[1..])
        .status()
        .with_context(|| format!("Failed to run {}", args[0]))?;

    if !status.success() {
        bail!(
            "Probe could not run in container '{}' ({})",
            container_name,
            status
        );
    }
    Ok(())
}

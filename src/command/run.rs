use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use console::style;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::sandbox::container::{self, RunOptions};

/// Start the sandbox with `workspace` bound to the workspace root.
/// Returns the runtime's exit code.
pub fn run(
    project: Option<&Path>,
    workspace: &Path,
    name: Option<&str>,
    detach: bool,
) -> Result<i32> {
    let config = SandboxConfig::load(project)?;
    let workspace = container::prepare_workspace(workspace)?;

    let metadata = std::fs::metadata(&workspace)
        .with_context(|| format!("Failed to stat {}", workspace.display()))?;
    if metadata.uid() != config.uid() {
        warn!(
            owner = metadata.uid(),
            sandbox_uid = config.uid(),
            "run:workspace owner differs from sandbox identity"
        );
        println!(
            "{} {} is owned by uid {}, the sandbox runs as uid {}; the agent may not be able to write to it.",
            style("warning:").yellow().bold(),
            workspace.display(),
            metadata.uid(),
            config.uid()
        );
    }

    let opts = RunOptions {
        workspace: &workspace,
        name,
        detach,
    };
    let args = container::run_args(&config, &opts, |var| std::env::var_os(var).is_some())?;
    debug!(args = ?args, "run:container");

    let status = Command::new(&args[0])
        .args(&args[1..])
        .status()
        .with_context(|| format!("Failed to run {}", args[0]))?;

    Ok(status.code().unwrap_or(1))
}

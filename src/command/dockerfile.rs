use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;

use crate::config::SandboxConfig;
use crate::sandbox::{ImagePlan, dockerfile};

pub fn run(project: Option<&Path>, output: Option<&Path>, force: bool) -> Result<()> {
    let config = SandboxConfig::load(project)?;
    let plan = ImagePlan::from_config(&config).context("Invalid sandbox build plan")?;
    let rendered = dockerfile::render(&plan).context("Sandbox build plan fails validation")?;

    let Some(path) = output else {
        print!("{rendered}");
        return Ok(());
    };

    if path.exists() && !force {
        bail!("{} already exists. Use --force to overwrite.", path.display());
    }
    std::fs::write(path, rendered)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("✓ Created {}", style(path.display()).bold());
    println!();
    println!(
        "The image also needs the lethe-sandbox binary as the '{}' build context.",
        crate::sandbox::pipeline::GUARD_CONTEXT
    );
    println!(
        "Use {} to have it staged for you.",
        style("lethe-sandbox build").dim()
    );
    Ok(())
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;

use crate::config::SandboxConfig;
use crate::sandbox;

pub fn run(project: Option<&Path>, context: Option<&Path>, force: bool) -> Result<()> {
    let config = SandboxConfig::load(project)?;

    let context_dir: PathBuf = match context.or(project) {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };

    let image_name = config.resolved_image();
    println!("Building sandbox image '{}'...\n", image_name);

    let image_id = sandbox::build_image(&config, &context_dir, force)?;

    println!("\nSandbox image built successfully!");
    println!("  {} {}", style("tag:").bold(), image_name);
    println!("  {} {}", style("id: ").bold(), image_id);
    println!();
    println!(
        "Start it with: {}",
        style("lethe-sandbox run --workspace <DIR>").dim()
    );

    Ok(())
}

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::config::SandboxConfig;
use crate::sandbox::{ImagePlan, ImageState};

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "STEP")]
    name: &'static str,
    #[tabled(rename = "RUNS AS")]
    user: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    plan: &'a ImagePlan,
    image: &'a ImageState,
}

/// Rows for each step, tagged with the identity the step executes under.
fn step_rows(plan: &ImagePlan) -> Result<Vec<StepRow>> {
    let mut state = ImageState::default();
    let mut rows = Vec::with_capacity(plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        let user = state.privilege.user_name().to_string();
        state = step
            .apply(state)
            .with_context(|| format!("Step {} ({}) is invalid", i + 1, step.name()))?;
        rows.push(StepRow {
            index: i + 1,
            name: step.name(),
            user,
            detail: step.summary(),
        });
    }
    Ok(rows)
}

pub fn run(project: Option<&Path>, json: bool) -> Result<()> {
    let config = SandboxConfig::load(project)?;
    let plan = ImagePlan::from_config(&config).context("Invalid sandbox build plan")?;
    let image = plan.finalize().context("Sandbox build plan fails validation")?;

    if json {
        let output = PlanOutput {
            plan: &plan,
            image: &image,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let mut table = Table::new(step_rows(&plan)?);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");
    println!();

    let identity = &plan.identity;
    println!(
        "{} {} (uid {}, gid {})",
        style("Default identity:").bold(),
        identity.name(),
        identity.uid(),
        identity.gid()
    );
    if let Some(workdir) = &image.workdir {
        println!("{} {}", style("Working directory:").bold(), workdir.display());
    }
    if let Some(entry) = &image.entry {
        println!("{} {}", style("Entry:").bold(), entry.join(" "));
    }
    println!("{}", style("Owned by the agent:").bold());
    for root in plan.layout.owned_roots() {
        println!("  {} (recursive)", root.display());
    }

    Ok(())
}

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::config::SandboxConfig;
use crate::sandbox::{EnvContract, EnvVar};

#[derive(Tabled, Serialize)]
struct EnvRow {
    #[tabled(rename = "VARIABLE")]
    name: &'static str,
    #[tabled(rename = "VALUE")]
    value: String,
    #[tabled(rename = "MEANING")]
    meaning: &'static str,
    #[tabled(rename = "BACKING")]
    backing: &'static str,
}

fn rows(contract: &EnvContract) -> Vec<EnvRow> {
    EnvVar::ALL
        .into_iter()
        .map(|var| EnvRow {
            name: var.name(),
            value: contract.path(var).display().to_string(),
            meaning: var.meaning(),
            backing: var.backing(),
        })
        .collect()
}

pub fn run(project: Option<&Path>, json: bool) -> Result<()> {
    let config = SandboxConfig::load(project)?;
    let contract = config.layout().context("Invalid sandbox layout")?.contract();
    let rows = rows(&contract);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..4), Padding::new(0, 1, 0, 0));
    println!("{table}");

    let passthrough = config.env_passthrough();
    if !passthrough.is_empty() {
        println!();
        println!(
            "{} {}",
            style("Forwarded from the host when set:").bold(),
            passthrough.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::layout::Layout;

    #[test]
    fn test_rows_cover_contract_in_order() {
        let rows = rows(&Layout::default().contract());
        let names: Vec<_> = rows.iter().map(|r| r.name).collect();
        assert_eq!(names, ["WORKSPACE_DIR", "MEMORY_DIR", "LETHE_CONFIG_DIR"]);
        assert_eq!(rows[1].value, "/workspace/data/memory");
    }
}

use crate::command;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "lethe-sandbox")]
#[command(about = "Build, run and inspect the safe-mode sandbox for the lethe agent")]
#[command(after_help = "Run 'lethe-sandbox probe' inside a container to check its boundary.")]
struct Cli {
    /// Directory holding lethe-sandbox.yaml and the build context (defaults to the current directory)
    #[arg(short = 'C', long, global = true, value_name = "DIR")]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ordered build steps and the identity each runs as
    Plan {
        /// Print the plan and the resulting image state as JSON
        #[arg(long)]
        json: bool,
    },

    /// Render the sandbox Dockerfile
    Dockerfile {
        /// Write to a file instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite the output file if it exists
        #[arg(long)]
        force: bool,
    },

    /// Validate the plan, build the image untagged, then tag it
    Build {
        /// Build context with pyproject.toml, uv.lock and the application sources
        #[arg(long, value_name = "DIR")]
        context: Option<PathBuf>,

        /// Build even on a non-Linux host (the copied binary will not run in the image)
        #[arg(long)]
        force: bool,
    },

    /// Start a sandbox container with a host directory as its workspace
    Run {
        /// Host directory bound to the workspace root (created if missing)
        #[arg(short, long, value_name = "DIR")]
        workspace: PathBuf,

        /// Container name
        #[arg(long)]
        name: Option<String>,

        /// Run in the background
        #[arg(short, long)]
        detach: bool,
    },

    /// Check the sandbox boundary and exec the agent (image entrypoint)
    Entry {
        /// Start even if the workspace is not a mount point; its contents are lost with the container
        #[arg(long)]
        allow_ephemeral_workspace: bool,

        /// Agent command and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Report what the current process can and cannot do inside the sandbox
    Probe {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Seconds to wait for each external command
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Run the probe inside a running sandbox container
    ExecProbe {
        /// Container name or id
        container: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the environment contract the sandbox sets
    Env {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let project = cli.project.as_deref();

    match cli.command {
        Commands::Plan { json } => command::plan::run(project, json),
        Commands::Dockerfile { output, force } => {
            command::dockerfile::run(project, output.as_deref(), force)
        }
        Commands::Build { context, force } => {
            command::build::run(project, context.as_deref(), force)
        }
        Commands::Run {
            workspace,
            name,
            detach,
        } => {
            let code = command::run::run(project, &workspace, name.as_deref(), detach)?;
            std::process::exit(code);
        }
        Commands::Entry {
            allow_ephemeral_workspace,
            command,
        } => command::entry::run(allow_ephemeral_workspace, &command),
        Commands::Probe { json, timeout } => command::probe::run(json, timeout),
        Commands::ExecProbe { container, json } => {
            command::exec_probe::run(project, &container, json)
        }
        Commands::Env { json } => command::env::run(project, json),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_entry_takes_trailing_command() {
        let cli = Cli::try_parse_from([
            "lethe-sandbox",
            "entry",
            "--allow-ephemeral-workspace",
            "--",
            "/app/.venv/bin/lethe",
            "--verbose",
        ])
        .unwrap();
        match cli.command {
            Commands::Entry {
                allow_ephemeral_workspace,
                command,
            } => {
                assert!(allow_ephemeral_workspace);
                assert_eq!(command, ["/app/.venv/bin/lethe", "--verbose"]);
            }
            _ => panic!("expected entry"),
        }
    }

    #[test]
    fn test_run_requires_workspace() {
        assert!(Cli::try_parse_from(["lethe-sandbox", "run"]).is_err());
    }

    #[test]
    fn test_global_project_flag() {
        let cli = Cli::try_parse_from(["lethe-sandbox", "plan", "-C", "/src/lethe", "--json"]).unwrap();
        assert_eq!(cli.project, Some(PathBuf::from("/src/lethe")));
    }
}

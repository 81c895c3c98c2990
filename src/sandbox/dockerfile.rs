//! Render an [`ImagePlan`] as a Dockerfile.

use std::fmt::Write as _;

use super::pipeline::{BROWSERS_PATH_VAR, BuildError, ImagePlan, Step};

const HEADER: &str = "# syntax=docker/dockerfile:1
# Generated by lethe-sandbox. Do not edit; change lethe-sandbox.yaml instead.
#
# Safe-mode image: the agent runs as an unprivileged user and can only write
# to the workspace and application roots.
";

/// Render the plan. The plan is finalized first, so a Dockerfile is only ever
/// produced for an image that satisfies the sandbox invariants.
pub fn render(plan: &ImagePlan) -> Result<String, BuildError> {
    plan.finalize()?;

    let mut out = String::from(HEADER);
    for step in &plan.steps {
        let body = render_step(step);
        if body.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\n# {}", step.name());
        out.push_str(&body);
    }
    Ok(out)
}

fn render_step(step: &Step) -> String {
    match step {
        Step::Base { image } => format!("FROM {}\n", image),
        Step::SystemPackages { packages } => {
            if packages.is_empty() {
                return String::new();
            }
            let mut s = String::from(
                "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends \\\n",
            );
            for pkg in packages {
                let _ = writeln!(s, "       {} \\", pkg);
            }
            s.push_str("    && rm -rf /var/lib/apt/lists/*\n");
            s
        }
        Step::InstallResolver { image } => format!("COPY --from={} /uv /uvx /bin/\n", image),
        Step::GlobalTools {
            packages,
            setup,
            browsers_path,
        } => {
            let mut cmds: Vec<String> = Vec::new();
            if !packages.is_empty() {
                cmds.push(format!("npm install -g {}", packages.join(" ")));
            }
            cmds.extend(setup.iter().cloned());
            if cmds.is_empty() {
                return String::new();
            }
            format!(
                "ENV {}={}\nRUN {}\n",
                BROWSERS_PATH_VAR,
                browsers_path.display(),
                cmds.join(" \\\n    && ")
            )
        }
        Step::InstallGuard { context, path } => format!(
            "COPY --from={} --chmod=0755 lethe-sandbox {}\n",
            context,
            path.display()
        ),
        Step::Dependencies(spec) => format!(
            "WORKDIR {}\nCOPY {} {} ./\nRUN {}\n",
            spec.app_root.display(),
            spec.project_file,
            spec.lock_file,
            spec.sync_command(false)
        ),
        Step::CopyApplication {
            dependencies,
            sources,
            config_source,
            config_root,
        } => {
            let mut s = String::new();
            for src in sources {
                let _ = writeln!(
                    s,
                    "COPY {} {}/{}",
                    src,
                    dependencies.app_root.display(),
                    src
                );
            }
            let _ = writeln!(s, "COPY {} {}", config_source, config_root.display());
            let _ = writeln!(s, "RUN {}", dependencies.sync_command(true));
            s
        }
        Step::ProvisionDirs { dirs } => {
            let dirs: Vec<_> = dirs.iter().map(|d| d.display().to_string()).collect();
            format!("RUN mkdir -p {}\n", dirs.join(" "))
        }
        Step::CreateIdentity(id) => format!(
            "RUN groupadd --gid {gid} {name} \\\n    && useradd --uid {uid} --gid {gid} --create-home --shell /bin/bash {name}\n",
            gid = id.gid(),
            uid = id.uid(),
            name = id.name()
        ),
        Step::AssignOwnership {
            user,
            paths,
            recursive,
        } => {
            let paths: Vec<_> = paths.iter().map(|p| p.display().to_string()).collect();
            format!(
                "RUN chown {}{}:{} {}\n",
                if *recursive { "-R " } else { "" },
                user,
                user,
                paths.join(" ")
            )
        }
        // Numeric so runtimes enforcing non-root can verify it without /etc/passwd.
        Step::SetIdentity(id) => format!("USER {}:{}\n", id.uid(), id.gid()),
        Step::Environment(contract) => {
            let vars: Vec<_> = contract
                .entries()
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("ENV {}\n", vars.join(" \\\n    "))
        }
        Step::Entry { workdir, command } => {
            // serde_json produces the exec-form array Docker expects.
            let cmd = serde_json::to_string(command).unwrap_or_else(|_| "[]".to_string());
            format!("WORKDIR {}\nCMD {}\n", workdir.display(), cmd)
        }
    }
}

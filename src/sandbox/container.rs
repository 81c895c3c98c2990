//! Docker/Podman side of the sandbox: building the image and composing the
//! `run` and `exec` invocations.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use super::dockerfile;
use super::pipeline::{GUARD_CONTEXT, GUARD_PATH, ImagePlan, Step};
use crate::cmd::Cmd;
use crate::config::SandboxConfig;
use crate::spinner;

/// Name of the binary inside the side build context.
const GUARD_BINARY: &str = "lethe-sandbox";

/// Files and directories the plan copies out of the build context.
pub fn required_context_entries(plan: &ImagePlan) -> Vec<String> {
    let mut entries = Vec::new();
    for step in &plan.steps {
        match step {
            Step::Dependencies(spec) => {
                entries.push(spec.project_file.clone());
                entries.push(spec.lock_file.clone());
            }
            Step::CopyApplication {
                sources,
                config_source,
                ..
            } => {
                entries.extend(sources.iter().cloned());
                entries.push(config_source.clone());
            }
            _ => {}
        }
    }
    entries
}

/// Fail before invoking the runtime if the context lacks anything the plan copies.
pub fn check_context(plan: &ImagePlan, context_dir: &Path) -> Result<()> {
    if !context_dir.is_dir() {
        bail!("Build context {} is not a directory", context_dir.display());
    }
    let missing: Vec<String> = required_context_entries(plan)
        .into_iter()
        .filter(|entry| !context_dir.join(entry).exists())
        .collect();
    if !missing.is_empty() {
        bail!(
            "Build context {} is missing: {}",
            context_dir.display(),
            missing.join(", ")
        );
    }
    Ok(())
}

/// Arguments for an untagged build. The image is only tagged after the
/// runtime reports success, so a failed build never promotes a tag.
pub fn build_args(
    config: &SandboxConfig,
    dockerfile: &Path,
    iidfile: &Path,
    guard_dir: &Path,
    context_dir: &Path,
) -> Vec<String> {
    vec![
        config.runtime().binary().to_string(),
        "build".to_string(),
        "--file".to_string(),
        dockerfile.display().to_string(),
        "--iidfile".to_string(),
        iidfile.display().to_string(),
        "--build-context".to_string(),
        format!("{}={}", GUARD_CONTEXT, guard_dir.display()),
        context_dir.display().to_string(),
    ]
}

/// Build the sandbox image from `context_dir` and tag it.
///
/// Renders the Dockerfile from the validated plan, stages it together with a
/// copy of the current executable (the in-image entry guard and probe) in a
/// temporary side context, builds untagged, then applies the tag.
///
/// # Arguments
/// * `config` - Sandbox configuration
/// * `context_dir` - Directory holding the application sources
/// * `force` - If true, skip the OS compatibility check
///
/// Returns the image id.
pub fn build_image(config: &SandboxConfig, context_dir: &Path, force: bool) -> Result<String> {
    // Linux binaries are copied into the image; a host binary from another OS won't run there.
    if !cfg!(target_os = "linux") && !force {
        bail!(
            "Cannot build sandbox image on non-Linux OS.\n\
             The lethe-sandbox binary copied into the image would be incompatible with the Linux container.\n\n\
             Options:\n\
             1. Build on a Linux machine\n\
             2. Use --force to build anyway (the entry guard will not run)"
        );
    }

    let plan = ImagePlan::from_config(config).context("Invalid sandbox build plan")?;
    let rendered = dockerfile::render(&plan).context("Invalid sandbox build plan")?;
    check_context(&plan, context_dir)?;

    let runtime = config.runtime().binary();
    let image_name = config.resolved_image();

    let temp_dir = tempfile::Builder::new()
        .prefix("lethe-sandbox-build-")
        .tempdir()
        .context("Failed to create temporary build directory")?;
    let staging = temp_dir.path();

    let guard_dir = staging.join(GUARD_CONTEXT);
    std::fs::create_dir(&guard_dir).context("Failed to create guard build context")?;
    let current_exe =
        std::env::current_exe().context("Failed to locate current lethe-sandbox executable")?;
    std::fs::copy(&current_exe, guard_dir.join(GUARD_BINARY))
        .context("Failed to copy lethe-sandbox binary to build context")?;

    let dockerfile_path = staging.join("Dockerfile");
    std::fs::write(&dockerfile_path, rendered).context("Failed to write Dockerfile")?;
    let iidfile = staging.join("image.id");

    let args = build_args(config, &dockerfile_path, &iidfile, &guard_dir, context_dir);
    debug!(args = ?args, "container:build");
    info!(image = image_name, runtime, context = %context_dir.display(), "container:build start");

    let image_id = build_then_tag(
        image_name,
        &iidfile,
        || {
            let mut cmd = Command::new(&args[0]);
            cmd.args(&args[1..]);
            spinner::with_streaming_command(
                &format!("Building image '{}' using {}", image_name, runtime),
                cmd,
            )
            .with_context(|| format!("{} build failed", runtime))
        },
        |id| {
            Cmd::new(runtime)
                .args(&["tag", id, image_name])
                .run()
                .map(|_| ())
        },
    )?;
    info!(image = image_name, id = %image_id, "container:build tagged");

    Ok(image_id)
}

/// Run `build`, read the id it wrote to `iidfile`, then `tag` that id. The tag
/// is only applied once the build succeeded with a non-empty id.
fn build_then_tag(
    image_name: &str,
    iidfile: &Path,
    build: impl FnOnce() -> Result<()>,
    tag: impl FnOnce(&str) -> Result<()>,
) -> Result<String> {
    build().with_context(|| format!("Image '{}' was not tagged", image_name))?;

    let image_id = std::fs::read_to_string(iidfile)
        .context("Build finished without writing an image id")?
        .trim()
        .to_string();
    if image_id.is_empty() {
        bail!("Build finished with an empty image id; image '{}' was not tagged", image_name);
    }

    tag(&image_id).with_context(|| format!("Failed to tag image {} as {}", image_id, image_name))?;
    Ok(image_id)
}

/// Options for starting a sandbox container.
pub struct RunOptions<'a> {
    /// Host directory bound to the workspace root. Must be absolute.
    pub workspace: &'a Path,
    pub name: Option<&'a str>,
    pub detach: bool,
}

/// Compose `<runtime> run ...` for the sandbox image.
///
/// No `--user` is passed: the image's default identity applies. Passthrough
/// variables are only forwarded when `is_set` reports them present.
pub fn run_args(
    config: &SandboxConfig,
    opts: &RunOptions<'_>,
    is_set: impl Fn(&str) -> bool,
) -> Result<Vec<String>> {
    if !opts.workspace.is_absolute() {
        bail!(
            "Workspace path must be absolute, got {}",
            opts.workspace.display()
        );
    }
    let layout = config.layout().context("Invalid sandbox layout")?;

    let mut args = vec![
        config.runtime().binary().to_string(),
        "run".to_string(),
        "--rm".to_string(),
        if opts.detach { "-d" } else { "-it" }.to_string(),
    ];

    if let Some(name) = opts.name {
        args.push("--name".to_string());
        args.push(name.to_string());
    }

    args.push("--mount".to_string());
    args.push(format!(
        "type=bind,source={},target={}",
        opts.workspace.display(),
        layout.workspace_root().display()
    ));

    if config.hardening() {
        args.extend(
            ["--security-opt", "no-new-privileges", "--cap-drop", "ALL"]
                .into_iter()
                .map(str::to_string),
        );
    }

    for var in config.env_passthrough() {
        if is_set(var) {
            args.push("--env".to_string());
            args.push(var.to_string());
        }
    }

    args.push(config.resolved_image().to_string());
    Ok(args)
}

/// `<runtime> exec <container> lethe-sandbox probe ...`
pub fn probe_exec_args(config: &SandboxConfig, container: &str, json: bool) -> Vec<String> {
    let mut args = vec![
        config.runtime().binary().to_string(),
        "exec".to_string(),
        container.to_string(),
        GUARD_PATH.to_string(),
        "probe".to_string(),
        "--timeout".to_string(),
        config.probe_timeout().as_secs().to_string(),
    ];
    if json {
        args.push("--json".to_string());
    }
    args
}

/// Resolve a host workspace directory to an absolute path, creating it if needed.
pub fn prepare_workspace(dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create workspace {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve workspace {}", dir.display()))
}

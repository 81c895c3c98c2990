//! Ordered build pipeline for the sandbox image.
//!
//! Each [`Step`] is a pure transformation over [`ImageState`]: it takes the
//! state left by the previous step and returns the next one, or a
//! [`BuildError`] that aborts the whole build. [`ImagePlan::finalize`] folds
//! the steps and then checks the invariants a runnable image must satisfy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::contract::{EnvContract, EnvVar};
use super::identity::{Identity, IdentityError, Privilege, ROOT_USER};
use super::layout::{Layout, LayoutError};
use crate::config::SandboxConfig;

/// Where the entry guard binary is installed inside the image.
pub const GUARD_PATH: &str = "/usr/local/bin/lethe-sandbox";

/// Named build context the guard binary is copied from.
pub const GUARD_CONTEXT: &str = "sandbox-bin";

/// Where the browser CLI looks for its browsers, at build and at run time.
pub const BROWSERS_PATH_VAR: &str = "PLAYWRIGHT_BROWSERS_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("pipeline has no base image step")]
    MissingBase,

    #[error("base image must be the first step and appear only once")]
    BaseNotFirst,

    #[error("invalid package spec '{spec}': {reason}")]
    InvalidPackage { spec: String, reason: &'static str },

    #[error("package '{name}' pinned twice ({first} vs {second})")]
    ConflictingPackage {
        name: String,
        first: String,
        second: String,
    },

    #[error("invalid command '{0}': must be a single non-empty line")]
    InvalidCommand(String),

    #[error("path {0} cannot be used in a Dockerfile (whitespace or quotes)")]
    UnsafePath(PathBuf),

    #[error("step '{step}' needs root but the image already runs as '{user}'")]
    RequiresPrivilege { step: &'static str, user: String },

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error("identity '{0}' was never created")]
    UnknownIdentity(String),

    #[error("identity '{0}' created twice")]
    DuplicateIdentity(String),

    #[error("path {0} does not exist in the image")]
    UnknownPath(PathBuf),

    #[error("dependency resolver is not installed")]
    ResolverMissing,

    #[error("dependencies must be materialized before the application is copied")]
    DependenciesMissing,

    #[error("entry command set while the image still runs as root")]
    EntryBeforeDowngrade,

    #[error("entry command set twice")]
    DuplicateEntry,

    #[error("entry command is empty")]
    EmptyEntry,

    #[error("image has no entry command")]
    MissingEntry,

    #[error("image never switches away from root")]
    NotDowngraded,

    #[error("{path} is owned by '{owner}', expected '{expected}'")]
    OwnershipMissing {
        path: PathBuf,
        owner: String,
        expected: String,
    },

    #[error("{var} is {found:?} in the image, expected '{expected}'")]
    ContractMismatch {
        var: &'static str,
        expected: String,
        found: Option<String>,
    },
}

/// An apt package, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Package {
    pub name: String,
    pub version: Option<String>,
}

impl FromStr for Package {
    type Err = BuildError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| BuildError::InvalidPackage {
            spec: spec.to_string(),
            reason,
        };
        let (name, version) = match spec.split_once('=') {
            Some((name, version)) => (name, Some(version)),
            None => (spec, None),
        };

        // Debian policy: lowercase alphanumerics plus '+', '-', '.'.
        if name.is_empty() {
            return Err(invalid("empty package name"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c))
        {
            return Err(invalid("package name has invalid characters"));
        }
        if let Some(version) = version
            && (version.is_empty()
                || !version
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || ".+~:-".contains(c)))
        {
            return Err(invalid("version has invalid characters"));
        }

        Ok(Package {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}={}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Lock-file pinned dependency install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencySpec {
    pub app_root: PathBuf,
    pub project_file: String,
    pub lock_file: String,
    pub index_strategy: String,
    pub extra_index_url: Option<String>,
}

impl DependencySpec {
    /// The `uv sync` invocation. Both the dependency layer and the project
    /// install resolve against the same indexes.
    pub fn sync_command(&self, install_project: bool) -> String {
        let mut cmd = String::from("uv sync --frozen --no-dev");
        if !install_project {
            cmd.push_str(" --no-install-project");
        }
        cmd.push_str(" --index-strategy ");
        cmd.push_str(&self.index_strategy);
        if let Some(url) = &self.extra_index_url {
            cmd.push_str(" --extra-index-url ");
            cmd.push_str(url);
        }
        cmd
    }
}

/// One build step. Order matters: see [`ImagePlan::from_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Base {
        image: String,
    },
    SystemPackages {
        packages: Vec<Package>,
    },
    InstallResolver {
        image: String,
    },
    GlobalTools {
        packages: Vec<String>,
        setup: Vec<String>,
        browsers_path: PathBuf,
    },
    InstallGuard {
        context: String,
        path: PathBuf,
    },
    Dependencies(DependencySpec),
    CopyApplication {
        dependencies: DependencySpec,
        sources: Vec<String>,
        config_source: String,
        config_root: PathBuf,
    },
    ProvisionDirs {
        dirs: Vec<PathBuf>,
    },
    CreateIdentity(Identity),
    AssignOwnership {
        user: String,
        paths: Vec<PathBuf>,
        recursive: bool,
    },
    SetIdentity(Identity),
    Environment(EnvContract),
    Entry {
        workdir: PathBuf,
        command: Vec<String>,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Base { .. } => "base",
            Step::SystemPackages { .. } => "system-packages",
            Step::InstallResolver { .. } => "install-resolver",
            Step::GlobalTools { .. } => "global-tools",
            Step::InstallGuard { .. } => "install-guard",
            Step::Dependencies(_) => "dependencies",
            Step::CopyApplication { .. } => "copy-application",
            Step::ProvisionDirs { .. } => "provision-dirs",
            Step::CreateIdentity(_) => "create-identity",
            Step::AssignOwnership { .. } => "assign-ownership",
            Step::SetIdentity(_) => "set-identity",
            Step::Environment(_) => "environment",
            Step::Entry { .. } => "entry",
        }
    }

    /// Whether the step writes outside the identity's own directories.
    pub fn requires_privilege(&self) -> bool {
        !matches!(
            self,
            Step::Base { .. } | Step::SetIdentity(_) | Step::Environment(_) | Step::Entry { .. }
        )
    }

    /// One-line description for `plan` output.
    pub fn summary(&self) -> String {
        match self {
            Step::Base { image } => image.clone(),
            Step::SystemPackages { packages } => packages
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(" "),
            Step::InstallResolver { image } => format!("uv from {}", image),
            Step::GlobalTools { packages, .. } => packages.join(" "),
            Step::InstallGuard { path, .. } => path.display().to_string(),
            Step::Dependencies(spec) => format!(
                "{} ({}{})",
                spec.lock_file,
                spec.index_strategy,
                spec.extra_index_url
                    .as_deref()
                    .map(|u| format!(", extra index {}", u))
                    .unwrap_or_default()
            ),
            Step::CopyApplication { dependencies, .. } => {
                dependencies.app_root.display().to_string()
            }
            Step::ProvisionDirs { dirs } => join_paths(dirs),
            Step::CreateIdentity(id) => format!("{} ({}:{})", id.name(), id.uid(), id.gid()),
            Step::AssignOwnership {
                user,
                paths,
                recursive,
            } => format!(
                "{}{} -> {}",
                if *recursive { "-R " } else { "" },
                join_paths(paths),
                user
            ),
            Step::SetIdentity(id) => id.name().to_string(),
            Step::Environment(contract) => contract
                .entries()
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            Step::Entry { command, .. } => command.join(" "),
        }
    }

    pub fn apply(&self, mut state: ImageState) -> Result<ImageState, BuildError> {
        match (self, &state.base) {
            (Step::Base { .. }, Some(_)) => return Err(BuildError::BaseNotFirst),
            (Step::Base { .. }, None) => {}
            (_, None) => return Err(BuildError::MissingBase),
            (_, Some(_)) => {}
        }
        if self.requires_privilege() && !state.privilege.is_privileged() {
            return Err(BuildError::RequiresPrivilege {
                step: self.name(),
                user: state.privilege.user_name().to_string(),
            });
        }

        match self {
            Step::Base { image } => {
                state.base = Some(image.clone());
                // Directories every base image has.
                for dir in ["/", "/etc", "/usr", "/usr/local/bin", "/home", "/tmp"] {
                    state.create_path(Path::new(dir));
                }
            }
            Step::SystemPackages { packages } => {
                for pkg in packages {
                    if let Some(existing) = state.packages.get(&pkg.name)
                        && existing.version != pkg.version
                    {
                        return Err(BuildError::ConflictingPackage {
                            name: pkg.name.clone(),
                            first: existing.to_string(),
                            second: pkg.to_string(),
                        });
                    }
                    state.packages.insert(pkg.name.clone(), pkg.clone());
                }
            }
            Step::InstallResolver { .. } => {
                state.resolver = true;
            }
            Step::GlobalTools {
                packages,
                setup,
                browsers_path,
            } => {
                for cmd in packages.iter().chain(setup) {
                    check_command(cmd)?;
                }
                check_path(browsers_path)?;
                state.create_path(browsers_path);
                state.env.insert(
                    BROWSERS_PATH_VAR.to_string(),
                    browsers_path.display().to_string(),
                );
                state.global_tools.extend(packages.iter().cloned());
            }
            Step::InstallGuard { path, .. } => {
                check_path(path)?;
                state.create_path(path);
            }
            Step::Dependencies(spec) => {
                if !state.resolver {
                    return Err(BuildError::ResolverMissing);
                }
                check_path(&spec.app_root)?;
                state.create_path(&spec.app_root);
                state.dependencies_locked = true;
            }
            Step::CopyApplication {
                dependencies,
                config_root,
                ..
            } => {
                if !state.dependencies_locked {
                    return Err(BuildError::DependenciesMissing);
                }
                check_path(config_root)?;
                state.create_path(&dependencies.app_root);
                state.create_path(config_root);
            }
            Step::ProvisionDirs { dirs } => {
                for dir in dirs {
                    check_path(dir)?;
                    state.create_path(dir);
                }
            }
            Step::CreateIdentity(identity) => {
                if state.identities.contains_key(identity.name()) {
                    return Err(BuildError::DuplicateIdentity(identity.name().to_string()));
                }
                state
                    .identities
                    .insert(identity.name().to_string(), identity.clone());
                state.create_path(&Path::new("/home").join(identity.name()));
                state.set_owner(&Path::new("/home").join(identity.name()), identity.name(), true);
            }
            Step::AssignOwnership {
                user,
                paths,
                recursive,
            } => {
                if !state.identities.contains_key(user) {
                    return Err(BuildError::UnknownIdentity(user.clone()));
                }
                for path in paths {
                    if !state.has_path(path) {
                        return Err(BuildError::UnknownPath(path.clone()));
                    }
                    state.set_owner(path, user, *recursive);
                }
            }
            Step::SetIdentity(identity) => {
                if state.identities.get(identity.name()) != Some(identity) {
                    return Err(BuildError::UnknownIdentity(identity.name().to_string()));
                }
                state.privilege = state.privilege.downgrade(identity.clone())?;
            }
            Step::Environment(contract) => {
                for (name, value) in contract.entries() {
                    state.env.insert(name.to_string(), value);
                }
            }
            Step::Entry { workdir, command } => {
                if state.privilege.is_privileged() {
                    return Err(BuildError::EntryBeforeDowngrade);
                }
                if state.entry.is_some() {
                    return Err(BuildError::DuplicateEntry);
                }
                if command.is_empty() || command.iter().any(|a| a.is_empty()) {
                    return Err(BuildError::EmptyEntry);
                }
                if !state.has_path(workdir) {
                    return Err(BuildError::UnknownPath(workdir.clone()));
                }
                state.entry = Some(command.clone());
                state.workdir = Some(workdir.clone());
            }
        }

        Ok(state)
    }
}

/// Ownership record for a path created during the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathRecord {
    pub owner: String,
    /// Ownership was applied to everything beneath this path.
    pub recursive: bool,
}

/// Simulated image after some prefix of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ImageState {
    pub base: Option<String>,
    pub privilege: Privilege,
    pub packages: BTreeMap<String, Package>,
    pub resolver: bool,
    pub global_tools: BTreeSet<String>,
    pub dependencies_locked: bool,
    pub identities: BTreeMap<String, Identity>,
    pub paths: BTreeMap<PathBuf, PathRecord>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<PathBuf>,
    pub entry: Option<Vec<String>>,
}

impl ImageState {
    fn create_path(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            self.paths
                .entry(ancestor.to_path_buf())
                .or_insert_with(|| PathRecord {
                    owner: ROOT_USER.to_string(),
                    recursive: false,
                });
        }
    }

    pub fn has_path(&self, path: &Path) -> bool {
        self.paths.contains_key(path)
    }

    fn set_owner(&mut self, path: &Path, owner: &str, recursive: bool) {
        if recursive {
            for (p, record) in self.paths.iter_mut() {
                if p.starts_with(path) {
                    record.owner = owner.to_string();
                }
            }
        }
        self.paths.insert(
            path.to_path_buf(),
            PathRecord {
                owner: owner.to_string(),
                recursive,
            },
        );
    }

    /// Owner of `path`: its own record, or the nearest recursively-owned ancestor.
    pub fn owner_of(&self, path: &Path) -> &str {
        if let Some(record) = self.paths.get(path) {
            return &record.owner;
        }
        path.ancestors()
            .skip(1)
            .find_map(|a| self.paths.get(a).filter(|r| r.recursive))
            .map_or(ROOT_USER, |r| r.owner.as_str())
    }
}

/// Ordered steps plus the layout they were derived from.
#[derive(Debug, Clone, Serialize)]
pub struct ImagePlan {
    pub steps: Vec<Step>,
    pub layout: Layout,
    pub identity: Identity,
}

impl ImagePlan {
    /// The standard safe-mode pipeline for `config`.
    pub fn from_config(config: &SandboxConfig) -> Result<Self, BuildError> {
        let layout = config.layout()?;
        let identity = config.identity()?;

        let packages = config
            .system_packages()
            .into_iter()
            .map(Package::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        let mut command = vec![
            GUARD_PATH.to_string(),
            "entry".to_string(),
            "--".to_string(),
        ];
        command.extend(config.agent_command().into_iter().map(str::to_string));

        let dependencies = DependencySpec {
            app_root: layout.app_root().to_path_buf(),
            project_file: "pyproject.toml".to_string(),
            lock_file: "uv.lock".to_string(),
            index_strategy: config.index_strategy().to_string(),
            extra_index_url: config.extra_index_url().map(str::to_string),
        };

        let steps = vec![
            Step::Base {
                image: config.base_image().to_string(),
            },
            Step::SystemPackages { packages },
            Step::InstallResolver {
                image: config.resolver_image().to_string(),
            },
            Step::GlobalTools {
                packages: config
                    .global_tools()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                setup: config
                    .global_tool_setup()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                // Inside the app root, which the identity owns.
                browsers_path: layout.app_root().join(".browsers"),
            },
            Step::InstallGuard {
                context: GUARD_CONTEXT.to_string(),
                path: PathBuf::from(GUARD_PATH),
            },
            Step::Dependencies(dependencies.clone()),
            Step::CopyApplication {
                dependencies,
                sources: config
                    .app_sources()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
                config_source: config.config_source().to_string(),
                config_root: layout.config_root().to_path_buf(),
            },
            Step::ProvisionDirs {
                dirs: layout.provisioned_dirs(),
            },
            Step::CreateIdentity(identity.clone()),
            Step::AssignOwnership {
                user: identity.name().to_string(),
                paths: layout.owned_roots(),
                recursive: true,
            },
            Step::SetIdentity(identity.clone()),
            Step::Environment(layout.contract()),
            Step::Entry {
                workdir: layout.workspace_root().to_path_buf(),
                command,
            },
        ];

        Ok(Self {
            steps,
            layout,
            identity,
        })
    }

    /// Fold every step, then check the invariants of a runnable image.
    pub fn finalize(&self) -> Result<ImageState, BuildError> {
        let mut state = ImageState::default();
        for step in &self.steps {
            debug!(step = step.name(), "pipeline:apply");
            state = step.apply(state)?;
        }

        if state.base.is_none() {
            return Err(BuildError::MissingBase);
        }
        let Some(identity) = state.privilege.identity() else {
            return Err(BuildError::NotDowngraded);
        };
        if state.entry.is_none() {
            return Err(BuildError::MissingEntry);
        }

        let mut must_own = self.layout.owned_roots();
        must_own.push(self.layout.memory_dir().to_path_buf());
        must_own.push(self.layout.config_root().to_path_buf());
        for path in must_own {
            let owner = state.owner_of(&path);
            if owner != identity.name() {
                return Err(BuildError::OwnershipMissing {
                    owner: owner.to_string(),
                    expected: identity.name().to_string(),
                    path,
                });
            }
        }

        let contract = self.layout.contract();
        for var in EnvVar::ALL {
            let expected = contract.path(var).display().to_string();
            let found = state.env.get(var.name());
            if found != Some(&expected) {
                return Err(BuildError::ContractMismatch {
                    var: var.name(),
                    expected,
                    found: found.cloned(),
                });
            }
        }

        Ok(state)
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn check_path(path: &Path) -> Result<(), BuildError> {
    let s = path.to_string_lossy();
    if s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return Err(BuildError::UnsafePath(path.to_path_buf()));
    }
    Ok(())
}

fn check_command(cmd: &str) -> Result<(), BuildError> {
    if cmd.trim().is_empty() || cmd.contains('\n') || cmd.contains('\r') {
        return Err(BuildError::InvalidCommand(cmd.to_string()));
    }
    Ok(())
}

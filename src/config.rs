use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::sandbox::contract::EnvVar;
use crate::sandbox::identity::{Identity, IdentityError};
use crate::sandbox::layout::{Layout, LayoutError};

/// Project config file names, checked in order.
pub const CONFIG_FILE_NAMES: &[&str] = &["lethe-sandbox.yaml", "lethe-sandbox.yml"];

/// Container runtime used to build and run the sandbox.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl SandboxRuntime {
    pub fn binary(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
        }
    }
}

/// Configuration for the sandbox image, read from lethe-sandbox.yaml.
///
/// Every field is optional; accessors supply the defaults.
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<SandboxRuntime>,

    /// Tag applied to the built image. Default: "lethe-sandbox"
    #[serde(default)]
    pub image: Option<String>,

    /// Base OS image. Default: "python:3.12-slim-bookworm"
    #[serde(default)]
    pub base_image: Option<String>,

    /// apt packages, optionally pinned as `name=version`.
    #[serde(default)]
    pub system_packages: Option<Vec<String>>,

    /// npm packages installed globally. Default: ["agent-browser"]
    #[serde(default)]
    pub global_tools: Option<Vec<String>>,

    /// Commands run as root after the global tools are installed.
    /// Default: ["agent-browser install --with-deps"]
    #[serde(default)]
    pub global_tool_setup: Option<Vec<String>>,

    /// Image the `uv` resolver binaries are copied from.
    #[serde(default)]
    pub resolver_image: Option<String>,

    /// uv index strategy. Default: "unsafe-best-match"
    #[serde(default)]
    pub index_strategy: Option<String>,

    /// Extra package index, used for the CPU-only torch wheels.
    /// Set to an empty string to disable.
    #[serde(default)]
    pub extra_index_url: Option<String>,

    /// Agent sources copied into the application root. Default: ["src"]
    #[serde(default)]
    pub app_sources: Option<Vec<String>>,

    /// Directory in the build context baked in as the config root. Default: "config"
    #[serde(default)]
    pub config_source: Option<String>,

    /// Unprivileged account name. Default: "lethe"
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub uid: Option<u32>,

    #[serde(default)]
    pub gid: Option<u32>,

    /// Default: /workspace
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Default: /app
    #[serde(default)]
    pub app_dir: Option<PathBuf>,

    /// Default: /app/config
    #[serde(default)]
    pub config_dir: Option<PathBuf>,

    /// Memory store path relative to the workspace root. Default: "data/memory"
    #[serde(default)]
    pub memory_subdir: Option<String>,

    /// Agent command exec'd by the entry guard. Default: ["/app/.venv/bin/lethe"]
    #[serde(default)]
    pub agent_command: Option<Vec<String>>,

    /// Host environment variables forwarded to `run`.
    #[serde(default)]
    pub env_passthrough: Option<Vec<String>>,

    /// Drop capabilities and forbid new privileges on `run`. Default: true
    #[serde(default)]
    pub hardening: Option<bool>,

    /// Timeout for each external command the probe runs. Default: 60
    #[serde(default)]
    pub probe_timeout_secs: Option<u64>,
}

impl SandboxConfig {
    pub fn runtime(&self) -> SandboxRuntime {
        self.runtime.clone().unwrap_or_default()
    }

    /// Get the image tag, falling back to default "lethe-sandbox".
    pub fn resolved_image(&self) -> &str {
        self.image.as_deref().unwrap_or("lethe-sandbox")
    }

    pub fn base_image(&self) -> &str {
        self.base_image
            .as_deref()
            .unwrap_or("python:3.12-slim-bookworm")
    }

    pub fn system_packages(&self) -> Vec<&str> {
        self.system_packages
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["ca-certificates", "curl", "git", "nodejs", "npm"])
    }

    pub fn global_tools(&self) -> Vec<&str> {
        self.global_tools
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["agent-browser"])
    }

    pub fn global_tool_setup(&self) -> Vec<&str> {
        self.global_tool_setup
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["agent-browser install --with-deps"])
    }

    pub fn resolver_image(&self) -> &str {
        self.resolver_image
            .as_deref()
            .unwrap_or("ghcr.io/astral-sh/uv:0.5.14")
    }

    pub fn index_strategy(&self) -> &str {
        self.index_strategy.as_deref().unwrap_or("unsafe-best-match")
    }

    pub fn extra_index_url(&self) -> Option<&str> {
        match self.extra_index_url.as_deref() {
            Some("") => None,
            Some(url) => Some(url),
            None => Some("https://download.pytorch.org/whl/cpu"),
        }
    }

    pub fn app_sources(&self) -> Vec<&str> {
        self.app_sources
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["src"])
    }

    pub fn config_source(&self) -> &str {
        self.config_source.as_deref().unwrap_or("config")
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or("lethe")
    }

    pub fn uid(&self) -> u32 {
        self.uid.unwrap_or(1000)
    }

    /// Defaults to the uid so the user's primary group mirrors it.
    pub fn gid(&self) -> u32 {
        self.gid.unwrap_or_else(|| self.uid())
    }

    pub fn identity(&self) -> Result<Identity, IdentityError> {
        Identity::unprivileged(self.user(), self.uid(), self.gid())
    }

    pub fn layout(&self) -> Result<Layout, LayoutError> {
        Layout::new(
            self.workspace_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/workspace")),
            self.app_dir.clone().unwrap_or_else(|| PathBuf::from("/app")),
            self.config_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/app/config")),
            self.memory_subdir.as_deref().unwrap_or("data/memory"),
        )
    }

    pub fn agent_command(&self) -> Vec<&str> {
        self.agent_command
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| vec!["/app/.venv/bin/lethe"])
    }

    /// Passthrough variables, minus any that would shadow the contract.
    pub fn env_passthrough(&self) -> Vec<&str> {
        self.env_passthrough
            .as_ref()
            .map(|v| v.iter().map(|s| s.as_str()).collect())
            .unwrap_or_else(|| {
                vec![
                    "OPENROUTER_API_KEY",
                    "ANTHROPIC_API_KEY",
                    "TELEGRAM_BOT_TOKEN",
                ]
            })
            .into_iter()
            .filter(|name| EnvVar::from_name(name).is_none())
            .collect()
    }

    pub fn hardening(&self) -> bool {
        self.hardening.unwrap_or(true)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.unwrap_or(60))
    }

    /// Load and merge the global config and the project config in `dir`
    /// (or the current directory).
    pub fn load(dir: Option<&Path>) -> anyhow::Result<Self> {
        debug!("config:loading");
        let global = Self::load_global()?.unwrap_or_default();
        let start = match dir {
            Some(d) => d.to_path_buf(),
            None => std::env::current_dir().unwrap_or_default(),
        };
        let project = Self::load_project(&start)?.unwrap_or_default();
        let config = global.merge(project);
        debug!(
            image = config.resolved_image(),
            runtime = config.runtime().binary(),
            "config:loaded"
        );
        Ok(config)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: SandboxConfig = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from ~/.config/lethe-sandbox.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/lethe-sandbox").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    fn load_project(dir: &Path) -> anyhow::Result<Option<Self>> {
        for name in CONFIG_FILE_NAMES {
            let path = dir.join(name);
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        Ok(None)
    }

    /// Merge a project config over a global one. Project values win per field.
    fn merge(self, project: Self) -> Self {
        macro_rules! merge_options {
            ($global:expr, $project:expr, $($field:ident),+ $(,)?) => {
                Self {
                    $($field: $project.$field.or($global.$field),)+
                }
            };
        }

        merge_options!(
            self,
            project,
            runtime,
            image,
            base_image,
            system_packages,
            global_tools,
            global_tool_setup,
            resolver_image,
            index_strategy,
            extra_index_url,
            app_sources,
            config_source,
            user,
            uid,
            gid,
            workspace_dir,
            app_dir,
            config_dir,
            memory_subdir,
            agent_command,
            env_passthrough,
            hardening,
            probe_timeout_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.runtime(), SandboxRuntime::Docker);
        assert_eq!(config.resolved_image(), "lethe-sandbox");
        assert_eq!(config.user(), "lethe");
        assert_eq!(config.uid(), 1000);
        assert_eq!(config.gid(), 1000);
        assert!(config.hardening());
        assert_eq!(config.probe_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.extra_index_url(),
            Some("https://download.pytorch.org/whl/cpu")
        );
        assert_eq!(config.layout().unwrap(), Layout::default());
    }

    #[test]
    fn test_gid_follows_uid() {
        let config = SandboxConfig {
            uid: Some(1500),
            ..Default::default()
        };
        assert_eq!(config.gid(), 1500);
    }

    #[test]
    fn test_empty_extra_index_disables_it() {
        let config = SandboxConfig {
            extra_index_url: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(config.extra_index_url(), None);
    }

    #[test]
    fn test_env_passthrough_cannot_shadow_contract() {
        let config = SandboxConfig {
            env_passthrough: Some(vec![
                "OPENROUTER_API_KEY".to_string(),
                "WORKSPACE_DIR".to_string(),
                "MEMORY_DIR".to_string(),
            ]),
            ..Default::default()
        };
        assert_eq!(config.env_passthrough(), vec!["OPENROUTER_API_KEY"]);
    }

    #[test]
    fn test_root_identity_rejected() {
        let config = SandboxConfig {
            user: Some("root".to_string()),
            ..Default::default()
        };
        assert!(config.identity().is_err());

        let config = SandboxConfig {
            uid: Some(0),
            ..Default::default()
        };
        assert!(config.identity().is_err());
    }

    #[test]
    fn test_merge_project_overrides_global() {
        let global = SandboxConfig {
            runtime: Some(SandboxRuntime::Docker),
            image: Some("global-image".to_string()),
            user: Some("agent".to_string()),
            ..Default::default()
        };
        let project = SandboxConfig {
            runtime: Some(SandboxRuntime::Podman),
            ..Default::default()
        };
        let merged = global.merge(project);
        assert_eq!(merged.runtime(), SandboxRuntime::Podman);
        assert_eq!(merged.resolved_image(), "global-image");
        assert_eq!(merged.user(), "agent");
    }

    #[test]
    fn test_load_project_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("lethe-sandbox.yaml"),
            "runtime: podman\nimage: my-sandbox\nmemory_subdir: state/memory\n",
        )
        .unwrap();
        let config = SandboxConfig::load_project(dir.path()).unwrap().unwrap();
        assert_eq!(config.runtime(), SandboxRuntime::Podman);
        assert_eq!(config.resolved_image(), "my-sandbox");
        assert_eq!(
            config.layout().unwrap().memory_dir(),
            Path::new("/workspace/state/memory")
        );
    }

    #[test]
    fn test_load_project_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(SandboxConfig::load_project(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lethe-sandbox.yaml");
        std::fs::write(&path, "workspace_root: /data\n").unwrap();
        let err = SandboxConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}

//! Configuration surface: the environment variables the agent reads at startup.
//!
//! The names are a public contract with the agent's settings loader. Renaming
//! one is a breaking change for every agent build.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// The closed set of contract variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EnvVar {
    WorkspaceDir,
    MemoryDir,
    ConfigDir,
}

impl EnvVar {
    pub const ALL: [EnvVar; 3] = [EnvVar::WorkspaceDir, EnvVar::MemoryDir, EnvVar::ConfigDir];

    pub const fn name(self) -> &'static str {
        match self {
            EnvVar::WorkspaceDir => "WORKSPACE_DIR",
            EnvVar::MemoryDir => "MEMORY_DIR",
            EnvVar::ConfigDir => "LETHE_CONFIG_DIR",
        }
    }

    pub const fn meaning(self) -> &'static str {
        match self {
            EnvVar::WorkspaceDir => "root of all agent-writable state",
            EnvVar::MemoryDir => "persistent memory directory",
            EnvVar::ConfigDir => "static configuration directory",
        }
    }

    pub const fn backing(self) -> &'static str {
        match self {
            EnvVar::WorkspaceDir => "host bind mount",
            EnvVar::MemoryDir => "nested under workspace root",
            EnvVar::ConfigDir => "baked into image",
        }
    }

    pub fn from_name(name: &str) -> Option<EnvVar> {
        EnvVar::ALL.into_iter().find(|var| var.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} must be an absolute path, got '{value}'")]
    NotAbsolute { var: &'static str, value: String },

    #[error("{var} must not contain '..' components, got '{value}'")]
    ParentComponent { var: &'static str, value: String },

    #[error("MEMORY_DIR ({memory}) is not nested under WORKSPACE_DIR ({workspace})")]
    MemoryOutsideWorkspace { memory: PathBuf, workspace: PathBuf },

    #[error("memory subpath '{0}' must be relative and stay inside the workspace")]
    InvalidMemorySubpath(String),
}

/// Resolved contract: every variable mapped to exactly one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvContract {
    pub workspace_dir: PathBuf,
    pub memory_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl EnvContract {
    /// Build a contract from explicit roots, validating every path.
    pub fn new(
        workspace_dir: PathBuf,
        memory_dir: PathBuf,
        config_dir: PathBuf,
    ) -> Result<Self, ContractError> {
        check_absolute(EnvVar::WorkspaceDir, &workspace_dir)?;
        check_absolute(EnvVar::MemoryDir, &memory_dir)?;
        check_absolute(EnvVar::ConfigDir, &config_dir)?;

        if memory_dir == workspace_dir || !memory_dir.starts_with(&workspace_dir) {
            return Err(ContractError::MemoryOutsideWorkspace {
                memory: memory_dir,
                workspace: workspace_dir,
            });
        }

        Ok(Self {
            workspace_dir,
            memory_dir,
            config_dir,
        })
    }

    /// Read the contract through `lookup`, typically the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ContractError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: EnvVar| {
            lookup(var.name())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .ok_or(ContractError::Missing(var.name()))
        };
        Self::new(
            get(EnvVar::WorkspaceDir)?,
            get(EnvVar::MemoryDir)?,
            get(EnvVar::ConfigDir)?,
        )
    }

    pub fn path(&self, var: EnvVar) -> &Path {
        match var {
            EnvVar::WorkspaceDir => &self.workspace_dir,
            EnvVar::MemoryDir => &self.memory_dir,
            EnvVar::ConfigDir => &self.config_dir,
        }
    }

    /// Name -> value pairs in contract order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        EnvVar::ALL
            .into_iter()
            .map(|var| (var.name(), self.path(var).display().to_string()))
            .collect()
    }
}

/// Join a relative memory subpath onto the workspace root.
pub fn nest_memory_dir(workspace: &Path, subpath: &str) -> Result<PathBuf, ContractError> {
    let sub = Path::new(subpath);
    let escapes = sub
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if subpath.is_empty() || escapes {
        return Err(ContractError::InvalidMemorySubpath(subpath.to_string()));
    }
    Ok(workspace.join(sub))
}

fn check_absolute(var: EnvVar, path: &Path) -> Result<(), ContractError> {
    if !path.is_absolute() {
        return Err(ContractError::NotAbsolute {
            var: var.name(),
            value: path.display().to_string(),
        });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ContractError::ParentComponent {
            var: var.name(),
            value: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn default_contract() -> EnvContract {
        EnvContract::new(
            PathBuf::from("/workspace"),
            PathBuf::from("/workspace/data/memory"),
            PathBuf::from("/app/config"),
        )
        .unwrap()
    }

    #[test]
    fn test_contract_names_are_stable() {
        let names: Vec<_> = EnvVar::ALL.iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["WORKSPACE_DIR", "MEMORY_DIR", "LETHE_CONFIG_DIR"]);
    }

    #[test]
    fn test_from_name_round_trips_only_contract_names() {
        for var in EnvVar::ALL {
            assert_eq!(EnvVar::from_name(var.name()), Some(var));
        }
        assert_eq!(EnvVar::from_name("WORKSPACE"), None);
        assert_eq!(EnvVar::from_name("LETHE_DATA_DIR"), None);
    }

    #[test]
    fn test_memory_must_be_nested() {
        let err = EnvContract::new(
            PathBuf::from("/workspace"),
            PathBuf::from("/var/lib/memory"),
            PathBuf::from("/app/config"),
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::MemoryOutsideWorkspace { .. }));

        // Equal to the workspace root is not "nested" either.
        assert!(
            EnvContract::new(
                PathBuf::from("/workspace"),
                PathBuf::from("/workspace"),
                PathBuf::from("/app/config"),
            )
            .is_err()
        );
    }

    #[test]
    fn test_relative_paths_rejected() {
        let err = EnvContract::new(
            PathBuf::from("workspace"),
            PathBuf::from("workspace/memory"),
            PathBuf::from("/app/config"),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ContractError::NotAbsolute {
                var: "WORKSPACE_DIR",
                value: "workspace".to_string()
            }
        );
    }

    #[test]
    fn test_parent_components_rejected() {
        let err = EnvContract::new(
            PathBuf::from("/workspace"),
            PathBuf::from("/workspace/../etc"),
            PathBuf::from("/app/config"),
        )
        .unwrap_err();
        assert!(matches!(err, ContractError::ParentComponent { .. }));
    }

    #[test]
    fn test_from_lookup_reports_first_missing_variable() {
        let env: HashMap<&str, &str> = [("WORKSPACE_DIR", "/workspace")].into();
        let err = EnvContract::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert_eq!(err, ContractError::Missing("MEMORY_DIR"));
    }

    #[test]
    fn test_from_lookup_treats_empty_as_missing() {
        let env: HashMap<&str, &str> = [
            ("WORKSPACE_DIR", "/workspace"),
            ("MEMORY_DIR", "/workspace/data/memory"),
            ("LETHE_CONFIG_DIR", ""),
        ]
        .into();
        let err = EnvContract::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert_eq!(err, ContractError::Missing("LETHE_CONFIG_DIR"));
    }

    #[test]
    fn test_from_lookup_success() {
        let env: HashMap<&str, &str> = [
            ("WORKSPACE_DIR", "/workspace"),
            ("MEMORY_DIR", "/workspace/data/memory"),
            ("LETHE_CONFIG_DIR", "/app/config"),
        ]
        .into();
        let contract = EnvContract::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(contract, default_contract());
    }

    #[test]
    fn test_entries_in_contract_order() {
        let entries = default_contract().entries();
        assert_eq!(
            entries,
            vec![
                ("WORKSPACE_DIR", "/workspace".to_string()),
                ("MEMORY_DIR", "/workspace/data/memory".to_string()),
                ("LETHE_CONFIG_DIR", "/app/config".to_string()),
            ]
        );
    }

    #[test]
    fn test_nest_memory_dir() {
        let ws = Path::new("/workspace");
        assert_eq!(
            nest_memory_dir(ws, "data/memory").unwrap(),
            PathBuf::from("/workspace/data/memory")
        );
        assert!(nest_memory_dir(ws, "../memory").is_err());
        assert!(nest_memory_dir(ws, "/abs/memory").is_err());
        assert!(nest_memory_dir(ws, "").is_err());
    }
}

//! Filesystem layout of the sandbox image.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::contract::{ContractError, EnvContract, nest_memory_dir};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error("{name} root must not be the filesystem root")]
    FilesystemRoot { name: &'static str },

    #[error("workspace root {workspace} and application root {app} must not contain each other")]
    Overlapping { workspace: PathBuf, app: PathBuf },

    #[error("config root {config} must live under the application root {app}")]
    ConfigOutsideApp { config: PathBuf, app: PathBuf },
}

/// Where everything lives inside the image.
///
/// The workspace root and the application root are the only paths the
/// unprivileged identity owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layout {
    workspace_root: PathBuf,
    app_root: PathBuf,
    config_root: PathBuf,
    memory_dir: PathBuf,
}

impl Layout {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        app_root: impl Into<PathBuf>,
        config_root: impl Into<PathBuf>,
        memory_subpath: &str,
    ) -> Result<Self, LayoutError> {
        let workspace_root = workspace_root.into();
        let app_root = app_root.into();
        let config_root = config_root.into();

        let memory_dir = nest_memory_dir(&workspace_root, memory_subpath)?;
        // Validates absoluteness and nesting of all three contract paths.
        EnvContract::new(
            workspace_root.clone(),
            memory_dir.clone(),
            config_root.clone(),
        )?;

        for (name, path) in [("workspace", &workspace_root), ("application", &app_root)] {
            if path.parent().is_none() {
                return Err(LayoutError::FilesystemRoot { name });
            }
        }
        if workspace_root.starts_with(&app_root) || app_root.starts_with(&workspace_root) {
            return Err(LayoutError::Overlapping {
                workspace: workspace_root,
                app: app_root,
            });
        }
        if !config_root.starts_with(&app_root) {
            return Err(LayoutError::ConfigOutsideApp {
                config: config_root,
                app: app_root,
            });
        }

        Ok(Self {
            workspace_root,
            app_root,
            config_root,
            memory_dir,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Roots that must be recursively owned by the unprivileged identity.
    pub fn owned_roots(&self) -> Vec<PathBuf> {
        vec![self.workspace_root.clone(), self.app_root.clone()]
    }

    /// Directories created empty at build time.
    pub fn provisioned_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.workspace_root.clone(),
            self.memory_dir.clone(),
            self.config_root.clone(),
        ]
    }

    pub fn contract(&self) -> EnvContract {
        EnvContract {
            workspace_dir: self.workspace_root.clone(),
            memory_dir: self.memory_dir.clone(),
            config_dir: self.config_root.clone(),
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/workspace"),
            app_root: PathBuf::from("/app"),
            config_root: PathBuf::from("/app/config"),
            memory_dir: PathBuf::from("/workspace/data/memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        let built = Layout::new("/workspace", "/app", "/app/config", "data/memory").unwrap();
        assert_eq!(built, Layout::default());
        assert_eq!(
            built.contract().memory_dir,
            PathBuf::from("/workspace/data/memory")
        );
    }

    #[test]
    fn test_overlapping_roots_rejected() {
        let err = Layout::new("/app/workspace", "/app", "/app/config", "memory").unwrap_err();
        assert!(matches!(err, LayoutError::Overlapping { .. }));
    }

    #[test]
    fn test_config_outside_app_rejected() {
        let err = Layout::new("/workspace", "/app", "/etc/lethe", "memory").unwrap_err();
        assert!(matches!(err, LayoutError::ConfigOutsideApp { .. }));
    }

    #[test]
    fn test_filesystem_root_rejected() {
        let err = Layout::new("/", "/app", "/app/config", "memory").unwrap_err();
        // "/" contains the app root too, so either rejection is acceptable;
        // the layout must never be accepted.
        assert!(matches!(
            err,
            LayoutError::FilesystemRoot { .. } | LayoutError::Overlapping { .. }
        ));
    }

    #[test]
    fn test_memory_subpath_escape_rejected() {
        let err = Layout::new("/workspace", "/app", "/app/config", "../tmp").unwrap_err();
        assert!(matches!(err, LayoutError::Contract(_)));
    }

    #[test]
    fn test_owned_roots_cover_workspace_and_app() {
        let layout = Layout::default();
        assert_eq!(
            layout.owned_roots(),
            vec![PathBuf::from("/workspace"), PathBuf::from("/app")]
        );
    }
}

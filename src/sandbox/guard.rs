//! Pre-flight checks the image entrypoint runs before handing over to the agent.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

use super::contract::{ContractError, EnvContract, EnvVar};
use super::mounts::{self, MountInfoError};
use crate::probe::Host;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("refusing to start the agent as root (uid 0)")]
    RunningAsRoot,

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(
        "workspace {0} is not a mount point; agent state would be lost with the container \
         (bind a host directory, or pass --allow-ephemeral-workspace)"
    )]
    EphemeralWorkspace(PathBuf),

    #[error("workspace {0} is not writable by the running user")]
    WorkspaceNotWritable(PathBuf),

    #[error("configuration directory {0} does not exist")]
    ConfigMissing(PathBuf),

    #[error("could not inspect mounts: {0}")]
    MountInfo(#[from] MountInfoError),
}

/// Verify the privilege boundary and environment contract. Returns the
/// validated contract for the caller to act on.
pub fn check_boundary(host: &dyn Host, allow_ephemeral: bool) -> Result<EnvContract, GuardError> {
    if host.effective_uid() == 0 {
        return Err(GuardError::RunningAsRoot);
    }

    let contract = EnvContract::from_lookup(|name| host.env_var(name))?;
    let workspace = contract.path(EnvVar::WorkspaceDir).to_path_buf();
    debug!(workspace = %workspace.display(), "guard:contract ok");

    let entries = host.mounts()?;
    if mounts::mount_at(&entries, &workspace).is_none() {
        if !allow_ephemeral {
            return Err(GuardError::EphemeralWorkspace(workspace));
        }
        warn!(workspace = %workspace.display(), "guard:workspace is not a mount point, continuing");
    }

    if !host.can_write(&workspace) {
        return Err(GuardError::WorkspaceNotWritable(workspace));
    }

    let config = contract.path(EnvVar::ConfigDir);
    if !host.exists(config) {
        return Err(GuardError::ConfigMissing(config.to_path_buf()));
    }

    Ok(contract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::host::fake::FakeHost;
    use std::path::Path;

    #[test]
    fn test_healthy_instance_passes() {
        let contract = check_boundary(&FakeHost::healthy(), false).unwrap();
        assert_eq!(
            contract.path(EnvVar::MemoryDir),
            Path::new("/workspace/data/memory")
        );
    }

    #[test]
    fn test_refuses_root() {
        let mut host = FakeHost::healthy();
        host.uid = 0;
        assert!(matches!(
            check_boundary(&host, true),
            Err(GuardError::RunningAsRoot)
        ));
    }

    #[test]
    fn test_missing_variable() {
        let mut host = FakeHost::healthy();
        host.env.remove("LETHE_CONFIG_DIR");
        assert!(matches!(
            check_boundary(&host, false),
            Err(GuardError::Contract(ContractError::Missing("LETHE_CONFIG_DIR")))
        ));
    }

    #[test]
    fn test_relative_workspace() {
        let mut host = FakeHost::healthy();
        host.env
            .insert("WORKSPACE_DIR".to_string(), "workspace".to_string());
        assert!(matches!(
            check_boundary(&host, false),
            Err(GuardError::Contract(_))
        ));
    }

    #[test]
    fn test_missing_bind_mount_fails_fast() {
        let mut host = FakeHost::healthy();
        host.mountinfo = "1 0 0:1 / / rw - overlay overlay rw\n".to_string();
        let err = check_boundary(&host, false).unwrap_err();
        assert!(matches!(err, GuardError::EphemeralWorkspace(ref p) if p == Path::new("/workspace")));
        assert!(err.to_string().contains("--allow-ephemeral-workspace"));
    }

    #[test]
    fn test_missing_bind_mount_allowed_when_overridden() {
        let mut host = FakeHost::healthy();
        host.mountinfo = "1 0 0:1 / / rw - overlay overlay rw\n".to_string();
        assert!(check_boundary(&host, true).is_ok());
    }

    #[test]
    fn test_unwritable_workspace() {
        let mut host = FakeHost::healthy();
        host.writable.remove(Path::new("/workspace"));
        assert!(matches!(
            check_boundary(&host, false),
            Err(GuardError::WorkspaceNotWritable(_))
        ));
    }

    #[test]
    fn test_missing_config_dir() {
        let mut host = FakeHost::healthy();
        host.dirs.remove(Path::new("/app/config"));
        assert!(matches!(
            check_boundary(&host, false),
            Err(GuardError::ConfigMissing(_))
        ));
    }
}

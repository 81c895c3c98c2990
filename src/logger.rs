use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: OnceLock<()> = OnceLock::new();
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE: &str = "lethe-sandbox.log";

pub fn init() -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    init_inner()?;
    let _ = INIT.set(());
    Ok(())
}

fn init_inner() -> Result<()> {
    let log_path = ensure_log_dir(determine_log_path())
        .or_else(|_| ensure_log_dir(std::env::temp_dir().join("lethe-sandbox").join(LOG_FILE)))?;

    let (directory, file_name) = split_path(&log_path)?;
    let file_appender = rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// The image's home directory may be read-only in some setups, so callers fall
/// back to the temp dir when this fails.
fn ensure_log_dir(path: PathBuf) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }
    Ok(path)
}

fn determine_log_path() -> PathBuf {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return PathBuf::from(state_home)
            .join("lethe-sandbox")
            .join(LOG_FILE);
    }

    // XDG default: ~/.local/state/lethe-sandbox/lethe-sandbox.log
    if let Some(home_dir) = home::home_dir() {
        return home_dir
            .join(".local")
            .join("state")
            .join("lethe-sandbox")
            .join(LOG_FILE);
    }

    std::env::temp_dir().join("lethe-sandbox").join(LOG_FILE)
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        let (dir, name) = split_path(Path::new("/var/log/lethe/lethe-sandbox.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/lethe"));
        assert_eq!(name, "lethe-sandbox.log");
    }

    #[test]
    fn test_determine_log_path_ends_with_log_file() {
        assert!(determine_log_path().ends_with("lethe-sandbox/lethe-sandbox.log"));
    }
}

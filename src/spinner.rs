use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Create a spinner with consistent styling.
fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb
}

/// Run a command with a spinner, streaming its output above the spinner line.
///
/// Build output can be long; every non-empty line from stdout and stderr is
/// printed above the spinner as it arrives. On a non-zero exit the spinner
/// finishes with a failure mark and an error is returned.
pub fn with_streaming_command(msg: &str, mut cmd: Command) -> Result<()> {
    let pb = create_spinner(msg);

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            pb.finish_with_message(format!("✘ {}", msg));
            anyhow::anyhow!("Failed to spawn command: {}", e)
        })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let pb_out = pb.clone();
    let pb_err = pb.clone();

    let stdout_thread = std::thread::spawn(move || {
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if !line.trim().is_empty() {
                    pb_out.println(&line);
                }
            }
        }
    });
    let stderr_thread = std::thread::spawn(move || {
        if let Some(stderr) = stderr {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                if !line.trim().is_empty() {
                    pb_err.println(&line);
                }
            }
        }
    });

    stdout_thread.join().ok();
    stderr_thread.join().ok();

    let status = child.wait().map_err(|e| {
        pb.finish_with_message(format!("✘ {}", msg));
        anyhow::anyhow!("Failed to wait for command: {}", e)
    })?;

    if status.success() {
        pb.finish_with_message(format!("✔ {}", msg));
        Ok(())
    } else {
        pb.finish_with_message(format!("✘ {}", msg));
        anyhow::bail!("{} (exit code: {})", msg, status.code().unwrap_or(-1))
    }
}

use anyhow::{Context, Result, anyhow};
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tracing::{debug, trace};
use wait_timeout::ChildExt;

/// Result of a command run for observation rather than for its side effects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// `None` when killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// First non-empty stderr line, or stdout if stderr is empty.
    pub fn first_line(&self) -> &str {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// A builder for executing external commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<&'a str>,
    timeout: Option<Duration>,
}

impl<'a> Cmd<'a> {
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn args(mut self, args: &[&'a str]) -> Self {
        self.args.extend_from_slice(args);
        self
    }

    /// Kill the command if it runs longer than `timeout` (only honoured by `capture`).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.command);
        cmd.args(&self.args);
        cmd
    }

    fn display(&self) -> String {
        format!("{} {}", self.command, self.args.join(" "))
    }

    /// Execute the command and return the output.
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        trace!(command = self.command, args = ?self.args, "cmd:run start");

        let output = self
            .command()
            .output()
            .with_context(|| format!("Failed to execute command: {}", self.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {}\n{}",
                self.display(),
                stderr.trim()
            ));
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

    /// Run to completion (or until the timeout), never treating a non-zero
    /// exit as an error. Only spawn/wait failures are errors.
    pub fn capture(self) -> std::io::Result<Outcome> {
        trace!(command = self.command, args = ?self.args, timeout = ?self.timeout, "cmd:capture start");

        let mut child = self
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain pipes on threads so a chatty child cannot block on a full pipe.
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let out_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_string(&mut buf);
            }
            buf
        });
        let err_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_string(&mut buf);
            }
            buf
        });

        let (exit_code, timed_out) = match self.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => (status.code(), false),
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    (None, true)
                }
            },
            None => (child.wait()?.code(), false),
        };

        let outcome = Outcome {
            exit_code,
            stdout: out_thread.join().unwrap_or_default(),
            stderr: err_thread.join().unwrap_or_default(),
            timed_out,
        };
        trace!(command = self.command, exit_code = ?outcome.exit_code, timed_out, "cmd:capture result");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_success() {
        let outcome = Cmd::new("sh").args(&["-c", "echo hi"]).capture().unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout.trim(), "hi");
    }

    #[test]
    fn test_capture_failure_is_not_an_error() {
        let outcome = Cmd::new("sh")
            .args(&["-c", "echo nope >&2; exit 3"])
            .capture()
            .unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.first_line(), "nope");
    }

    #[test]
    fn test_capture_timeout() {
        let outcome = Cmd::new("sh")
            .args(&["-c", "exec sleep 5"])
            .timeout(Duration::from_millis(100))
            .capture()
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.succeeded());
    }

    #[test]
    fn test_capture_missing_binary_is_io_error() {
        assert!(Cmd::new("lethe-sandbox-no-such-binary").capture().is_err());
    }

    #[test]
    fn test_run_reports_failure() {
        let err = Cmd::new("sh").args(&["-c", "exit 1"]).run().unwrap_err();
        assert!(err.to_string().contains("Command failed: sh -c exit 1"));
    }
}

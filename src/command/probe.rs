use std::io::IsTerminal;
use std::time::Duration;

use anyhow::Result;

use crate::config::SandboxConfig;
use crate::probe::{self, LiveHost};

/// Always succeeds once the checks have run, whatever they found.
pub fn run(json: bool, timeout_secs: Option<u64>) -> Result<()> {
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| SandboxConfig::default().probe_timeout());
    let report = probe::run(&LiveHost::new(timeout));

    if json {
        println!("{}", report.render_json()?);
    } else {
        println!("{}", report.render_text(std::io::stdout().is_terminal()));
    }
    Ok(())
}

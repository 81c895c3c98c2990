//! Read-only diagnostic probe for a running sandbox instance.

pub mod checks;
pub mod host;
pub mod report;

use tracing::info;

pub use checks::CheckId;
pub use host::{Host, LiveHost};
pub use report::Report;

/// Run every check in order. Findings never abort the run.
pub fn run(host: &dyn Host) -> Report {
    let findings = CheckId::ALL.iter().map(|c| c.run(host)).collect();
    let report = Report::new(findings);
    info!(
        passed = report.passed,
        failed = report.failed,
        unknown = report.unknown,
        "probe:complete"
    );
    report
}

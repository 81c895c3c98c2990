use console::style;
use serde::Serialize;
use std::fmt::Write as _;

use super::checks::CheckId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    /// The check could not determine an answer (unreadable file, timeout, ...).
    Unknown,
}

impl Verdict {
    pub fn label(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub number: usize,
    pub check: CheckId,
    pub title: &'static str,
    pub verdict: Verdict,
    pub detail: Vec<String>,
}

impl Finding {
    pub fn new(check: CheckId, verdict: Verdict, detail: Vec<String>) -> Self {
        Self {
            number: check.number(),
            check,
            title: check.title(),
            verdict,
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub findings: Vec<Finding>,
    pub passed: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl Report {
    pub fn new(findings: Vec<Finding>) -> Self {
        let count = |v| findings.iter().filter(|f| f.verdict == v).count();
        let (passed, failed, unknown) = (
            count(Verdict::Pass),
            count(Verdict::Fail),
            count(Verdict::Unknown),
        );
        Self {
            findings,
            passed,
            failed,
            unknown,
        }
    }

    #[cfg(test)]
    pub fn finding(&self, check: CheckId) -> Option<&Finding> {
        self.findings.iter().find(|f| f.check == check)
    }

    /// Numbered sections, each ending in its verdict line, then a summary.
    pub fn render_text(&self, styled: bool) -> String {
        let mut out = String::new();
        for finding in &self.findings {
            let heading = format!("== {}. {} ==", finding.number, finding.title);
            let _ = writeln!(
                out,
                "{}",
                if styled {
                    style(heading).bold().to_string()
                } else {
                    heading
                }
            );
            for line in &finding.detail {
                let _ = writeln!(out, "{}", line);
            }
            let _ = writeln!(out, "{}\n", verdict_text(finding.verdict, styled));
        }
        let _ = write!(
            out,
            "Summary: {} passed, {} failed, {} unknown",
            self.passed, self.failed, self.unknown
        );
        out
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn verdict_text(verdict: Verdict, styled: bool) -> String {
    if !styled {
        return verdict.label().to_string();
    }
    match verdict {
        Verdict::Pass => style(verdict.label()).green().to_string(),
        Verdict::Fail => style(verdict.label()).red().bold().to_string(),
        Verdict::Unknown => style(verdict.label()).yellow().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        Report::new(vec![
            Finding::new(
                CheckId::Identity,
                Verdict::Pass,
                vec!["uid=1000 (lethe)".to_string()],
            ),
            Finding::new(CheckId::ContainerMarker, Verdict::Fail, vec![]),
            Finding::new(
                CheckId::SudoersPolicy,
                Verdict::Unknown,
                vec!["unreadable: /etc/sudoers".to_string()],
            ),
        ])
    }

    #[test]
    fn test_counts() {
        let report = sample();
        assert_eq!((report.passed, report.failed, report.unknown), (1, 1, 1));
    }

    #[test]
    fn test_render_text_plain() {
        let text = sample().render_text(false);
        assert!(text.starts_with("== 1. Effective identity ==\nuid=1000 (lethe)\nPASS\n"));
        assert!(text.contains("== 2. Container marker ==\nFAIL\n"));
        assert!(text.contains("UNKNOWN\n"));
        assert!(text.ends_with("Summary: 1 passed, 1 failed, 1 unknown"));
    }

    #[test]
    fn test_render_json() {
        let json = sample().render_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["findings"][0]["check"], "identity");
        assert_eq!(value["findings"][0]["verdict"], "PASS");
        assert_eq!(value["findings"][2]["verdict"], "UNKNOWN");
        assert_eq!(value["failed"], 1);
    }
}

// src/verify/mod.rs
//! Statistical quality gate for generated assets.
//!
//! Each verification run is a list of independent named checks folded into an
//! overall status. The overall status only ever worsens as checks are
//! appended (passed -> warning -> failed); skipped checks never affect it.

use serde::{Deserialize, Serialize};

pub mod clip;
pub mod image;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

/// How much a failing check matters: an `Error`-severity failure fails the
/// whole asset, a `Warning`-severity failure only flags it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl Check {
    pub fn passed(name: &str, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Passed,
            severity,
            expected: None,
            actual: None,
        }
    }

    pub fn failed(name: &str, severity: Severity) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Failed,
            severity,
            expected: None,
            actual: None,
        }
    }

    pub fn warning(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Warning,
            severity: Severity::Warning,
            expected: None,
            actual: None,
        }
    }

    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: CheckStatus::Skipped,
            severity: Severity::Warning,
            expected: None,
            actual: None,
        }
    }

    pub fn expected(mut self, value: impl ToString) -> Self {
        self.expected = Some(value.to_string());
        self
    }

    pub fn actual(mut self, value: impl ToString) -> Self {
        self.actual = Some(value.to_string());
        self
    }

    /// What this check contributes to the overall status.
    fn contribution(&self) -> CheckStatus {
        match (self.status, self.severity) {
            (CheckStatus::Failed, Severity::Error) => CheckStatus::Failed,
            (CheckStatus::Failed, Severity::Warning) => CheckStatus::Warning,
            (CheckStatus::Warning, _) => CheckStatus::Warning,
            _ => CheckStatus::Passed,
        }
    }
}

fn rank(status: CheckStatus) -> u8 {
    match status {
        CheckStatus::Passed | CheckStatus::Skipped => 0,
        CheckStatus::Warning => 1,
        CheckStatus::Failed => 2,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub reference: String,
    pub kind: String,
    pub checks: Vec<Check>,
    pub overall: CheckStatus,
}

impl VerificationReport {
    pub fn new(reference: &str, kind: &str) -> Self {
        Self {
            reference: reference.to_string(),
            kind: kind.to_string(),
            checks: Vec::new(),
            overall: CheckStatus::Passed,
        }
    }

    /// Append a check, worsening the overall status if warranted. The overall
    /// status never improves within one run.
    pub fn push(&mut self, check: Check) {
        let contribution = check.contribution();
        if rank(contribution) > rank(self.overall) {
            self.overall = contribution;
        }
        self.checks.push(check);
    }

    pub fn is_usable(&self) -> bool {
        self.overall != CheckStatus::Failed
    }

    pub fn overall_str(&self) -> &'static str {
        match self.overall {
            CheckStatus::Passed => "passed",
            CheckStatus::Warning => "warning",
            CheckStatus::Failed => "failed",
            CheckStatus::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_is_monotonic_worsening() {
        let mut report = VerificationReport::new("a.png", "image");
        assert_eq!(report.overall, CheckStatus::Passed);

        report.push(Check::warning("aspect_ratio"));
        assert_eq!(report.overall, CheckStatus::Warning);

        report.push(Check::failed("blank_frame", Severity::Error));
        assert_eq!(report.overall, CheckStatus::Failed);

        // A later passing check never improves the overall status.
        report.push(Check::passed("file_size", Severity::Error));
        assert_eq!(report.overall, CheckStatus::Failed);
    }

    #[test]
    fn test_warning_severity_failure_only_warns_overall() {
        let mut report = VerificationReport::new("b.mp4", "video");
        report.push(Check::failed("audio_track", Severity::Warning));
        assert_eq!(report.overall, CheckStatus::Warning);
        assert!(report.is_usable());
    }

    #[test]
    fn test_skipped_checks_never_affect_overall() {
        let mut report = VerificationReport::new("c.png", "image");
        report.push(Check::skipped("resolution"));
        report.push(Check::skipped("blank_frame"));
        assert_eq!(report.overall, CheckStatus::Passed);
    }
}

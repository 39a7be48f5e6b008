//! Skip-versus-fail classification of extraction exits.
//!
//! The toolkit signals a missing capability through diagnostic text rather
//! than a dedicated exit code. Matching that text is kept here, as an ordered
//! list of pattern rules, so the pipeline only sees a verdict.

use crate::config::ClassifierConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tqbundle_common::{Error, Result};
use tqbundle_manifest::PipelineStatus;

/// Longest diagnostic kept on the manifest.
const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Toolkit reports an unsupported plugin or function for this target.
pub static UNSUPPORTED_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)unsupported (plugin|function)").unwrap());

/// Toolkit could not find the requested function at all.
pub static NOT_FOUND_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)no (plugins?|functions?) (were |was )?(found|available)").unwrap()
});

/// Toolkit names a plugin as not present in this build.
pub static NOT_AVAILABLE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(plugin|function) ['"]?[\w.]+['"]? (is )?(not (found|available|installed)|unavailable)"#)
        .unwrap()
});

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    Skip,
    Fail,
}

/// One pattern rule.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub pattern: Regex,
    /// Restrict the rule to these exit codes.
    pub exit_codes: Option<Vec<i32>>,
    pub outcome: RuleOutcome,
}

impl ClassifierRule {
    pub fn new(pattern: Regex, outcome: RuleOutcome) -> Self {
        Self {
            pattern,
            exit_codes: None,
            outcome,
        }
    }

    fn applies(&self, report: &ExitReport<'_>) -> bool {
        let code_ok = match (&self.exit_codes, report.exit_code) {
            (None, _) => true,
            (Some(codes), Some(code)) => codes.contains(&code),
            (Some(_), None) => false,
        };
        code_ok && self.pattern.is_match(report.stderr)
    }

    /// First stderr line that matched, as the human-readable reason.
    fn reason(&self, stderr: &str) -> String {
        stderr
            .lines()
            .find(|line| self.pattern.is_match(line))
            .unwrap_or(stderr)
            .trim()
            .to_string()
    }
}

/// What the classifier sees of a finished extraction.
#[derive(Debug, Clone, Copy)]
pub struct ExitReport<'a> {
    /// `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr: &'a str,
    /// Bytes of record stream produced.
    pub record_bytes: u64,
}

/// Classification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: PipelineStatus,
    pub reason: Option<String>,
}

/// Ordered pattern → outcome rules.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassifierRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::toolkit_default()
    }
}

impl Classifier {
    /// Rules for the toolkit's capability-unavailable signatures.
    pub fn toolkit_default() -> Self {
        Self {
            rules: vec![
                ClassifierRule::new(UNSUPPORTED_PATTERN.clone(), RuleOutcome::Skip),
                ClassifierRule::new(NOT_FOUND_PATTERN.clone(), RuleOutcome::Skip),
                ClassifierRule::new(NOT_AVAILABLE_PATTERN.clone(), RuleOutcome::Skip),
            ],
        }
    }

    /// Configured extra rules first, then the toolkit defaults.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.extra_rules.len() + 3);
        for rule in &config.extra_rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                Error::Config(format!("Invalid classifier pattern {:?}: {}", rule.pattern, e))
            })?;
            rules.push(ClassifierRule {
                pattern,
                exit_codes: rule.exit_codes.clone(),
                outcome: rule.outcome,
            });
        }
        rules.extend(Self::toolkit_default().rules);
        Ok(Self { rules })
    }

    pub fn classify(&self, report: &ExitReport<'_>) -> Verdict {
        let clean_exit = report.exit_code == Some(0);

        if let Some(rule) = self.rules.iter().find(|r| r.applies(report)) {
            match rule.outcome {
                // Partial support still produced records worth keeping.
                RuleOutcome::Skip if clean_exit && report.record_bytes > 0 => {}
                RuleOutcome::Skip => {
                    return Verdict {
                        status: PipelineStatus::Skipped,
                        reason: Some(rule.reason(report.stderr)),
                    }
                }
                RuleOutcome::Fail => {
                    return Verdict {
                        status: PipelineStatus::Failed,
                        reason: Some(summarize_stderr(report.stderr, report.exit_code)),
                    }
                }
            }
        }

        if clean_exit {
            Verdict {
                status: PipelineStatus::Succeeded,
                reason: None,
            }
        } else {
            Verdict {
                status: PipelineStatus::Failed,
                reason: Some(summarize_stderr(report.stderr, report.exit_code)),
            }
        }
    }
}

/// Diagnostic text for a failed command: trimmed stderr, or the exit status.
pub fn summarize_stderr(stderr: &str, exit_code: Option<i32>) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return match exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        };
    }
    if trimmed.chars().count() <= MAX_DIAGNOSTIC_CHARS {
        return trimmed.to_string();
    }
    // Keep the tail; tracebacks end with the cause.
    let skip = trimmed.chars().count() - MAX_DIAGNOSTIC_CHARS;
    format!("...{}", trimmed.chars().skip(skip).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierRuleConfig;

    fn report(exit_code: Option<i32>, stderr: &str, record_bytes: u64) -> ExitReport<'_> {
        ExitReport {
            exit_code,
            stderr,
            record_bytes,
        }
    }

    #[test]
    fn test_clean_exit_succeeds() {
        let verdict = Classifier::default().classify(&report(Some(0), "", 120));
        assert_eq!(verdict.status, PipelineStatus::Succeeded);
        assert_eq!(verdict.reason, None);
    }

    #[test]
    fn test_unsupported_marker_skips() {
        let stderr = "2024-01-01 WARNING loading target\nUnsupported plugin: sru\n";
        let verdict = Classifier::default().classify(&report(Some(1), stderr, 0));
        assert_eq!(verdict.status, PipelineStatus::Skipped);
        assert_eq!(verdict.reason.as_deref(), Some("Unsupported plugin: sru"));

        let verdict = Classifier::default().classify(&report(Some(0), stderr, 0));
        assert_eq!(verdict.status, PipelineStatus::Skipped);
    }

    #[test]
    fn test_marker_with_records_still_succeeds() {
        let stderr = "Unsupported function `browser.passwords` for target";
        let verdict = Classifier::default().classify(&report(Some(0), stderr, 2048));
        assert_eq!(verdict.status, PipelineStatus::Succeeded);
    }

    #[test]
    fn test_other_nonzero_exit_fails() {
        let verdict =
            Classifier::default().classify(&report(Some(2), "OSError: cannot open disk1.img\n", 0));
        assert_eq!(verdict.status, PipelineStatus::Failed);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("OSError: cannot open disk1.img")
        );

        let verdict = Classifier::default().classify(&report(None, "", 0));
        assert_eq!(verdict.reason.as_deref(), Some("terminated by signal"));
    }

    #[test]
    fn test_not_available_signature() {
        let verdict = Classifier::default()
            .classify(&report(Some(1), "plugin 'yara' is not available", 0));
        assert_eq!(verdict.status, PipelineStatus::Skipped);
    }

    #[test]
    fn test_configured_rules_take_precedence() {
        let config = ClassifierConfig {
            extra_rules: vec![ClassifierRuleConfig {
                pattern: "(?i)unsupported plugin: evtx".to_string(),
                outcome: RuleOutcome::Fail,
                exit_codes: Some(vec![1]),
            }],
        };
        let classifier = Classifier::from_config(&config).unwrap();

        let verdict = classifier.classify(&report(Some(1), "Unsupported plugin: evtx", 0));
        assert_eq!(verdict.status, PipelineStatus::Failed);

        // Exit code outside the rule's set falls through to the defaults.
        let verdict = classifier.classify(&report(Some(3), "Unsupported plugin: evtx", 0));
        assert_eq!(verdict.status, PipelineStatus::Skipped);
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let config = ClassifierConfig {
            extra_rules: vec![ClassifierRuleConfig {
                pattern: "(unclosed".to_string(),
                outcome: RuleOutcome::Skip,
                exit_codes: None,
            }],
        };
        assert!(matches!(
            Classifier::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_summarize_keeps_tail() {
        let long = format!("{}END", "x".repeat(MAX_DIAGNOSTIC_CHARS + 10));
        let summary = summarize_stderr(&long, Some(1));
        assert!(summary.starts_with("..."));
        assert!(summary.ends_with("END"));
        assert_eq!(summary.chars().count(), MAX_DIAGNOSTIC_CHARS + 3);
    }
}

//! Manifest types returned to the workflow engine.

use crate::audit::{AuditEntry, AuditLog};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current manifest schema version.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Status of one (evidence, preset) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Overall outcome of a bundle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::SucceededWithWarnings => write!(f, "succeeded-with-warnings"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Why a preset failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Extraction or conversion exited abnormally, or could not be launched.
    ExtractionFailed,
    /// Inline rule text or rule paths were rejected before scanning.
    RuleBundleInvalid,
}

/// Non-fatal conditions recorded on the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The sink writer was unreachable or rejected records.
    SinkForwardingFailed,
    /// Forwarding was requested with a URI that could not be parsed.
    InvalidSinkUri,
    /// A mount or unmount step reported a problem.
    Mount,
}

/// One artifact file produced by a succeeded preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Evidence display name.
    pub evidence: String,
    /// Preset name.
    pub preset: String,
    /// Absolute or run-relative path of the artifact.
    pub path: String,
    /// File name of the artifact.
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// Whether the same record stream was forwarded to the sink.
    pub forwarded: bool,
}

/// A preset that was skipped because the toolkit lacks the capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPreset {
    pub evidence: Option<String>,
    pub preset: String,
    pub function: Option<String>,
    pub reason: String,
}

/// A preset that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPreset {
    /// `None` when the failure is not tied to one evidence input.
    pub evidence: Option<String>,
    pub preset: String,
    pub function: Option<String>,
    pub kind: FailureKind,
    pub diagnostic: String,
}

/// A warning that did not affect local output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestWarning {
    pub evidence: Option<String>,
    pub preset: Option<String>,
    pub kind: WarningKind,
    pub message: String,
}

/// Result of running one preset against one evidence input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Evidence display name.
    pub evidence: String,
    /// Evidence path as staged on local storage.
    pub evidence_path: String,
    pub preset: String,
    /// Toolkit function invoked.
    pub function: String,
    pub status: PipelineStatus,
    pub artifact: Option<ArtifactEntry>,
    /// Skip reason or failure diagnostic.
    pub diagnostic: Option<String>,
    pub forwarded: bool,
    /// Sink error, if forwarding was attempted and failed.
    pub sink_error: Option<String>,
    pub extraction_command: String,
    pub converter_command: Option<String>,
    pub extraction_stderr: String,
    pub converter_stderr: String,
    /// Bytes of record stream read from the extraction command.
    pub record_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<AuditEntry>,
}

impl PipelineResult {
    /// Start a result for one pair; status is filled in by the executor.
    pub fn new(
        evidence: impl Into<String>,
        evidence_path: impl Into<String>,
        preset: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            evidence: evidence.into(),
            evidence_path: evidence_path.into(),
            preset: preset.into(),
            function: function.into(),
            status: PipelineStatus::Failed,
            artifact: None,
            diagnostic: None,
            forwarded: false,
            sink_error: None,
            extraction_command: String::new(),
            converter_command: None,
            extraction_stderr: String::new(),
            converter_stderr: String::new(),
            record_bytes: 0,
            commands: Vec::new(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == PipelineStatus::Succeeded
    }
}

/// The manifest for one bundle run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Schema version for forward compatibility.
    pub schema_version: String,
    /// Unique identifier for this run.
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Canonical scope values that were requested.
    pub selection: Vec<String>,
    /// Display labels for the selection.
    pub selection_labels: Vec<String>,
    /// Preset names in execution order.
    pub presets: Vec<String>,
    /// Evidence display names in input order.
    pub inputs: Vec<String>,
    /// Sink URI with credentials masked, when forwarding was active.
    pub sink: Option<String>,
    pub artifacts: Vec<ArtifactEntry>,
    pub skipped: Vec<SkippedPreset>,
    pub failed: Vec<FailedPreset>,
    pub warnings: Vec<ManifestWarning>,
    pub results: Vec<PipelineResult>,
    pub outcome: RunOutcome,
}

impl Default for BundleManifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            completed_at: None,
            selection: Vec::new(),
            selection_labels: Vec::new(),
            presets: Vec::new(),
            inputs: Vec::new(),
            sink: None,
            artifacts: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            results: Vec::new(),
            outcome: RunOutcome::Failed,
        }
    }
}

impl BundleManifest {
    /// Record one pipeline result, deriving the artifact/skip/failure lists.
    pub fn record(&mut self, result: PipelineResult) {
        match result.status {
            PipelineStatus::Succeeded => {
                if let Some(ref artifact) = result.artifact {
                    self.artifacts.push(artifact.clone());
                }
            }
            PipelineStatus::Skipped => self.skipped.push(SkippedPreset {
                evidence: Some(result.evidence.clone()),
                preset: result.preset.clone(),
                function: Some(result.function.clone()),
                reason: result.diagnostic.clone().unwrap_or_default(),
            }),
            PipelineStatus::Failed => self.failed.push(FailedPreset {
                evidence: Some(result.evidence.clone()),
                preset: result.preset.clone(),
                function: Some(result.function.clone()),
                kind: FailureKind::ExtractionFailed,
                diagnostic: result.diagnostic.clone().unwrap_or_default(),
            }),
        }

        if let Some(ref error) = result.sink_error {
            self.warnings.push(ManifestWarning {
                evidence: Some(result.evidence.clone()),
                preset: Some(result.preset.clone()),
                kind: WarningKind::SinkForwardingFailed,
                message: error.clone(),
            });
        }

        self.results.push(result);
    }

    /// Record a failure that is not tied to one evidence input.
    pub fn record_failure(
        &mut self,
        preset: impl Into<String>,
        function: Option<String>,
        kind: FailureKind,
        diagnostic: impl Into<String>,
    ) {
        self.failed.push(FailedPreset {
            evidence: None,
            preset: preset.into(),
            function,
            kind,
            diagnostic: diagnostic.into(),
        });
    }

    /// Record a run-level warning.
    pub fn warn(&mut self, kind: WarningKind, message: impl Into<String>) {
        self.warnings.push(ManifestWarning {
            evidence: None,
            preset: None,
            kind,
            message: message.into(),
        });
    }

    /// Number of succeeded pairs.
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_succeeded()).count()
    }

    /// Outcome derived from the recorded results.
    ///
    /// `Failed` when nothing succeeded, `SucceededWithWarnings` when anything
    /// was skipped, failed or warned alongside at least one success.
    pub fn compute_outcome(&self) -> RunOutcome {
        if self.succeeded_count() == 0 {
            RunOutcome::Failed
        } else if self.skipped.is_empty() && self.failed.is_empty() && self.warnings.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::SucceededWithWarnings
        }
    }

    /// Stamp the completion time and settle the outcome.
    pub fn finalize(&mut self) {
        self.completed_at = Some(Utc::now());
        self.outcome = self.compute_outcome();
    }

    /// Audit log of every command launched, in result order.
    pub fn audit_log(&self) -> AuditLog {
        let mut log = AuditLog::new();
        for result in &self.results {
            for entry in &result.commands {
                log.add(entry.clone());
            }
        }
        log
    }
}

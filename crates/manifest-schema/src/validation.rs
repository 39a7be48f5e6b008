//! Manifest validation utilities.

use crate::manifest::{BundleManifest, PipelineStatus};
use crate::schema;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

/// Validation error type.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Schema validation failed: {0}")]
    SchemaError(String),

    #[error("Duplicate result for {evidence} / {preset}")]
    DuplicatePair { evidence: String, preset: String },

    #[error("Artifact recorded for non-succeeded preset {preset} on {evidence}")]
    ArtifactWithoutSuccess { evidence: String, preset: String },

    #[error("Succeeded preset {preset} on {evidence} has no artifact")]
    SuccessWithoutArtifact { evidence: String, preset: String },

    #[error("Outcome {recorded} does not match results (expected {expected})")]
    OutcomeMismatch { recorded: String, expected: String },

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result of manifest validation.
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a manifest document against the JSON schema.
pub fn validate_manifest_json(manifest: &Value) -> Result<ValidationResult, ValidationError> {
    let mut result = ValidationResult::new();

    let schema_value = schema::manifest_schema();
    let compiled = JSONSchema::compile(&schema_value)
        .map_err(|e| ValidationError::SchemaError(e.to_string()))?;

    let validation = compiled.validate(manifest);
    if let Err(errors) = validation {
        for error in errors {
            result.add_error(ValidationError::SchemaError(format!(
                "{} at {}",
                error, error.instance_path
            )));
        }
    }

    Ok(result)
}

/// Validate a manifest: schema plus run invariants.
pub fn validate_manifest(manifest: &BundleManifest) -> Result<ValidationResult, ValidationError> {
    let manifest_json = serde_json::to_value(manifest)?;
    let mut result = validate_manifest_json(&manifest_json)?;

    let mut seen: HashSet<(&str, &str)> = HashSet::new();
    for r in &manifest.results {
        if !seen.insert((r.evidence_path.as_str(), r.preset.as_str())) {
            result.add_error(ValidationError::DuplicatePair {
                evidence: r.evidence.clone(),
                preset: r.preset.clone(),
            });
        }

        // A records-only run feeds just the sink and writes no artifact.
        let forward_only =
            r.converter_command.is_none() && (r.forwarded || r.sink_error.is_some());
        match (r.status, r.artifact.is_some()) {
            (PipelineStatus::Succeeded, false) if !forward_only => {
                result.add_error(ValidationError::SuccessWithoutArtifact {
                    evidence: r.evidence.clone(),
                    preset: r.preset.clone(),
                })
            }
            (PipelineStatus::Skipped | PipelineStatus::Failed, true) => {
                result.add_error(ValidationError::ArtifactWithoutSuccess {
                    evidence: r.evidence.clone(),
                    preset: r.preset.clone(),
                })
            }
            _ => {}
        }
    }

    let expected = manifest.compute_outcome();
    if expected != manifest.outcome {
        result.add_error(ValidationError::OutcomeMismatch {
            recorded: manifest.outcome.to_string(),
            expected: expected.to_string(),
        });
    }

    if manifest.completed_at.is_none() {
        result.add_warning("Manifest has no completion time".to_string());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArtifactEntry, PipelineResult, RunOutcome};

    #[test]
    fn test_validate_manifest_minimal() {
        let manifest = serde_json::json!({
            "schema_version": "1.0.0",
            "run_id": "550e8400-e29b-41d4-a716-446655440000",
            "started_at": "2024-01-01T00:00:00Z",
            "presets": [],
            "artifacts": [],
            "skipped": [],
            "failed": [],
            "results": [],
            "outcome": "failed"
        });

        let result = validate_manifest_json(&manifest).unwrap();
        assert!(result.valid, "Errors: {:?}", result.errors);
    }

    #[test]
    fn test_validate_manifest_missing_field() {
        let manifest = serde_json::json!({
            "schema_version": "1.0.0"
        });

        let result = validate_manifest_json(&manifest).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn test_validate_rejects_artifact_on_skipped() {
        let mut manifest = BundleManifest::default();
        let mut skipped = PipelineResult::new("disk1.img", "/cases/disk1.img", "SRUM", "sru");
        skipped.status = PipelineStatus::Skipped;
        skipped.artifact = Some(ArtifactEntry {
            evidence: "disk1.img".to_string(),
            preset: "SRUM".to_string(),
            path: "/out/disk1-sru.csv".to_string(),
            file_name: "disk1-sru.csv".to_string(),
            size_bytes: 0,
            sha256: String::new(),
            forwarded: false,
        });
        manifest.results.push(skipped);
        manifest.finalize();

        let result = validate_manifest(&manifest).unwrap();
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::ArtifactWithoutSuccess { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_pair_and_stale_outcome() {
        let mut manifest = BundleManifest::default();
        let mut first = PipelineResult::new("disk1.img", "/cases/disk1.img", "Prefetch", "prefetch");
        first.diagnostic = Some("boom".to_string());
        manifest.record(first.clone());
        manifest.record(first);
        manifest.finalize();
        manifest.outcome = RunOutcome::Succeeded;

        let result = validate_manifest(&manifest).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::DuplicatePair { .. })));
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::OutcomeMismatch { .. })));
    }

    #[test]
    fn test_forward_only_success_needs_no_artifact() {
        let mut manifest = BundleManifest::default();
        let mut records =
            PipelineResult::new("disk1.img", "/cases/disk1.img", "Target info (records)", "target-info");
        records.status = PipelineStatus::Succeeded;
        records.forwarded = true;
        manifest.record(records.clone());
        manifest.finalize();
        assert!(validate_manifest(&manifest).unwrap().valid);

        let mut converted = records;
        converted.evidence_path = "/cases/disk2.img".to_string();
        converted.converter_command = Some("rdump -C".to_string());
        manifest.record(converted);
        manifest.finalize();
        let result = validate_manifest(&manifest).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::SuccessWithoutArtifact { .. })));
    }
}

//! Manifest schema definitions for tqbundle.
//!
//! This crate defines the structure of the run manifest returned to the
//! workflow engine, including per-pair pipeline results and the command
//! audit log.

pub mod audit;
pub mod manifest;
pub mod schema;
pub mod validation;

pub use audit::{AuditEntry, AuditLog, CommandRole};
pub use manifest::{
    ArtifactEntry, BundleManifest, FailedPreset, FailureKind, ManifestWarning, PipelineResult,
    PipelineStatus, RunOutcome, SkippedPreset, WarningKind,
};
pub use validation::validate_manifest;

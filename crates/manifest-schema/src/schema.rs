//! JSON schema definitions for manifest validation.

/// JSON Schema for the run manifest.
pub const MANIFEST_SCHEMA: &str = r#"{
  "$schema": "https://json-schema.org/draft/2020-12/schema",
  "$id": "https://tqbundle.dev/schemas/manifest.json",
  "title": "tqbundle Run Manifest",
  "type": "object",
  "required": ["schema_version", "run_id", "started_at", "presets", "artifacts", "skipped", "failed", "results", "outcome"],
  "properties": {
    "schema_version": {
      "type": "string",
      "pattern": "^\\d+\\.\\d+\\.\\d+$"
    },
    "run_id": {
      "type": "string",
      "format": "uuid"
    },
    "started_at": {
      "type": "string",
      "format": "date-time"
    },
    "completed_at": {
      "type": ["string", "null"],
      "format": "date-time"
    },
    "selection": { "type": "array", "items": { "type": "string" } },
    "selection_labels": { "type": "array", "items": { "type": "string" } },
    "presets": { "type": "array", "items": { "type": "string" } },
    "inputs": { "type": "array", "items": { "type": "string" } },
    "sink": { "type": ["string", "null"] },
    "artifacts": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["evidence", "preset", "path", "file_name", "size_bytes", "sha256"],
        "properties": {
          "evidence": { "type": "string" },
          "preset": { "type": "string" },
          "path": { "type": "string" },
          "file_name": { "type": "string" },
          "size_bytes": { "type": "integer", "minimum": 0 },
          "sha256": { "type": "string" },
          "forwarded": { "type": "boolean" }
        }
      }
    },
    "skipped": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["preset", "reason"],
        "properties": {
          "evidence": { "type": ["string", "null"] },
          "preset": { "type": "string" },
          "function": { "type": ["string", "null"] },
          "reason": { "type": "string" }
        }
      }
    },
    "failed": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["preset", "kind", "diagnostic"],
        "properties": {
          "evidence": { "type": ["string", "null"] },
          "preset": { "type": "string" },
          "function": { "type": ["string", "null"] },
          "kind": { "type": "string", "enum": ["extraction_failed", "rule_bundle_invalid"] },
          "diagnostic": { "type": "string" }
        }
      }
    },
    "warnings": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["kind", "message"],
        "properties": {
          "kind": { "type": "string", "enum": ["sink_forwarding_failed", "invalid_sink_uri", "mount"] },
          "message": { "type": "string" }
        }
      }
    },
    "results": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["evidence", "preset", "function", "status"],
        "properties": {
          "evidence": { "type": "string" },
          "evidence_path": { "type": "string" },
          "preset": { "type": "string" },
          "function": { "type": "string" },
          "status": { "type": "string", "enum": ["succeeded", "skipped", "failed"] },
          "diagnostic": { "type": ["string", "null"] },
          "forwarded": { "type": "boolean" },
          "extraction_command": { "type": "string" },
          "converter_command": { "type": ["string", "null"] }
        }
      }
    },
    "outcome": {
      "type": "string",
      "enum": ["succeeded", "succeeded-with-warnings", "failed"]
    }
  }
}"#;

/// Get the manifest schema as a JSON value.
pub fn manifest_schema() -> serde_json::Value {
    serde_json::from_str(MANIFEST_SCHEMA).expect("Invalid manifest schema")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_schema_parses() {
        let schema = manifest_schema();
        assert!(schema.is_object());
        assert_eq!(schema["type"], "object");
    }
}

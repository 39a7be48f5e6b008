//! Task parameters as supplied by the workflow engine.

use crate::orchestrator::{BundleRequest, EvidenceInput};
use crate::sink::SinkDirective;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tqbundle_common::Result;

/// A string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// Bundle task configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleTaskConfig {
    #[serde(default)]
    pub bundle_scopes: Option<OneOrMany>,
    /// Older single-scope key, used when `bundle_scopes` is absent.
    #[serde(default)]
    pub bundle_scope: Option<String>,
    #[serde(default)]
    pub yara_rule: Option<String>,
    #[serde(default)]
    pub yara_rule_paths: Option<OneOrMany>,
    #[serde(default)]
    pub sink_uri: Option<String>,
    #[serde(default)]
    pub forward_records: bool,
}

impl BundleTaskConfig {
    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Raw scope selectors.
    pub fn scopes(&self) -> Vec<String> {
        match (&self.bundle_scopes, &self.bundle_scope) {
            (Some(scopes), _) => scopes.clone().into_vec(),
            (None, Some(scope)) => vec![scope.clone()],
            (None, None) => Vec::new(),
        }
    }

    /// Rule paths as one newline-delimited string.
    pub fn rule_paths(&self) -> Option<String> {
        self.yara_rule_paths
            .clone()
            .map(|paths| paths.into_vec().join("\n"))
    }

    pub fn into_request(self, evidence: Vec<EvidenceInput>, output_dir: PathBuf) -> BundleRequest {
        BundleRequest {
            evidence,
            scopes: self.scopes(),
            yara_rule_paths: self.rule_paths(),
            yara_rule: self.yara_rule,
            sink: SinkDirective::new(self.sink_uri, self.forward_records),
            output_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scopes_list_or_string() {
        let config = BundleTaskConfig::from_json_str(
            r#"{"bundle_scopes": ["browser_activity", "usb"], "bundle_scope": "mft"}"#,
        )
        .unwrap();
        assert_eq!(config.scopes(), vec!["browser_activity", "usb"]);

        let config =
            BundleTaskConfig::from_json_str(r#"{"bundle_scopes": "browser,deleted"}"#).unwrap();
        assert_eq!(config.scopes(), vec!["browser,deleted"]);
    }

    #[test]
    fn test_legacy_scope_key() {
        let config = BundleTaskConfig::from_json_str(r#"{"bundle_scope": "mft_timeline"}"#).unwrap();
        assert_eq!(config.scopes(), vec!["mft_timeline"]);
        assert!(BundleTaskConfig::default().scopes().is_empty());
    }

    #[test]
    fn test_into_request() {
        let config = BundleTaskConfig::from_json_str(
            r#"{
                "yara_rule_paths": ["/rules/a.yar", "/rules/b.yar"],
                "sink_uri": "elastic+https://es:9200?index=case",
                "forward_records": true
            }"#,
        )
        .unwrap();
        let request = config.into_request(
            vec![EvidenceInput::new("/cases/disk1.img")],
            PathBuf::from("/out"),
        );
        assert_eq!(request.yara_rule_paths.as_deref(), Some("/rules/a.yar\n/rules/b.yar"));
        assert!(request.sink.is_requested());
        assert!(request.scopes.is_empty());
    }

    #[test]
    fn test_forwarding_defaults_off() {
        let config =
            BundleTaskConfig::from_json_str(r#"{"sink_uri": "elastic+https://es:9200"}"#).unwrap();
        assert!(!config.into_request(Vec::new(), PathBuf::new()).sink.is_requested());
    }
}

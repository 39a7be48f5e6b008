//! Engine configuration loaded from YAML.

use crate::classifier::RuleOutcome;
use crate::launcher::CommandLine;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tqbundle_common::{Error, Result};

/// Default arguments for the tabular converter.
pub const DEFAULT_CONVERTER_ARGS: &[&str] = &["-C", "--multi-timestamp"];

/// A program plus fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawToolCommand", into = "Vec<String>")]
pub struct ToolCommand(Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawToolCommand {
    Single(String),
    Many(Vec<String>),
}

impl From<RawToolCommand> for ToolCommand {
    fn from(raw: RawToolCommand) -> Self {
        match raw {
            RawToolCommand::Single(program) => ToolCommand(vec![program]),
            RawToolCommand::Many(parts) => ToolCommand(parts),
        }
    }
}

impl From<ToolCommand> for Vec<String> {
    fn from(cmd: ToolCommand) -> Self {
        cmd.0
    }
}

impl ToolCommand {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand(parts.into_iter().map(Into::into).collect())
    }

    /// Command line with the program and its fixed arguments.
    pub fn command_line(&self) -> CommandLine {
        let mut parts = self.0.iter();
        let program = parts.next().cloned().unwrap_or_default();
        CommandLine::new(program).args(parts.cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.0.first().map(|p| p.trim().is_empty()).unwrap_or(true)
    }
}

/// Which toolkit entry point a preset drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// Per-function record extraction.
    Query,
    /// Standard survey recipe.
    Info,
}

/// External toolkit commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub target_query: ToolCommand,
    pub target_info: ToolCommand,
    pub converter: ToolCommand,
    pub sink_writer: ToolCommand,
}

impl Default for ToolkitConfig {
    fn default() -> Self {
        Self {
            target_query: ToolCommand::new(["target-query"]),
            target_info: ToolCommand::new(["target-info"]),
            converter: ToolCommand::new(["rdump"]),
            sink_writer: ToolCommand::new(["rdump"]),
        }
    }
}

impl ToolkitConfig {
    pub fn command_for(&self, tool: Tool) -> &ToolCommand {
        match tool {
            Tool::Query => &self.target_query,
            Tool::Info => &self.target_info,
        }
    }
}

/// Extra skip/fail classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierRuleConfig {
    pub pattern: String,
    pub outcome: RuleOutcome,
    #[serde(default)]
    pub exit_codes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Evaluated before the built-in toolkit rules.
    pub extra_rules: Vec<ClassifierRuleConfig>,
}

/// Explicit mount step for toolkits that need exclusive image access.
///
/// Templates may use `{evidence}` and `{mountpoint}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    pub mount: Vec<String>,
    #[serde(default)]
    pub unmount: Vec<String>,
    /// Directory under which mountpoints are created (defaults to the temp dir).
    #[serde(default)]
    pub mount_root: Option<PathBuf>,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub toolkit: ToolkitConfig,
    /// Upper bound on concurrently running (evidence, preset) pairs.
    pub max_workers: usize,
    pub converter_args: Vec<String>,
    /// Read buffer size for the record stream fan-out.
    pub chunk_size: usize,
    pub classifier: ClassifierConfig,
    pub mount: Option<MountConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            toolkit: ToolkitConfig::default(),
            max_workers: 4,
            converter_args: DEFAULT_CONVERTER_ARGS.iter().map(|s| s.to_string()).collect(),
            chunk_size: 64 * 1024,
            classifier: ClassifierConfig::default(),
            mount: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".to_string()));
        }
        for (name, cmd) in [
            ("target_query", &self.toolkit.target_query),
            ("target_info", &self.toolkit.target_info),
            ("converter", &self.toolkit.converter),
            ("sink_writer", &self.toolkit.sink_writer),
        ] {
            if cmd.is_empty() {
                return Err(Error::Config(format!("toolkit.{} has no program", name)));
            }
        }
        if let Some(ref mount) = self.mount {
            if mount.mount.is_empty() {
                return Err(Error::Config("mount.mount has no program".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.converter_args, vec!["-C", "--multi-timestamp"]);
        assert_eq!(
            config.toolkit.command_for(Tool::Query).command_line().program,
            "target-query"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
toolkit:
  target_query: ["python3", "-m", "dissect.target.tools.query"]
  converter: rdump
max_workers: 8
classifier:
  extra_rules:
    - pattern: "(?i)no such plugin"
      outcome: skip
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_workers, 8);

        let query = config.toolkit.target_query.command_line();
        assert_eq!(query.program, "python3");
        assert_eq!(query.args, vec!["-m", "dissect.target.tools.query"]);
        assert_eq!(config.toolkit.converter.command_line().program, "rdump");
        assert_eq!(config.toolkit.sink_writer.command_line().program, "rdump");
        assert_eq!(config.classifier.extra_rules.len(), 1);
        assert_eq!(config.classifier.extra_rules[0].outcome, RuleOutcome::Skip);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = EngineConfig::from_yaml_str("max_workers: 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_empty_program() {
        let err = EngineConfig::from_yaml_str("toolkit:\n  converter: []\n").unwrap_err();
        assert!(err.to_string().contains("converter"));
    }
}

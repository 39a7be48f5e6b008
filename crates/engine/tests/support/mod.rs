//! Shell-script stand-ins for the extraction toolkit.

#![allow(dead_code)]

use assert_fs::prelude::*;
use assert_fs::TempDir;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tqbundle_engine::config::ToolCommand;
use tqbundle_engine::{EngineConfig, LocalLauncher, Orchestrator, RecordingLauncher};

pub const RULE: &str = r#"
rule suspicious_marker {
    strings:
        $a = "evil"
    condition:
        $a
}
"#;

/// How the fake toolkit misbehaves.
#[derive(Default)]
pub struct Behaviour {
    /// Functions reported as unsupported in this build.
    pub unsupported: Vec<&'static str>,
    /// Functions that crash.
    pub failing: Vec<&'static str>,
    /// Functions that hang until killed.
    pub slow: Vec<&'static str>,
    /// Sink writer rejects the stream.
    pub sink_fails: bool,
}

pub struct FakeToolkit {
    pub dir: TempDir,
    pub log: PathBuf,
    pub sink_out: PathBuf,
}

fn script(dir: &TempDir, name: &str, body: String) -> PathBuf {
    let file = dir.child(name);
    file.write_str(&body).unwrap();
    file.path().to_path_buf()
}

impl FakeToolkit {
    pub fn new() -> Self {
        Self::with_behaviour(Behaviour::default())
    }

    pub fn with_behaviour(behaviour: Behaviour) -> Self {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("invocations.log");
        let sink_out = dir.path().join("sink.out");

        script(
            &dir,
            "target-query.sh",
            format!(
                r#"evidence="$1"
function="$3"
echo "query $function $evidence" >> '{log}'
if [ ! -r "$evidence" ]; then
  echo "OSError: cannot open $evidence" >&2
  exit 1
fi
if [ "$function" = yara ]; then
  shift 4
  echo "rules $*" >> '{log}'
fi
case " {unsupported} " in *" $function "*) echo "Unsupported plugin: $function" >&2; exit 1;; esac
case " {failing} " in *" $function "*) echo "RuntimeError: $function exploded" >&2; exit 2;; esac
case " {slow} " in *" $function "*) exec sleep 30;; esac
printf 'record:%s:%s\n' "$function" "$(basename "$evidence")"
if [ "$function" = yara ]; then
  for rule in "$@"; do printf 'rule:%s\n' "$rule"; done
fi
"#,
                log = log.display(),
                unsupported = behaviour.unsupported.join(" "),
                failing = behaviour.failing.join(" "),
                slow = behaviour.slow.join(" "),
            ),
        );

        script(
            &dir,
            "rdump.sh",
            format!(
                r#"echo "converter $*" >> '{log}'
echo "function,evidence"
cat
"#,
                log = log.display()
            ),
        );

        let fail = if behaviour.sink_fails {
            "echo 'connection refused' >&2\nexit 1"
        } else {
            ""
        };
        script(
            &dir,
            "sink.sh",
            format!(
                r#"echo "sink $2" >> '{log}'
cat >> '{out}'
{fail}
"#,
                log = log.display(),
                out = sink_out.display(),
                fail = fail
            ),
        );

        script(
            &dir,
            "target-info.sh",
            format!(
                r#"echo "info $*" >> '{log}'
if [ "$2" = "-r" ]; then
  printf 'record:target-info:%s\n' "$(basename "$1")"
else
  printf 'Hostname: %s\nOS: windows\n' "$(basename "$1")"
fi
"#,
                log = log.display()
            ),
        );

        Self { dir, log, sink_out }
    }

    fn tool(&self, name: &str) -> ToolCommand {
        ToolCommand::new(["sh".to_string(), self.dir.path().join(name).display().to_string()])
    }

    pub fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.toolkit.target_query = self.tool("target-query.sh");
        config.toolkit.converter = self.tool("rdump.sh");
        config.toolkit.sink_writer = self.tool("sink.sh");
        config.toolkit.target_info = self.tool("target-info.sh");
        config
    }

    /// Logged invocations of one fake tool (`query`, `rules`, `converter`, `sink`, `info`).
    pub fn invocations(&self, tool: &str) -> Vec<String> {
        let prefix = format!("{} ", tool);
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .filter(|line| line.starts_with(&prefix))
            .map(|line| line[prefix.len()..].to_string())
            .collect()
    }

    /// Every logged line, in order.
    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn sink_contents(&self) -> String {
        std::fs::read_to_string(&self.sink_out).unwrap_or_default()
    }
}

pub type Recorder = Arc<RecordingLauncher<LocalLauncher>>;

pub fn orchestrator(toolkit: &FakeToolkit) -> (Orchestrator, Recorder) {
    orchestrator_with(toolkit.config())
}

pub fn orchestrator_with(config: EngineConfig) -> (Orchestrator, Recorder) {
    let launcher = Arc::new(RecordingLauncher::new(LocalLauncher::new()));
    let orchestrator = Orchestrator::new(launcher.clone(), config).unwrap();
    (orchestrator, launcher)
}

/// A readable evidence file.
pub fn evidence(dir: &TempDir, name: &str) -> PathBuf {
    let file = dir.child(name);
    file.write_str("not really a disk image").unwrap();
    file.path().to_path_buf()
}

/// Files left with a `.partial` suffix.
pub fn partial_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "partial"))
                .collect()
        })
        .unwrap_or_default()
}

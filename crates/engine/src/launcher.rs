//! Process launching for toolkit commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::debug;

/// A program and its arguments, never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-quoted rendering for logs and the manifest.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| quote(part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

fn quote(part: &str) -> String {
    let plain = !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c));
    if plain {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}

/// Where a child's standard output goes.
#[derive(Debug)]
pub enum StdoutTarget {
    Piped,
    File(std::fs::File),
    Null,
}

/// Everything needed to start one child process.
#[derive(Debug)]
pub struct LaunchSpec {
    pub command: CommandLine,
    /// Open a pipe to the child's stdin; otherwise stdin is null.
    pub stdin_piped: bool,
    pub stdout: StdoutTarget,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Stdout piped, stdin closed.
    pub fn producer(command: CommandLine) -> Self {
        Self {
            command,
            stdin_piped: false,
            stdout: StdoutTarget::Piped,
            working_dir: None,
        }
    }

    /// Stdin piped, stdout to `stdout`.
    pub fn consumer(command: CommandLine, stdout: StdoutTarget) -> Self {
        Self {
            command,
            stdin_piped: true,
            stdout,
            working_dir: None,
        }
    }
}

/// Starts child processes. Stderr is always piped.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Child>;
}

/// Launches processes on the local host.
pub struct LocalLauncher;

impl LocalLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve a bare program name on `PATH`; paths are used as given.
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    which::which(program).with_context(|| format!("Program not found on PATH: {}", program))
}

#[async_trait]
impl ProcessLauncher for LocalLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Child> {
        debug!("Local launch: {}", spec.command);

        let program = resolve_program(&spec.command.program)?;
        let mut cmd = Command::new(&program);
        cmd.args(&spec.command.args)
            .stdin(if spec.stdin_piped {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(match spec.stdout {
                StdoutTarget::Piped => Stdio::piped(),
                StdoutTarget::File(file) => Stdio::from(file),
                StdoutTarget::Null => Stdio::null(),
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn()
            .with_context(|| format!("Failed to launch {}", program.display()))
    }
}

/// Launcher wrapper that records every command it is asked to start.
pub struct RecordingLauncher<L> {
    inner: L,
    calls: Arc<Mutex<Vec<CommandLine>>>,
}

impl<L: ProcessLauncher> RecordingLauncher<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Commands launched so far, in launch order.
    pub fn calls(&self) -> Vec<CommandLine> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of launches whose program ends with `name`.
    pub fn count_program(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.program.ends_with(name) || c.args.iter().any(|a| a.ends_with(name)))
            .count()
    }
}

#[async_trait]
impl<L: ProcessLauncher> ProcessLauncher for RecordingLauncher<L> {
    async fn launch(&self, spec: LaunchSpec) -> Result<Child> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(spec.command.clone());
        }
        self.inner.launch(spec).await
    }
}

/// Read a child pipe to the end, lossily decoded.
pub async fn read_lossy<R: AsyncRead + Unpin>(reader: Option<R>) -> (String, u64) {
    let Some(mut reader) = reader else {
        return (String::new(), 0);
    };
    let mut buf = Vec::new();
    // A read error just truncates the diagnostics.
    let _ = reader.read_to_end(&mut buf).await;
    let len = buf.len() as u64;
    (String::from_utf8_lossy(&buf).into_owned(), len)
}

/// Output of a command run to completion with both streams captured.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub command: CommandLine,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command with stdout and stderr captured in memory.
pub async fn capture_command(
    launcher: &dyn ProcessLauncher,
    command: CommandLine,
    working_dir: Option<&Path>,
) -> Result<CapturedOutput> {
    let started_at = Utc::now();
    let mut spec = LaunchSpec::producer(command.clone());
    spec.working_dir = working_dir.map(Path::to_path_buf);

    let mut child = launcher.launch(spec).await?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_task = async move {
        let mut buf = Vec::new();
        if let Some(mut out) = stdout {
            out.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let (stdout, (stderr, _)) = tokio::join!(stdout_task, read_lossy(stderr));
    let stdout = stdout.context("Failed to read command output")?;
    let status = child
        .wait()
        .await
        .with_context(|| format!("Failed to wait for {}", command.program))?;

    Ok(CapturedOutput {
        command,
        exit_code: status.code(),
        stdout,
        stderr,
        started_at,
        completed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_when_needed() {
        let cmd = CommandLine::new("rdump")
            .args(["-C", "--multi-timestamp", "-s"])
            .arg(r#"r.EventID in [1006]"#);
        assert_eq!(
            cmd.display(),
            "rdump -C --multi-timestamp -s 'r.EventID in [1006]'"
        );
        assert_eq!(CommandLine::new("echo").arg("it's").display(), r"echo 'it'\''s'");
        assert_eq!(CommandLine::new("echo").arg("").display(), "echo ''");
    }

    #[test]
    fn test_resolve_program_keeps_paths() {
        assert_eq!(
            resolve_program("/opt/toolkit/bin/target-query").unwrap(),
            PathBuf::from("/opt/toolkit/bin/target-query")
        );
        assert!(resolve_program("surely-not-a-real-program-name").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capture_command() {
        let launcher = RecordingLauncher::new(LocalLauncher::new());
        let cmd = CommandLine::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = capture_command(&launcher, cmd, None).await.unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert!(!output.success());
        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(launcher.calls().len(), 1);
        assert_eq!(launcher.count_program("sh"), 1);
    }

    #[tokio::test]
    async fn test_launch_unknown_program_fails() {
        let launcher = LocalLauncher::new();
        let err = launcher
            .launch(LaunchSpec::producer(CommandLine::new("surely-not-a-real-program-name")))
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("not found"));
    }
}

//! Pipeline executor: one preset against one evidence input.
//!
//! The extraction command is launched once. Its stdout is fanned out to the
//! tabular converter (whose stdout is the artifact file) and, when forwarding
//! is active, to the sink writer. The converter writes into a `.partial` file
//! that is renamed into place only when the pair succeeds.

use crate::catalog::Preset;
use crate::classifier::{summarize_stderr, Classifier, ExitReport};
use crate::config::EngineConfig;
use crate::fanout::{fan_out, FanOutReport, TeeTarget};
use crate::launcher::{read_lossy, CommandLine, LaunchSpec, ProcessLauncher, StdoutTarget};
use crate::sink::SinkTarget;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tqbundle_common::{hash, Error, Result};
use tqbundle_manifest::{ArtifactEntry, AuditEntry, CommandRole, PipelineResult, PipelineStatus};
use tracing::{debug, error, info, warn};

/// One (evidence, preset) pair, ready to run.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    /// Evidence display name.
    pub evidence: String,
    /// Evidence path as staged.
    pub evidence_path: String,
    /// Path handed to the toolkit: the evidence path, or its mountpoint.
    pub target_path: String,
    pub preset: &'static Preset,
    pub rule_paths: Arc<[String]>,
    pub sink: Option<Arc<SinkTarget>>,
    /// Artifact destination; `None` runs without a converter.
    pub artifact_path: Option<PathBuf>,
}

/// Artifact file being written; removed on drop unless committed.
pub(crate) struct PartialArtifact {
    partial: PathBuf,
    destination: PathBuf,
    committed: bool,
}

impl PartialArtifact {
    pub(crate) fn create(destination: &Path) -> std::io::Result<(Self, std::fs::File)> {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".partial");
        let partial = destination.with_file_name(name);
        let file = std::fs::File::create(&partial)?;
        Ok((
            Self {
                partial,
                destination: destination.to_path_buf(),
                committed: false,
            },
            file,
        ))
    }

    pub(crate) fn commit(mut self) -> std::io::Result<PathBuf> {
        std::fs::rename(&self.partial, &self.destination)?;
        self.committed = true;
        Ok(self.destination.clone())
    }
}

impl Drop for PartialArtifact {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_file(&self.partial) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.partial.display(), e);
                }
            }
        }
    }
}

/// Everything observed once the streams close and the children exit.
struct Finished {
    fan: std::io::Result<FanOutReport<tokio::process::ChildStdin>>,
    extraction_stderr: (String, u64),
    converter_stderr: (String, u64),
    sink_stderr: (String, u64),
    extraction_status: std::io::Result<std::process::ExitStatus>,
    converter_status: Option<std::io::Result<std::process::ExitStatus>>,
    sink_status: Option<std::io::Result<std::process::ExitStatus>>,
}

fn exit_code(status: &std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    status.as_ref().ok().and_then(|s| s.code())
}

/// Runs pipeline jobs.
#[derive(Clone)]
pub struct PipelineExecutor {
    launcher: Arc<dyn ProcessLauncher>,
    config: Arc<EngineConfig>,
    classifier: Arc<Classifier>,
}

impl PipelineExecutor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: Arc<EngineConfig>,
        classifier: Arc<Classifier>,
    ) -> Self {
        Self {
            launcher,
            config,
            classifier,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn launcher(&self) -> &Arc<dyn ProcessLauncher> {
        &self.launcher
    }

    /// Extraction command for a job.
    pub fn extraction_command(&self, job: &PipelineJob) -> CommandLine {
        self.config
            .toolkit
            .command_for(job.preset.tool)
            .command_line()
            .args(job.preset.render(&job.target_path, &job.rule_paths))
    }

    /// Converter command for a preset.
    pub fn converter_command(&self, preset: &Preset) -> CommandLine {
        let converter = self.config.toolkit.converter.command_line();
        match preset.converter_args {
            Some(args) => converter.args(args.iter().copied()),
            None => converter.args(self.config.converter_args.iter().cloned()),
        }
    }

    /// Run one job to completion.
    ///
    /// Every per-pair problem is reported through the returned result. The
    /// only error is `Cancelled`, after the children have been killed and the
    /// partial artifact removed.
    pub async fn run(&self, job: &PipelineJob, cancel: &CancellationToken) -> Result<PipelineResult> {
        let preset = job.preset;
        let mut result = PipelineResult::new(
            &job.evidence,
            &job.evidence_path,
            preset.name,
            preset.function,
        );
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let extraction_cmd = self.extraction_command(job);
        result.extraction_command = extraction_cmd.display();
        info!("[{}] {}: {}", job.evidence, preset.name, result.extraction_command);

        let started_at = Utc::now();
        let mut extraction = match self.launcher.launch(LaunchSpec::producer(extraction_cmd)).await {
            Ok(child) => child,
            Err(e) => {
                let diagnostic = format!("{:#}", e);
                error!("[{}] {} could not be launched: {}", job.evidence, preset.name, diagnostic);
                result.commands.push(AuditEntry::launch_failure(
                    result.extraction_command.clone(),
                    CommandRole::Extraction,
                    diagnostic.clone(),
                ));
                result.diagnostic = Some(diagnostic);
                return Ok(result);
            }
        };

        let mut partial: Option<PartialArtifact> = None;
        let mut converter: Option<Child> = None;
        if let Some(ref destination) = job.artifact_path {
            let cmd = self.converter_command(preset);
            let shown = cmd.display();
            result.converter_command = Some(shown.clone());
            let launched = match PartialArtifact::create(destination) {
                Ok((artifact, file)) => {
                    partial = Some(artifact);
                    self.launcher
                        .launch(LaunchSpec::consumer(cmd, StdoutTarget::File(file)))
                        .await
                }
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("Failed to create {}", destination.display()))),
            };
            match launched {
                Ok(child) => converter = Some(child),
                Err(e) => {
                    let _ = extraction.kill().await;
                    let diagnostic = format!("Converter could not be launched: {:#}", e);
                    error!("[{}] {}: {}", job.evidence, preset.name, diagnostic);
                    result.commands.push(AuditEntry::new(
                        result.extraction_command.clone(),
                        CommandRole::Extraction,
                        started_at,
                        Utc::now(),
                        None,
                        0,
                        0,
                        Some("killed: no consumer for the record stream".to_string()),
                    ));
                    result.commands.push(AuditEntry::launch_failure(
                        shown,
                        CommandRole::Converter,
                        diagnostic.clone(),
                    ));
                    result.diagnostic = Some(diagnostic);
                    return Ok(result);
                }
            }
        }

        let mut sink: Option<Child> = None;
        let mut sink_shown: Option<String> = None;
        if let Some(ref target) = job.sink {
            let cmd = target.writer_command(&self.config.toolkit.sink_writer);
            let shown = target.redacted_command(&cmd);
            debug!("[{}] {}: forwarding via {}", job.evidence, preset.name, shown);
            match self
                .launcher
                .launch(LaunchSpec::consumer(cmd, StdoutTarget::Null))
                .await
            {
                Ok(child) => sink = Some(child),
                Err(e) => {
                    let message = target.redact_text(&format!("{:#}", e));
                    warn!("[{}] {}: sink writer unavailable: {}", job.evidence, preset.name, message);
                    result.commands.push(AuditEntry::launch_failure(
                        shown.clone(),
                        CommandRole::SinkWriter,
                        message.clone(),
                    ));
                    result.sink_error = Some(message);
                }
            }
            sink_shown = Some(shown);
        }

        let mut targets = Vec::with_capacity(2);
        let converter_slot = converter.as_mut().and_then(|c| c.stdin.take()).map(|stdin| {
            targets.push(TeeTarget::new("converter", stdin));
            targets.len() - 1
        });
        let sink_slot = sink.as_mut().and_then(|c| c.stdin.take()).map(|stdin| {
            targets.push(TeeTarget::new("sink", stdin));
            targets.len() - 1
        });

        let record_stream = extraction.stdout.take();
        let extraction_stderr = extraction.stderr.take();
        let converter_stderr = converter.as_mut().and_then(|c| c.stderr.take());
        let sink_stderr = sink.as_mut().and_then(|c| c.stderr.take());
        let chunk_size = self.config.chunk_size;

        let work = async {
            let fan = async move {
                match record_stream {
                    Some(stream) => fan_out(stream, targets, chunk_size).await,
                    None => Ok(FanOutReport {
                        bytes_read: 0,
                        targets,
                    }),
                }
            };
            let (fan, extraction_stderr, converter_stderr, sink_stderr) = tokio::join!(
                fan,
                read_lossy(extraction_stderr),
                read_lossy(converter_stderr),
                read_lossy(sink_stderr)
            );
            let extraction_status = extraction.wait().await;
            let converter_status = match converter.as_mut() {
                Some(child) => Some(child.wait().await),
                None => None,
            };
            let sink_status = match sink.as_mut() {
                Some(child) => Some(child.wait().await),
                None => None,
            };
            Finished {
                fan,
                extraction_stderr,
                converter_stderr,
                sink_stderr,
                extraction_status,
                converter_status,
                sink_status,
            }
        };

        let finished = tokio::select! {
            finished = work => Some(finished),
            _ = cancel.cancelled() => None,
        };
        let Some(finished) = finished else {
            warn!("[{}] {} cancelled", job.evidence, preset.name);
            for child in [Some(&mut extraction), converter.as_mut(), sink.as_mut()]
                .into_iter()
                .flatten()
            {
                let _ = child.kill().await;
            }
            return Err(Error::Cancelled);
        };
        let completed_at = Utc::now();

        let (extraction_stderr, extraction_stderr_len) = finished.extraction_stderr;
        let (converter_stderr, converter_stderr_len) = finished.converter_stderr;
        let (sink_stderr, sink_stderr_len) = finished.sink_stderr;
        result.extraction_stderr = extraction_stderr.trim().to_string();
        result.converter_stderr = converter_stderr.trim().to_string();

        let (bytes_read, stream_error, converter_write_error, sink_write_error) = match finished.fan {
            Ok(report) => {
                let error_at = |slot: Option<usize>| {
                    slot.and_then(|i| report.targets.get(i))
                        .and_then(|t| t.error.as_ref())
                        .map(|e| e.to_string())
                };
                (
                    report.bytes_read,
                    None,
                    error_at(converter_slot),
                    error_at(sink_slot),
                )
            }
            Err(e) => (0, Some(format!("Failed to read record stream: {}", e)), None, None),
        };
        result.record_bytes = bytes_read;

        let extraction_exit = exit_code(&finished.extraction_status);
        let verdict = self.classifier.classify(&ExitReport {
            exit_code: extraction_exit,
            stderr: &extraction_stderr,
            record_bytes: bytes_read,
        });
        let mut status = verdict.status;
        let mut diagnostic = verdict.reason;

        if status == PipelineStatus::Succeeded {
            if let Err(ref e) = finished.extraction_status {
                status = PipelineStatus::Failed;
                diagnostic = Some(format!("Failed to wait for extraction: {}", e));
            } else if let Some(e) = stream_error {
                status = PipelineStatus::Failed;
                diagnostic = Some(e);
            }
        }

        let converter_exit = finished.converter_status.as_ref().map(exit_code);
        if status == PipelineStatus::Succeeded && converter_exit.is_some() {
            let clean = converter_exit == Some(Some(0)) && converter_write_error.is_none();
            if !clean {
                status = PipelineStatus::Failed;
                let detail = match (converter_exit, converter_write_error) {
                    (Some(Some(0)), Some(e)) => format!("stopped reading records: {}", e),
                    (code, _) => summarize_stderr(&converter_stderr, code.flatten()),
                };
                diagnostic = Some(format!("Converter failed: {}", detail));
            }
        }

        let sink_exit = finished.sink_status.as_ref().map(exit_code);
        let mut sink_ok = false;
        if let (Some(target), Some(code)) = (job.sink.as_ref(), sink_exit) {
            let problem = if code != Some(0) {
                Some(summarize_stderr(&sink_stderr, code))
            } else {
                sink_write_error.map(|e| format!("stopped accepting records: {}", e))
            };
            match problem {
                Some(problem) => {
                    let message = target.redact_text(&problem);
                    warn!("[{}] {}: sink forwarding failed: {}", job.evidence, preset.name, message);
                    result.sink_error = Some(message);
                }
                None => sink_ok = true,
            }
        }
        result.forwarded = sink_ok && status == PipelineStatus::Succeeded;

        if status == PipelineStatus::Succeeded {
            if let Some(artifact) = partial.take() {
                match finalize_artifact(artifact, &job.evidence, preset.name, result.forwarded).await {
                    Ok(entry) => result.artifact = Some(entry),
                    Err(e) => {
                        status = PipelineStatus::Failed;
                        diagnostic = Some(format!("Failed to finalize artifact: {}", e));
                    }
                }
            }
        }
        // An uncommitted partial file is removed here.
        drop(partial);

        result.commands.push(AuditEntry::new(
            result.extraction_command.clone(),
            CommandRole::Extraction,
            started_at,
            completed_at,
            extraction_exit,
            bytes_read,
            extraction_stderr_len,
            (extraction_exit != Some(0))
                .then(|| summarize_stderr(&extraction_stderr, extraction_exit)),
        ));
        if let (Some(shown), Some(code)) = (result.converter_command.clone(), converter_exit) {
            result.commands.push(AuditEntry::new(
                shown,
                CommandRole::Converter,
                started_at,
                completed_at,
                code,
                result.artifact.as_ref().map(|a| a.size_bytes).unwrap_or(0),
                converter_stderr_len,
                (code != Some(0)).then(|| summarize_stderr(&converter_stderr, code)),
            ));
        }
        if let (Some(shown), Some(code)) = (sink_shown, sink_exit) {
            result.commands.push(AuditEntry::new(
                shown,
                CommandRole::SinkWriter,
                started_at,
                completed_at,
                code,
                0,
                sink_stderr_len,
                result.sink_error.clone(),
            ));
        }

        result.status = status;
        result.diagnostic = diagnostic;
        match status {
            PipelineStatus::Succeeded => match result.artifact {
                Some(ref artifact) => info!(
                    "[{}] {} succeeded: {} ({} bytes)",
                    job.evidence, preset.name, artifact.file_name, artifact.size_bytes
                ),
                None => info!("[{}] {} succeeded", job.evidence, preset.name),
            },
            PipelineStatus::Skipped => warn!(
                "[{}] {} skipped: {}",
                job.evidence,
                preset.name,
                result.diagnostic.as_deref().unwrap_or_default()
            ),
            PipelineStatus::Failed => error!(
                "[{}] {} failed: {}",
                job.evidence,
                preset.name,
                result.diagnostic.as_deref().unwrap_or_default()
            ),
        }

        Ok(result)
    }
}

/// Move the artifact into place and describe it.
pub(crate) async fn finalize_artifact(
    artifact: PartialArtifact,
    evidence: &str,
    preset: &str,
    forwarded: bool,
) -> Result<ArtifactEntry> {
    let path = artifact.commit()?;
    let hashed = path.clone();
    let (sha256, size_bytes) = tokio::task::spawn_blocking(move || hash::sha256_file(&hashed))
        .await
        .map_err(|e| Error::Other(format!("Hashing task failed: {}", e)))??;

    Ok(ArtifactEntry {
        evidence: evidence.to_string(),
        preset: preset.to_string(),
        path: path.to_string_lossy().into_owned(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes,
        sha256,
        forwarded,
    })
}

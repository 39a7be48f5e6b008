//! Single-recipe tasks: the standard survey and ad-hoc console scripts.

use crate::catalog::SURVEY_RECORDS;
use crate::classifier::summarize_stderr;
use crate::launcher::{read_lossy, CommandLine, LaunchSpec, ProcessLauncher, StdoutTarget};
use crate::orchestrator::{allocate_stems, usable_inputs, EvidenceInput};
use crate::pipeline::{finalize_artifact, PartialArtifact, PipelineExecutor, PipelineJob};
use crate::sink::SinkDirective;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tqbundle_common::{Error, Result};
use tqbundle_manifest::{
    AuditEntry, BundleManifest, CommandRole, PipelineResult, PipelineStatus, WarningKind,
};
use tracing::{error, info, warn};

/// Preset name recorded for the survey's text report.
pub const SURVEY_REPORT: &str = "Target info";

#[derive(Debug, Clone, Default)]
pub struct SurveyRequest {
    pub evidence: Vec<EvidenceInput>,
    /// Also write the survey as a tabular artifact.
    pub export_records: bool,
    pub sink: SinkDirective,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub evidence: Vec<EvidenceInput>,
    /// Console script to run, e.g. `target-dd`.
    pub script: String,
    /// Shell-style argument string placed before the evidence path.
    pub arguments: Option<String>,
    pub output_dir: PathBuf,
}

/// Split a shell-style argument string; newlines separate words too.
pub fn split_arguments(raw: &str) -> Result<Vec<String>> {
    shlex::split(raw)
        .ok_or_else(|| Error::Config(format!("Unbalanced quoting in arguments: {}", raw)))
}

/// Run `command` with stdout written to `destination`.
async fn capture_to_file(
    launcher: &dyn ProcessLauncher,
    input: &EvidenceInput,
    preset: &str,
    role: CommandRole,
    command: CommandLine,
    destination: &Path,
    cancel: &CancellationToken,
) -> Result<PipelineResult> {
    let name = input.display();
    let mut result = PipelineResult::new(&name, input.path.to_string_lossy(), preset, preset);
    result.extraction_command = command.display();
    info!("[{}] {}: {}", name, preset, result.extraction_command);

    let started_at = Utc::now();
    let launched = match PartialArtifact::create(destination) {
        Ok((artifact, file)) => launcher
            .launch(LaunchSpec {
                command,
                stdin_piped: false,
                stdout: StdoutTarget::File(file),
                working_dir: None,
            })
            .await
            .map(|child| (artifact, child)),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to create {}", destination.display()))),
    };
    let (artifact, mut child) = match launched {
        Ok(launched) => launched,
        Err(e) => {
            let diagnostic = format!("{:#}", e);
            error!("[{}] {} could not be launched: {}", name, preset, diagnostic);
            result.commands.push(AuditEntry::launch_failure(
                result.extraction_command.clone(),
                role,
                diagnostic.clone(),
            ));
            result.diagnostic = Some(diagnostic);
            return Ok(result);
        }
    };

    let stderr = child.stderr.take();
    let work = async {
        let stderr = read_lossy(stderr).await;
        let status = child.wait().await;
        (stderr, status)
    };
    let finished = tokio::select! {
        finished = work => Some(finished),
        _ = cancel.cancelled() => None,
    };
    let Some(((stderr, stderr_len), status)) = finished else {
        let _ = child.kill().await;
        return Err(Error::Cancelled);
    };

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    result.extraction_stderr = stderr.trim().to_string();

    if exit_code == Some(0) {
        if !result.extraction_stderr.is_empty() {
            warn!("[{}] {} reported warnings: {}", name, preset, result.extraction_stderr);
        }
        match finalize_artifact(artifact, &name, preset, false).await {
            Ok(entry) => {
                info!("[{}] {} wrote {}", name, preset, entry.file_name);
                result.record_bytes = entry.size_bytes;
                result.artifact = Some(entry);
                result.status = PipelineStatus::Succeeded;
            }
            Err(e) => result.diagnostic = Some(format!("Failed to finalize artifact: {}", e)),
        }
    } else {
        let diagnostic = match status {
            Ok(_) => summarize_stderr(&stderr, exit_code),
            Err(e) => format!("Failed to wait for {}: {}", preset, e),
        };
        error!("[{}] {} failed: {}", name, preset, diagnostic);
        result.diagnostic = Some(diagnostic);
    }

    result.commands.push(AuditEntry::new(
        result.extraction_command.clone(),
        role,
        started_at,
        Utc::now(),
        exit_code,
        result.record_bytes,
        stderr_len,
        (exit_code != Some(0)).then(|| summarize_stderr(&stderr, exit_code)),
    ));
    Ok(result)
}

/// Run the standard survey recipe over every input.
///
/// The recipe is re-invoked in record mode only when export or forwarding is
/// requested; otherwise only the text report is produced.
pub async fn run_survey(
    executor: &PipelineExecutor,
    request: &SurveyRequest,
    cancel: CancellationToken,
) -> Result<BundleManifest> {
    let inputs = usable_inputs(&request.evidence)?;
    let mut manifest = BundleManifest {
        presets: vec![SURVEY_REPORT.to_string()],
        inputs: inputs.iter().map(EvidenceInput::display).collect(),
        ..Default::default()
    };

    let sink = match request.sink.target() {
        Ok(target) => target.map(Arc::new),
        Err(e) => {
            warn!("Record forwarding disabled: {}", e);
            manifest.warn(WarningKind::InvalidSinkUri, e.to_string());
            None
        }
    };
    manifest.sink = sink.as_ref().map(|s| s.redacted());
    let needs_records = request.export_records || sink.is_some();
    if needs_records {
        manifest.presets.push(SURVEY_RECORDS.name.to_string());
    }

    tokio::fs::create_dir_all(&request.output_dir).await?;
    let info = &executor.config().toolkit.target_info;

    for (input, stem) in inputs.iter().zip(allocate_stems(&inputs)) {
        let evidence_path = input.path.to_string_lossy().into_owned();
        let command = info.command_line().arg(evidence_path.clone());
        let destination = request
            .output_dir
            .join(format!("{}-{}.txt", stem, SURVEY_RECORDS.output_base));
        let report = capture_to_file(
            executor.launcher().as_ref(),
            input,
            SURVEY_REPORT,
            CommandRole::Survey,
            command,
            &destination,
            &cancel,
        )
        .await?;
        let report_ok = report.is_succeeded();
        manifest.record(report);

        if needs_records && report_ok {
            let job = PipelineJob {
                evidence: input.display(),
                evidence_path: evidence_path.clone(),
                target_path: evidence_path,
                preset: &SURVEY_RECORDS,
                rule_paths: Arc::from(Vec::new()),
                sink: sink.clone(),
                artifact_path: request.export_records.then(|| {
                    request
                        .output_dir
                        .join(format!("{}-{}.csv", stem, SURVEY_RECORDS.output_base))
                }),
            };
            let records = executor.run(&job, &cancel).await?;
            manifest.record(records);
        }
    }

    manifest.finalize();
    info!("Survey finished: {}", manifest.outcome);
    Ok(manifest)
}

/// Run a console script over every input: `<script> [args...] <evidence>`.
pub async fn run_query(
    launcher: &dyn ProcessLauncher,
    request: &QueryRequest,
    cancel: CancellationToken,
) -> Result<BundleManifest> {
    let script = request.script.trim();
    if script.is_empty() {
        return Err(Error::Config("No console script provided".to_string()));
    }
    let arguments = split_arguments(request.arguments.as_deref().unwrap_or_default())?;
    let inputs = usable_inputs(&request.evidence)?;
    let script_name = Path::new(script)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| script.to_string());

    let mut manifest = BundleManifest {
        presets: vec![script_name.clone()],
        inputs: inputs.iter().map(EvidenceInput::display).collect(),
        ..Default::default()
    };
    tokio::fs::create_dir_all(&request.output_dir).await?;

    for (input, stem) in inputs.iter().zip(allocate_stems(&inputs)) {
        let command = CommandLine::new(script)
            .args(arguments.iter().cloned())
            .arg(input.path.to_string_lossy().into_owned());
        let destination = request
            .output_dir
            .join(format!("{}-{}.txt", stem, script_name));
        let result = capture_to_file(
            launcher,
            input,
            &script_name,
            CommandRole::Query,
            command,
            &destination,
            &cancel,
        )
        .await?;
        manifest.record(result);
    }

    manifest.finalize();
    if manifest.artifacts.is_empty() {
        error!("{} did not generate any output", script_name);
    }
    Ok(manifest)
}

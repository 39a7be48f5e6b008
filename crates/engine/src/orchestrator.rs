//! Bundle orchestrator.
//!
//! Runs every resolved preset against every evidence input with bounded
//! concurrency, isolates per-pair failures, and folds the results into a
//! manifest in resolution order regardless of completion order.

use crate::catalog::{Catalog, Preset, RULE_SCAN};
use crate::classifier::Classifier;
use crate::config::{EngineConfig, MountConfig};
use crate::launcher::ProcessLauncher;
use crate::mount::EvidenceMount;
use crate::pipeline::{PipelineExecutor, PipelineJob};
use crate::rules::RuleBundle;
use crate::scope::{self, Resolution};
use crate::sink::{SinkDirective, SinkTarget};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tqbundle_common::{Error, Result};
use tqbundle_manifest::{
    BundleManifest, FailureKind, ManifestWarning, PipelineResult, PipelineStatus, WarningKind,
};
use tracing::{error, info, warn};

/// One staged evidence file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceInput {
    pub path: PathBuf,
    /// Name shown to analysts; defaults to the file name.
    pub display_name: Option<String>,
}

impl EvidenceInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn display(&self) -> String {
        match self.display_name {
            Some(ref name) if !name.trim().is_empty() => name.clone(),
            _ => self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.to_string_lossy().into_owned()),
        }
    }

    /// Display name without its extension.
    pub fn stem(&self) -> String {
        let display = self.display();
        Path::new(&display)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or(display)
    }
}

/// Inputs with a path, each staged path once, in request order.
pub fn usable_inputs(evidence: &[EvidenceInput]) -> Result<Vec<EvidenceInput>> {
    let mut seen: HashSet<&Path> = HashSet::new();
    let mut inputs = Vec::with_capacity(evidence.len());
    for input in evidence {
        if input.path.as_os_str().is_empty() {
            warn!("Skipping evidence entry without a path");
        } else if !seen.insert(input.path.as_path()) {
            warn!("Skipping duplicate evidence entry {}", input.path.display());
        } else {
            inputs.push(input.clone());
        }
    }
    if inputs.is_empty() {
        return Err(Error::NoEvidence);
    }
    Ok(inputs)
}

/// Unique artifact stems in input order: `disk`, `disk_2`, `disk_3`...
pub fn allocate_stems(inputs: &[EvidenceInput]) -> Vec<String> {
    let mut used: HashSet<String> = HashSet::new();
    inputs
        .iter()
        .map(|input| {
            let base = input.stem();
            let mut candidate = base.clone();
            let mut n = 1;
            while !used.insert(candidate.clone()) {
                n += 1;
                candidate = format!("{}_{}", base, n);
            }
            candidate
        })
        .collect()
}

/// Artifact file name for one pair.
pub fn artifact_file_name(stem: &str, preset: &Preset) -> String {
    format!("{}-{}.csv", stem, preset.output_base)
}

/// A bundle run as requested by the workflow engine.
#[derive(Debug, Clone, Default)]
pub struct BundleRequest {
    pub evidence: Vec<EvidenceInput>,
    /// Raw scope selectors; empty means everything.
    pub scopes: Vec<String>,
    pub yara_rule: Option<String>,
    /// Comma or newline separated rule paths.
    pub yara_rule_paths: Option<String>,
    pub sink: SinkDirective,
    pub output_dir: PathBuf,
}

/// Reported after each completed pair.
#[derive(Debug, Clone)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub evidence: String,
    pub preset: String,
    pub status: PipelineStatus,
}

pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

#[derive(Clone)]
struct Shared {
    executor: PipelineExecutor,
    mount: Option<MountConfig>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
    completed: Arc<AtomicUsize>,
    total: usize,
}

struct EvidenceOutcome {
    index: usize,
    results: Vec<PipelineResult>,
    warnings: Vec<ManifestWarning>,
    cancelled: bool,
}

/// Runs bundles.
pub struct Orchestrator {
    executor: PipelineExecutor,
    catalog: Catalog,
    progress: Option<ProgressFn>,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let classifier = Classifier::from_config(&config.classifier)?;
        Ok(Self {
            executor: PipelineExecutor::new(launcher, Arc::new(config), Arc::new(classifier)),
            catalog: Catalog::builtin(),
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn executor(&self) -> &PipelineExecutor {
        &self.executor
    }

    /// Resolve the request's scopes without launching anything.
    pub fn plan(&self, request: &BundleRequest) -> Result<Resolution> {
        scope::resolve(&self.catalog, &request.scopes)
    }

    /// Run a bundle.
    ///
    /// Request errors (`NoEvidence`, `InvalidScope`) are returned before any
    /// process is launched. Everything that happens per pair ends up in the
    /// manifest. `Cancelled` is returned after in-flight children are killed.
    pub async fn run(&self, request: &BundleRequest, cancel: CancellationToken) -> Result<BundleManifest> {
        let inputs = usable_inputs(&request.evidence)?;

        let resolution = self.plan(request)?;
        let mut manifest = BundleManifest {
            selection: resolution.selection(),
            selection_labels: resolution.selection_labels(),
            ..Default::default()
        };
        let mut presets = resolution.presets;

        // Held until the run returns so the inline rule file outlives every scan.
        let rules = match RuleBundle::build(
            request.yara_rule.as_deref(),
            request.yara_rule_paths.as_deref(),
        ) {
            Ok(rules) => rules,
            Err(Error::RuleBundleInvalid(reason)) => {
                error!("Rule bundle rejected: {}", reason);
                manifest.record_failure(
                    RULE_SCAN.name,
                    Some(RULE_SCAN.function.to_string()),
                    FailureKind::RuleBundleInvalid,
                    reason,
                );
                None
            }
            Err(e) => return Err(e),
        };
        let rule_paths: Arc<[String]> = match rules {
            Some(ref bundle) => {
                presets.push(&RULE_SCAN);
                Arc::from(bundle.paths())
            }
            None => Arc::from(Vec::new()),
        };
        manifest.presets = presets.iter().map(|p| p.name.to_string()).collect();

        let sink = match request.sink.target() {
            Ok(target) => target.map(Arc::new),
            Err(e) => {
                warn!("Record forwarding disabled: {}", e);
                manifest.warn(WarningKind::InvalidSinkUri, e.to_string());
                None
            }
        };
        manifest.sink = sink.as_deref().map(SinkTarget::redacted);

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let stems = allocate_stems(&inputs);
        manifest.inputs = inputs.iter().map(EvidenceInput::display).collect();

        let total = inputs.len() * presets.len();
        info!(
            "Running {} presets against {} evidence inputs ({} pairs)",
            presets.len(),
            inputs.len(),
            total
        );

        let shared = Shared {
            executor: self.executor.clone(),
            mount: self.executor.config().mount.clone(),
            semaphore: Arc::new(Semaphore::new(self.executor.config().max_workers)),
            cancel: cancel.clone(),
            progress: self.progress.clone(),
            completed: Arc::new(AtomicUsize::new(0)),
            total,
        };

        let mut evidence_tasks = JoinSet::new();
        for (index, (input, stem)) in inputs.iter().zip(stems.iter()).enumerate() {
            let evidence_path = input.path.to_string_lossy().into_owned();
            let jobs: Vec<PipelineJob> = presets
                .iter()
                .map(|&preset| PipelineJob {
                    evidence: input.display(),
                    evidence_path: evidence_path.clone(),
                    target_path: evidence_path.clone(),
                    preset,
                    rule_paths: rule_paths.clone(),
                    sink: sink.clone(),
                    artifact_path: Some(
                        request.output_dir.join(artifact_file_name(stem, preset)),
                    ),
                })
                .collect();
            evidence_tasks.spawn(run_evidence(index, jobs, shared.clone()));
        }

        let mut outcomes: Vec<Option<EvidenceOutcome>> = (0..inputs.len()).map(|_| None).collect();
        let mut cancelled = false;
        while let Some(joined) = evidence_tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    cancelled |= outcome.cancelled;
                    let index = outcome.index;
                    outcomes[index] = Some(outcome);
                }
                Err(e) => error!("Evidence task aborted: {}", e),
            }
        }
        if cancelled || cancel.is_cancelled() {
            warn!("Bundle run cancelled");
            return Err(Error::Cancelled);
        }

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(outcome) => {
                    for result in outcome.results {
                        manifest.record(result);
                    }
                    manifest.warnings.extend(outcome.warnings);
                }
                None => {
                    let display = inputs[index].display();
                    for preset in &presets {
                        manifest.record(aborted_result(&display, &inputs[index].path, preset));
                    }
                }
            }
        }
        drop(rules);

        manifest.finalize();
        info!(
            "Bundle finished: {} ({} artifacts, {} skipped, {} failed)",
            manifest.outcome,
            manifest.artifacts.len(),
            manifest.skipped.len(),
            manifest.failed.len()
        );
        Ok(manifest)
    }
}

fn aborted_result(display: &str, path: &Path, preset: &Preset) -> PipelineResult {
    let mut result = PipelineResult::new(
        display,
        path.to_string_lossy(),
        preset.name,
        preset.function,
    );
    result.diagnostic = Some("Pipeline task did not complete".to_string());
    result
}

/// All presets for one evidence input, sharing one mount if configured.
async fn run_evidence(index: usize, mut jobs: Vec<PipelineJob>, shared: Shared) -> EvidenceOutcome {
    let mut outcome = EvidenceOutcome {
        index,
        results: Vec::with_capacity(jobs.len()),
        warnings: Vec::new(),
        cancelled: false,
    };
    let Some(first) = jobs.first() else {
        return outcome;
    };
    let evidence = first.evidence.clone();
    let evidence_path = first.evidence_path.clone();
    let launcher = shared.executor.launcher().clone();

    let mut mount = None;
    if let Some(ref config) = shared.mount {
        match EvidenceMount::mount(launcher.as_ref(), config, &evidence_path).await {
            Ok(mounted) => {
                let target = mounted.path().to_string_lossy().into_owned();
                for job in jobs.iter_mut() {
                    job.target_path = target.clone();
                }
                mount = Some(mounted);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!("[{}] {}", evidence, message);
                outcome.warnings.push(ManifestWarning {
                    evidence: Some(evidence.clone()),
                    preset: None,
                    kind: WarningKind::Mount,
                    message: message.clone(),
                });
                for job in &jobs {
                    let mut result = PipelineResult::new(
                        &job.evidence,
                        &job.evidence_path,
                        job.preset.name,
                        job.preset.function,
                    );
                    result.diagnostic = Some(message.clone());
                    outcome.results.push(result);
                }
                return outcome;
            }
        }
    }

    let mut slots: Vec<Option<PipelineResult>> = (0..jobs.len()).map(|_| None).collect();
    let mut tasks = JoinSet::new();
    for (slot, job) in jobs.iter().cloned().enumerate() {
        let shared = shared.clone();
        tasks.spawn(async move {
            let permit = shared.semaphore.clone().acquire_owned().await;
            let result = match permit {
                Ok(_permit) => shared.executor.run(&job, &shared.cancel).await,
                Err(_) => Err(Error::Cancelled),
            };
            (slot, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((slot, Ok(result))) => {
                let completed = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(ref progress) = shared.progress {
                    progress(&Progress {
                        completed,
                        total: shared.total,
                        evidence: result.evidence.clone(),
                        preset: result.preset.clone(),
                        status: result.status,
                    });
                }
                slots[slot] = Some(result);
            }
            Ok((_, Err(Error::Cancelled))) => outcome.cancelled = true,
            Ok((slot, Err(e))) => {
                let job = &jobs[slot];
                let mut result = aborted_result(&job.evidence, Path::new(&job.evidence_path), job.preset);
                result.diagnostic = Some(e.to_string());
                slots[slot] = Some(result);
            }
            Err(e) => error!("[{}] Pipeline task aborted: {}", evidence, e),
        }
    }

    for (slot, result) in slots.into_iter().enumerate() {
        let job = &jobs[slot];
        outcome.results.push(result.unwrap_or_else(|| {
            aborted_result(&job.evidence, Path::new(&job.evidence_path), job.preset)
        }));
    }

    if let Some(mounted) = mount {
        match mounted.release(launcher.as_ref()).await {
            Ok(audit) => {
                if let Some(first) = outcome.results.first_mut() {
                    first.commands.splice(0..0, audit);
                }
            }
            Err(e) => {
                let message = format!("{:#}", e);
                warn!("[{}] {}", evidence, message);
                outcome.warnings.push(ManifestWarning {
                    evidence: Some(evidence.clone()),
                    preset: None,
                    kind: WarningKind::Mount,
                    message,
                });
            }
        }
    }

    outcome
}

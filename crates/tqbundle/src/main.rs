//! tqbundle - Run forensic extraction presets against evidence images.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tqbundle_common::Error;
use tqbundle_engine::catalog::{Catalog, Scope, RULE_SCAN};
use tqbundle_engine::orchestrator::{BundleRequest, EvidenceInput, Orchestrator, Progress};
use tqbundle_engine::survey::{run_query, run_survey, QueryRequest, SurveyRequest};
use tqbundle_engine::{BundleTaskConfig, EngineConfig, LocalLauncher, SinkDirective};
use tqbundle_manifest::validation::validate_manifest_json;
use tqbundle_manifest::{validate_manifest, BundleManifest, RunOutcome};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status when the run produced nothing useful.
const EXIT_RUN_FAILED: u8 = 2;
/// Exit status when the run was interrupted.
const EXIT_CANCELLED: u8 = 130;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "tqbundle")]
#[command(
    author,
    version,
    about = "Run bundles of forensic extraction presets against evidence images"
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Engine configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the preset bundle for the selected scopes
    Bundle {
        /// Evidence file (repeatable)
        #[arg(long, required = true)]
        evidence: Vec<PathBuf>,

        /// Scope selector (repeatable or comma separated; default everything)
        #[arg(long)]
        scope: Vec<String>,

        /// Inline rule text for the rule-scanning preset
        #[arg(long, conflicts_with = "yara_rule_file")]
        yara_rule: Option<String>,

        /// File holding inline rule text
        #[arg(long)]
        yara_rule_file: Option<PathBuf>,

        /// Rule files or directories, comma or newline separated
        #[arg(long)]
        yara_rule_paths: Option<String>,

        /// Record sink URI
        #[arg(long)]
        sink_uri: Option<String>,

        /// Forward records to the sink (requires --sink-uri)
        #[arg(long)]
        forward_records: bool,

        /// Task parameters as JSON, overridden by explicit flags
        #[arg(long)]
        task_config: Option<PathBuf>,

        /// Output directory for artifacts
        #[arg(long, short)]
        out: PathBuf,

        /// Manifest path (defaults to <out>/manifest.json)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Run the standard survey recipe
    Survey {
        /// Evidence file (repeatable)
        #[arg(long, required = true)]
        evidence: Vec<PathBuf>,

        /// Also export the survey as a tabular artifact
        #[arg(long)]
        export_records: bool,

        /// Record sink URI
        #[arg(long)]
        sink_uri: Option<String>,

        /// Forward records to the sink (requires --sink-uri)
        #[arg(long)]
        forward_records: bool,

        /// Output directory for artifacts
        #[arg(long, short)]
        out: PathBuf,

        /// Manifest path (defaults to <out>/manifest.json)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Run a toolkit console script against each evidence file
    Query {
        /// Evidence file (repeatable)
        #[arg(long, required = true)]
        evidence: Vec<PathBuf>,

        /// Console script name, e.g. target-dd
        #[arg(long)]
        script: String,

        /// Shell-style arguments placed before the evidence path
        #[arg(long, allow_hyphen_values = true)]
        arguments: Option<String>,

        /// Output directory for artifacts
        #[arg(long, short)]
        out: PathBuf,

        /// Manifest path (defaults to <out>/manifest.json)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// List scopes and presets
    Presets {
        /// Only presets in this scope
        #[arg(long)]
        scope: Option<String>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Validate a manifest file
    ValidateManifest {
        /// Manifest JSON file
        manifest: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn evidence_inputs(paths: Vec<PathBuf>) -> Vec<EvidenceInput> {
    paths.into_iter().map(EvidenceInput::new).collect()
}

/// Cancel the token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            token.cancel();
        }
    });
    cancel
}

/// Write the manifest and its audit log; map the outcome to an exit status.
fn write_outputs(manifest: &BundleManifest, out: &Path, path: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let manifest_path = path.unwrap_or_else(|| out.join("manifest.json"));
    if let Some(parent) = manifest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&manifest_path, serde_json::to_string_pretty(manifest)?)
        .with_context(|| format!("Failed to write {}", manifest_path.display()))?;

    let audit_path = manifest_path.with_file_name("audit.jsonl");
    std::fs::write(&audit_path, manifest.audit_log().to_jsonl())
        .with_context(|| format!("Failed to write {}", audit_path.display()))?;

    info!("Manifest written to {:?} (outcome: {})", manifest_path, manifest.outcome);
    Ok(match manifest.outcome {
        RunOutcome::Failed => ExitCode::from(EXIT_RUN_FAILED),
        RunOutcome::Succeeded | RunOutcome::SucceededWithWarnings => ExitCode::SUCCESS,
    })
}

fn finish(
    outcome: Result<BundleManifest, Error>,
    out: &Path,
    manifest: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    match outcome {
        Ok(m) => write_outputs(&m, out, manifest),
        Err(Error::Cancelled) => {
            error!("Run cancelled; no manifest written");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_presets(scope: Option<String>, json: bool) -> anyhow::Result<()> {
    let catalog = Catalog::builtin();
    let scopes: Vec<Scope> = match scope {
        Some(raw) => match raw.parse::<tqbundle_engine::ScopeSelector>()? {
            tqbundle_engine::ScopeSelector::Everything => Scope::ALL.to_vec(),
            tqbundle_engine::ScopeSelector::Scope(s) => vec![s],
        },
        None => Scope::ALL.to_vec(),
    };

    if json {
        let listing: Vec<serde_json::Value> = scopes
            .iter()
            .map(|scope| {
                let presets: Vec<serde_json::Value> = catalog
                    .presets_in_scope(*scope)
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name,
                            "function": p.function,
                            "output_base": p.output_base,
                        })
                    })
                    .collect();
                serde_json::json!({
                    "scope": scope.value(),
                    "label": scope.label(),
                    "presets": presets,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    for scope in scopes {
        println!("{} ({})", scope.label(), scope.value());
        for preset in catalog.presets_in_scope(scope) {
            println!("  {:<42} -f {:<20} -> <stem>-{}.csv", preset.name, preset.function, preset.output_base);
        }
    }
    println!(
        "\nWith rules: {} -> <stem>-{}.csv",
        RULE_SCAN.name, RULE_SCAN.output_base
    );
    Ok(())
}

fn validate_file(path: &Path) -> anyhow::Result<ExitCode> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;

    let mut result = validate_manifest_json(&value)?;
    if result.valid {
        let manifest: BundleManifest = serde_json::from_value(value)?;
        result = validate_manifest(&manifest)?;
    }

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if result.valid {
        info!("{} is valid", path.display());
        Ok(ExitCode::SUCCESS)
    } else {
        for e in &result.errors {
            error!("{}", e);
        }
        Ok(ExitCode::FAILURE)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    match cli.command {
        Commands::Bundle {
            evidence,
            scope,
            yara_rule,
            yara_rule_file,
            yara_rule_paths,
            sink_uri,
            forward_records,
            task_config,
            out,
            manifest,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let task = match task_config {
                Some(ref path) => BundleTaskConfig::load(path)
                    .with_context(|| format!("Failed to load task config {}", path.display()))?,
                None => BundleTaskConfig::default(),
            };

            let inline_rule = match yara_rule_file {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read rule file {}", path.display()))?,
                ),
                None => yara_rule,
            };

            let mut request: BundleRequest = task.into_request(evidence_inputs(evidence), out.clone());
            if !scope.is_empty() {
                request.scopes = scope;
            }
            if inline_rule.is_some() {
                request.yara_rule = inline_rule;
            }
            if yara_rule_paths.is_some() {
                request.yara_rule_paths = yara_rule_paths;
            }
            if sink_uri.is_some() || forward_records {
                request.sink = SinkDirective::new(
                    sink_uri.or(request.sink.uri),
                    forward_records || request.sink.forward,
                );
            }

            let orchestrator = Orchestrator::new(Arc::new(LocalLauncher::new()), config)?
                .with_progress(Arc::new(|p: &Progress| {
                    info!(
                        "[{}/{}] {} / {}: {:?}",
                        p.completed, p.total, p.evidence, p.preset, p.status
                    )
                }));
            let resolution = orchestrator.plan(&request)?;
            info!(
                "Selection: {} ({} presets)",
                resolution.selection_labels().join(", "),
                resolution.presets.len()
            );

            let cancel = cancel_on_interrupt();
            let outcome = orchestrator.run(&request, cancel).await;
            finish(outcome, &out, manifest)
        }

        Commands::Survey {
            evidence,
            export_records,
            sink_uri,
            forward_records,
            out,
            manifest,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let orchestrator = Orchestrator::new(Arc::new(LocalLauncher::new()), config)?;
            let request = SurveyRequest {
                evidence: evidence_inputs(evidence),
                export_records,
                sink: SinkDirective::new(sink_uri, forward_records),
                output_dir: out.clone(),
            };

            let cancel = cancel_on_interrupt();
            let outcome = run_survey(orchestrator.executor(), &request, cancel).await;
            finish(outcome, &out, manifest)
        }

        Commands::Query {
            evidence,
            script,
            arguments,
            out,
            manifest,
        } => {
            let request = QueryRequest {
                evidence: evidence_inputs(evidence),
                script,
                arguments,
                output_dir: out.clone(),
            };

            let cancel = cancel_on_interrupt();
            let outcome = run_query(&LocalLauncher::new(), &request, cancel).await;
            finish(outcome, &out, manifest)
        }

        Commands::Presets { scope, json } => {
            print_presets(scope, json)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::ValidateManifest { manifest } => validate_file(&manifest),
    }
}

//! tqbundle engine: runs forensic extraction presets against evidence images.
//!
//! A request names evidence files and scope selectors. The scopes resolve to
//! an ordered preset list, each preset runs once per evidence input through
//! the pipeline executor, and the results are folded into a manifest.

pub mod catalog;
pub mod classifier;
pub mod config;
pub mod fanout;
pub mod launcher;
pub mod mount;
pub mod orchestrator;
pub mod pipeline;
pub mod rules;
pub mod scope;
pub mod sink;
pub mod survey;
pub mod task;

pub use catalog::{Catalog, Preset, Scope};
pub use classifier::{Classifier, RuleOutcome};
pub use config::EngineConfig;
pub use launcher::{LocalLauncher, ProcessLauncher, RecordingLauncher};
pub use orchestrator::{BundleRequest, EvidenceInput, Orchestrator, Progress, ProgressFn};
pub use pipeline::{PipelineExecutor, PipelineJob};
pub use scope::{resolve, Resolution, ScopeSelector};
pub use sink::{SinkDirective, SinkTarget};
pub use survey::{run_query, run_survey, QueryRequest, SurveyRequest};
pub use task::BundleTaskConfig;

//! Data model: configuration document, steps, env items, triggers, results.

pub mod config;
pub mod env_item;
pub mod results;
pub mod step;
pub mod trigger;

pub use config::{
    is_utility_workflow, App, BitriseConfig, GraphNode, Inventory, Pipeline, Stage, StageAlwaysRun,
    StageListItem, StepListItem, Workflow, WorkflowListItem, SUPPORTED_FORMAT_VERSION,
};
pub use env_item::{merge_env_with, EnvItem, EnvOpts, ResolvedOpts};
pub use results::{
    compare_versions, BuildRunResults, StepInfo, StepRunResult, StepRunStatus,
};
pub use step::{
    merge_step_with, BashToolkit, DepsItem, LegacyDependency, SourceKind, Step, StepDeps, StepId,
    StepSource, StepToolkit,
};
pub use trigger::{
    validate_trigger_map, TriggerMapItem, TriggerParams, TriggerTarget,
};

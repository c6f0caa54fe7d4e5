//! Shared helpers for engine integration tests
#![allow(dead_code)]

use std::path::Path;

use bitrise::models::{BitriseConfig, BuildRunResults, EnvItem};
use bitrise::paths::WorkPaths;
use bitrise::steps::GitStepLibrary;
use bitrise::workflow::WorkflowEngine;
use bitrise::BuildContext;

/// Write a runnable `path::` step (entry script plus a minimal declaration)
/// and return its composite id.
pub fn write_path_step(dir: &Path, name: &str, script: &str) -> String {
    let step_dir = dir.join(name);
    std::fs::create_dir_all(&step_dir).unwrap();
    std::fs::write(step_dir.join("step.sh"), script).unwrap();
    std::fs::write(step_dir.join("step.yml"), "title: test step\n").unwrap();
    format!("path::{}", step_dir.display())
}

/// Script that appends its label to a marker file, for ordering assertions.
pub fn recording_script(marker: &Path, label: &str) -> String {
    format!("#!/bin/bash\necho {label} >> {}\n", marker.display())
}

/// Run a workflow from a parsed YAML config against a scratch work dir.
pub async fn run_workflow(
    config_yaml: &str,
    target: &str,
    secrets: Vec<EnvItem>,
    scratch: &Path,
    ctx: BuildContext,
) -> BuildRunResults {
    let (config, _) = BitriseConfig::from_yaml(config_yaml).expect("config loads");
    let paths = WorkPaths::init_at(&scratch.join("work")).unwrap();
    let steplib = GitStepLibrary::with_cache_root(scratch.join("steplibs"));
    let engine = WorkflowEngine::new(&config, ctx, paths, &steplib);
    engine
        .run_build(target, &secrets, chrono::Utc::now())
        .await
        .expect("build runs")
}

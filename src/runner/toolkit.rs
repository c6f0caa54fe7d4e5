//! Step toolkit invocation
//!
//! A toolkit maps a populated step directory to the command that executes
//! the step. Only the bash toolkit is supported; a step without a toolkit
//! hint gets bash with the default entry file.

use std::path::Path;

use crate::models::Step;

const DEFAULT_ENTRY_FILE: &str = "step.sh";

/// Command line invoking the step's entry point.
pub fn step_command(step: &Step, step_dir: &Path) -> Vec<String> {
    let entry_file = step
        .toolkit
        .as_ref()
        .and_then(|toolkit| toolkit.bash.as_ref())
        .map(|bash| bash.entry_file.as_str())
        .filter(|entry| !entry.is_empty())
        .unwrap_or(DEFAULT_ENTRY_FILE);

    vec![
        "bash".to_string(),
        step_dir.join(entry_file).to_string_lossy().to_string(),
    ]
}

//! Build and step result accounting
//!
//! Results are append-only: every executed step lands in exactly one bucket
//! and carries a monotonically increasing index, so the summary can replay
//! them in execution order.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Outcome classification of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRunStatus {
    Success,
    Failed,
    FailedSkippable,
    Skipped,
    SkippedWithRunIf,
}

impl StepRunStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepRunStatus::Failed | StepRunStatus::FailedSkippable)
    }
}

/// Identity and provenance of a step, for presentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInfo {
    pub id: String,
    pub title: String,
    pub version: String,
    /// Latest version known to the step library, when resolved through one.
    pub latest: String,
    pub steplib: String,
    pub support_url: String,
    pub source_code_url: String,
}

impl StepInfo {
    /// True when the library knows a newer version than the one that ran.
    pub fn is_update_available(&self) -> bool {
        if self.latest.is_empty() || self.version.is_empty() {
            return false;
        }
        compare_versions(&self.version, &self.latest) == std::cmp::Ordering::Less
    }
}

/// Loose semver-style comparison: dot-separated numeric segments, missing
/// segments read as zero, non-numeric segments compared as strings.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (l, r) => {
                let l = l.unwrap_or("0");
                let r = r.unwrap_or("0");
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Record of one step invocation.
#[derive(Debug, Clone)]
pub struct StepRunResult {
    pub step_info: StepInfo,
    pub status: StepRunStatus,
    pub idx: usize,
    pub run_time: Duration,
    pub exit_code: i32,
    pub error: Option<String>,
    /// Tail of the step's output plus lines matching error heuristics,
    /// captured on non-zero exit.
    pub detected_error_messages: Vec<String>,
}

/// Aggregated results of one build.
#[derive(Debug, Clone)]
pub struct BuildRunResults {
    pub start_time: DateTime<Utc>,
    pub success_steps: Vec<StepRunResult>,
    pub failed_steps: Vec<StepRunResult>,
    pub failed_skippable_steps: Vec<StepRunResult>,
    pub skipped_steps: Vec<StepRunResult>,
    /// Per-library count of cache refreshes performed during this build.
    pub steplib_updates: BTreeMap<String, u32>,
}

impl BuildRunResults {
    pub fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            success_steps: Vec::new(),
            failed_steps: Vec::new(),
            failed_skippable_steps: Vec::new(),
            skipped_steps: Vec::new(),
            steplib_updates: BTreeMap::new(),
        }
    }

    pub fn results_count(&self) -> usize {
        self.success_steps.len()
            + self.failed_steps.len()
            + self.failed_skippable_steps.len()
            + self.skipped_steps.len()
    }

    pub fn is_build_failed(&self) -> bool {
        !self.failed_steps.is_empty()
    }

    pub fn has_failed_skippable_steps(&self) -> bool {
        !self.failed_skippable_steps.is_empty()
    }

    pub fn is_steplib_updated(&self, library: &str) -> bool {
        self.steplib_updates.contains_key(library)
    }

    pub fn record_steplib_update(&mut self, library: &str) {
        *self.steplib_updates.entry(library.to_string()).or_insert(0) += 1;
    }

    /// File the result into its status bucket.
    pub fn append(&mut self, result: StepRunResult) {
        match result.status {
            StepRunStatus::Success => self.success_steps.push(result),
            StepRunStatus::Failed => self.failed_steps.push(result),
            StepRunStatus::FailedSkippable => self.failed_skippable_steps.push(result),
            StepRunStatus::Skipped | StepRunStatus::SkippedWithRunIf => {
                self.skipped_steps.push(result)
            }
        }
    }

    /// All results in execution order.
    pub fn ordered_results(&self) -> Vec<&StepRunResult> {
        let mut results: Vec<&StepRunResult> = self
            .success_steps
            .iter()
            .chain(self.failed_steps.iter())
            .chain(self.failed_skippable_steps.iter())
            .chain(self.skipped_steps.iter())
            .collect();
        results.sort_by_key(|result| result.idx);
        results
    }

    pub fn total_run_time(&self) -> Duration {
        self.ordered_results()
            .iter()
            .map(|result| result.run_time)
            .sum()
    }
}

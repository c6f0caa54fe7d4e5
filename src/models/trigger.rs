//! Trigger map model
//!
//! A trigger map is an ordered list of items mapping inbound VCS events to a
//! workflow or pipeline target. Items come in two shapes: the legacy
//! `{pattern, is_pull_request_allowed, workflow}` form and the typed form
//! with per-event selectors. The first matching item wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Inbound trigger descriptor, as reported by the VCS hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerParams {
    pub push_branch: String,
    pub pr_source_branch: String,
    pub pr_target_branch: String,
    pub tag: String,
    pub is_draft_pr: bool,
}

impl TriggerParams {
    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            push_branch: branch.into(),
            ..Default::default()
        }
    }

    pub fn pull_request(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pr_source_branch: source.into(),
            pr_target_branch: target.into(),
            ..Default::default()
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn is_pr(&self) -> bool {
        !self.pr_source_branch.is_empty() || !self.pr_target_branch.is_empty()
    }
}

impl std::fmt::Display for TriggerParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "push-branch: {}, pr-source-branch: {}, pr-target-branch: {}, tag: {}",
            self.push_branch, self.pr_source_branch, self.pr_target_branch, self.tag
        )
    }
}

/// One entry of the trigger map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMapItem {
    // typed selectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_source_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_target_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_pull_request_enabled: Option<bool>,

    // legacy form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_pull_request_allowed: Option<bool>,

    // target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
}

/// Resolution result: a pipeline or a workflow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerTarget {
    Pipeline(String),
    Workflow(String),
}

fn selector_matches(selector: &str, value: &str) -> Result<bool> {
    if selector.is_empty() {
        return Ok(value.is_empty());
    }
    if selector == "*" {
        return Ok(!value.is_empty());
    }
    if let Some(pattern) = selector
        .strip_prefix("regex:/")
        .and_then(|rest| rest.strip_suffix('/'))
        .or_else(|| selector.strip_prefix("regex:"))
    {
        let re = Regex::new(pattern).map_err(|err| {
            Error::ConfigInvalid(format!("invalid trigger regex ({selector}): {err}"))
        })?;
        return Ok(re.is_match(value));
    }
    Ok(selector == value)
}

impl TriggerMapItem {
    fn is_legacy(&self) -> bool {
        self.pattern.is_some()
    }

    fn is_pr_item(&self) -> bool {
        self.pull_request_source_branch.is_some() || self.pull_request_target_branch.is_some()
    }

    /// Whether this item matches the given trigger descriptor.
    pub fn matches(&self, params: &TriggerParams) -> Result<bool> {
        if self.is_legacy() {
            return self.matches_legacy(params);
        }

        // draft PRs only match items that did not opt out of them
        if self.is_pr_item()
            && params.is_draft_pr
            && !self.draft_pull_request_enabled.unwrap_or(true)
        {
            return Ok(false);
        }

        let mut declared_any = false;
        for (selector, value) in [
            (&self.push_branch, &params.push_branch),
            (&self.pull_request_source_branch, &params.pr_source_branch),
            (&self.pull_request_target_branch, &params.pr_target_branch),
            (&self.tag, &params.tag),
        ] {
            if let Some(selector) = selector {
                declared_any = true;
                if !selector_matches(selector, value)? {
                    return Ok(false);
                }
            }
        }

        Ok(declared_any)
    }

    fn matches_legacy(&self, params: &TriggerParams) -> Result<bool> {
        let pattern = self.pattern.as_deref().unwrap_or_default();
        if params.is_pr() {
            if !self.is_pull_request_allowed.unwrap_or(false) {
                return Ok(false);
            }
            return Ok(selector_matches(pattern, &params.pr_target_branch)?
                || selector_matches(pattern, &params.pr_source_branch)?);
        }
        selector_matches(pattern, &params.push_branch)
    }

    pub fn target(&self) -> Option<TriggerTarget> {
        if let Some(pipeline) = &self.pipeline {
            return Some(TriggerTarget::Pipeline(pipeline.clone()));
        }
        self.workflow
            .as_ref()
            .map(|workflow| TriggerTarget::Workflow(workflow.clone()))
    }

    /// Canonical rendering of selectors and target, used for duplicate
    /// detection and validation messages.
    pub fn normalized(&self) -> String {
        let mut selectors = Vec::new();
        if let Some(pattern) = &self.pattern {
            selectors.push(format!("pattern: {pattern}"));
            selectors.push(format!(
                "is_pull_request_allowed: {}",
                self.is_pull_request_allowed.unwrap_or(false)
            ));
        }
        if let Some(branch) = &self.push_branch {
            selectors.push(format!("push_branch: {branch}"));
        }
        if let Some(branch) = &self.pull_request_source_branch {
            selectors.push(format!("pull_request_source_branch: {branch}"));
        }
        if let Some(branch) = &self.pull_request_target_branch {
            selectors.push(format!("pull_request_target_branch: {branch}"));
        }
        if let Some(tag) = &self.tag {
            selectors.push(format!("tag: {tag}"));
        }
        let target = match self.target() {
            Some(TriggerTarget::Pipeline(id)) => format!("pipeline: {id}"),
            Some(TriggerTarget::Workflow(id)) => format!("workflow: {id}"),
            None => "no target".to_string(),
        };
        format!("{} -> {}", selectors.join(" & "), target)
    }

    /// Validate the item against the known workflow and pipeline ids.
    /// Returns warnings for conditions that do not abort the load.
    pub fn validate(&self, workflows: &[&str], pipelines: &[&str]) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.workflow.is_none() && self.pipeline.is_none() {
            return Err(Error::ConfigInvalid(format!(
                "trigger item ({}) has no workflow or pipeline target",
                self.normalized()
            )));
        }
        if let Some(id) = &self.workflow {
            if id.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "empty workflow id in trigger item ({})",
                    self.normalized()
                )));
            }
            if id.starts_with('_') {
                warnings.push(format!(
                    "workflow ({id}) defined in trigger item ({}), but utility workflows can't be triggered directly",
                    self.normalized()
                ));
            } else if !workflows.contains(&id.as_str()) {
                return Err(Error::ReferenceMissing {
                    kind: "workflow",
                    id: id.clone(),
                });
            }
        }
        if let Some(id) = &self.pipeline {
            if !pipelines.contains(&id.as_str()) {
                return Err(Error::ReferenceMissing {
                    kind: "pipeline",
                    id: id.clone(),
                });
            }
        }

        Ok(warnings)
    }
}

/// Validate an entire trigger map: each item in isolation, then duplicates.
pub fn validate_trigger_map(
    items: &[TriggerMapItem],
    workflows: &[&str],
    pipelines: &[&str],
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();

    for item in items {
        warnings.extend(item.validate(workflows, pipelines)?);
        let normalized = item.normalized();
        if !seen.insert(normalized.clone()) {
            return Err(Error::ConfigInvalid(format!(
                "duplicated trigger item found ({normalized})"
            )));
        }
    }

    Ok(warnings)
}

//! Configuration document model
//!
//! The top-level build configuration: app envs, trigger map, workflows with
//! before/after composition, and the pipeline/stage grouping layer. Loading
//! goes through [`BitriseConfig::from_yaml`], which normalizes and validates
//! in one pass; a config that loads is safe to execute.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::models::env_item::EnvItem;
use crate::models::results::compare_versions;
use crate::models::step::Step;
use crate::models::trigger::{validate_trigger_map, TriggerMapItem};

/// Highest configuration format version this engine understands.
pub const SUPPORTED_FORMAT_VERSION: &str = "1.4.0";

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_.]+$").expect("valid id pattern"));

/// One entry of a workflow's step list: a composite step ID mapped to a
/// possibly-partial step override. Exactly one entry per list item.
#[derive(Debug, Clone, PartialEq)]
pub struct StepListItem {
    pub id: String,
    pub step: Step,
}

impl<'de> Deserialize<'de> for StepListItem {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, Option<Step>>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(DeError::custom(format!(
                "step list item must have exactly 1 step, got {}",
                map.len()
            )));
        }
        let (id, step) = map.into_iter().next().expect("one entry");
        Ok(StepListItem {
            id,
            step: step.unwrap_or_default(),
        })
    }
}

impl Serialize for StepListItem {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.id, &self.step)?;
        map.end()
    }
}

/// Single-entry mapping from a workflow id to a (currently unused) override,
/// as stages list their workflows.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowListItem {
    pub id: String,
}

impl<'de> Deserialize<'de> for WorkflowListItem {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(DeError::custom(format!(
                "workflow list item must have exactly 1 workflow, got {}",
                map.len()
            )));
        }
        Ok(WorkflowListItem {
            id: map.into_keys().next().expect("one entry"),
        })
    }
}

impl Serialize for WorkflowListItem {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.id, &serde_yaml::Mapping::new())?;
        map.end()
    }
}

/// Single-entry mapping from a stage id to a (currently unused) override.
#[derive(Debug, Clone, PartialEq)]
pub struct StageListItem {
    pub id: String,
}

impl<'de> Deserialize<'de> for StageListItem {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(DeError::custom(format!(
                "stage list item must have exactly 1 stage, got {}",
                map.len()
            )));
        }
        Ok(StageListItem {
            id: map.into_keys().next().expect("one entry"),
        })
    }
}

impl Serialize for StageListItem {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.id, &serde_yaml::Mapping::new())?;
        map.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepListItem>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAlwaysRun {
    #[default]
    Off,
    Workflow,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<WorkflowListItem>,
    #[serde(default, skip_serializing_if = "is_default_always_run")]
    pub should_always_run: StageAlwaysRun,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub abort_on_fail: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

fn is_default_always_run(value: &StageAlwaysRun) -> bool {
    *value == StageAlwaysRun::Off
}

/// Node of a DAG-shaped pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,
    /// Stringified positive integer; reserved for fan-out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<StageListItem>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, GraphNode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct App {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitriseConfig {
    pub format_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_step_lib_source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_map: Vec<TriggerMapItem>,
    #[serde(default, skip_serializing_if = "is_default_app")]
    pub app: App,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, Pipeline>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, Stage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub workflows: BTreeMap<String, Workflow>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

fn is_default_app(app: &App) -> bool {
    *app == App::default()
}

fn validate_id(id: &str, kind: &str, warnings: &mut Vec<String>) -> Result<()> {
    if id.is_empty() {
        return Err(Error::ConfigInvalid(format!("invalid {kind} ID ({id}): empty")));
    }
    if !ID_PATTERN.is_match(id) {
        warnings.push(format!(
            "invalid {kind} ID ({id}): doesn't conform to: [A-Za-z0-9-_.]"
        ));
    }
    Ok(())
}

impl BitriseConfig {
    /// Parse, normalize and validate a configuration document. Returns the
    /// config together with non-fatal warnings.
    pub fn from_yaml(content: &str) -> Result<(Self, Vec<String>)> {
        let config: BitriseConfig = serde_yaml::from_str(content)?;
        let warnings = config.validate()?;
        Ok((config, warnings))
    }

    /// Like [`Self::from_yaml`], from a base64-encoded document.
    pub fn from_base64(encoded: &str) -> Result<(Self, Vec<String>)> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| Error::ConfigInvalid(format!("failed to decode base64 config: {err}")))?;
        let content = String::from_utf8(bytes)
            .map_err(|err| Error::ConfigInvalid(format!("config is not valid UTF-8: {err}")))?;
        Self::from_yaml(&content)
    }

    /// Reject configs authored for a newer engine.
    pub fn check_format_version(&self) -> Result<()> {
        if self.format_version.is_empty() {
            return Err(Error::ConfigInvalid("missing format_version".to_string()));
        }
        if compare_versions(SUPPORTED_FORMAT_VERSION, &self.format_version)
            == std::cmp::Ordering::Less
        {
            return Err(Error::ConfigInvalid(format!(
                "config format version ({}) is newer than the supported version ({}), please upgrade",
                self.format_version, SUPPORTED_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    pub fn workflow_ids(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn pipeline_ids(&self) -> Vec<&str> {
        self.pipelines.keys().map(String::as_str).collect()
    }

    /// Validate the whole document. Fatal conditions return an error; style
    /// issues are collected as warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        self.check_format_version()?;

        for (id, pipeline) in &self.pipelines {
            validate_id(id, "pipeline", &mut warnings)?;
            if pipeline.stages.is_empty() && pipeline.workflows.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "pipeline ({id}) should have at least 1 stage"
                )));
            }
            for stage_item in &pipeline.stages {
                if !self.stages.contains_key(&stage_item.id) {
                    return Err(Error::ConfigInvalid(format!(
                        "stage ({}) defined in pipeline ({id}), but does not exist",
                        stage_item.id
                    )));
                }
            }
            for (node_id, node) in &pipeline.workflows {
                validate_id(node_id, "workflow", &mut warnings)?;
                if !self.workflows.contains_key(node_id) {
                    return Err(Error::ConfigInvalid(format!(
                        "workflow ({node_id}) defined in pipeline ({id}), but does not exist"
                    )));
                }
                for dependency in &node.depends_on {
                    if !pipeline.workflows.contains_key(dependency) {
                        return Err(Error::ConfigInvalid(format!(
                            "workflow ({node_id}) in pipeline ({id}) depends on unknown workflow ({dependency})"
                        )));
                    }
                }
                if let Some(parallel) = &node.parallel {
                    if parallel.parse::<u32>().map(|n| n == 0).unwrap_or(true) {
                        return Err(Error::ConfigInvalid(format!(
                            "workflow ({node_id}) in pipeline ({id}) has invalid parallel value ({parallel})"
                        )));
                    }
                }
            }
        }

        for (id, stage) in &self.stages {
            validate_id(id, "stage", &mut warnings)?;
            if stage.workflows.is_empty() {
                return Err(Error::ConfigInvalid(format!(
                    "stage ({id}) should have at least 1 workflow"
                )));
            }
            for workflow_item in &stage.workflows {
                if workflow_item.id.starts_with('_') {
                    return Err(Error::ConfigInvalid(format!(
                        "workflow ({}) defined in stage ({id}), is a utility workflow",
                        workflow_item.id
                    )));
                }
                if !self.workflows.contains_key(&workflow_item.id) {
                    return Err(Error::ConfigInvalid(format!(
                        "workflow ({}) defined in stage ({id}), but does not exist",
                        workflow_item.id
                    )));
                }
            }
        }

        for (id, workflow) in &self.workflows {
            validate_id(id, "workflow", &mut warnings)?;
            self.validate_workflow(id, workflow, &mut warnings)?;
            // fail fast on circular before/after composition
            self.expand_workflow_ids(id)?;
        }

        let workflow_ids = self.workflow_ids();
        let pipeline_ids = self.pipeline_ids();
        warnings.extend(validate_trigger_map(
            &self.trigger_map,
            &workflow_ids,
            &pipeline_ids,
        )?);

        Ok(warnings)
    }

    fn validate_workflow(
        &self,
        id: &str,
        workflow: &Workflow,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        for referenced in workflow.before_run.iter().chain(workflow.after_run.iter()) {
            if !self.workflows.contains_key(referenced) {
                return Err(Error::ReferenceMissing {
                    kind: "workflow",
                    id: referenced.clone(),
                });
            }
        }

        for env in &workflow.envs {
            env.validate()?;
        }

        for step_item in &workflow.steps {
            let mut seen_inputs = HashSet::new();
            for input in &step_item.step.inputs {
                input.validate()?;
                if !seen_inputs.insert(input.key.clone()) {
                    warnings.push(format!(
                        "duplicated input ({}) in step ({}) of workflow ({id})",
                        input.key, step_item.id
                    ));
                }
            }
            for output in &step_item.step.outputs {
                output.validate()?;
            }
        }

        Ok(())
    }

    /// Flatten a workflow's before/after composition into execution order.
    /// Implemented as an explicit-stack depth-first walk; a workflow id
    /// appearing twice on the traversal stack is a circular dependency.
    pub fn expand_workflow_ids(&self, target: &str) -> Result<Vec<String>> {
        enum Frame<'a> {
            Visit(&'a str),
            Emit(&'a str),
            Leave(&'a str),
        }

        let mut order = Vec::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut stack = vec![Frame::Visit(target)];

        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit(id) => {
                    let workflow =
                        self.workflows
                            .get(id)
                            .ok_or_else(|| Error::ReferenceMissing {
                                kind: "workflow",
                                id: id.to_string(),
                            })?;
                    if !on_stack.insert(id) {
                        return Err(Error::CircularWorkflowDependency(id.to_string()));
                    }
                    stack.push(Frame::Leave(id));
                    for after in workflow.after_run.iter().rev() {
                        stack.push(Frame::Visit(after.as_str()));
                    }
                    stack.push(Frame::Emit(id));
                    for before in workflow.before_run.iter().rev() {
                        stack.push(Frame::Visit(before.as_str()));
                    }
                }
                Frame::Emit(id) => order.push(id.to_string()),
                Frame::Leave(id) => {
                    on_stack.remove(id);
                }
            }
        }

        Ok(order)
    }

    /// The workflow whose steps run last: the deepest rightmost descendant
    /// of the target through `after_run`.
    pub fn last_workflow_id(&self, target: &str) -> Result<String> {
        let expanded = self.expand_workflow_ids(target)?;
        Ok(expanded.last().cloned().unwrap_or_else(|| target.to_string()))
    }

    /// Workflow title falling back to its id.
    pub fn workflow_title(&self, id: &str) -> String {
        match self.workflows.get(id) {
            Some(workflow) if !workflow.title.is_empty() => workflow.title.clone(),
            _ => id.to_string(),
        }
    }
}

/// True for workflow ids that may only be invoked through
/// `before_run`/`after_run`.
pub fn is_utility_workflow(id: &str) -> bool {
    id.starts_with('_')
}

/// Secrets inventory document: a list of env items, each typically marked
/// sensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub envs: Vec<EnvItem>,
}

impl Inventory {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let inventory: Inventory = serde_yaml::from_str(content)?;
        for env in &inventory.envs {
            env.validate()?;
        }
        Ok(inventory)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded.trim()).map_err(|err| {
            Error::ConfigInvalid(format!("failed to decode base64 inventory: {err}"))
        })?;
        let content = String::from_utf8(bytes)
            .map_err(|err| Error::ConfigInvalid(format!("inventory is not valid UTF-8: {err}")))?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config(workflows_yaml: &str) -> String {
        format!(
            "format_version: 1.4.0\ndefault_step_lib_source: \"https://github.com/bitrise-io/bitrise-steplib.git\"\nworkflows:\n{workflows_yaml}"
        )
    }

    #[test]
    fn parses_and_validates_minimal_config() {
        let yaml = minimal_config("  primary:\n    steps:\n    - script:\n        title: hello\n");
        let (config, warnings) = BitriseConfig::from_yaml(&yaml).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.workflows.len(), 1);
        assert_eq!(config.workflows["primary"].steps[0].id, "script");
    }

    #[test]
    fn rejects_newer_format_version() {
        let yaml = "format_version: 99.0.0\nworkflows:\n  primary: {}\n";
        let err = BitriseConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("newer than the supported version"));
    }

    #[test]
    fn empty_pipeline_id_is_fatal() {
        let yaml = r#"
format_version: 1.4.0
pipelines:
  "":
    stages:
    - stage1: {}
stages:
  stage1:
    workflows:
    - workflow1: {}
workflows:
  workflow1: {}
"#;
        let err = BitriseConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid pipeline ID"));
    }

    #[test]
    fn bad_id_characters_warn_but_do_not_fail() {
        let yaml = minimal_config("  \"wf/id\": {}\n");
        let (_, warnings) = BitriseConfig::from_yaml(&yaml).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("doesn't conform to: [A-Za-z0-9-_.]"));
    }

    #[test]
    fn pipeline_without_stages_is_fatal() {
        let yaml = r#"
format_version: 1.4.0
pipelines:
  pipeline1: {}
workflows:
  workflow1: {}
"#;
        let err = BitriseConfig::from_yaml(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("pipeline (pipeline1) should have at least 1 stage"));
    }

    #[test]
    fn utility_workflow_in_stage_is_fatal() {
        let yaml = r#"
format_version: 1.4.0
stages:
  stage1:
    workflows:
    - _utility_workflow: {}
workflows:
  _utility_workflow: {}
"#;
        let err = BitriseConfig::from_yaml(yaml).unwrap_err();
        assert!(err
            .to_string()
            .contains("workflow (_utility_workflow) defined in stage (stage1), is a utility workflow"));
    }

    #[test]
    fn unknown_before_run_reference_is_fatal() {
        let yaml = minimal_config("  primary:\n    before_run:\n    - missing\n");
        let err = BitriseConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, Error::ReferenceMissing { kind: "workflow", .. }));
    }

    #[test]
    fn circular_before_run_is_detected_at_validation() {
        let yaml = minimal_config(
            "  a:\n    before_run:\n    - b\n  b:\n    before_run:\n    - a\n",
        );
        let err = BitriseConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, Error::CircularWorkflowDependency(_)));
    }

    #[test]
    fn expansion_is_before_target_after_in_order() {
        let yaml = minimal_config(
            "  target:\n    before_run:\n    - b1\n    after_run:\n    - a1\n  b1: {}\n  a1: {}\n",
        );
        let (config, _) = BitriseConfig::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.expand_workflow_ids("target").unwrap(),
            vec!["b1", "target", "a1"]
        );
        assert_eq!(config.last_workflow_id("target").unwrap(), "a1");
    }

    #[test]
    fn expansion_recurses_through_nested_composition() {
        let yaml = minimal_config(
            "  target:\n    before_run:\n    - b1\n    after_run:\n    - a1\n  b1:\n    before_run:\n    - b2\n  b2: {}\n  a1:\n    after_run:\n    - a2\n  a2: {}\n",
        );
        let (config, _) = BitriseConfig::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.expand_workflow_ids("target").unwrap(),
            vec!["b2", "b1", "target", "a1", "a2"]
        );
        assert_eq!(config.last_workflow_id("target").unwrap(), "a2");
    }

    #[test]
    fn env_with_extra_keys_is_fatal() {
        let yaml = minimal_config(
            "  target:\n    steps:\n    - script:\n        inputs:\n        - content: echo \"Hello\"\n          BAD_KEY: value\n",
        );
        let err = BitriseConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("more than 2 keys specified"));
    }

    #[test]
    fn duplicated_step_inputs_warn() {
        let yaml = minimal_config(
            "  target:\n    steps:\n    - script:\n        inputs:\n        - content: echo \"Hello\"\n        - content: echo \"Hello\"\n",
        );
        let (_, warnings) = BitriseConfig::from_yaml(&yaml).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("duplicated input"));
    }

    #[test]
    fn config_round_trips_modulo_defaults() {
        let yaml = minimal_config(
            "  primary:\n    title: Primary\n    envs:\n    - KEY: value\n    steps:\n    - script:\n        title: hello\n",
        );
        let (config, _) = BitriseConfig::from_yaml(&yaml).unwrap();
        let rendered = serde_yaml::to_string(&config).unwrap();
        let (reparsed, _) = BitriseConfig::from_yaml(&rendered).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn inventory_parses_env_list() {
        let yaml = "envs:\n- SECRET_TOKEN: hunter2\n  opts:\n    is_sensitive: true\n";
        let inventory = Inventory::from_yaml(yaml).unwrap();
        assert_eq!(inventory.envs.len(), 1);
        assert!(inventory.envs[0].opts.resolved().is_sensitive);
    }

    #[test]
    fn base64_loading_round_trip() {
        let yaml = minimal_config("  primary: {}\n");
        let encoded = BASE64.encode(yaml.as_bytes());
        let (config, _) = BitriseConfig::from_base64(&encoded).unwrap();
        assert!(config.workflows.contains_key("primary"));
    }
}

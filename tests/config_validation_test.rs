//! Configuration loading and validation edge cases that must fail before a
//! build is started.

use bitrise::models::{BitriseConfig, SUPPORTED_FORMAT_VERSION};
use bitrise::Error;

#[test]
fn circular_before_run_fails_at_load() {
    let config = r#"
format_version: 1.4.0
workflows:
  a:
    before_run: [b]
  b:
    before_run: [a]
"#;
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(matches!(err, Error::CircularWorkflowDependency(_)));
}

#[test]
fn self_referencing_workflow_fails_at_load() {
    let config = r#"
format_version: 1.4.0
workflows:
  a:
    after_run: [a]
"#;
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(matches!(err, Error::CircularWorkflowDependency(_)));
}

#[test]
fn shared_before_workflow_is_not_a_cycle() {
    let config = r#"
format_version: 1.4.0
workflows:
  target:
    before_run: [b1, b2]
  b1:
    before_run: [shared]
  b2:
    before_run: [shared]
  shared: {}
"#;
    let (config, _) = BitriseConfig::from_yaml(config).unwrap();
    // the shared workflow is expanded once per reference
    assert_eq!(
        config.expand_workflow_ids("target").unwrap(),
        vec!["shared", "b1", "shared", "b2", "target"]
    );
}

#[test]
fn utility_workflow_in_stage_is_a_hard_error() {
    let config = r#"
format_version: 1.4.0
stages:
  ci-stage:
    workflows:
    - _utility: {}
workflows:
  _utility: {}
"#;
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(err.to_string().contains("is a utility workflow"));
}

#[test]
fn duplicate_trigger_items_are_rejected() {
    let config = r#"
format_version: 1.4.0
trigger_map:
- push_branch: master
  workflow: ci
- push_branch: master
  workflow: ci
workflows:
  ci: {}
"#;
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(err.to_string().contains("duplicated trigger item"));
}

#[test]
fn trigger_target_must_exist() {
    let config = r#"
format_version: 1.4.0
trigger_map:
- push_branch: master
  workflow: release
workflows:
  ci: {}
"#;
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(matches!(err, Error::ReferenceMissing { kind: "workflow", .. }));
}

#[test]
fn newer_format_version_is_rejected() {
    let config = "format_version: 99.9.9\nworkflows:\n  ci: {}\n";
    let err = BitriseConfig::from_yaml(config).unwrap_err();
    assert!(err.to_string().contains(SUPPORTED_FORMAT_VERSION));
}

#[test]
fn config_round_trips_modulo_defaults() {
    let yaml = r#"
format_version: 1.4.0
default_step_lib_source: "https://github.com/bitrise-io/bitrise-steplib.git"
project_type: ios
app:
  summary: sum
  envs:
  - ENV_KEY: env_value
    opts:
      is_required: true
trigger_map:
- push_branch: master
  workflow: target
workflows:
  target:
    title: Output Test
    envs:
    - ENV_KEY: env_value
      opts:
        title: test_env
    steps:
    - script:
        description: test
"#;
    let (config, _) = BitriseConfig::from_yaml(yaml).unwrap();
    let rendered = serde_yaml::to_string(&config).unwrap();
    let (reparsed, _) = BitriseConfig::from_yaml(&rendered).unwrap();
    assert_eq!(config, reparsed);

    assert_eq!(config.format_version, "1.4.0");
    assert_eq!(config.project_type, "ios");
    assert_eq!(config.app.summary, "sum");
    assert_eq!(config.workflows["target"].title, "Output Test");
}

#[test]
fn pipeline_graph_nodes_validate_dependencies() {
    let valid = r#"
format_version: 1.4.0
pipelines:
  graph:
    workflows:
      build: {}
      test:
        depends_on: [build]
        parallel: "2"
workflows:
  build: {}
  test: {}
"#;
    assert!(BitriseConfig::from_yaml(valid).is_ok());

    let unknown_dependency = r#"
format_version: 1.4.0
pipelines:
  graph:
    workflows:
      test:
        depends_on: [missing]
workflows:
  test: {}
"#;
    assert!(BitriseConfig::from_yaml(unknown_dependency).is_err());

    let bad_parallel = r#"
format_version: 1.4.0
pipelines:
  graph:
    workflows:
      test:
        parallel: "zero"
workflows:
  test: {}
"#;
    assert!(BitriseConfig::from_yaml(bad_parallel).is_err());
}

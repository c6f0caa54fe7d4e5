//! Command handlers
//!
//! Thin orchestration between argument parsing, config loading and the
//! workflow engine. Exit codes: 0 on build success, 1 on build failure or
//! any fatal configuration error.

pub mod output;
pub mod print;

use chrono::Utc;
use std::path::PathBuf;

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::models::{is_utility_workflow, BitriseConfig, EnvItem, Inventory, TriggerTarget};
use crate::paths::{is_setup_done_for_version, save_setup_done_for_version, WorkPaths};
use crate::steps::GitStepLibrary;
use crate::trigger::TriggerResolver;
use crate::workflow::WorkflowEngine;

pub use output::{OutputFormat, TriggerCheckResult, ValidationResult};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "bitrise.yml";
pub const DEFAULT_SECRETS_FILE_NAME: &str = ".bitrise.secrets.yml";

/// Shared `--config` / `--inventory` style inputs.
#[derive(Debug, Clone, Default)]
pub struct ConfigParams {
    pub config: Option<PathBuf>,
    pub config_base64: Option<String>,
    pub inventory: Option<PathBuf>,
    pub inventory_base64: Option<String>,
}

/// Load and validate the configuration from CLI params, searching the
/// current directory for the default file when no source is given.
pub fn load_config(params: &ConfigParams) -> Result<(BitriseConfig, Vec<String>)> {
    if let Some(encoded) = &params.config_base64 {
        return BitriseConfig::from_base64(encoded);
    }

    let path = match &params.config {
        Some(path) => path.clone(),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILE_NAME);
            if !default.exists() {
                return Err(Error::ConfigInvalid(format!(
                    "no config ({DEFAULT_CONFIG_FILE_NAME}) found in the current directory"
                )));
            }
            default
        }
    };

    let content = std::fs::read_to_string(&path).map_err(|err| {
        Error::ConfigInvalid(format!("failed to read config ({}): {err}", path.display()))
    })?;
    BitriseConfig::from_yaml(&content)
}

/// Load the secrets inventory. A missing default file is not an error; an
/// explicitly given path must exist.
pub fn load_inventory(params: &ConfigParams) -> Result<Vec<EnvItem>> {
    if let Some(encoded) = &params.inventory_base64 {
        return Ok(Inventory::from_base64(encoded)?.envs);
    }

    let path = match &params.inventory {
        Some(path) => {
            if !path.exists() {
                return Err(Error::ConfigInvalid(format!(
                    "no inventory found at ({})",
                    path.display()
                )));
            }
            path.clone()
        }
        None => {
            let default = PathBuf::from(DEFAULT_SECRETS_FILE_NAME);
            if !default.exists() {
                return Ok(Vec::new());
            }
            default
        }
    };

    let content = std::fs::read_to_string(&path).map_err(|err| {
        Error::ConfigInvalid(format!(
            "failed to read inventory ({}): {err}",
            path.display()
        ))
    })?;
    Ok(Inventory::from_yaml(&content)?.envs)
}

fn print_about_utility_workflows() {
    println!("Note about utility workflows:");
    println!("Utility workflow names start with '_' (example: _my_utility_workflow),");
    println!(" these can't be triggered directly but can be used by other workflows");
    println!(" in the before_run and after_run blocks.");
}

fn print_available_workflows(config: &BitriseConfig) {
    let mut workflow_names: Vec<&str> = Vec::new();
    let mut utility_workflow_names: Vec<&str> = Vec::new();
    for name in config.workflows.keys() {
        if is_utility_workflow(name) {
            utility_workflow_names.push(name);
        } else {
            workflow_names.push(name);
        }
    }

    if workflow_names.is_empty() {
        println!("No workflows are available!");
    } else {
        println!("The following workflows are available:");
        for name in workflow_names {
            println!(" * {name}");
        }
        println!();
        println!("You can run a selected workflow with:");
        println!("-> bitrise run the-workflow-name");
        println!();
    }

    if !utility_workflow_names.is_empty() {
        println!("The following utility workflows are also defined:");
        for name in utility_workflow_names {
            println!(" * {name}");
        }
        println!();
        print_about_utility_workflows();
        println!();
    }
}

async fn run_build(
    config: &BitriseConfig,
    workflow_id: &str,
    secrets: Vec<EnvItem>,
    ctx: BuildContext,
) -> Result<i32> {
    ensure_setup().await?;

    let paths = WorkPaths::init()?;
    let steplib = GitStepLibrary::new()?;
    let engine = WorkflowEngine::new(config, ctx, paths, &steplib);

    let results = engine.run_build(workflow_id, &secrets, Utc::now()).await?;

    if results.has_failed_skippable_steps() {
        tracing::warn!("workflow finished, but some non important steps failed");
        print::step_status_list("Failed skippable steps:", &results.failed_skippable_steps);
    }
    if results.is_build_failed() {
        tracing::error!("workflow finished, but some steps failed");
        print::step_status_list("Failed steps:", &results.failed_steps);
        return Ok(1);
    }
    Ok(0)
}

/// `run <workflow>`: execute the named workflow.
pub async fn run(
    params: &ConfigParams,
    workflow: Option<String>,
    pr_flag: bool,
    ci_flag: bool,
) -> Result<i32> {
    let (config, warnings) = load_config(params)?;
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    let secrets = load_inventory(params)?;

    let Some(workflow_id) = workflow else {
        print_available_workflows(&config);
        return Ok(1);
    };

    if is_utility_workflow(&workflow_id) {
        tracing::error!("utility workflows can't be triggered directly");
        println!();
        print_about_utility_workflows();
        return Ok(1);
    }

    let ctx = BuildContext::detect(ci_flag, pr_flag, &secrets);
    ctx.register();

    run_build(&config, &workflow_id, secrets, ctx).await
}

/// `trigger <pattern>`: resolve the pattern through the trigger map and run
/// the matched workflow.
pub async fn trigger(
    params: &ConfigParams,
    pattern: &str,
    pr_flag: bool,
    ci_flag: bool,
) -> Result<i32> {
    let (config, warnings) = load_config(params)?;
    for warning in &warnings {
        tracing::warn!("{warning}");
    }
    let secrets = load_inventory(params)?;

    let ctx = BuildContext::detect(ci_flag, pr_flag, &secrets);
    ctx.register();

    let resolver = TriggerResolver::new(&config);
    let workflow_id = match resolver.resolve_pattern(pattern, ctx.is_pr)? {
        TriggerTarget::Workflow(id) => id,
        TriggerTarget::Pipeline(id) => {
            return Err(Error::ConfigInvalid(format!(
                "trigger resolved to pipeline ({id}), which this runner does not execute"
            )))
        }
    };

    if is_utility_workflow(&workflow_id) {
        return Err(Error::ConfigInvalid(format!(
            "utility workflow ({workflow_id}) can't be triggered directly"
        )));
    }

    tracing::info!("triggered workflow id: {workflow_id}");
    run_build(&config, &workflow_id, secrets, ctx).await
}

/// `trigger-check <pattern>`: resolve the pattern and report the flattened
/// workflow expansion without running anything.
pub fn trigger_check(
    params: &ConfigParams,
    pattern: &str,
    format: OutputFormat,
    pr_flag: bool,
    ci_flag: bool,
) -> Result<TriggerCheckResult> {
    let (config, _) = load_config(params)?;
    let secrets = load_inventory(params)?;
    let ctx = BuildContext::detect(ci_flag, pr_flag, &secrets);

    let resolver = TriggerResolver::new(&config);
    let workflow_id = match resolver.resolve_pattern(pattern, ctx.is_pr)? {
        TriggerTarget::Workflow(id) => id,
        TriggerTarget::Pipeline(id) => {
            return Err(Error::ConfigInvalid(format!(
                "trigger resolved to pipeline ({id}), which trigger-check cannot expand"
            )))
        }
    };

    if workflow_id.is_empty() || is_utility_workflow(&workflow_id) {
        return Err(Error::ConfigInvalid(format!(
            "triggered workflow id ({workflow_id}) is not runnable"
        )));
    }

    let result = TriggerCheckResult {
        pattern: pattern.to_string(),
        workflows: config.expand_workflow_ids(&workflow_id)?,
    };
    println!("{}", result.render(format)?);
    Ok(result)
}

/// `validate`: load the config (and inventory when given) and report.
pub fn validate(params: &ConfigParams, format: OutputFormat) -> i32 {
    let validation = match load_config(params).and_then(|loaded| {
        load_inventory(params)?;
        Ok(loaded)
    }) {
        Ok((_, warnings)) => ValidationResult {
            is_valid: true,
            warnings,
            error: None,
        },
        Err(err) => ValidationResult {
            is_valid: false,
            warnings: Vec::new(),
            error: Some(err.to_string()),
        },
    };

    match validation.render(format) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => {
            tracing::error!("failed to render validation result: {err}");
            return 1;
        }
    }
    if validation.is_valid {
        0
    } else {
        1
    }
}

/// `setup`: verify host prerequisites and stamp the setup state.
pub async fn setup() -> Result<()> {
    for tool in ["bash", "git"] {
        let path = crate::deps::which(tool)
            .ok_or_else(|| Error::DependencyMissing(tool.to_string()))?;
        tracing::info!(" * [OK] {tool}: {}", path.display());
    }

    save_setup_done_for_version(engine_version())?;
    tracing::info!("setup finished for version {}", engine_version());
    Ok(())
}

async fn ensure_setup() -> Result<()> {
    if is_setup_done_for_version(engine_version()) {
        return Ok(());
    }
    tracing::warn!("setup was not performed for this version of bitrise, doing it now");
    setup().await
}

pub fn engine_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TRIGGER_CHECK_CONFIG: &str = r#"
format_version: 1.4.0
default_step_lib_source: "https://github.com/bitrise-io/bitrise-steplib.git"

trigger_map:
- pattern: pr_allowed
  is_pull_request_allowed: true
  workflow: pr_allowed
- pattern: only_code_push
  workflow: only_code_push
- pattern: "*"
  is_pull_request_allowed: true
  workflow: fall_back

workflows:
  pr_allowed: {}
  only_code_push: {}
  fall_back: {}
"#;

    fn params_for(tmp: &TempDir, config: &str) -> ConfigParams {
        let path = tmp.path().join("bitrise.yml");
        std::fs::write(&path, config).unwrap();
        ConfigParams {
            config: Some(path),
            ..Default::default()
        }
    }

    fn clear_mode_envs() {
        std::env::remove_var(crate::context::PR_MODE_ENV_KEY);
        std::env::remove_var(crate::context::PULL_REQUEST_ID_ENV_KEY);
    }

    #[test]
    #[serial_test::serial]
    fn trigger_check_resolves_push_mode() {
        clear_mode_envs();
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, TRIGGER_CHECK_CONFIG);

        let result =
            trigger_check(&params, "only_code_push", OutputFormat::Json, false, false).unwrap();
        assert_eq!(
            result.render(OutputFormat::Json).unwrap(),
            r#"{"pattern":"only_code_push","workflows":["only_code_push"]}"#
        );
    }

    #[test]
    #[serial_test::serial]
    fn trigger_check_pr_mode_falls_through_disallowed_items() {
        clear_mode_envs();
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, TRIGGER_CHECK_CONFIG);

        let result =
            trigger_check(&params, "only_code_push", OutputFormat::Json, true, false).unwrap();
        assert_eq!(
            result.render(OutputFormat::Json).unwrap(),
            r#"{"pattern":"only_code_push","workflows":["fall_back"]}"#
        );
    }

    #[test]
    #[serial_test::serial]
    fn trigger_check_expands_composition() {
        clear_mode_envs();
        let config = r#"
format_version: 1.4.0
workflows:
  target:
    before_run: [b1]
    after_run: [a1]
  b1: {}
  a1: {}
"#;
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, config);

        let result = trigger_check(&params, "target", OutputFormat::Json, false, false).unwrap();
        assert_eq!(result.workflows, vec!["b1", "target", "a1"]);
    }

    #[test]
    fn trigger_check_rejects_empty_pattern() {
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, TRIGGER_CHECK_CONFIG);
        assert!(trigger_check(&params, "", OutputFormat::Json, true, false).is_err());
    }

    #[test]
    fn validate_reports_valid_config() {
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, TRIGGER_CHECK_CONFIG);
        assert_eq!(validate(&params, OutputFormat::Raw), 0);
    }

    #[test]
    fn validate_reports_broken_config() {
        let tmp = TempDir::new().unwrap();
        let params = params_for(
            &tmp,
            "format_version: 1.4.0\nworkflows:\n  a:\n    before_run: [b]\n  b:\n    before_run: [a]\n",
        );
        assert_eq!(validate(&params, OutputFormat::Raw), 1);
    }

    #[test]
    fn missing_explicit_inventory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut params = params_for(&tmp, TRIGGER_CHECK_CONFIG);
        params.inventory = Some(tmp.path().join("nope.yml"));
        assert!(load_inventory(&params).is_err());
    }

    #[test]
    fn missing_default_inventory_is_fine() {
        let tmp = TempDir::new().unwrap();
        let params = params_for(&tmp, TRIGGER_CHECK_CONFIG);
        assert!(load_inventory(&params).unwrap().is_empty());
    }
}

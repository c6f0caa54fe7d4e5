//! Workflow execution engine
//!
//! Expands the target workflow's before/after composition into a linear
//! sequence, then drives every step through the per-step state machine:
//! acquire, merge, run-if evaluation, execution, result classification. A
//! single mutable env list flows through the whole expansion; secrets come
//! first so project envs may override them, step outputs are appended on
//! success. Per-step failures never abort the loop; they flip the
//! build-failed flag and later steps run only when marked always-run.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;

use crate::cli::print;
use crate::context::{
    BuildContext, BITRISE_BUILD_STATUS_ENV_KEY, BITRISE_DEPLOY_DIR_ENV_KEY,
    FORMATTED_OUTPUT_FILE_ENV_KEY, LAST_WORKFLOW_ENV_KEY, OUTPUT_ENVSTORE_PATH_ENV_KEY,
    STEPLIB_BUILD_STATUS_ENV_KEY, TRIGGERED_WORKFLOW_ID_ENV_KEY,
    TRIGGERED_WORKFLOW_TITLE_ENV_KEY,
};
use crate::deps::DependencyInstaller;
use crate::envstore::EnvStore;
use crate::error::{Error, Result};
use crate::models::{
    BitriseConfig, BuildRunResults, EnvItem, Step, StepId, StepInfo, StepRunResult, StepRunStatus,
};
use crate::paths::WorkPaths;
use crate::runner::{CancelSignal, StepRunner};
use crate::steps::{StepAcquirer, StepLibrary};
use crate::template::{evaluate_to_bool, TemplateState};

pub struct WorkflowEngine<'a> {
    config: &'a BitriseConfig,
    ctx: BuildContext,
    paths: WorkPaths,
    steplib: &'a dyn StepLibrary,
    cancel: Option<CancelSignal>,
}

impl<'a> WorkflowEngine<'a> {
    pub fn new(
        config: &'a BitriseConfig,
        ctx: BuildContext,
        paths: WorkPaths,
        steplib: &'a dyn StepLibrary,
    ) -> Self {
        Self {
            config,
            ctx,
            paths,
            steplib,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the target workflow and everything its composition pulls in.
    /// Returns the accumulated results; the caller decides the process exit
    /// code from `is_build_failed`.
    pub async fn run_build(
        &self,
        workflow_id: &str,
        secrets: &[EnvItem],
        start_time: DateTime<Utc>,
    ) -> Result<BuildRunResults> {
        if !self.config.workflows.contains_key(workflow_id) {
            return Err(Error::ReferenceMissing {
                kind: "workflow",
                id: workflow_id.to_string(),
            });
        }

        let expansion = self.config.expand_workflow_ids(workflow_id)?;
        let last_workflow_id = expansion.last().cloned().unwrap_or_default();

        // build-wide process envs, set exactly once
        std::env::set_var(OUTPUT_ENVSTORE_PATH_ENV_KEY, &self.paths.output_envstore);
        std::env::set_var(FORMATTED_OUTPUT_FILE_ENV_KEY, &self.paths.formatted_output);
        std::env::set_var(BITRISE_DEPLOY_DIR_ENV_KEY, &self.paths.deploy_dir);
        std::env::set_var(TRIGGERED_WORKFLOW_ID_ENV_KEY, workflow_id);
        std::env::set_var(
            TRIGGERED_WORKFLOW_TITLE_ENV_KEY,
            self.config.workflow_title(workflow_id),
        );
        std::env::set_var(LAST_WORKFLOW_ENV_KEY, &last_workflow_id);

        EnvStore::init(&self.paths.output_envstore, true)?;

        // secrets precede app envs so project configuration can override
        let mut environments: Vec<EnvItem> = Vec::new();
        environments.extend_from_slice(secrets);
        environments.extend_from_slice(&self.config.app.envs);

        let mut results = BuildRunResults::new(start_time);

        for (position, id) in expansion.iter().enumerate() {
            let workflow = self
                .config
                .workflows
                .get(id)
                .ok_or_else(|| Error::ReferenceMissing {
                    kind: "workflow",
                    id: id.clone(),
                })?;
            let is_last_workflow = position == expansion.len() - 1;

            print::running_workflow(&self.config.workflow_title(id));
            environments.extend_from_slice(&workflow.envs);

            self.run_workflow_steps(
                workflow,
                secrets,
                &mut environments,
                &mut results,
                is_last_workflow,
            )
            .await;
        }

        print::summary(&results);
        Ok(results)
    }

    async fn run_workflow_steps(
        &self,
        workflow: &crate::models::Workflow,
        secrets: &[EnvItem],
        environments: &mut Vec<EnvItem>,
        results: &mut BuildRunResults,
        is_last_workflow: bool,
    ) {
        for (idx, step_item) in workflow.steps.iter().enumerate() {
            let started = Instant::now();
            let is_last_step = is_last_workflow && idx == workflow.steps.len() - 1;

            set_build_status_envs(results.is_build_failed());

            let fallback_info = StepInfo {
                id: step_item.id.clone(),
                title: step_item
                    .step
                    .title
                    .clone()
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| step_item.id.clone()),
                ..Default::default()
            };

            if let Err(err) = self.paths.cleanup_step_dir() {
                self.register(
                    results,
                    Registration::failed(fallback_info, err).print_header(),
                    started,
                    idx,
                    is_last_step,
                );
                continue;
            }

            let step_id = match StepId::parse(&step_item.id, &self.config.default_step_lib_source) {
                Ok(step_id) => step_id,
                Err(err) => {
                    self.register(
                        results,
                        Registration::failed(fallback_info, err).print_header(),
                        started,
                        idx,
                        is_last_step,
                    );
                    continue;
                }
            };

            let acquirer = StepAcquirer::new(self.steplib, &self.paths);
            let acquired = match acquirer.acquire(&step_id, &step_item.step, results).await {
                Ok(acquired) => acquired,
                Err(err) => {
                    self.register(
                        results,
                        Registration::failed(fallback_info, err).print_header(),
                        started,
                        idx,
                        is_last_step,
                    );
                    continue;
                }
            };
            let step = acquired.step;
            let info = acquired.info;

            print::step_header(&info, idx);

            // a failed build short-circuits everything except always-run steps
            if results.is_build_failed() && !step.is_always_run() {
                tracing::warn!(
                    "a previous step failed and this step ({}) was not marked as always-run, skipped",
                    info.title
                );
                self.register(
                    results,
                    Registration::skipped(info, StepRunStatus::Skipped),
                    started,
                    idx,
                    is_last_step,
                );
                continue;
            }

            // run-if gate, evaluated against the env state a step would see
            let run_if = step.run_if.clone().unwrap_or_default();
            if !run_if.is_empty() {
                match self
                    .template_state(environments, results)
                    .and_then(|state| evaluate_to_bool(&run_if, &state))
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            "the step's ({}) run-if expression evaluated to false, skipping",
                            info.title
                        );
                        tracing::info!("the run-if expression was: {run_if}");
                        self.register(
                            results,
                            Registration::skipped(info, StepRunStatus::SkippedWithRunIf),
                            started,
                            idx,
                            is_last_step,
                        );
                        continue;
                    }
                    Err(err) => {
                        self.register(
                            results,
                            Registration::failed(info, err),
                            started,
                            idx,
                            is_last_step,
                        );
                        continue;
                    }
                }
            }

            // dependencies install only once the step is certain to run
            let installer = DependencyInstaller::new(self.ctx);
            if let Err(err) = installer.install_step_dependencies(&step).await {
                self.register(
                    results,
                    Registration::run_error(info, &step, 1, err, Vec::new()),
                    started,
                    idx,
                    is_last_step,
                );
                continue;
            }

            let secret_values = collect_secret_values(secrets, environments);
            let mut runner = StepRunner::new(&self.ctx, &self.paths);
            if let Some(cancel) = &self.cancel {
                runner = runner.with_cancel(cancel.clone());
            }
            let outcome = runner.run(&step, environments, results, &secret_values).await;

            let registration = match outcome.error {
                None => {
                    environments.extend(outcome.outputs);
                    Registration::success(info)
                }
                Some(err) => Registration::run_error(
                    info,
                    &step,
                    outcome.exit_code,
                    err,
                    outcome.detected_error_messages,
                ),
            };
            self.register(results, registration, started, idx, is_last_step);
        }
    }

    fn template_state(
        &self,
        environments: &[EnvItem],
        results: &BuildRunResults,
    ) -> Result<TemplateState> {
        let process_env: HashMap<String, String> = std::env::vars().collect();
        let store = EnvStore::init(&self.paths.input_envstore, true)?;
        store.add_many(environments)?;
        let mut exported: Vec<(String, String)> = process_env.clone().into_iter().collect();
        exported.extend(store.read_evaluated(&process_env)?);
        Ok(TemplateState::new(&self.ctx, results, &exported))
    }

    fn register(
        &self,
        results: &mut BuildRunResults,
        registration: Registration,
        started: Instant,
        idx: usize,
        is_last_step: bool,
    ) {
        if registration.print_header {
            print::step_header(&registration.info, idx);
        }

        match (&registration.status, &registration.error) {
            (StepRunStatus::Failed, Some(err)) => {
                tracing::error!("step ({}) failed: {err}", registration.info.title);
            }
            (StepRunStatus::FailedSkippable, Some(err)) => {
                tracing::warn!(
                    "step ({}) failed, but was marked as skippable: {err}",
                    registration.info.title
                );
            }
            _ => {}
        }

        let result = StepRunResult {
            step_info: registration.info,
            status: registration.status,
            idx: results.results_count(),
            run_time: started.elapsed(),
            exit_code: registration.exit_code,
            error: registration.error.map(|err| err.to_string()),
            detected_error_messages: registration.detected_error_messages,
        };
        print::step_footer(&result, is_last_step);
        results.append(result);
    }
}

/// One step's pending result, before indexing and bucket filing.
struct Registration {
    info: StepInfo,
    status: StepRunStatus,
    exit_code: i32,
    error: Option<Error>,
    detected_error_messages: Vec<String>,
    print_header: bool,
}

impl Registration {
    fn success(info: StepInfo) -> Self {
        Self {
            info,
            status: StepRunStatus::Success,
            exit_code: 0,
            error: None,
            detected_error_messages: Vec::new(),
            print_header: false,
        }
    }

    fn skipped(info: StepInfo, status: StepRunStatus) -> Self {
        Self {
            info,
            status,
            exit_code: 0,
            error: None,
            detected_error_messages: Vec::new(),
            print_header: false,
        }
    }

    fn failed(info: StepInfo, error: Error) -> Self {
        Self {
            info,
            status: StepRunStatus::Failed,
            exit_code: 1,
            error: Some(error),
            detected_error_messages: Vec::new(),
            print_header: false,
        }
    }

    fn run_error(
        info: StepInfo,
        step: &Step,
        exit_code: i32,
        error: Error,
        detected_error_messages: Vec<String>,
    ) -> Self {
        let status = if step.is_skippable() {
            StepRunStatus::FailedSkippable
        } else {
            StepRunStatus::Failed
        };
        Self {
            info,
            status,
            exit_code,
            error: Some(error),
            detected_error_messages,
            print_header: false,
        }
    }

    fn print_header(mut self) -> Self {
        self.print_header = true;
        self
    }
}

fn set_build_status_envs(is_build_failed: bool) {
    let status = if is_build_failed { "1" } else { "0" };
    std::env::set_var(BITRISE_BUILD_STATUS_ENV_KEY, status);
    std::env::set_var(STEPLIB_BUILD_STATUS_ENV_KEY, status);
}

/// Secret strings for the redaction set: every non-empty inventory value
/// that is not an engine flag, plus every env item marked sensitive.
fn collect_secret_values(secrets: &[EnvItem], environments: &[EnvItem]) -> Vec<String> {
    let mut values: Vec<String> = Vec::new();
    for secret in secrets {
        if secret.value.is_empty() || crate::context::is_built_in_flag_key(&secret.key) {
            continue;
        }
        if !values.contains(&secret.value) {
            values.push(secret.value.clone());
        }
    }
    for item in environments {
        if item.opts.resolved().is_sensitive
            && !item.value.is_empty()
            && !values.contains(&item.value)
        {
            values.push(item.value.clone());
        }
    }
    values
}

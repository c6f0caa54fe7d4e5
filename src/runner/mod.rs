//! Step subprocess execution
//!
//! Runs one step under the full io/timer harness: the input env store is
//! prepared from the caller's env list, templated inputs are evaluated, the
//! process is launched in its own group with stdout and stderr piped through
//! the log pipeline, and two timers bound its lifetime. Either timer firing
//! terminates the whole process group with SIGTERM, a grace wait and then
//! SIGKILL, and marks the result with a distinct reason. Every reader task
//! spawned here terminates before the runner returns.

pub mod toolkit;

use std::collections::HashMap;
use std::io::Stdout;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::context::{BuildContext, BITRISE_SOURCE_DIR_ENV_KEY};
use crate::envstore::EnvStore;
use crate::error::{Error, Result};
use crate::logfilter::{ClassifiedMessage, LogSink};
use crate::models::{BuildRunResults, EnvItem, Step};
use crate::paths::WorkPaths;
use crate::template::{evaluate_to_string, TemplateState};

/// Grace period between SIGTERM and SIGKILL when a timer fires.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(5);

const NO_OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Build-level abort signal. Flipping it terminates the running step, which
/// is recorded as failed with a cancellation reason.
#[derive(Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (sender, receiver) = watch::channel(false);
        (sender, Self { receiver })
    }

    fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Result of one step subprocess invocation.
pub struct RunOutcome {
    pub exit_code: i32,
    pub outputs: Vec<EnvItem>,
    pub error: Option<Error>,
    pub detected_error_messages: Vec<String>,
    pub log_messages: Vec<ClassifiedMessage>,
}

pub struct StepRunner<'a> {
    ctx: &'a BuildContext,
    paths: &'a WorkPaths,
    cancel: Option<CancelSignal>,
}

impl<'a> StepRunner<'a> {
    pub fn new(ctx: &'a BuildContext, paths: &'a WorkPaths) -> Self {
        Self {
            ctx,
            paths,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Run the step with the given env list. Outputs produced by the step
    /// are always surfaced; the caller propagates them only on success.
    pub async fn run(
        &self,
        step: &Step,
        environments: &[EnvItem],
        results: &BuildRunResults,
        secrets: &[String],
    ) -> RunOutcome {
        match self.run_inner(step, environments, results, secrets).await {
            Ok(outcome) => outcome,
            Err(error) => RunOutcome {
                exit_code: 1,
                outputs: Vec::new(),
                error: Some(error),
                detected_error_messages: Vec::new(),
                log_messages: Vec::new(),
            },
        }
    }

    async fn run_inner(
        &self,
        step: &Step,
        environments: &[EnvItem],
        results: &BuildRunResults,
        secrets: &[String],
    ) -> Result<RunOutcome> {
        let process_env: HashMap<String, String> = std::env::vars().collect();

        // input store: caller's env list first, then the step inputs with
        // templated values evaluated against the state exported so far
        let input_store = EnvStore::init(&self.paths.input_envstore, true)?;
        input_store.add_many(environments)?;

        let exported = input_store.read_evaluated(&process_env)?;
        let template_state = TemplateState::new(self.ctx, results, &exported);
        for input in &step.inputs {
            let mut item = input.clone();
            if input.opts.resolved().is_template {
                item.value = evaluate_to_string(&input.value, &template_state)?;
            }
            input_store.add_item(&item)?;
        }

        let working_dir = self.resolve_working_dir(environments, step, &process_env);
        let command_line = toolkit::step_command(step, &self.paths.steps_dir);

        // final child environment: process env overlaid with the store
        let mut child_env = process_env.clone();
        for (key, value) in input_store.read_evaluated(&process_env)? {
            child_env.insert(key, value);
        }
        child_env.insert("PWD".to_string(), working_dir.clone());

        let output_store = EnvStore::init(&self.paths.output_envstore, false)?;
        let outputs_before = output_store.read_raw()?.len();

        let mut command = Command::new(&command_line[0]);
        command
            .args(&command_line[1..])
            .env_clear()
            .envs(&child_env)
            .current_dir(&working_dir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        tracing::debug!("executing step: {}", command_line.join(" "));
        let mut child = command.spawn().map_err(|err| {
            Error::Other(format!("failed to spawn step command ({}): {err}", command_line[0]))
        })?;

        let sink: Arc<Mutex<LogSink<Stdout>>> =
            Arc::new(Mutex::new(LogSink::new(secrets, std::io::stdout())));
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let stdout_reader = spawn_reader(stdout, Arc::clone(&sink), Arc::clone(&last_activity));
        let stderr_reader = spawn_reader(stderr, Arc::clone(&sink), Arc::clone(&last_activity));

        let (exit_code, timeout_error) = self
            .supervise(&mut child, step, Arc::clone(&last_activity))
            .await;

        // both readers hit EOF once the process group is gone
        let _ = stdout_reader.await;
        let _ = stderr_reader.await;

        let (detected_error_messages, log_messages) = {
            let mut sink = sink.lock().expect("log sink");
            sink.close().map_err(Error::Io)?;
            (sink.detected_error_messages(), sink.messages().to_vec())
        };

        let mut accumulated = output_store.read_raw()?;
        let outputs = if outputs_before <= accumulated.len() {
            accumulated.split_off(outputs_before)
        } else {
            Vec::new()
        };

        let error = match timeout_error {
            Some(error) => Some(error),
            None if exit_code != 0 => Some(Error::StepExitedNonZero(exit_code)),
            None => None,
        };

        Ok(RunOutcome {
            exit_code,
            outputs,
            error,
            detected_error_messages: if exit_code != 0 {
                detected_error_messages
            } else {
                Vec::new()
            },
            log_messages,
        })
    }

    /// Working directory: the last `BITRISE_SOURCE_DIR` in the env list, the
    /// step inputs, or the process environment; the current directory when
    /// unset.
    fn resolve_working_dir(
        &self,
        environments: &[EnvItem],
        step: &Step,
        process_env: &HashMap<String, String>,
    ) -> String {
        environments
            .iter()
            .chain(step.inputs.iter())
            .rev()
            .find(|item| item.key == BITRISE_SOURCE_DIR_ENV_KEY && !item.value.is_empty())
            .map(|item| item.value.clone())
            .or_else(|| {
                process_env
                    .get(BITRISE_SOURCE_DIR_ENV_KEY)
                    .filter(|value| !value.is_empty())
                    .cloned()
            })
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .map(|dir| dir.to_string_lossy().to_string())
                    .unwrap_or_else(|_| ".".to_string())
            })
    }

    /// Wait for the child while arbitrating the hard timeout, the no-output
    /// timeout and build-level cancellation. Exactly one result is emitted.
    async fn supervise(
        &self,
        child: &mut Child,
        step: &Step,
        last_activity: Arc<Mutex<Instant>>,
    ) -> (i32, Option<Error>) {
        let hard_timeout = step.timeout.filter(|&secs| secs > 0).map(Duration::from_secs);
        let no_output_timeout = step
            .no_output_timeout
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs);

        let hard_deadline = hard_timeout.map(|timeout| Instant::now() + timeout);
        let mut poll = tokio::time::interval(NO_OUTPUT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cancel = self.cancel.clone();
        let has_cancel = cancel.is_some();

        // determine the termination reason without touching the child inside
        // the handlers; the wait future's borrow ends with the select
        let reason = loop {
            tokio::select! {
                status = child.wait() => {
                    return (exit_code_of(status), None);
                }
                _ = tokio::time::sleep_until(hard_deadline.unwrap_or_else(Instant::now)),
                        if hard_deadline.is_some() => {
                    let timeout = hard_timeout.expect("deadline implies timeout");
                    tracing::warn!("step timed out after {timeout:?}, terminating");
                    break Error::StepTimeout(timeout);
                }
                _ = poll.tick(), if no_output_timeout.is_some() => {
                    let timeout = no_output_timeout.expect("polling implies timeout");
                    let idle = last_activity.lock().expect("activity clock").elapsed();
                    if idle >= timeout {
                        tracing::warn!("step produced no output for {timeout:?}, terminating");
                        break Error::NoOutputTimeout(timeout);
                    }
                }
                changed = wait_for_cancel(&mut cancel), if has_cancel => {
                    if changed {
                        tracing::warn!("build cancelled, terminating running step");
                        break Error::Cancelled;
                    }
                }
            }
        };

        let code = terminate_process_group(child).await;
        (code, Some(reason))
    }
}

async fn wait_for_cancel(cancel: &mut Option<CancelSignal>) -> bool {
    match cancel {
        Some(signal) => {
            if signal.is_cancelled() {
                return true;
            }
            if signal.receiver.changed().await.is_err() {
                // sender dropped, no cancellation can arrive anymore
                std::future::pending::<()>().await;
            }
            signal.is_cancelled()
        }
        None => std::future::pending().await,
    }
}

fn spawn_reader<R>(
    mut stream: R,
    sink: Arc<Mutex<LogSink<Stdout>>>,
    last_activity: Arc<Mutex<Instant>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = [0u8; 8192];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    *last_activity.lock().expect("activity clock") = Instant::now();
                    if let Ok(mut sink) = sink.lock() {
                        let _ = sink.write_chunk(&buffer[..n]);
                    }
                }
            }
        }
    })
}

fn exit_code_of(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                return code;
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    return 128 + signal;
                }
            }
            1
        }
        Err(_) => 1,
    }
}

/// Terminate the child's whole process group: SIGTERM, a bounded grace wait,
/// then SIGKILL. Idempotent against an already-exited child.
async fn terminate_process_group(child: &mut Child) -> i32 {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let group = Pid::from_raw(-(pid as i32));
            let _ = kill(group, Signal::SIGTERM);

            match tokio::time::timeout(TERMINATION_GRACE, child.wait()).await {
                Ok(status) => return exit_code_of(status),
                Err(_) => {
                    let _ = kill(group, Signal::SIGKILL);
                }
            }
        }
    }

    let _ = child.kill().await;
    exit_code_of(child.wait().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnvOpts;
    use chrono::Utc;
    use tempfile::TempDir;

    fn write_step_script(paths: &WorkPaths, script: &str) {
        std::fs::write(paths.steps_dir.join("step.sh"), script).unwrap();
    }

    fn results() -> BuildRunResults {
        BuildRunResults::new(Utc::now())
    }

    async fn run_script(script: &str, envs: &[EnvItem], step: Step) -> (RunOutcome, WorkPaths, TempDir) {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::init_at(&tmp.path().join("work")).unwrap();
        write_step_script(&paths, script);
        EnvStore::init(&paths.output_envstore, true).unwrap();

        let ctx = BuildContext::default();
        let runner = StepRunner::new(&ctx, &paths);
        let outcome = runner.run(&step, envs, &results(), &[]).await;
        (outcome, paths, tmp)
    }

    #[tokio::test]
    async fn successful_step_exits_zero() {
        let (outcome, _, _tmp) = run_script("#!/bin/bash\nexit 0\n", &[], Step::default()).await;
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn failing_step_reports_exit_code() {
        let (outcome, _, _tmp) = run_script("#!/bin/bash\nexit 42\n", &[], Step::default()).await;
        assert_eq!(outcome.exit_code, 42);
        assert!(matches!(outcome.error, Some(Error::StepExitedNonZero(42))));
    }

    #[tokio::test]
    async fn step_sees_exported_envs() {
        let (outcome, _, _tmp) = run_script(
            "#!/bin/bash\nif [ \"$MY_INPUT\" != \"expected\" ]; then exit 1; fi\n",
            &[EnvItem::new("MY_INPUT", "expected")],
            Step::default(),
        )
        .await;
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn hard_timeout_kills_the_step_with_reason() {
        let step = Step {
            timeout: Some(1),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let (outcome, _, _tmp) = run_script("#!/bin/bash\nsleep 60\n", &[], step).await;

        assert!(started.elapsed() < Duration::from_secs(12));
        assert!(matches!(outcome.error, Some(Error::StepTimeout(_))));
    }

    #[tokio::test]
    async fn no_output_timeout_has_distinct_reason() {
        let step = Step {
            no_output_timeout: Some(1),
            ..Default::default()
        };
        let (outcome, _, _tmp) = run_script("#!/bin/bash\nsleep 60\n", &[], step).await;
        assert!(matches!(outcome.error, Some(Error::NoOutputTimeout(_))));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn step_outputs_are_collected() {
        let script = r#"#!/bin/bash
cat >> "$ENVMAN_ENVSTORE_PATH" <<DONE
- RELEASE_URL: https://example.com/release
DONE
"#;
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::init_at(&tmp.path().join("work")).unwrap();
        write_step_script(&paths, script);

        let output_store = EnvStore::init(&paths.output_envstore, true).unwrap();
        output_store.add("STALE", "from-earlier-step", true, false, false).unwrap();

        std::env::set_var(
            crate::context::OUTPUT_ENVSTORE_PATH_ENV_KEY,
            &paths.output_envstore,
        );
        let ctx = BuildContext::default();
        let runner = StepRunner::new(&ctx, &paths);
        let outcome = runner.run(&Step::default(), &[], &results(), &[]).await;

        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs[0].key, "RELEASE_URL");
    }

    #[tokio::test]
    async fn templated_inputs_are_evaluated_before_launch() {
        let step = Step {
            inputs: vec![EnvItem::new("IS_CI_INPUT", "{{.IsCI}}").with_opts(EnvOpts {
                is_template: Some(true),
                ..Default::default()
            })],
            ..Default::default()
        };

        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::init_at(&tmp.path().join("work")).unwrap();
        write_step_script(
            &paths,
            "#!/bin/bash\nif [ \"$IS_CI_INPUT\" != \"true\" ]; then exit 1; fi\n",
        );
        EnvStore::init(&paths.output_envstore, true).unwrap();

        let ctx = BuildContext {
            is_ci: true,
            is_pr: false,
        };
        let runner = StepRunner::new(&ctx, &paths);
        let outcome = runner.run(&step, &[], &results(), &[]).await;
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn secrets_never_reach_the_log_messages() {
        let (outcome, _, _tmp) = {
            let tmp = TempDir::new().unwrap();
            let paths = WorkPaths::init_at(&tmp.path().join("work")).unwrap();
            write_step_script(&paths, "#!/bin/bash\necho \"token=$SECRET\"\n");
            EnvStore::init(&paths.output_envstore, true).unwrap();

            let ctx = BuildContext::default();
            let runner = StepRunner::new(&ctx, &paths);
            let outcome = runner
                .run(
                    &Step::default(),
                    &[EnvItem::sensitive("SECRET", "hunter2")],
                    &results(),
                    &["hunter2".to_string()],
                )
                .await;
            (outcome, paths, tmp)
        };

        assert_eq!(outcome.exit_code, 0);
        let combined: Vec<u8> = outcome
            .log_messages
            .iter()
            .flat_map(|message| message.message.clone())
            .collect();
        let combined = String::from_utf8_lossy(&combined);
        assert!(!combined.contains("hunter2"));
        assert!(combined.contains("token=[REDACTED]"));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_step() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkPaths::init_at(&tmp.path().join("work")).unwrap();
        write_step_script(&paths, "#!/bin/bash\nsleep 60\n");
        EnvStore::init(&paths.output_envstore, true).unwrap();

        let ctx = BuildContext::default();
        let (sender, signal) = CancelSignal::new();
        let runner = StepRunner::new(&ctx, &paths).with_cancel(signal);

        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = sender.send(true);
        });

        let outcome = runner.run(&Step::default(), &[], &results(), &[]).await;
        cancel_task.await.unwrap();
        assert!(matches!(outcome.error, Some(Error::Cancelled)));
    }

    #[tokio::test]
    async fn failing_step_surfaces_error_tail() {
        let (outcome, _, _tmp) = run_script(
            "#!/bin/bash\necho \"error: the widget exploded\"\nexit 3\n",
            &[],
            Step::default(),
        )
        .await;
        assert_eq!(outcome.exit_code, 3);
        assert!(outcome
            .detected_error_messages
            .iter()
            .any(|line| line.contains("the widget exploded")));
    }
}

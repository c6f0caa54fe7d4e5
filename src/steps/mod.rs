//! Step acquisition
//!
//! Materializes a step's source tree from its composite ID and produces the
//! canonical step spec merged from the library declaration and the workflow
//! override. Each source kind owns its acquisition path; there is no
//! string-typed branching at call sites.

pub mod steplib;

use std::path::Path;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::models::{merge_step_with, BuildRunResults, SourceKind, Step, StepId, StepInfo};
use crate::paths::WorkPaths;

pub use steplib::{GitStepLibrary, StepLibrary};

/// A step ready to run: populated directory, merged spec, identity.
#[derive(Debug, Clone)]
pub struct AcquiredStep {
    pub step: Step,
    pub info: StepInfo,
}

pub struct StepAcquirer<'a> {
    steplib: &'a dyn StepLibrary,
    paths: &'a WorkPaths,
}

impl<'a> StepAcquirer<'a> {
    pub fn new(steplib: &'a dyn StepLibrary, paths: &'a WorkPaths) -> Self {
        Self { steplib, paths }
    }

    /// Populate the step directory for `id` and merge the declared spec with
    /// the workflow override. Library cache refreshes performed along the
    /// way are recorded in `results`.
    pub async fn acquire(
        &self,
        id: &StepId,
        override_step: &Step,
        results: &mut BuildRunResults,
    ) -> Result<AcquiredStep> {
        let step_dir = &self.paths.steps_dir;
        let yml_path = self.paths.step_yml_path();

        let mut info = StepInfo {
            id: id.id_or_uri.clone(),
            title: override_step.title.clone().unwrap_or_default(),
            version: id.version.clone(),
            steplib: id.source.as_source_str().to_string(),
            ..Default::default()
        };

        let declared: Option<Step> = match &id.source {
            SourceKind::Path => {
                tracing::debug!("local step, copying from (path:{})", id.id_or_uri);
                let source_dir = expand_path(&id.id_or_uri);
                copy_dir_contents(Path::new(&source_dir), step_dir)?;
                Some(read_step_yml(&Path::new(&source_dir).join("step.yml"), &yml_path)?)
            }
            SourceKind::Git => {
                tracing::debug!(
                    "remote step, direct git uri (uri:{}) (tag-or-branch:{})",
                    id.id_or_uri,
                    id.version
                );
                git_clone(&id.id_or_uri, step_dir, &id.version, true).await?;
                Some(read_step_yml(&step_dir.join("step.yml"), &yml_path)?)
            }
            SourceKind::Inline => {
                tracing::debug!(
                    "steplib independent step, direct git uri (uri:{}) (tag-or-branch:{})",
                    id.id_or_uri,
                    id.version
                );
                git_clone(&id.id_or_uri, step_dir, &id.version, true).await?;
                None
            }
            SourceKind::Library(library) => {
                self.steplib.setup(library).await?;

                // a step pinned to no version wants the latest, so refresh
                // the cache once per library per build
                if id.version.is_empty() && !results.is_steplib_updated(library) {
                    tracing::info!("step uses latest version, updating step library ({library})");
                    match self.steplib.update(library).await {
                        Ok(()) => results.record_steplib_update(library),
                        Err(err) => {
                            tracing::warn!("failed to update step library ({library}): {err}")
                        }
                    }
                }

                let resolved = match self.steplib.step_info(library, &id.id_or_uri, &id.version).await {
                    Ok(resolved) => resolved,
                    Err(_) if !results.is_steplib_updated(library) => {
                        tracing::info!(
                            "step info not found in step library ({library}), updating"
                        );
                        self.steplib.update(library).await?;
                        results.record_steplib_update(library);
                        self.steplib
                            .step_info(library, &id.id_or_uri, &id.version)
                            .await?
                    }
                    Err(err) => return Err(err),
                };

                info.version = resolved.version.clone();
                info.latest = resolved.latest.clone();
                info.steplib = library.clone();
                if info.title.is_empty() {
                    info.title = resolved.title.clone();
                }

                self.steplib
                    .activate(library, &id.id_or_uri, &id.version, step_dir, &yml_path)
                    .await?;
                let content = std::fs::read_to_string(&yml_path)?;
                Some(serde_yaml::from_str(&content).map_err(|err| {
                    Error::StepAcquireFailed(format!("invalid step declaration: {err}"))
                })?)
            }
        };

        let merged = match declared {
            Some(spec) => merge_step_with(spec, override_step)?,
            None => {
                let mut inline = override_step.clone();
                inline.fill_missing_defaults();
                inline
            }
        };

        if let Some(support_url) = &merged.support_url {
            info.support_url = support_url.clone();
        }
        if let Some(source_code_url) = &merged.source_code_url {
            info.source_code_url = source_code_url.clone();
        }
        if info.title.is_empty() {
            info.title = merged
                .title
                .clone()
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| id.id_or_uri.clone());
        }

        Ok(AcquiredStep { step: merged, info })
    }
}

fn read_step_yml(source: &Path, dest: &Path) -> Result<Step> {
    let content = std::fs::read_to_string(source).map_err(|err| {
        Error::StepAcquireFailed(format!("failed to read ({}): {err}", source.display()))
    })?;
    std::fs::write(dest, &content)?;
    serde_yaml::from_str(&content)
        .map_err(|err| Error::StepAcquireFailed(format!("invalid step declaration: {err}")))
}

/// Copy a directory tree's contents into `dest` (which must exist).
fn copy_dir_contents(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        return Err(Error::StepAcquireFailed(format!(
            "step source directory does not exist ({})",
            source.display()
        )));
    }
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_dir_contents(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Expand a leading tilde and `$VAR`/`${VAR}` references from the process
/// environment. Used for `path::` step sources only.
pub fn expand_path(input: &str) -> String {
    let tilde_expanded = match input.strip_prefix("~") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{home}{rest}"),
            Err(_) => input.to_string(),
        },
        None => input.to_string(),
    };

    let mut result = String::with_capacity(tilde_expanded.len());
    let mut chars = tilde_expanded.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                key.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if key.is_empty() {
            result.push('$');
        } else {
            result.push_str(&std::env::var(&key).unwrap_or_default());
        }
    }
    result
}

/// `git clone` a repository, optionally at a tag or branch.
pub(crate) async fn git_clone(
    uri: &str,
    dest: &Path,
    tag_or_branch: &str,
    recursive: bool,
) -> Result<()> {
    let mut args: Vec<&str> = vec!["clone"];
    if recursive {
        args.push("--recursive");
    }
    if !tag_or_branch.is_empty() {
        args.push("--branch");
        args.push(tag_or_branch);
    }
    let dest_str = dest.to_string_lossy().to_string();
    args.push(uri);
    args.push(&dest_str);
    run_git(&args, None).await
}

pub(crate) async fn run_git(args: &[&str], cwd: Option<&Path>) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    tracing::debug!("running git {}", args.join(" "));

    let output = cmd
        .output()
        .await
        .map_err(|err| Error::StepAcquireFailed(format!("failed to run git: {err}")))?;
    if !output.status.success() {
        return Err(Error::StepAcquireFailed(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

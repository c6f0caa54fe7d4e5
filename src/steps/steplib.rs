//! Step library collaborator
//!
//! A step library is a versioned collection of step declarations addressed
//! by URL; it ships no code, so activation materializes the step's source
//! on demand. The engine talks to it through the [`StepLibrary`] trait; the
//! production implementation keeps a git clone of the library per URL under
//! the user config directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{compare_versions, Step, StepInfo};
use crate::paths::config_dir;
use crate::steps::{git_clone, run_git};

#[async_trait]
pub trait StepLibrary: Send + Sync {
    /// Make the library usable: fetch its collection when not yet cached.
    async fn setup(&self, library: &str) -> Result<()>;

    /// Refresh the cached collection.
    async fn update(&self, library: &str) -> Result<()>;

    /// Resolve a step reference to its identity. An empty `version` resolves
    /// to the latest known version.
    async fn step_info(&self, library: &str, id: &str, version: &str) -> Result<StepInfo>;

    /// Materialize the step's source tree into `dir` and its declaration
    /// into `yml_dest`.
    async fn activate(
        &self,
        library: &str,
        id: &str,
        version: &str,
        dir: &Path,
        yml_dest: &Path,
    ) -> Result<()>;
}

/// Git-clone backed step library cache.
pub struct GitStepLibrary {
    cache_root: PathBuf,
}

impl GitStepLibrary {
    pub fn new() -> Result<Self> {
        Ok(Self {
            cache_root: config_dir()?.join("steplibs"),
        })
    }

    pub fn with_cache_root(cache_root: PathBuf) -> Self {
        Self { cache_root }
    }

    fn collection_dir(&self, library: &str) -> PathBuf {
        let sanitized: String = library
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.cache_root.join(sanitized)
    }

    fn step_versions_dir(&self, library: &str, id: &str) -> PathBuf {
        self.collection_dir(library).join("steps").join(id)
    }

    fn resolve_version(&self, library: &str, id: &str, version: &str) -> Result<(String, String)> {
        let versions_dir = self.step_versions_dir(library, id);
        let mut versions: Vec<String> = std::fs::read_dir(&versions_dir)
            .map_err(|_| {
                Error::StepAcquireFailed(format!(
                    "step ({id}) not found in step library ({library})"
                ))
            })?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        versions.sort_by(|a, b| compare_versions(a, b));

        let latest = versions.last().cloned().ok_or_else(|| {
            Error::StepAcquireFailed(format!(
                "step ({id}) has no versions in step library ({library})"
            ))
        })?;

        let resolved = if version.is_empty() {
            latest.clone()
        } else if versions.iter().any(|v| v == version) {
            version.to_string()
        } else {
            return Err(Error::StepAcquireFailed(format!(
                "step ({id}) version ({version}) not found in step library ({library})"
            )));
        };

        Ok((resolved, latest))
    }

    fn read_declared_step(&self, library: &str, id: &str, version: &str) -> Result<Step> {
        let yml_path = self
            .step_versions_dir(library, id)
            .join(version)
            .join("step.yml");
        let content = std::fs::read_to_string(&yml_path).map_err(|err| {
            Error::StepAcquireFailed(format!(
                "failed to read step declaration ({}): {err}",
                yml_path.display()
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|err| {
            Error::StepAcquireFailed(format!(
                "invalid step declaration ({}): {err}",
                yml_path.display()
            ))
        })
    }
}

#[async_trait]
impl StepLibrary for GitStepLibrary {
    async fn setup(&self, library: &str) -> Result<()> {
        let dir = self.collection_dir(library);
        if dir.join(".git").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.cache_root)?;
        tracing::debug!("setting up step library ({library})");
        git_clone(library, &dir, "", false).await
    }

    async fn update(&self, library: &str) -> Result<()> {
        let dir = self.collection_dir(library);
        tracing::debug!("updating step library ({library})");
        run_git(&["pull"], Some(&dir)).await
    }

    async fn step_info(&self, library: &str, id: &str, version: &str) -> Result<StepInfo> {
        let (resolved, latest) = self.resolve_version(library, id, version)?;
        let declared = self.read_declared_step(library, id, &resolved)?;
        Ok(StepInfo {
            id: id.to_string(),
            title: declared.title.unwrap_or_default(),
            version: resolved,
            latest,
            steplib: library.to_string(),
            support_url: declared.support_url.unwrap_or_default(),
            source_code_url: declared.source_code_url.unwrap_or_default(),
        })
    }

    async fn activate(
        &self,
        library: &str,
        id: &str,
        version: &str,
        dir: &Path,
        yml_dest: &Path,
    ) -> Result<()> {
        let (resolved, _) = self.resolve_version(library, id, version)?;
        let declared = self.read_declared_step(library, id, &resolved)?;

        let source = declared.source.as_ref().filter(|s| !s.git.is_empty()).ok_or_else(|| {
            Error::StepAcquireFailed(format!(
                "step ({id}@{resolved}) declares no git source in library ({library})"
            ))
        })?;
        git_clone(&source.git, dir, &resolved, true).await?;

        let yml_src = self
            .step_versions_dir(library, id)
            .join(&resolved)
            .join("step.yml");
        std::fs::copy(&yml_src, yml_dest).map_err(|err| {
            Error::StepAcquireFailed(format!(
                "failed to copy step declaration ({}): {err}",
                yml_src.display()
            ))
        })?;
        Ok(())
    }
}

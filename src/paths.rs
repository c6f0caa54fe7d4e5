//! On-disk layout for a single build
//!
//! Every build owns a scratch directory holding the step working directory,
//! the two env store files and the formatted output file. The step directory
//! is wiped before every step; the env stores are owned by the env store
//! gateway and touched only between steps.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

const SETUP_STATE_FILE_NAME: &str = "version.setup";

/// Paths used by one build.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    pub work_dir: PathBuf,
    pub steps_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub input_envstore: PathBuf,
    pub output_envstore: PathBuf,
    pub formatted_output: PathBuf,
}

impl WorkPaths {
    /// Create the build scratch layout under the OS temp directory.
    pub fn init() -> Result<Self> {
        let work_dir = std::env::temp_dir().join(format!("bitrise-work-{}", std::process::id()));
        Self::init_at(&work_dir)
    }

    /// Create the build scratch layout rooted at the given directory.
    pub fn init_at(work_dir: &Path) -> Result<Self> {
        let paths = Self {
            work_dir: work_dir.to_path_buf(),
            steps_dir: work_dir.join("step_src"),
            deploy_dir: work_dir.join("deploy"),
            input_envstore: work_dir.join("input_envstore.yml"),
            output_envstore: work_dir.join("output_envstore.yml"),
            formatted_output: work_dir.join("formatted_output.md"),
        };
        std::fs::create_dir_all(&paths.work_dir)?;
        std::fs::create_dir_all(&paths.steps_dir)?;
        std::fs::create_dir_all(&paths.deploy_dir)?;
        Ok(paths)
    }

    /// Remove and recreate the step working directory. Called before every
    /// step so no step observes a previous step's source tree.
    pub fn cleanup_step_dir(&self) -> Result<()> {
        if self.steps_dir.exists() {
            std::fs::remove_dir_all(&self.steps_dir)?;
        }
        std::fs::create_dir_all(&self.steps_dir)?;
        Ok(())
    }

    /// Location the acquirer copies the active step's declaration to.
    pub fn step_yml_path(&self) -> PathBuf {
        self.work_dir.join("current_step.yml")
    }
}

/// Per-user configuration directory (`~/.bitrise`).
pub fn config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| Error::Other("HOME environment variable is not set".to_string()))?;
    Ok(PathBuf::from(home).join(".bitrise"))
}

/// True when setup has completed for this engine version.
pub fn is_setup_done_for_version(version: &str) -> bool {
    let Ok(dir) = config_dir() else {
        return false;
    };
    match std::fs::read_to_string(dir.join(SETUP_STATE_FILE_NAME)) {
        Ok(content) => content.trim() == version,
        Err(_) => false,
    }
}

/// Record a successful setup for this engine version.
pub fn save_setup_done_for_version(version: &str) -> Result<()> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(SETUP_STATE_FILE_NAME), version)?;
    Ok(())
}

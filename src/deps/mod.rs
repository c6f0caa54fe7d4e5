//! OS-level step dependency handling
//!
//! Before a step runs, its declared dependencies must be satisfied on the
//! host: check-only entries must be discoverable on `PATH`, brew entries
//! apply on macOS, apt-get entries on Linux. Entries for the other platform
//! are skipped silently. In CI mode installers run non-interactively;
//! otherwise the user is asked before anything is installed. A dependency
//! failure is fatal for the step invocation, not for the workflow.

use std::io::Write;
use std::path::PathBuf;
use tokio::process::Command;

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::models::{LegacyDependency, Step};

const LEGACY_MANAGER_BREW: &str = "brew";
const LEGACY_MANAGER_CHECK_ONLY: &str = "_";

pub struct DependencyInstaller {
    ctx: BuildContext,
}

impl DependencyInstaller {
    pub fn new(ctx: BuildContext) -> Self {
        Self { ctx }
    }

    /// Satisfy every dependency the step declares.
    pub async fn install_step_dependencies(&self, step: &Step) -> Result<()> {
        if !step.dependencies.is_empty() {
            tracing::warn!("step.dependencies is deprecated, use step.deps instead");
        }

        if let Some(deps) = step.deps.as_ref().filter(|deps| !deps.is_empty()) {
            for dep in &deps.check_only {
                check_tool_on_path(&dep.name)?;
                tracing::info!(" * [OK] step dependency ({}) installed, available", dep.name);
            }

            if cfg!(target_os = "macos") {
                for dep in &deps.brew {
                    self.install_with_brew_if_needed(&dep.name).await?;
                    tracing::info!(" * [OK] step dependency ({}) installed, available", dep.name);
                }
            } else if cfg!(target_os = "linux") {
                for dep in &deps.apt_get {
                    self.install_with_apt_get_if_needed(&dep.name).await?;
                    tracing::info!(" * [OK] step dependency ({}) installed, available", dep.name);
                }
            } else if !deps.brew.is_empty() || !deps.apt_get.is_empty() {
                return Err(Error::Other("unsupported os".to_string()));
            }
            return Ok(());
        }

        for dep in &step.dependencies {
            self.install_legacy_dependency(dep).await?;
        }
        Ok(())
    }

    async fn install_legacy_dependency(&self, dep: &LegacyDependency) -> Result<()> {
        match dep.manager.as_str() {
            LEGACY_MANAGER_BREW => {
                if cfg!(target_os = "macos") {
                    self.install_with_brew_if_needed(&dep.name).await?;
                    tracing::info!(" * [OK] step dependency ({}) installed, available", dep.name);
                } else {
                    tracing::debug!(
                        " * dependency ({}) skipped, manager ({}) not supported on this platform",
                        dep.name,
                        dep.manager
                    );
                }
                Ok(())
            }
            LEGACY_MANAGER_CHECK_ONLY => {
                check_tool_on_path(&dep.name)?;
                tracing::info!(" * [OK] step dependency ({}) installed, available", dep.name);
                Ok(())
            }
            other => Err(Error::Other(format!(
                "not supported dependency ({other}) ({})",
                dep.name
            ))),
        }
    }

    async fn install_with_brew_if_needed(&self, tool: &str) -> Result<()> {
        if run_quiet("brew", &["list", tool]).await? {
            return Ok(());
        }
        self.confirm_install(tool, "brew")?;
        tracing::info!("installing ({tool}) with brew");
        if !run_inherited("brew", &["install", tool]).await? {
            return Err(Error::DependencyMissing(tool.to_string()));
        }
        Ok(())
    }

    async fn install_with_apt_get_if_needed(&self, tool: &str) -> Result<()> {
        if which(tool).is_some() {
            return Ok(());
        }
        self.confirm_install(tool, "apt-get")?;
        tracing::info!("installing ({tool}) with apt-get");
        if !run_inherited("sudo", &["apt-get", "-y", "install", tool]).await? {
            return Err(Error::DependencyMissing(tool.to_string()));
        }
        Ok(())
    }

    /// Outside CI mode an install needs the user's consent; in CI mode
    /// installers proceed without prompting.
    fn confirm_install(&self, tool: &str, manager: &str) -> Result<()> {
        if self.ctx.is_ci {
            return Ok(());
        }
        print!("step requires ({tool}), install it with {manager}? [yes/no] ");
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .map_err(|err| Error::Other(format!("failed to read answer: {err}")))?;
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(()),
            _ => Err(Error::DependencyMissing(tool.to_string())),
        }
    }
}

/// Locate a tool on `PATH`.
pub fn which(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(tool);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn check_tool_on_path(tool: &str) -> Result<()> {
    which(tool)
        .map(|_| ())
        .ok_or_else(|| Error::DependencyMissing(tool.to_string()))
}

async fn run_quiet(program: &str, args: &[&str]) -> Result<bool> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| Error::Other(format!("failed to run {program}: {err}")))?;
    Ok(output.status.success())
}

async fn run_inherited(program: &str, args: &[&str]) -> Result<bool> {
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|err| Error::Other(format!("failed to run {program}: {err}")))?;
    Ok(status.success())
}

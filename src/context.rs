//! Build context detection
//!
//! CI and PR mode are detected exactly once, at build start, from CLI flags,
//! the host environment, and the secrets inventory. The resulting context is
//! immutable and threaded through every component that needs it; nothing else
//! in the engine reads mode information from the process environment.

use crate::models::EnvItem;

/// Env key signalling CI mode (`"true"` enables it).
pub const CI_MODE_ENV_KEY: &str = "CI";
/// Env key signalling PR mode (`"true"` enables it).
pub const PR_MODE_ENV_KEY: &str = "PR";
/// A non-empty value enables PR mode.
pub const PULL_REQUEST_ID_ENV_KEY: &str = "PULL_REQUEST_ID";

pub const BITRISE_SOURCE_DIR_ENV_KEY: &str = "BITRISE_SOURCE_DIR";
pub const BITRISE_DEPLOY_DIR_ENV_KEY: &str = "BITRISE_DEPLOY_DIR";
pub const BITRISE_BUILD_STATUS_ENV_KEY: &str = "BITRISE_BUILD_STATUS";
pub const STEPLIB_BUILD_STATUS_ENV_KEY: &str = "STEPLIB_BUILD_STATUS";
pub const TRIGGERED_WORKFLOW_ID_ENV_KEY: &str = "BITRISE_TRIGGERED_WORKFLOW_ID";
pub const TRIGGERED_WORKFLOW_TITLE_ENV_KEY: &str = "BITRISE_TRIGGERED_WORKFLOW_TITLE";
pub const LAST_WORKFLOW_ENV_KEY: &str = "BITRISE_CLI_LAST_WORKFLOW";
pub const FORMATTED_OUTPUT_FILE_ENV_KEY: &str = "BITRISE_STEP_FORMATTED_OUTPUT_FILE_PATH";
pub const OUTPUT_ENVSTORE_PATH_ENV_KEY: &str = "ENVMAN_ENVSTORE_PATH";

/// Immutable per-build mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildContext {
    pub is_ci: bool,
    pub is_pr: bool,
}

impl BuildContext {
    /// Detect modes from CLI flags, the host environment and the secrets
    /// inventory. This is the single boundary where the process environment
    /// is consulted for mode information.
    pub fn detect(ci_flag: bool, pr_flag: bool, secrets: &[EnvItem]) -> Self {
        let env_true = |key: &str| std::env::var(key).map(|v| v == "true").unwrap_or(false);
        let env_non_empty = |key: &str| std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false);

        let mut is_ci = ci_flag || env_true(CI_MODE_ENV_KEY);
        let mut is_pr = pr_flag
            || env_true(PR_MODE_ENV_KEY)
            || env_non_empty(PULL_REQUEST_ID_ENV_KEY);

        for secret in secrets {
            match secret.key.as_str() {
                CI_MODE_ENV_KEY if secret.value == "true" => is_ci = true,
                PR_MODE_ENV_KEY if secret.value == "true" => is_pr = true,
                PULL_REQUEST_ID_ENV_KEY if !secret.value.is_empty() => is_pr = true,
                _ => {}
            }
        }

        Self { is_ci, is_pr }
    }

    /// Re-export the detected modes to the process environment so child
    /// processes observe the same flags.
    pub fn register(&self) {
        if self.is_ci {
            tracing::info!("bitrise runs in CI mode");
        }
        if self.is_pr {
            tracing::info!("bitrise runs in PR mode");
        }
        std::env::set_var(CI_MODE_ENV_KEY, if self.is_ci { "true" } else { "false" });
        std::env::set_var(PR_MODE_ENV_KEY, if self.is_pr { "true" } else { "false" });
    }
}

/// True for env keys the engine itself owns as mode or control flags. Values
/// under these keys are never added to the secret redaction set.
pub fn is_built_in_flag_key(key: &str) -> bool {
    matches!(
        key,
        CI_MODE_ENV_KEY | PR_MODE_ENV_KEY | PULL_REQUEST_ID_ENV_KEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnvItem;
    use serial_test::serial;

    fn clear_mode_envs() {
        std::env::remove_var(CI_MODE_ENV_KEY);
        std::env::remove_var(PR_MODE_ENV_KEY);
        std::env::remove_var(PULL_REQUEST_ID_ENV_KEY);
    }

    #[test]
    #[serial]
    fn detects_pr_mode_from_flag_env_and_secrets() {
        clear_mode_envs();

        assert!(!BuildContext::detect(false, false, &[]).is_pr);
        assert!(BuildContext::detect(false, true, &[]).is_pr);

        std::env::set_var(PULL_REQUEST_ID_ENV_KEY, "123");
        assert!(BuildContext::detect(false, false, &[]).is_pr);
        clear_mode_envs();

        let secrets = vec![EnvItem::new(PR_MODE_ENV_KEY, "true")];
        assert!(BuildContext::detect(false, false, &secrets).is_pr);
    }

    #[test]
    #[serial]
    fn detects_ci_mode_from_env() {
        clear_mode_envs();

        assert!(!BuildContext::detect(false, false, &[]).is_ci);
        std::env::set_var(CI_MODE_ENV_KEY, "true");
        assert!(BuildContext::detect(false, false, &[]).is_ci);
        clear_mode_envs();
    }

    #[test]
    fn built_in_flag_keys() {
        assert!(is_built_in_flag_key("CI"));
        assert!(is_built_in_flag_key("PULL_REQUEST_ID"));
        assert!(!is_built_in_flag_key("MY_SECRET"));
    }
}

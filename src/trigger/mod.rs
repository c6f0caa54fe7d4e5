//! Trigger resolution
//!
//! Walks the trigger map in declared order and returns the first matching
//! pipeline or workflow target. Ambiguity is resolved by declaration order;
//! duplicate items are rejected earlier, at config load.

use crate::error::{Error, Result};
use crate::models::{BitriseConfig, TriggerParams, TriggerTarget};

pub struct TriggerResolver<'a> {
    config: &'a BitriseConfig,
}

impl<'a> TriggerResolver<'a> {
    pub fn new(config: &'a BitriseConfig) -> Self {
        Self { config }
    }

    /// First matching target for the given trigger descriptor.
    pub fn resolve(&self, params: &TriggerParams) -> Result<TriggerTarget> {
        for item in &self.config.trigger_map {
            if item.matches(params)? {
                return item
                    .target()
                    .ok_or_else(|| Error::NoTriggerMatch(params.to_string()));
            }
        }
        Err(Error::NoTriggerMatch(params.to_string()))
    }

    /// Resolve a plain CLI pattern: the push branch outside PR mode, the PR
    /// target branch in PR mode. Falls back to treating the pattern as a
    /// workflow id when no trigger item matches.
    pub fn resolve_pattern(&self, pattern: &str, is_pr_mode: bool) -> Result<TriggerTarget> {
        if pattern.is_empty() {
            return Err(Error::ConfigInvalid("empty trigger pattern".to_string()));
        }
        let params = if is_pr_mode {
            TriggerParams::pull_request("", pattern)
        } else {
            TriggerParams::push(pattern)
        };
        match self.resolve(&params) {
            Ok(target) => Ok(target),
            Err(Error::NoTriggerMatch(_))
                if !pattern.starts_with('_') && self.config.workflows.contains_key(pattern) =>
            {
                Ok(TriggerTarget::Workflow(pattern.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TriggerMapItem;

    fn config_with_map(items: Vec<TriggerMapItem>) -> BitriseConfig {
        let mut config = BitriseConfig {
            format_version: "1.4.0".to_string(),
            trigger_map: items,
            ..Default::default()
        };
        for id in ["pr_allowed", "only_code_push", "fall_back"] {
            config
                .workflows
                .insert(id.to_string(), Default::default());
        }
        config
    }

    fn legacy(pattern: &str, pr_allowed: bool, workflow: &str) -> TriggerMapItem {
        TriggerMapItem {
            pattern: Some(pattern.to_string()),
            is_pull_request_allowed: Some(pr_allowed),
            workflow: Some(workflow.to_string()),
            ..Default::default()
        }
    }

    fn pr_check_map() -> Vec<TriggerMapItem> {
        vec![
            legacy("pr_allowed", true, "pr_allowed"),
            legacy("only_code_push", false, "only_code_push"),
            legacy("*", true, "fall_back"),
        ]
    }

    #[test]
    fn first_match_wins_in_declared_order() {
        let config = config_with_map(pr_check_map());
        let resolver = TriggerResolver::new(&config);

        let target = resolver.resolve_pattern("only_code_push", false).unwrap();
        assert_eq!(target, TriggerTarget::Workflow("only_code_push".to_string()));
    }

    #[test]
    fn pr_mode_skips_disallowed_items() {
        let config = config_with_map(pr_check_map());
        let resolver = TriggerResolver::new(&config);

        // the only_code_push item refuses PRs, so the wildcard fallback wins
        let target = resolver.resolve_pattern("only_code_push", true).unwrap();
        assert_eq!(target, TriggerTarget::Workflow("fall_back".to_string()));
    }

    #[test]
    fn unmatched_pattern_falls_back_to_workflow_id() {
        let config = config_with_map(vec![legacy("master", false, "only_code_push")]);
        let resolver = TriggerResolver::new(&config);

        let target = resolver.resolve_pattern("fall_back", false).unwrap();
        assert_eq!(target, TriggerTarget::Workflow("fall_back".to_string()));
    }

    #[test]
    fn unmatched_pattern_without_workflow_errors() {
        let config = config_with_map(vec![]);
        let resolver = TriggerResolver::new(&config);
        assert!(matches!(
            resolver.resolve_pattern("no_such_thing", false),
            Err(Error::NoTriggerMatch(_))
        ));
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let config = config_with_map(pr_check_map());
        let resolver = TriggerResolver::new(&config);
        assert!(resolver.resolve_pattern("", false).is_err());
    }

    #[test]
    fn utility_workflow_never_matches_via_fallback() {
        let mut config = config_with_map(vec![]);
        config.workflows.insert("_utility".to_string(), Default::default());
        let resolver = TriggerResolver::new(&config);
        assert!(matches!(
            resolver.resolve_pattern("_utility", false),
            Err(Error::NoTriggerMatch(_))
        ));
    }
}

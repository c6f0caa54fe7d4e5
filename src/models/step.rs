//! Step model and composite step ID
//!
//! A step declaration is deliberately pointer-laden: every scalar is
//! option-typed so that "unset" and "explicit default" stay distinguishable
//! until [`Step::fill_missing_defaults`] runs at the single merge site.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::env_item::{merge_env_with, EnvItem};

pub const DEFAULT_IS_REQUIRES_ADMIN_USER: bool = false;
pub const DEFAULT_IS_ALWAYS_RUN: bool = false;
pub const DEFAULT_IS_SKIPPABLE: bool = false;
pub const DEFAULT_TIMEOUT_SECS: u64 = 0;

/// Source location of a step's code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub git: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepsItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bin_name: String,
}

/// OS-level dependency sets, keyed by package manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDeps {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brew: Vec<DepsItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apt_get: Vec<DepsItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub check_only: Vec<DepsItem>,
}

impl StepDeps {
    pub fn is_empty(&self) -> bool {
        self.brew.is_empty() && self.apt_get.is_empty() && self.check_only.is_empty()
    }
}

/// Deprecated `{manager, name}` dependency form. The `_` manager is an alias
/// for check-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyDependency {
    pub manager: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BashToolkit {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_file: String,
}

/// Toolkit hint declaring how the step's entry point is invoked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepToolkit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash: Option<BashToolkit>,
}

/// Declarative step definition, as found in `step.yml` or inlined in a
/// workflow's step list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<StepSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_os_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub project_type_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<StepDeps>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<LegacyDependency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolkit: Option<StepToolkit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_requires_admin_user: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_always_run: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_skippable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_output_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<EnvItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<EnvItem>,
}

impl Step {
    /// Apply documented defaults to every still-unset field. Called once,
    /// after spec and override have been merged.
    pub fn fill_missing_defaults(&mut self) {
        if self.title.is_none() {
            self.title = Some(String::new());
        }
        if self.is_requires_admin_user.is_none() {
            self.is_requires_admin_user = Some(DEFAULT_IS_REQUIRES_ADMIN_USER);
        }
        if self.is_always_run.is_none() {
            self.is_always_run = Some(DEFAULT_IS_ALWAYS_RUN);
        }
        if self.is_skippable.is_none() {
            self.is_skippable = Some(DEFAULT_IS_SKIPPABLE);
        }
        if self.run_if.is_none() {
            self.run_if = Some(String::new());
        }
        if self.timeout.is_none() {
            self.timeout = Some(DEFAULT_TIMEOUT_SECS);
        }
        if self.no_output_timeout.is_none() {
            self.no_output_timeout = Some(DEFAULT_TIMEOUT_SECS);
        }
    }

    pub fn is_always_run(&self) -> bool {
        self.is_always_run.unwrap_or(DEFAULT_IS_ALWAYS_RUN)
    }

    pub fn is_skippable(&self) -> bool {
        self.is_skippable.unwrap_or(DEFAULT_IS_SKIPPABLE)
    }

    pub fn input_by_key(&self, key: &str) -> Option<&EnvItem> {
        self.inputs.iter().find(|input| input.key == key)
    }
}

/// Merge a workflow override on top of a library-declared spec. Scalars and
/// whole lists present in the override win; `inputs` and `outputs` merge by
/// key, the override replacing the value while preserving option fields that
/// were not redeclared. Defaults are filled afterwards.
pub fn merge_step_with(spec: Step, override_step: &Step) -> Result<Step> {
    let mut merged = spec;

    if override_step.title.is_some() {
        merged.title = override_step.title.clone();
    }
    if override_step.summary.is_some() {
        merged.summary = override_step.summary.clone();
    }
    if override_step.description.is_some() {
        merged.description = override_step.description.clone();
    }
    if override_step.website.is_some() {
        merged.website = override_step.website.clone();
    }
    if override_step.source_code_url.is_some() {
        merged.source_code_url = override_step.source_code_url.clone();
    }
    if override_step.support_url.is_some() {
        merged.support_url = override_step.support_url.clone();
    }
    if override_step.published_at.is_some() {
        merged.published_at = override_step.published_at;
    }
    if override_step.source.is_some() {
        merged.source = override_step.source.clone();
    }
    if !override_step.host_os_tags.is_empty() {
        merged.host_os_tags = override_step.host_os_tags.clone();
    }
    if !override_step.project_type_tags.is_empty() {
        merged.project_type_tags = override_step.project_type_tags.clone();
    }
    if !override_step.type_tags.is_empty() {
        merged.type_tags = override_step.type_tags.clone();
    }
    if override_step.deps.is_some() {
        merged.deps = override_step.deps.clone();
    }
    if !override_step.dependencies.is_empty() {
        merged.dependencies = override_step.dependencies.clone();
    }
    if override_step.toolkit.is_some() {
        merged.toolkit = override_step.toolkit.clone();
    }
    if override_step.is_requires_admin_user.is_some() {
        merged.is_requires_admin_user = override_step.is_requires_admin_user;
    }
    if override_step.is_always_run.is_some() {
        merged.is_always_run = override_step.is_always_run;
    }
    if override_step.is_skippable.is_some() {
        merged.is_skippable = override_step.is_skippable;
    }
    if override_step.run_if.is_some() {
        merged.run_if = override_step.run_if.clone();
    }
    if override_step.timeout.is_some() {
        merged.timeout = override_step.timeout;
    }
    if override_step.no_output_timeout.is_some() {
        merged.no_output_timeout = override_step.no_output_timeout;
    }

    for override_input in &override_step.inputs {
        match merged
            .inputs
            .iter_mut()
            .find(|input| input.key == override_input.key)
        {
            Some(input) => merge_env_with(input, override_input)?,
            None => merged.inputs.push(override_input.clone()),
        }
    }
    for override_output in &override_step.outputs {
        match merged
            .outputs
            .iter_mut()
            .find(|output| output.key == override_output.key)
        {
            Some(output) => merge_env_with(output, override_output)?,
            None => merged.outputs.push(override_output.clone()),
        }
    }

    merged.fill_missing_defaults();
    Ok(merged)
}

/// Where a step's source tree comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Versioned step library addressed by URL.
    Library(String),
    /// Local directory.
    Path,
    /// Direct git repository URL.
    Git,
    /// Steplib-independent: the whole declaration lives in the workflow.
    Inline,
}

impl SourceKind {
    fn from_source_str(source: &str) -> Option<Self> {
        match source {
            "path" => Some(SourceKind::Path),
            "git" => Some(SourceKind::Git),
            "_" => Some(SourceKind::Inline),
            "" => None,
            other => Some(SourceKind::Library(other.to_string())),
        }
    }

    pub fn as_source_str(&self) -> &str {
        match self {
            SourceKind::Library(url) => url,
            SourceKind::Path => "path",
            SourceKind::Git => "git",
            SourceKind::Inline => "_",
        }
    }
}

/// Parsed composite step ID: `[ source :: ] id-or-uri [ @ version ]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepId {
    pub source: SourceKind,
    pub id_or_uri: String,
    pub version: String,
}

impl StepId {
    /// Parse a composite ID string, falling back to `default_library` when
    /// no source is given.
    pub fn parse(composite: &str, default_library: &str) -> Result<Self> {
        if composite.is_empty() {
            return Err(Error::ConfigInvalid(
                "empty composite step id".to_string(),
            ));
        }

        let (source_str, rest) = match composite.split_once("::") {
            Some((source, rest)) => (source, rest),
            None => ("", composite),
        };

        let source = match SourceKind::from_source_str(source_str) {
            Some(source) => source,
            None if !default_library.is_empty() => SourceKind::Library(default_library.to_string()),
            None => {
                return Err(Error::ConfigInvalid(format!(
                    "no step source defined and no default step library source (composite: {composite})"
                )))
            }
        };

        // git URIs may carry a user part (git@host:...), which must not be
        // taken for the version separator
        let (uri_prefix, versioned) = match rest.strip_prefix("git@") {
            Some(stripped) if source == SourceKind::Git || source == SourceKind::Inline => {
                ("git@", stripped)
            }
            _ => ("", rest),
        };

        let (id_part, version) = match versioned.split_once('@') {
            Some((id, version)) => {
                if version.contains('@') {
                    return Err(Error::ConfigInvalid(format!(
                        "invalid composite step id ({composite}): more than one version separator"
                    )));
                }
                (id, version.to_string())
            }
            None => (versioned, String::new()),
        };

        if id_part.is_empty() && uri_prefix.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "invalid composite step id ({composite}): empty step id"
            )));
        }

        Ok(StepId {
            source,
            id_or_uri: format!("{uri_prefix}{id_part}"),
            version,
        })
    }

    /// A version-qualified step library reference uniquely identifies a
    /// cached artifact; path, git and inline references never do.
    pub fn is_unique_resource_id(&self) -> bool {
        matches!(self.source, SourceKind::Library(_))
            && !self.id_or_uri.is_empty()
            && !self.version.is_empty()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.source.as_source_str(), self.id_or_uri)?;
        if !self.version.is_empty() {
            write!(f, "@{}", self.version)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_composite_id_variants() {
        struct Case {
            composite: &'static str,
            default_library: &'static str,
            want_source: &'static str,
            want_id: &'static str,
            want_version: &'static str,
        }

        let cases = [
            Case {
                composite: "step-id@0.0.1",
                default_library: "default-steplib-src",
                want_source: "default-steplib-src",
                want_id: "step-id",
                want_version: "0.0.1",
            },
            Case {
                composite: "::step-id@0.0.1",
                default_library: "default-steplib-src",
                want_source: "default-steplib-src",
                want_id: "step-id",
                want_version: "0.0.1",
            },
            Case {
                composite: "step-id",
                default_library: "default-steplib-src",
                want_source: "default-steplib-src",
                want_id: "step-id",
                want_version: "",
            },
            Case {
                composite: "steplib-src::step-id@0.0.1",
                default_library: "",
                want_source: "steplib-src",
                want_id: "step-id",
                want_version: "0.0.1",
            },
            Case {
                composite: "_::https://github.com/bitrise-io/steps-timestamp.git@1.0.0",
                default_library: "",
                want_source: "_",
                want_id: "https://github.com/bitrise-io/steps-timestamp.git",
                want_version: "1.0.0",
            },
            Case {
                composite: "path::/some/path",
                default_library: "",
                want_source: "path",
                want_id: "/some/path",
                want_version: "",
            },
            Case {
                composite: "path::$HOME/some/path/in/home",
                default_library: "",
                want_source: "path",
                want_id: "$HOME/some/path/in/home",
                want_version: "",
            },
            Case {
                composite: "git::https://github.com/bitrise-io/steps-timestamp.git@develop",
                default_library: "default-steplib-src",
                want_source: "git",
                want_id: "https://github.com/bitrise-io/steps-timestamp.git",
                want_version: "develop",
            },
            Case {
                composite: "git::git@github.com:bitrise-io/steps-timestamp.git@develop",
                default_library: "",
                want_source: "git",
                want_id: "git@github.com:bitrise-io/steps-timestamp.git",
                want_version: "develop",
            },
            Case {
                composite: "git::git@github.com:bitrise-io/steps-timestamp.git",
                default_library: "default-steplib-src",
                want_source: "git",
                want_id: "git@github.com:bitrise-io/steps-timestamp.git",
                want_version: "",
            },
        ];

        for case in cases {
            let id = StepId::parse(case.composite, case.default_library).unwrap();
            assert_eq!(id.source.as_source_str(), case.want_source, "{}", case.composite);
            assert_eq!(id.id_or_uri, case.want_id, "{}", case.composite);
            assert_eq!(id.version, case.want_version, "{}", case.composite);
        }
    }

    #[test]
    fn rejects_invalid_composite_ids() {
        assert!(StepId::parse("", "default").is_err());
        assert!(StepId::parse("@1.0.0", "default").is_err());
        assert!(StepId::parse("step-id@0.0.1", "").is_err());
        assert!(StepId::parse("::step-id@0.0.1", "").is_err());
    }

    #[test]
    fn unique_resource_id_requires_library_id_and_version() {
        let full = StepId::parse("my-lib::script@1.2.3", "").unwrap();
        assert!(full.is_unique_resource_id());

        let unversioned = StepId::parse("my-lib::script", "").unwrap();
        assert!(!unversioned.is_unique_resource_id());

        for composite in ["path::/x", "git::https://host/x.git@dev", "_::https://host/x.git@1"] {
            let id = StepId::parse(composite, "").unwrap();
            assert!(!id.is_unique_resource_id(), "{composite}");
        }
    }

    #[test]
    fn merge_prefers_override_scalars_and_merges_inputs_by_key() {
        let spec = Step {
            description: Some("desc 1".to_string()),
            summary: Some("sum 1".to_string()),
            website: Some("web/1".to_string()),
            source_code_url: Some("fork/1".to_string()),
            host_os_tags: vec!["osx".to_string()],
            inputs: vec![EnvItem::new("KEY_1", "Value 1"), EnvItem::new("KEY_2", "Value 2")],
            ..Default::default()
        };

        let override_step = Step {
            title: Some("name 2".to_string()),
            host_os_tags: vec!["linux".to_string()],
            support_url: Some("supp".to_string()),
            run_if: Some(String::new()),
            timeout: Some(1),
            inputs: vec![EnvItem::new("KEY_2", "Value 2 CHANGED")],
            ..Default::default()
        };

        let merged = merge_step_with(spec, &override_step).unwrap();

        assert_eq!(merged.title.as_deref(), Some("name 2"));
        assert_eq!(merged.description.as_deref(), Some("desc 1"));
        assert_eq!(merged.summary.as_deref(), Some("sum 1"));
        assert_eq!(merged.website.as_deref(), Some("web/1"));
        assert_eq!(merged.source_code_url.as_deref(), Some("fork/1"));
        assert_eq!(merged.host_os_tags, vec!["linux".to_string()]);
        assert_eq!(merged.run_if.as_deref(), Some(""));
        assert_eq!(merged.timeout, Some(1));

        assert_eq!(merged.inputs[0].key, "KEY_1");
        assert_eq!(merged.inputs[0].value, "Value 1");
        assert_eq!(merged.inputs[1].key, "KEY_2");
        assert_eq!(merged.inputs[1].value, "Value 2 CHANGED");
    }

    #[test]
    fn defaults_applied_after_merge() {
        let merged = merge_step_with(Step::default(), &Step::default()).unwrap();
        assert_eq!(merged.is_always_run, Some(false));
        assert_eq!(merged.is_skippable, Some(false));
        assert_eq!(merged.timeout, Some(0));
        assert_eq!(merged.no_output_timeout, Some(0));
    }
}

//! Environment item model
//!
//! An env item is a `(key, value, options)` triple. In the configuration
//! document it is written as a single-entry mapping with an optional `opts`
//! sibling:
//!
//! ```yaml
//! - MY_KEY: my value
//!   opts:
//!     is_expand: false
//!     is_sensitive: true
//! ```
//!
//! Option fields deliberately distinguish "unset" from "explicit default";
//! defaults are applied at a single site ([`EnvOpts::resolved`]).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub const DEFAULT_IS_EXPAND: bool = true;
pub const DEFAULT_SKIP_IF_EMPTY: bool = false;
pub const DEFAULT_IS_SENSITIVE: bool = false;
pub const DEFAULT_IS_REQUIRED: bool = false;
pub const DEFAULT_IS_TEMPLATE: bool = false;
pub const DEFAULT_IS_DONT_CHANGE_VALUE: bool = false;

static ENV_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_]*$").expect("valid env key pattern"));

const OPTIONS_KEY: &str = "opts";

/// Declarative options attached to an env item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_expand: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_empty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_template: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dont_change_value: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_yaml::Value>,
}

/// Options with every boolean resolved to its documented default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOpts {
    pub is_required: bool,
    pub is_expand: bool,
    pub skip_if_empty: bool,
    pub is_sensitive: bool,
    pub is_template: bool,
}

impl EnvOpts {
    pub fn is_default(&self) -> bool {
        *self == EnvOpts::default()
    }

    /// Apply documented defaults to every unset boolean.
    pub fn resolved(&self) -> ResolvedOpts {
        ResolvedOpts {
            is_required: self.is_required.unwrap_or(DEFAULT_IS_REQUIRED),
            is_expand: self.is_expand.unwrap_or(DEFAULT_IS_EXPAND),
            skip_if_empty: self.skip_if_empty.unwrap_or(DEFAULT_SKIP_IF_EMPTY),
            is_sensitive: self.is_sensitive.unwrap_or(DEFAULT_IS_SENSITIVE),
            is_template: self.is_template.unwrap_or(DEFAULT_IS_TEMPLATE),
        }
    }

    /// Merge `other` on top of `self`: fields declared in `other` win,
    /// everything else is preserved.
    pub fn merge_with(&mut self, other: &EnvOpts) {
        if other.title.is_some() {
            self.title = other.title.clone();
        }
        if other.summary.is_some() {
            self.summary = other.summary.clone();
        }
        if other.description.is_some() {
            self.description = other.description.clone();
        }
        if other.category.is_some() {
            self.category = other.category.clone();
        }
        if !other.value_options.is_empty() {
            self.value_options = other.value_options.clone();
        }
        if other.is_required.is_some() {
            self.is_required = other.is_required;
        }
        if other.is_expand.is_some() {
            self.is_expand = other.is_expand;
        }
        if other.skip_if_empty.is_some() {
            self.skip_if_empty = other.skip_if_empty;
        }
        if other.is_sensitive.is_some() {
            self.is_sensitive = other.is_sensitive;
        }
        if other.is_template.is_some() {
            self.is_template = other.is_template;
        }
        if other.is_dont_change_value.is_some() {
            self.is_dont_change_value = other.is_dont_change_value;
        }
        for (k, v) in &other.meta {
            self.meta.insert(k.clone(), v.clone());
        }
    }
}

/// A single environment variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvItem {
    pub key: String,
    pub value: String,
    pub opts: EnvOpts,
}

impl EnvItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            opts: EnvOpts::default(),
        }
    }

    pub fn sensitive(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut item = Self::new(key, value);
        item.opts.is_sensitive = Some(true);
        item
    }

    pub fn with_opts(mut self, opts: EnvOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Validate the key against the allowed grammar.
    pub fn validate(&self) -> Result<()> {
        if !ENV_KEY_PATTERN.is_match(&self.key) {
            return Err(Error::ConfigInvalid(format!(
                "invalid env key ({}): doesn't conform to: [A-Za-z0-9_]",
                self.key
            )));
        }
        Ok(())
    }
}

/// Merge `other` on top of `base`. Both items must declare the same key;
/// `other`'s value wins and option fields redeclared by `other` replace the
/// base declaration while every other option field is preserved.
pub fn merge_env_with(base: &mut EnvItem, other: &EnvItem) -> Result<()> {
    if base.key != other.key {
        return Err(Error::MergeConflict(format!(
            "env item keys differ ({} != {})",
            base.key, other.key
        )));
    }
    base.value = other.value.clone();
    base.opts.merge_with(&other.opts);
    Ok(())
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

impl<'de> Deserialize<'de> for EnvItem {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = BTreeMap::<String, serde_yaml::Value>::deserialize(deserializer)?;

        let mut opts = EnvOpts::default();
        let mut pair: Option<(String, String)> = None;
        for (key, value) in &map {
            if key == OPTIONS_KEY {
                opts = serde_yaml::from_value(value.clone()).map_err(DeError::custom)?;
                continue;
            }
            if pair.is_some() {
                let keys: Vec<&str> = map.keys().map(String::as_str).collect();
                return Err(DeError::custom(format!(
                    "invalid env: more than 2 keys specified: [{}]",
                    keys.join(" ")
                )));
            }
            let value = yaml_scalar_to_string(value).ok_or_else(|| {
                DeError::custom(format!("invalid env value for key ({key}): not a scalar"))
            })?;
            pair = Some((key.clone(), value));
        }

        let (key, value) =
            pair.ok_or_else(|| DeError::custom("invalid env: no key-value specified"))?;
        Ok(EnvItem { key, value, opts })
    }
}

impl Serialize for EnvItem {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeMap;
        let entries = if self.opts.is_default() { 1 } else { 2 };
        let mut map = serializer.serialize_map(Some(entries))?;
        map.serialize_entry(&self.key, &self.value)?;
        if !self.opts.is_default() {
            map.serialize_entry(OPTIONS_KEY, &self.opts)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_item() {
        let item: EnvItem = serde_yaml::from_str("MY_KEY: my value").unwrap();
        assert_eq!(item.key, "MY_KEY");
        assert_eq!(item.value, "my value");
        assert!(item.opts.is_default());
    }

    #[test]
    fn parses_item_with_opts() {
        let yaml = r#"
MY_KEY: my value
opts:
  title: test
  is_expand: false
  is_sensitive: true
"#;
        let item: EnvItem = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(item.opts.title.as_deref(), Some("test"));
        assert_eq!(item.opts.is_expand, Some(false));

        let resolved = item.opts.resolved();
        assert!(!resolved.is_expand);
        assert!(resolved.is_sensitive);
        assert!(!resolved.skip_if_empty);
    }

    #[test]
    fn parses_non_string_scalars() {
        let item: EnvItem = serde_yaml::from_str("COUNT: 42").unwrap();
        assert_eq!(item.value, "42");

        let item: EnvItem = serde_yaml::from_str("FLAG: true").unwrap();
        assert_eq!(item.value, "true");

        let item: EnvItem = serde_yaml::from_str("EMPTY:").unwrap();
        assert_eq!(item.value, "");
    }

    #[test]
    fn rejects_multiple_keys() {
        let yaml = r#"
content: echo "Hello"
BAD_KEY: value
"#;
        let err = serde_yaml::from_str::<EnvItem>(yaml).unwrap_err();
        assert!(err.to_string().contains("more than 2 keys specified"));
    }

    #[test]
    fn round_trips_through_yaml() {
        let yaml = "MY_KEY: my value\nopts:\n  is_sensitive: true\n";
        let item: EnvItem = serde_yaml::from_str(yaml).unwrap();
        let rendered = serde_yaml::to_string(&item).unwrap();
        let reparsed: EnvItem = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(item, reparsed);
    }

    #[test]
    fn validates_key_grammar() {
        assert!(EnvItem::new("GOOD_KEY_1", "v").validate().is_ok());
        assert!(EnvItem::new("_LEADING", "v").validate().is_ok());
        assert!(EnvItem::new("bad-key", "v").validate().is_err());
        assert!(EnvItem::new("", "v").validate().is_err());
    }

    #[test]
    fn merge_keeps_undeclared_option_fields() {
        let mut base = EnvItem::new("KEY", "old");
        base.opts.title = Some("base title".to_string());
        base.opts.skip_if_empty = Some(true);

        let mut other = EnvItem::new("KEY", "new");
        other.opts.is_expand = Some(false);

        merge_env_with(&mut base, &other).unwrap();
        assert_eq!(base.value, "new");
        assert_eq!(base.opts.title.as_deref(), Some("base title"));
        assert_eq!(base.opts.skip_if_empty, Some(true));
        assert_eq!(base.opts.is_expand, Some(false));
    }

    #[test]
    fn merge_rejects_different_keys() {
        let mut base = EnvItem::new("KEY_A", "v");
        let other = EnvItem::new("KEY_B", "v");
        assert!(merge_env_with(&mut base, &other).is_err());
    }
}

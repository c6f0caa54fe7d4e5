//! File-backed env store gateway
//!
//! The store serializes an ordered env list to disk so variables can cross
//! process boundaries. It is the only component that touches the store
//! files; callers interact through typed operations. Concurrent writers to
//! the same path are not supported.
//!
//! Duplicate-key policy on `add`: the later add overrides the earlier one,
//! unless the new item sets `skip_if_empty` and its value is empty, in which
//! case the prior value is retained. `is_expand` is resolved at read time by
//! substituting previously exported keys in declaration order; a reference
//! to an unset key expands to the empty string.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::EnvItem;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default, deserialize_with = "null_to_empty")]
    envs: Vec<EnvItem>,
}

// steps append bare list items under the `envs:` key, so a store holding no
// items must serialize as `envs:` (null), not `envs: []`
fn null_to_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<EnvItem>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<EnvItem>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Handle on one on-disk env store.
#[derive(Debug, Clone)]
pub struct EnvStore {
    path: PathBuf,
}

impl EnvStore {
    /// Open the store at `path`, creating an empty one when missing. With
    /// `clear` set any existing content is dropped.
    pub fn init(path: &Path, clear: bool) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
        };
        if clear || !path.exists() {
            store.write(&StoreFile::default())?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop every stored item.
    pub fn clear(&self) -> Result<()> {
        self.write(&StoreFile::default())
    }

    /// Append one variable, applying the duplicate-key policy.
    pub fn add(
        &self,
        key: &str,
        value: &str,
        expand: bool,
        skip_if_empty: bool,
        sensitive: bool,
    ) -> Result<()> {
        let mut item = EnvItem::new(key, value);
        item.opts.is_expand = Some(expand);
        item.opts.skip_if_empty = Some(skip_if_empty);
        item.opts.is_sensitive = Some(sensitive);
        self.add_item(&item)
    }

    /// Append one declared env item, applying the duplicate-key policy.
    pub fn add_item(&self, item: &EnvItem) -> Result<()> {
        item.validate()?;
        let mut file = self.read()?;

        let resolved = item.opts.resolved();
        if resolved.skip_if_empty
            && item.value.is_empty()
            && file.envs.iter().any(|existing| existing.key == item.key)
        {
            return Ok(());
        }

        file.envs.retain(|existing| existing.key != item.key);
        file.envs.push(item.clone());
        self.write(&file)
    }

    /// Append a list of items in order.
    pub fn add_many(&self, items: &[EnvItem]) -> Result<()> {
        for item in items {
            self.add_item(item)?;
        }
        Ok(())
    }

    /// The stored items, unevaluated and in declaration order.
    pub fn read_raw(&self) -> Result<Vec<EnvItem>> {
        Ok(self.read()?.envs)
    }

    /// The stored items as a JSON document, unevaluated.
    pub fn read_raw_json(&self) -> Result<String> {
        let envs = self.read_raw()?;
        Ok(serde_json::to_string(&envs)?)
    }

    /// Evaluate the store into final `(key, value)` pairs. Expansion
    /// substitutes `$KEY` and `${KEY}` from `base` overlaid with previously
    /// exported store keys, in declaration order. Items whose resolved value
    /// is empty are dropped when `skip_if_empty` is set.
    pub fn read_evaluated(&self, base: &HashMap<String, String>) -> Result<Vec<(String, String)>> {
        let items = self.read_raw()?;

        let mut exported = base.clone();
        let mut order: Vec<String> = Vec::new();

        for item in &items {
            let resolved = item.opts.resolved();
            let value = if resolved.is_expand {
                expand_references(&item.value, &exported)
            } else {
                item.value.clone()
            };

            if resolved.skip_if_empty && value.is_empty() {
                continue;
            }

            if !order.contains(&item.key) {
                order.push(item.key.clone());
            }
            exported.insert(item.key.clone(), value);
        }

        Ok(order
            .into_iter()
            .map(|key| {
                let value = exported.get(&key).cloned().unwrap_or_default();
                (key, value)
            })
            .collect())
    }

    /// Values of every stored item flagged sensitive, for the redaction set.
    pub fn sensitive_values(&self) -> Result<Vec<String>> {
        Ok(self
            .read_raw()?
            .into_iter()
            .filter(|item| item.opts.resolved().is_sensitive && !item.value.is_empty())
            .map(|item| item.value)
            .collect())
    }

    fn read(&self) -> Result<StoreFile> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|err| Error::EnvStore(format!("failed to read {}: {err}", self.path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|err| Error::EnvStore(format!("failed to parse {}: {err}", self.path.display())))
    }

    fn write(&self, file: &StoreFile) -> Result<()> {
        let content = if file.envs.is_empty() {
            "envs:\n".to_string()
        } else {
            serde_yaml::to_string(file)
                .map_err(|err| Error::EnvStore(format!("failed to serialize env store: {err}")))?
        };
        std::fs::write(&self.path, content)
            .map_err(|err| Error::EnvStore(format!("failed to write {}: {err}", self.path.display())))
    }
}

/// Substitute `$KEY` and `${KEY}` references from the given map. Unknown
/// keys expand to the empty string; a `$` not followed by a key char is
/// passed through verbatim.
fn expand_references(value: &str, exported: &HashMap<String, String>) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut key = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    key.push(inner);
                }
                if closed {
                    result.push_str(exported.get(&key).map(String::as_str).unwrap_or(""));
                } else {
                    result.push_str("${");
                    result.push_str(&key);
                }
            }
            Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
                let mut key = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        key.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                result.push_str(exported.get(&key).map(String::as_str).unwrap_or(""));
            }
            _ => result.push('$'),
        }
    }

    result
}

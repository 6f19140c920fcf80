//! Typed configuration lookups by dotted key.
//!
//! The engine never parses configuration files on its own hot paths; it reads
//! everything it needs through [`ConfigStore`] once at startup.

use std::{collections::BTreeMap, path::Path};

use serde_json::Value;

use crate::error::{TpsError, TpsResult};

pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn get_int(&self, key: &str, default: i64) -> TpsResult<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| TpsError::Config(format!("{key}: expected integer, got {raw:?}"))),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> TpsResult<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(TpsError::Config(format!(
                    "{key}: expected boolean, got {raw:?}"
                ))),
            },
        }
    }

    /// Keys directly below `prefix`, e.g. `tps.connector` yields `tks1`, `kra1`.
    fn children(&self, prefix: &str) -> Vec<String>;
}

/// Flat in-memory store. Loaded from YAML, JSON, or `key=value` lines.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    entries: BTreeMap<String, String>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> TpsResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TpsError::Config(format!("{}: {e}", path.display())))?;
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "json" => {
                let value: Value = serde_json::from_str(&contents).map_err(TpsError::config)?;
                Self::from_value(&value)
            }
            "yaml" | "yml" => {
                let value: Value = serde_yaml::from_str(&contents).map_err(TpsError::config)?;
                Self::from_value(&value)
            }
            _ => Ok(Self::from_properties(&contents)),
        }
    }

    /// Parse `key=value` lines; `#` starts a comment line.
    pub fn from_properties(contents: &str) -> Self {
        let mut store = Self::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                store.set(key.trim(), value.trim());
            }
        }
        store
    }

    pub fn from_value(value: &Value) -> TpsResult<Self> {
        let mut store = Self::new();
        match value {
            Value::Object(_) => {
                flatten(String::new(), value, &mut store.entries);
                Ok(store)
            }
            Value::Null => Ok(store),
            _ => Err(TpsError::config("configuration root must be a mapping")),
        }
    }
}

fn flatten(prefix: String, value: &Value, out: &mut BTreeMap<String, String>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten(join(key), child, out);
            }
        }
        Value::Array(items) => {
            let joined = items
                .iter()
                .map(scalar_string)
                .collect::<Vec<_>>()
                .join(",");
            out.insert(prefix, joined);
        }
        Value::Null => {}
        other => {
            out.insert(prefix, scalar_string(other));
        }
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn children(&self, prefix: &str) -> Vec<String> {
        let lead = format!("{prefix}.");
        let mut out: Vec<String> = self
            .entries
            .keys()
            .filter_map(|key| key.strip_prefix(&lead))
            .filter_map(|rest| rest.split('.').next())
            .map(str::to_string)
            .collect();
        out.dedup();
        out
    }
}

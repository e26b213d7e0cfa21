//! Environment variables
//!
//! A single in-process map. Keys are stored uppercase, so `tmpdir` and
//! `TMPDIR` are the same variable. The map starts with one entry,
//! `TMPDIR`, pointing at the configured temp directory.

use crate::lock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use tracing::warn;

pub const TMPDIR: &str = "TMPDIR";

pub struct Environment {
    vars: Mutex<BTreeMap<String, String>>,
    /// Keys that may be missing without a warning
    tolerated: HashSet<String>,
}

fn normalize(key: &str) -> String {
    key.to_uppercase()
}

impl Environment {
    pub fn new(tmp_dir: &str, tolerated: &[String]) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(TMPDIR.to_string(), tmp_dir.to_string());
        Self {
            vars: Mutex::new(vars),
            tolerated: tolerated.iter().map(|k| normalize(k)).collect(),
        }
    }

    pub fn getenv(&self, key: &str) -> Option<String> {
        let key = normalize(key);
        let value = lock(&self.vars).get(&key).cloned();
        if value.is_none() && !self.tolerated.contains(&key) {
            warn!(key = %key, "getenv of unknown variable");
        }
        value
    }

    pub fn setenv(&self, key: &str, value: &str) {
        lock(&self.vars).insert(normalize(key), value.to_string());
    }

    pub fn unsetenv(&self, key: &str) {
        lock(&self.vars).remove(&normalize(key));
    }

    /// Every variable as `KEY=value`, sorted by key
    pub fn environ(&self) -> Vec<String> {
        lock(&self.vars)
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// Current temp directory
    pub fn tmp_dir(&self) -> Option<String> {
        lock(&self.vars).get(TMPDIR).cloned()
    }
}

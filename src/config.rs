//! Bridge configuration
//!
//! Everything has a default, so a bridge works with no configuration at
//! all. An embedding page can override fields by putting a JSON object in
//! the `bridge-config` attribute of the embed tag; the attribute arrives in
//! the creation event's argument map.

use crate::kernel::error::{SyscallError, SyscallResult};
use crate::platform::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Embed-tag attribute holding a JSON `BridgeConfig`
pub const CONFIG_ATTRIBUTE: &str = "bridge-config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Temp-file prefix, also the initial value of `TMPDIR`
    pub tmp_dir: String,
    /// Longest message the host console accepts
    pub log_chunk_size: usize,
    /// Severity of descriptor 1
    pub stdout_level: LogLevel,
    /// Severity of descriptor 2
    pub stderr_level: LogLevel,
    /// Keys `getenv` may find missing without logging about it
    pub tolerated_env_keys: Vec<String>,
    /// Directories that exist from the start. Defaults to the temp dir.
    pub known_dirs: Vec<String>,
    /// Seed for the random device; the wall clock when absent
    pub random_seed: Option<u64>,
    /// Panic on fatal errors instead of returning them
    pub abort_on_fatal: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let tmp_dir = "/tmp".to_string();
        Self {
            known_dirs: vec![tmp_dir.clone()],
            tmp_dir,
            log_chunk_size: 128,
            stdout_level: LogLevel::Log,
            stderr_level: LogLevel::Warning,
            tolerated_env_keys: vec!["ZONEINFO".into(), "HTTP_PROXY".into(), "TZ".into()],
            random_seed: None,
            abort_on_fatal: false,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON object. Absent fields keep their defaults, except
    /// that `known_dirs` follows an overridden `tmp_dir`.
    pub fn from_json(json: &str) -> SyscallResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| SyscallError::Config(e.to_string()))?;
        let has_known_dirs = value.get("known_dirs").is_some();
        let mut config: Self =
            serde_json::from_value(value).map_err(|e| SyscallError::Config(e.to_string()))?;
        if !has_known_dirs {
            config.known_dirs = vec![config.tmp_dir.clone()];
        }
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration from creation arguments
    pub fn from_args(args: &HashMap<String, String>) -> SyscallResult<Self> {
        match args.get(CONFIG_ATTRIBUTE) {
            Some(json) => Self::from_json(json),
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> SyscallResult<()> {
        if self.log_chunk_size == 0 {
            return Err(SyscallError::Config("log_chunk_size must be positive".into()));
        }
        if !self.tmp_dir.starts_with('/') {
            return Err(SyscallError::Config(format!(
                "tmp_dir must be absolute, got {:?}",
                self.tmp_dir
            )));
        }
        Ok(())
    }

    /// Seed for the random device
    pub fn seed(&self) -> u64 {
        self.random_seed.unwrap_or_else(clock_seed)
    }
}

#[cfg(target_arch = "wasm32")]
fn clock_seed() -> u64 {
    js_sys::Date::now() as u64
}

#[cfg(not(target_arch = "wasm32"))]
fn clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

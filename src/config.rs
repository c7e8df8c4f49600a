//! Engine configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AclError, Result};
use crate::matcher::{DEFAULT_ACL_MEMORY_BUDGET, LOW_MEMORY_ACL_BUDGET};

/// Default traffic sampling interval
pub const DEFAULT_SPEED_INTERVAL_MS: u64 = 1000;

/// Default recursion bound for `#IMPORT_URL` resolution
pub const DEFAULT_IMPORT_DEPTH: usize = 10;

/// Default location of published rule sets
pub const DEFAULT_REMOTE_RULE_BASE: &str = "https://shadowsocks.org/acl/android/v5.0/";

/// Settings shared by the ACL pipeline and the traffic looper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Traffic sampling interval in milliseconds, 0 disables sampling
    pub speed_interval_ms: u64,
    /// Report bypass (direct) speed next to proxy speed
    pub show_direct_speed: bool,
    /// Keep and persist per-profile traffic counters
    pub profile_traffic_statistics: bool,
    /// Regex memory budget in bytes for each hostname set
    pub acl_memory_budget: usize,
    /// Directory holding one cached `<id>.acl` file per rule set
    pub rule_set_dir: PathBuf,
    /// URL prefix the syncer downloads `<id>.acl` from
    pub remote_rule_base: String,
    /// Recursion bound for imports
    pub import_depth: usize,
    /// Hostname classification cache size, 0 disables it
    pub match_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            speed_interval_ms: DEFAULT_SPEED_INTERVAL_MS,
            show_direct_speed: true,
            profile_traffic_statistics: true,
            acl_memory_budget: DEFAULT_ACL_MEMORY_BUDGET,
            rule_set_dir: PathBuf::from("acl"),
            remote_rule_base: DEFAULT_REMOTE_RULE_BASE.to_string(),
            import_depth: DEFAULT_IMPORT_DEPTH,
            match_cache_size: 0,
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for memory-constrained devices
    pub fn low_memory() -> Self {
        Self {
            acl_memory_budget: LOW_MEMORY_ACL_BUDGET,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            AclError::ConfigError(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.acl_memory_budget == 0 {
            return Err(AclError::ConfigError(
                "acl_memory_budget must be greater than zero".to_string(),
            ));
        }
        if !(self.remote_rule_base.starts_with("http://")
            || self.remote_rule_base.starts_with("https://"))
        {
            return Err(AclError::ConfigError(format!(
                "remote_rule_base must be an http(s) URL: {}",
                self.remote_rule_base
            )));
        }
        Ok(())
    }

    /// Sampling interval, `None` when sampling is disabled
    pub fn speed_interval(&self) -> Option<Duration> {
        (self.speed_interval_ms > 0).then(|| Duration::from_millis(self.speed_interval_ms))
    }

    pub fn with_speed_interval_ms(mut self, ms: u64) -> Self {
        self.speed_interval_ms = ms;
        self
    }

    pub fn with_show_direct_speed(mut self, show: bool) -> Self {
        self.show_direct_speed = show;
        self
    }

    pub fn with_profile_traffic_statistics(mut self, enabled: bool) -> Self {
        self.profile_traffic_statistics = enabled;
        self
    }

    pub fn with_acl_memory_budget(mut self, bytes: usize) -> Self {
        self.acl_memory_budget = bytes;
        self
    }

    pub fn with_rule_set_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.rule_set_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_remote_rule_base(mut self, base: impl Into<String>) -> Self {
        self.remote_rule_base = base.into();
        self
    }

    pub fn with_import_depth(mut self, depth: usize) -> Self {
        self.import_depth = depth;
        self
    }

    pub fn with_match_cache_size(mut self, size: usize) -> Self {
        self.match_cache_size = size;
        self
    }
}

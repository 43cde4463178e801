//! Engine configuration
//!
//! YAML schema v1, loaded with `deny_unknown_fields` and then overlaid with
//! environment overrides:
//!
//! ```yaml
//! version: 1
//! scheduler:
//!   worker_limit: 8
//!   unit_timeout_ms: 30000
//! plugins:
//!   enabled: false
//!   roots: []
//! capabilities:
//!   deny: [forensic]
//! tiers:
//!   - name: internal
//! default_tier: internal
//! ```

use crate::scheduler::{Enablement, SchedulerConfig};
use crate::tier::{TierPolicy, TierPolicySet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

pub const ENV_WORKER_LIMIT: &str = "METAEXTRACT_WORKER_LIMIT";
pub const ENV_UNIT_TIMEOUT_MS: &str = "METAEXTRACT_UNIT_TIMEOUT_MS";
pub const ENV_PLUGINS_ENABLED: &str = "METAEXTRACT_PLUGINS_ENABLED";

const WORKER_LIMIT_MAX: usize = 1024;
const UNIT_TIMEOUT_MS_MAX: u64 = 3_600_000;

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Invalid range for field '{field}': {value} not in {min}..={max}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Duplicate tier '{0}'")]
    DuplicateTier(String),

    #[error("default_tier '{0}' does not name a configured tier")]
    UnknownDefaultTier(String),

    #[error("Capability '{0}' is both allowed and denied")]
    CapabilityConflict(String),

    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl ConfigError {
    fn range(field: &str, value: impl ToString, min: impl ToString, max: impl ToString) -> Self {
        Self::Range {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub worker_limit: usize,
    pub unit_timeout_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            worker_limit: defaults.worker_limit,
            unit_timeout_ms: defaults.unit_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginsSection {
    /// Process-wide plugin toggle (off until explicitly enabled)
    pub enabled: bool,
    /// Plugin roots loaded at startup
    pub roots: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: Option<u32>,
}

/// Engine configuration (schema v1)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub version: u32,
    pub scheduler: SchedulerSection,
    pub plugins: PluginsSection,
    pub capabilities: Enablement,
    pub tiers: Vec<TierPolicy>,
    pub default_tier: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            scheduler: SchedulerSection::default(),
            plugins: PluginsSection::default(),
            capabilities: Enablement::all(),
            tiers: vec![TierPolicy::unrestricted("internal")],
            default_tier: "internal".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document (no environment overrides, not validated)
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let header: VersionHeader = serde_yaml::from_str(content)?;
        let version = header.version.ok_or(ConfigError::MissingVersion)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load from a YAML file, apply environment overrides, validate
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)?.finish()
    }

    /// File when given, defaults otherwise; then environment and validation
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        match path {
            Some(path) => Self::from_yaml(path),
            None => Self::default().finish(),
        }
    }

    fn finish(mut self) -> ConfigResult<Self> {
        self.apply_overrides(|var| std::env::var(var).ok())?;
        self.validate()?;
        Ok(self)
    }

    /// Overlay `METAEXTRACT_*` values obtained from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKER_LIMIT) {
            self.scheduler.worker_limit = parse_env(ENV_WORKER_LIMIT, &value)?;
        }
        if let Some(value) = lookup(ENV_UNIT_TIMEOUT_MS) {
            self.scheduler.unit_timeout_ms = parse_env(ENV_UNIT_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_PLUGINS_ENABLED) {
            self.plugins.enabled = parse_bool(ENV_PLUGINS_ENABLED, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(1..=WORKER_LIMIT_MAX).contains(&self.scheduler.worker_limit) {
            return Err(ConfigError::range(
                "scheduler.worker_limit",
                self.scheduler.worker_limit,
                1,
                WORKER_LIMIT_MAX,
            ));
        }
        if !(1..=UNIT_TIMEOUT_MS_MAX).contains(&self.scheduler.unit_timeout_ms) {
            return Err(ConfigError::range(
                "scheduler.unit_timeout_ms",
                self.scheduler.unit_timeout_ms,
                1,
                UNIT_TIMEOUT_MS_MAX,
            ));
        }

        let mut names = BTreeSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.as_str()) {
                return Err(ConfigError::DuplicateTier(tier.name.clone()));
            }
        }
        if !names.contains(self.default_tier.as_str()) {
            return Err(ConfigError::UnknownDefaultTier(self.default_tier.clone()));
        }

        if let Some(allow) = &self.capabilities.allow {
            if let Some(tag) = allow.intersection(&self.capabilities.deny).next() {
                return Err(ConfigError::CapabilityConflict(tag.clone()));
            }
        }

        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_limit: self.scheduler.worker_limit,
            unit_timeout: Duration::from_millis(self.scheduler.unit_timeout_ms),
        }
    }

    pub fn tier_policies(&self) -> ConfigResult<TierPolicySet> {
        TierPolicySet::new(self.tiers.clone()).map_err(|_| {
            let mut seen = BTreeSet::new();
            let dup = self
                .tiers
                .iter()
                .find(|t| !seen.insert(t.name.as_str()))
                .map(|t| t.name.clone())
                .unwrap_or_default();
            ConfigError::DuplicateTier(dup)
        })
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Default configuration rendered as YAML
    pub fn template() -> ConfigResult<String> {
        Self::default().to_yaml()
    }
}

fn parse_env<T>(var: &str, value: &str) -> ConfigResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            reason: "expected true/false".to_string(),
        }),
    }
}

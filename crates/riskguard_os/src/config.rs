#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use riskguard_contracts::policy::PolicyPreset;
use riskguard_engines::registry::DEFAULT_MAX_COLLECTION_WORKERS;
use riskguard_storage::policy_cache::{DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_NAMESPACE};

pub const POLICY_FETCH_TIMEOUT_MS_DEFAULT: u64 = 15_000;
pub const POLICY_REFRESH_INTERVAL_MS_DEFAULT: u64 = 300_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyProviderConfig {
    pub endpoint: Option<String>,
    pub fetch_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    pub cache_dir: Option<PathBuf>,
    pub cache_namespace: String,
    pub cache_max_entries: usize,
    pub fallback_preset: PolicyPreset,
}

impl PolicyProviderConfig {
    pub fn mvp_v1() -> Self {
        Self {
            endpoint: None,
            fetch_timeout_ms: POLICY_FETCH_TIMEOUT_MS_DEFAULT,
            refresh_interval_ms: POLICY_REFRESH_INTERVAL_MS_DEFAULT,
            cache_dir: None,
            cache_namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            fallback_preset: PolicyPreset::Default,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    /// Out-of-range or unparsable values fall back to the `mvp_v1` defaults.
    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = Self::mvp_v1();
        let endpoint = env_getter("RISKGUARD_POLICY_URL").and_then(non_empty);
        let fetch_timeout_ms = env_getter("RISKGUARD_POLICY_FETCH_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (100..=60_000).contains(v))
            .unwrap_or(defaults.fetch_timeout_ms);
        let refresh_interval_ms = env_getter("RISKGUARD_POLICY_REFRESH_INTERVAL_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| (1_000..=86_400_000).contains(v))
            .unwrap_or(defaults.refresh_interval_ms);
        let cache_dir = env_getter("RISKGUARD_POLICY_CACHE_DIR")
            .and_then(non_empty)
            .map(PathBuf::from);
        let cache_namespace = env_getter("RISKGUARD_POLICY_CACHE_NAMESPACE")
            .and_then(non_empty)
            .unwrap_or(defaults.cache_namespace);
        let cache_max_entries = env_getter("RISKGUARD_POLICY_CACHE_MAX_ENTRIES")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| (1..=64).contains(v))
            .unwrap_or(defaults.cache_max_entries);
        let fallback_preset = env_getter("RISKGUARD_POLICY_PRESET")
            .and_then(|v| parse_preset(&v))
            .unwrap_or(defaults.fallback_preset);

        Self {
            endpoint,
            fetch_timeout_ms,
            refresh_interval_ms,
            cache_dir,
            cache_namespace,
            cache_max_entries,
            fallback_preset,
        }
    }
}

impl Default for PolicyProviderConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskEngineConfig {
    pub max_collection_workers: usize,
    pub policy: PolicyProviderConfig,
}

impl RiskEngineConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_collection_workers: DEFAULT_MAX_COLLECTION_WORKERS,
            policy: PolicyProviderConfig::mvp_v1(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let max_collection_workers = env_getter("RISKGUARD_COLLECT_MAX_WORKERS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| (1..=32).contains(v))
            .unwrap_or(DEFAULT_MAX_COLLECTION_WORKERS);
        Self {
            max_collection_workers,
            policy: PolicyProviderConfig::from_env_var_map(env_getter),
        }
    }
}

impl Default for RiskEngineConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_preset(value: &str) -> Option<PolicyPreset> {
    match value.trim().to_ascii_lowercase().as_str() {
        "default" => Some(PolicyPreset::Default),
        "strict" => Some(PolicyPreset::Strict),
        "relaxed" => Some(PolicyPreset::Relaxed),
        _ => None,
    }
}

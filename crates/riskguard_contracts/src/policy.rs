#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::{validate_range, validate_token};
use crate::{ContractViolation, UnixTimeMs, Validate};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;
pub const CATEGORY_WEIGHT_MAX: f64 = 10.0;
pub const POLICY_LIST_MAX_ENTRIES: usize = 4_096;
pub const POLICY_MAX_SCENARIOS: usize = 64;
pub const POLICY_MAX_EXPERIMENTS: usize = 32;
pub const POLICY_MAX_RULES: usize = 64;
pub const POLICY_MAX_DETECTOR_TOGGLES: usize = 256;
pub const POLICY_MAX_JITTER_BP: u32 = 1_000;
pub const POLICY_MAX_DETECTION_DURATION_MS: u64 = 60_000;
const TRAFFIC_SUM_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Challenge,
    Block,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Challenge => "CHALLENGE",
            Action::Block => "BLOCK",
        }
    }

    /// The stricter of the two actions.
    pub fn escalate(self, other: Action) -> Action {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Medium => "MEDIUM",
            RiskTier::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTable {
    #[serde(alias = "lowAction")]
    pub low: Action,
    #[serde(alias = "mediumAction")]
    pub medium: Action,
    #[serde(alias = "highAction")]
    pub high: Action,
}

impl ActionTable {
    pub fn action_for(&self, tier: RiskTier) -> Action {
        match tier {
            RiskTier::Low => self.low,
            RiskTier::Medium => self.medium,
            RiskTier::High => self.high,
        }
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self {
            low: Action::Allow,
            medium: Action::Challenge,
            high: Action::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScenarioOverride {
    pub threshold: Option<f64>,
    pub medium_threshold: Option<f64>,
    pub category_weights: BTreeMap<String, f64>,
    pub actions: Option<ActionTable>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRules {
    /// High-risk threshold; scores at or above it land in the high tier.
    pub threshold: f64,
    pub medium_threshold: f64,
    pub category_weights: BTreeMap<String, f64>,
    pub default_category_weight: f64,
    pub category_caps: BTreeMap<String, f64>,
    pub default_category_cap: f64,
    pub conclusive_categories: BTreeSet<String>,
    pub category_actions: BTreeMap<String, Action>,
    pub actions: ActionTable,
    pub scenarios: BTreeMap<String, ScenarioOverride>,
    pub max_detection_duration_ms: u64,
}

impl Default for PolicyRules {
    fn default() -> Self {
        Self {
            threshold: 60.0,
            medium_threshold: 30.0,
            category_weights: BTreeMap::new(),
            default_category_weight: 1.0,
            category_caps: BTreeMap::new(),
            default_category_cap: SCORE_MAX,
            conclusive_categories: BTreeSet::from(["integrity".to_string()]),
            category_actions: BTreeMap::new(),
            actions: ActionTable::default(),
            scenarios: BTreeMap::new(),
            max_detection_duration_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListSet {
    pub device_ids: BTreeSet<String>,
    pub ip_addresses: BTreeSet<String>,
    pub signal_tags: BTreeSet<String>,
}

impl ListSet {
    pub fn is_empty(&self) -> bool {
        self.device_ids.is_empty() && self.ip_addresses.is_empty() && self.signal_tags.is_empty()
    }

    pub fn contains_device(&self, device_id: &str) -> bool {
        self.device_ids.contains(device_id)
    }

    pub fn contains_ip(&self, ip: Option<&str>) -> bool {
        ip.is_some_and(|ip| self.ip_addresses.contains(ip))
    }

    pub fn first_matching_tag<'a>(&self, tags: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
        tags.into_iter().find(|tag| self.signal_tags.contains(*tag))
    }

    fn validate_named(&self, field: &'static str) -> Result<(), ContractViolation> {
        for len in [
            self.device_ids.len(),
            self.ip_addresses.len(),
            self.signal_tags.len(),
        ] {
            if len > POLICY_LIST_MAX_ENTRIES {
                return Err(ContractViolation::InvalidValue {
                    field,
                    reason: "list exceeds POLICY_LIST_MAX_ENTRIES",
                });
            }
        }
        Ok(())
    }

    fn truncated(mut self) -> (Self, bool) {
        let mut truncated = false;
        for set in [
            &mut self.device_ids,
            &mut self.ip_addresses,
            &mut self.signal_tags,
        ] {
            if set.len() > POLICY_LIST_MAX_ENTRIES {
                *set = std::mem::take(set)
                    .into_iter()
                    .take(POLICY_LIST_MAX_ENTRIES)
                    .collect();
                truncated = true;
            }
        }
        (self, truncated)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentParameters {
    pub threshold: Option<f64>,
    pub medium_threshold: Option<f64>,
    pub category_weights: BTreeMap<String, f64>,
    pub blind_challenge_enabled: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentVariant {
    pub bucket: u8,
    #[serde(default)]
    pub parameters: ExperimentParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub key: String,
    pub traffic_fraction: f64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub variants: Vec<ExperimentVariant>,
}

impl Experiment {
    pub fn variant_for(&self, bucket: u8) -> Option<&ExperimentVariant> {
        self.variants.iter().find(|v| v.bucket == bucket)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BucketingStrategy {
    #[default]
    ConsistentHash,
    ModularHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MutationConfig {
    pub enabled: bool,
    pub seed: u64,
    pub shuffle_providers: bool,
    pub shuffle_signals: bool,
    pub threshold_jitter_bp: u32,
    pub score_jitter_bp: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlindChallengeRule {
    pub id: String,
    #[serde(rename = "allOfSignalIDs", alias = "allOf", default)]
    pub all_of_signal_ids: Vec<String>,
    #[serde(rename = "anyOfSignalIDs", alias = "anyOf", default)]
    pub any_of_signal_ids: Vec<String>,
    #[serde(default)]
    pub min_tampered_count: u32,
    #[serde(default)]
    pub min_distinct_risk_layers: u32,
    #[serde(default)]
    pub require_cross_layer_inconsistency: bool,
    pub weight: f64,
}

impl BlindChallengeRule {
    pub fn has_predicate(&self) -> bool {
        !self.all_of_signal_ids.is_empty()
            || !self.any_of_signal_ids.is_empty()
            || self.min_tampered_count > 0
            || self.min_distinct_risk_layers > 0
            || self.require_cross_layer_inconsistency
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlindChallengeConfig {
    pub enabled: bool,
    pub max_penalty: f64,
    pub rules: Vec<BlindChallengeRule>,
}

impl Default for BlindChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_penalty: SCORE_MAX,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyPreset {
    Default,
    Strict,
    Relaxed,
}

impl PolicyPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyPreset::Default => "default",
            PolicyPreset::Strict => "strict",
            PolicyPreset::Relaxed => "relaxed",
        }
    }
}

/// Versioned risk policy as distributed over the wire.
///
/// A `Policy` is validated once when it enters the process (fetch, import or
/// local construction) and is shared behind `Arc` afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub version: i64,
    #[serde(default)]
    pub timestamp: UnixTimeMs,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(rename = "policy")]
    pub rules: PolicyRules,
    #[serde(default)]
    pub detector_toggles: BTreeMap<String, bool>,
    #[serde(default)]
    pub whitelist: ListSet,
    #[serde(default)]
    pub blacklist: ListSet,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(rename = "mutationConfig", alias = "mutation", default)]
    pub mutation: MutationConfig,
    #[serde(rename = "blindChallengeConfig", alias = "blindChallenge", default)]
    pub blind_challenge: BlindChallengeConfig,
    #[serde(default)]
    pub bucketing_strategy: BucketingStrategy,
}

fn default_environment() -> String {
    "production".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecodeError {
    Parse(String),
    Invalid(ContractViolation),
}

impl fmt::Display for PolicyDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "policy parse error: {msg}"),
            Self::Invalid(violation) => write!(f, "policy validation error: {violation}"),
        }
    }
}

impl std::error::Error for PolicyDecodeError {}

impl From<ContractViolation> for PolicyDecodeError {
    fn from(value: ContractViolation) -> Self {
        Self::Invalid(value)
    }
}

/// Result of forcing a locally-supplied policy into range.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedPolicy {
    pub policy: Policy,
    pub warnings: Vec<ContractViolation>,
}

impl Policy {
    pub fn preset(preset: PolicyPreset) -> Self {
        match preset {
            PolicyPreset::Default => Self::default_v1(),
            PolicyPreset::Strict => Self::strict_v1(),
            PolicyPreset::Relaxed => Self::relaxed_v1(),
        }
    }

    pub fn default_v1() -> Self {
        let rules = PolicyRules {
            category_weights: BTreeMap::from([
                ("integrity".to_string(), 1.0),
                ("runtime".to_string(), 1.0),
                ("device".to_string(), 0.8),
                ("network".to_string(), 0.6),
                ("behavior".to_string(), 0.5),
            ]),
            category_caps: BTreeMap::from([
                ("network".to_string(), 40.0),
                ("behavior".to_string(), 30.0),
            ]),
            default_category_cap: 60.0,
            scenarios: BTreeMap::from([
                (
                    "payment".to_string(),
                    ScenarioOverride {
                        threshold: Some(50.0),
                        medium_threshold: Some(25.0),
                        ..ScenarioOverride::default()
                    },
                ),
                (
                    "login".to_string(),
                    ScenarioOverride {
                        threshold: Some(70.0),
                        ..ScenarioOverride::default()
                    },
                ),
            ]),
            ..PolicyRules::default()
        };
        Self {
            version: 0,
            timestamp: UnixTimeMs(0),
            environment: default_environment(),
            rules,
            detector_toggles: BTreeMap::new(),
            whitelist: ListSet::default(),
            blacklist: ListSet::default(),
            experiments: Vec::new(),
            mutation: MutationConfig::default(),
            blind_challenge: BlindChallengeConfig {
                rules: vec![BlindChallengeRule {
                    id: "tamper_with_network_masking".to_string(),
                    all_of_signal_ids: Vec::new(),
                    any_of_signal_ids: vec!["vpn_active".to_string(), "proxy_enabled".to_string()],
                    min_tampered_count: 1,
                    min_distinct_risk_layers: 0,
                    require_cross_layer_inconsistency: false,
                    weight: 40.0,
                }],
                ..BlindChallengeConfig::default()
            },
            bucketing_strategy: BucketingStrategy::ConsistentHash,
        }
    }

    pub fn strict_v1() -> Self {
        let mut policy = Self::default_v1();
        policy.rules.threshold = 45.0;
        policy.rules.medium_threshold = 20.0;
        policy.rules.default_category_cap = 80.0;
        policy
            .rules
            .category_actions
            .insert("integrity".to_string(), Action::Block);
        policy.mutation = MutationConfig {
            enabled: true,
            seed: 0x5EED_0001,
            shuffle_providers: true,
            shuffle_signals: true,
            threshold_jitter_bp: 200,
            score_jitter_bp: 100,
        };
        policy
    }

    pub fn relaxed_v1() -> Self {
        let mut policy = Self::default_v1();
        policy.rules.threshold = 75.0;
        policy.rules.medium_threshold = 45.0;
        policy.rules.actions = ActionTable {
            low: Action::Allow,
            medium: Action::Allow,
            high: Action::Challenge,
        };
        policy
            .rules
            .category_actions
            .insert("integrity".to_string(), Action::Block);
        policy
    }

    /// Parses and validates a wire policy.
    pub fn from_json(body: &str) -> Result<Self, PolicyDecodeError> {
        let policy = Self::decode(body)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parses without range checks; callers sanitize or validate afterwards.
    pub fn decode(body: &str) -> Result<Self, PolicyDecodeError> {
        serde_json::from_str(body).map_err(|err| PolicyDecodeError::Parse(err.to_string()))
    }

    pub fn to_json(&self) -> Result<String, PolicyDecodeError> {
        serde_json::to_string(self).map_err(|err| PolicyDecodeError::Parse(err.to_string()))
    }

    /// SHA-256 over the serialized policy; identifies one policy epoch.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(7 + digest.len() * 2);
        out.push_str("sha256:");
        for b in digest {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    pub fn is_detector_enabled(&self, provider_id: &str) -> bool {
        self.detector_toggles
            .get(provider_id)
            .copied()
            .unwrap_or(true)
    }

    pub fn active_experiments(&self) -> impl Iterator<Item = &Experiment> {
        self.experiments.iter().filter(|e| e.active)
    }

    pub fn active_traffic_sum(&self) -> f64 {
        self.active_experiments().map(|e| e.traffic_fraction).sum()
    }

    /// Clamps a locally-supplied policy into range instead of rejecting it.
    /// Every adjustment is reported as a warning.
    pub fn sanitize(self) -> SanitizedPolicy {
        let mut warnings = Vec::new();
        let mut policy = self;

        if policy.version < 0 {
            warnings.push(ContractViolation::InvalidValue {
                field: "policy.version",
                reason: "negative version reset to 0",
            });
            policy.version = 0;
        }

        let rules = &mut policy.rules;
        clamp_score("policy.rules.threshold", &mut rules.threshold, &mut warnings);
        clamp_score(
            "policy.rules.medium_threshold",
            &mut rules.medium_threshold,
            &mut warnings,
        );
        if rules.medium_threshold > rules.threshold {
            warnings.push(ContractViolation::InvalidValue {
                field: "policy.rules.medium_threshold",
                reason: "lowered to threshold",
            });
            rules.medium_threshold = rules.threshold;
        }
        clamp_weight(
            "policy.rules.default_category_weight",
            &mut rules.default_category_weight,
            &mut warnings,
        );
        for weight in rules.category_weights.values_mut() {
            clamp_weight("policy.rules.category_weights", weight, &mut warnings);
        }
        clamp_score(
            "policy.rules.default_category_cap",
            &mut rules.default_category_cap,
            &mut warnings,
        );
        for cap in rules.category_caps.values_mut() {
            clamp_score("policy.rules.category_caps", cap, &mut warnings);
        }
        for scenario in rules.scenarios.values_mut() {
            if let Some(t) = scenario.threshold.as_mut() {
                clamp_score("policy.rules.scenarios.threshold", t, &mut warnings);
            }
            if let Some(t) = scenario.medium_threshold.as_mut() {
                clamp_score("policy.rules.scenarios.medium_threshold", t, &mut warnings);
            }
            for weight in scenario.category_weights.values_mut() {
                clamp_weight("policy.rules.scenarios.category_weights", weight, &mut warnings);
            }
        }
        if rules.max_detection_duration_ms == 0
            || rules.max_detection_duration_ms > POLICY_MAX_DETECTION_DURATION_MS
        {
            warnings.push(ContractViolation::InvalidValue {
                field: "policy.rules.max_detection_duration_ms",
                reason: "clamped into 1..=POLICY_MAX_DETECTION_DURATION_MS",
            });
            rules.max_detection_duration_ms = rules
                .max_detection_duration_ms
                .clamp(1, POLICY_MAX_DETECTION_DURATION_MS);
        }

        let (whitelist, wl_truncated) = std::mem::take(&mut policy.whitelist).truncated();
        let (blacklist, bl_truncated) = std::mem::take(&mut policy.blacklist).truncated();
        policy.whitelist = whitelist;
        policy.blacklist = blacklist;
        if wl_truncated || bl_truncated {
            warnings.push(ContractViolation::InvalidValue {
                field: "policy.lists",
                reason: "truncated to POLICY_LIST_MAX_ENTRIES",
            });
        }

        let mut allocated = 0.0;
        for experiment in policy.experiments.iter_mut() {
            if !experiment.traffic_fraction.is_finite() {
                experiment.traffic_fraction = 0.0;
            }
            if !(0.0..=1.0).contains(&experiment.traffic_fraction) {
                warnings.push(ContractViolation::InvalidRange {
                    field: "policy.experiments.traffic_fraction",
                    min: 0.0,
                    max: 1.0,
                    got: experiment.traffic_fraction,
                });
                experiment.traffic_fraction = experiment.traffic_fraction.clamp(0.0, 1.0);
            }
            if !experiment.active {
                continue;
            }
            if allocated + experiment.traffic_fraction > 1.0 + TRAFFIC_SUM_EPSILON {
                warnings.push(ContractViolation::InvalidValue {
                    field: "policy.experiments",
                    reason: "experiment deactivated: active traffic would exceed 1.0",
                });
                experiment.active = false;
                continue;
            }
            allocated += experiment.traffic_fraction;
        }

        for jitter in [
            &mut policy.mutation.threshold_jitter_bp,
            &mut policy.mutation.score_jitter_bp,
        ] {
            if *jitter > POLICY_MAX_JITTER_BP {
                warnings.push(ContractViolation::InvalidValue {
                    field: "policy.mutation.jitter_bp",
                    reason: "clamped to POLICY_MAX_JITTER_BP",
                });
                *jitter = POLICY_MAX_JITTER_BP;
            }
        }

        clamp_score(
            "policy.blind_challenge.max_penalty",
            &mut policy.blind_challenge.max_penalty,
            &mut warnings,
        );
        for rule in policy.blind_challenge.rules.iter_mut() {
            clamp_score("policy.blind_challenge.rules.weight", &mut rule.weight, &mut warnings);
        }

        if let Err(violation) = policy.validate() {
            warnings.push(violation);
            let mut fallback = Policy::default_v1();
            fallback.version = policy.version;
            return SanitizedPolicy {
                policy: fallback,
                warnings,
            };
        }
        SanitizedPolicy { policy, warnings }
    }
}

fn clamp_score(field: &'static str, value: &mut f64, warnings: &mut Vec<ContractViolation>) {
    if !value.is_finite() {
        warnings.push(ContractViolation::NotFinite { field });
        *value = SCORE_MAX;
        return;
    }
    if *value < SCORE_MIN || *value > SCORE_MAX {
        warnings.push(ContractViolation::InvalidRange {
            field,
            min: SCORE_MIN,
            max: SCORE_MAX,
            got: *value,
        });
        *value = value.clamp(SCORE_MIN, SCORE_MAX);
    }
}

fn clamp_weight(field: &'static str, value: &mut f64, warnings: &mut Vec<ContractViolation>) {
    if !value.is_finite() {
        warnings.push(ContractViolation::NotFinite { field });
        *value = 1.0;
        return;
    }
    if *value < 0.0 || *value > CATEGORY_WEIGHT_MAX {
        warnings.push(ContractViolation::InvalidRange {
            field,
            min: 0.0,
            max: CATEGORY_WEIGHT_MAX,
            got: *value,
        });
        *value = value.clamp(0.0, CATEGORY_WEIGHT_MAX);
    }
}

fn validate_score(field: &'static str, value: f64) -> Result<(), ContractViolation> {
    validate_range(field, value, SCORE_MIN, SCORE_MAX)
}

fn validate_weights(
    field: &'static str,
    weights: &BTreeMap<String, f64>,
) -> Result<(), ContractViolation> {
    for (category, weight) in weights {
        validate_token(field, category, 96)?;
        validate_range(field, *weight, 0.0, CATEGORY_WEIGHT_MAX)?;
    }
    Ok(())
}

fn validate_tiers(
    field: &'static str,
    medium: f64,
    high: f64,
) -> Result<(), ContractViolation> {
    if medium > high {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "medium_threshold must be <= threshold",
        });
    }
    Ok(())
}

impl Validate for PolicyRules {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_score("policy.rules.threshold", self.threshold)?;
        validate_score("policy.rules.medium_threshold", self.medium_threshold)?;
        validate_tiers("policy.rules", self.medium_threshold, self.threshold)?;
        validate_range(
            "policy.rules.default_category_weight",
            self.default_category_weight,
            0.0,
            CATEGORY_WEIGHT_MAX,
        )?;
        validate_weights("policy.rules.category_weights", &self.category_weights)?;
        validate_score("policy.rules.default_category_cap", self.default_category_cap)?;
        for (category, cap) in &self.category_caps {
            validate_token("policy.rules.category_caps", category, 96)?;
            validate_score("policy.rules.category_caps", *cap)?;
        }
        for category in &self.conclusive_categories {
            validate_token("policy.rules.conclusive_categories", category, 96)?;
        }
        for category in self.category_actions.keys() {
            validate_token("policy.rules.category_actions", category, 96)?;
        }
        if self.scenarios.len() > POLICY_MAX_SCENARIOS {
            return Err(ContractViolation::InvalidValue {
                field: "policy.rules.scenarios",
                reason: "exceeds POLICY_MAX_SCENARIOS",
            });
        }
        for (name, scenario) in &self.scenarios {
            validate_token("policy.rules.scenarios.name", name, 64)?;
            if let Some(t) = scenario.threshold {
                validate_score("policy.rules.scenarios.threshold", t)?;
            }
            if let Some(t) = scenario.medium_threshold {
                validate_score("policy.rules.scenarios.medium_threshold", t)?;
            }
            validate_tiers(
                "policy.rules.scenarios",
                scenario.medium_threshold.unwrap_or(self.medium_threshold),
                scenario.threshold.unwrap_or(self.threshold),
            )?;
            validate_weights(
                "policy.rules.scenarios.category_weights",
                &scenario.category_weights,
            )?;
        }
        if self.max_detection_duration_ms == 0
            || self.max_detection_duration_ms > POLICY_MAX_DETECTION_DURATION_MS
        {
            return Err(ContractViolation::InvalidValue {
                field: "policy.rules.max_detection_duration_ms",
                reason: "must be within 1..=POLICY_MAX_DETECTION_DURATION_MS",
            });
        }
        Ok(())
    }
}

impl Validate for Experiment {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("policy.experiments.key", &self.key, 96)?;
        validate_range(
            "policy.experiments.traffic_fraction",
            self.traffic_fraction,
            0.0,
            1.0,
        )?;
        if self.variants.len() > 2 {
            return Err(ContractViolation::InvalidValue {
                field: "policy.experiments.variants",
                reason: "at most one variant per bucket",
            });
        }
        let mut seen = BTreeSet::new();
        for variant in &self.variants {
            if variant.bucket > 1 {
                return Err(ContractViolation::InvalidValue {
                    field: "policy.experiments.variants.bucket",
                    reason: "must be 0 or 1",
                });
            }
            if !seen.insert(variant.bucket) {
                return Err(ContractViolation::InvalidValue {
                    field: "policy.experiments.variants.bucket",
                    reason: "duplicate bucket",
                });
            }
            let params = &variant.parameters;
            if let Some(t) = params.threshold {
                validate_score("policy.experiments.parameters.threshold", t)?;
            }
            if let Some(t) = params.medium_threshold {
                validate_score("policy.experiments.parameters.medium_threshold", t)?;
            }
            validate_weights(
                "policy.experiments.parameters.category_weights",
                &params.category_weights,
            )?;
        }
        Ok(())
    }
}

impl Validate for BlindChallengeRule {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("policy.blind_challenge.rules.id", &self.id, 96)?;
        validate_score("policy.blind_challenge.rules.weight", self.weight)?;
        if !self.has_predicate() {
            return Err(ContractViolation::InvalidValue {
                field: "policy.blind_challenge.rules",
                reason: "rule must declare at least one predicate",
            });
        }
        for id in self.all_of_signal_ids.iter().chain(&self.any_of_signal_ids) {
            validate_token("policy.blind_challenge.rules.signal_id", id, 96)?;
        }
        Ok(())
    }
}

impl Validate for Policy {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.version < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "policy.version",
                reason: "must be >= 0",
            });
        }
        validate_token("policy.environment", &self.environment, 64)?;
        self.rules.validate()?;

        if self.detector_toggles.len() > POLICY_MAX_DETECTOR_TOGGLES {
            return Err(ContractViolation::InvalidValue {
                field: "policy.detector_toggles",
                reason: "exceeds POLICY_MAX_DETECTOR_TOGGLES",
            });
        }
        self.whitelist.validate_named("policy.whitelist")?;
        self.blacklist.validate_named("policy.blacklist")?;

        if self.experiments.len() > POLICY_MAX_EXPERIMENTS {
            return Err(ContractViolation::InvalidValue {
                field: "policy.experiments",
                reason: "exceeds POLICY_MAX_EXPERIMENTS",
            });
        }
        let mut keys = BTreeSet::new();
        for experiment in &self.experiments {
            experiment.validate()?;
            if !keys.insert(experiment.key.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "policy.experiments.key",
                    reason: "duplicate experiment key",
                });
            }
        }
        let traffic = self.active_traffic_sum();
        if traffic > 1.0 + TRAFFIC_SUM_EPSILON {
            return Err(ContractViolation::InvalidRange {
                field: "policy.experiments.active_traffic_sum",
                min: 0.0,
                max: 1.0,
                got: traffic,
            });
        }

        if self.mutation.threshold_jitter_bp > POLICY_MAX_JITTER_BP
            || self.mutation.score_jitter_bp > POLICY_MAX_JITTER_BP
        {
            return Err(ContractViolation::InvalidValue {
                field: "policy.mutation.jitter_bp",
                reason: "must be <= POLICY_MAX_JITTER_BP",
            });
        }

        validate_score(
            "policy.blind_challenge.max_penalty",
            self.blind_challenge.max_penalty,
        )?;
        if self.blind_challenge.rules.len() > POLICY_MAX_RULES {
            return Err(ContractViolation::InvalidValue {
                field: "policy.blind_challenge.rules",
                reason: "exceeds POLICY_MAX_RULES",
            });
        }
        let mut rule_ids = BTreeSet::new();
        for rule in &self.blind_challenge.rules {
            rule.validate()?;
            if !rule_ids.insert(rule.id.as_str()) {
                return Err(ContractViolation::InvalidValue {
                    field: "policy.blind_challenge.rules.id",
                    reason: "duplicate rule id",
                });
            }
        }
        Ok(())
    }
}

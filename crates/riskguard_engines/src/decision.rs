#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use riskguard_contracts::policy::{
    Action, ActionTable, BlindChallengeConfig, Policy, RiskTier, SCORE_MAX, SCORE_MIN,
};
use riskguard_contracts::report::{RiskReport, ScoreReport, Verdict};
use riskguard_contracts::signal::Signal;
use riskguard_contracts::snapshot::EvaluationSnapshot;
use riskguard_contracts::ReasonCodeId;

use crate::blind_challenge::{self, BlindChallengeOutcome};
use crate::bucketer::assign_buckets;
use crate::mutation::{
    apply_jitter_bp, MutationPlanner, SCOPE_SCORE_JITTER, SCOPE_THRESHOLD_JITTER,
};
use crate::registry::{CollectOptions, ProviderRegistry, DEFAULT_MAX_COLLECTION_WORKERS};
use crate::scorer::{contributing_signal_ids, score_with_profile, ScoringProfile};

pub mod reason_codes {
    use riskguard_contracts::ReasonCodeId;

    // Decision reason-code namespace ("RG").
    pub const DECISION_OK_THRESHOLD: ReasonCodeId = ReasonCodeId(0x5247_0001);

    pub const DECISION_BLACKLIST_HIT: ReasonCodeId = ReasonCodeId(0x5247_0010);
    pub const DECISION_WHITELIST_DOWNGRADE: ReasonCodeId = ReasonCodeId(0x5247_0011);
    pub const DECISION_HARD_OVERRIDE: ReasonCodeId = ReasonCodeId(0x5247_0012);
    pub const DECISION_CATEGORY_ACTION: ReasonCodeId = ReasonCodeId(0x5247_0013);
}

pub const DEFAULT_SCENARIO: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionConfig {
    pub max_collection_workers: usize,
}

impl DecisionConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_collection_workers: DEFAULT_MAX_COLLECTION_WORKERS,
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

/// Stages in execution order. Scenario overrides carry category weights, so
/// the scenario policy is selected before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvaluationStage {
    CollectSignals,
    SelectScenarioPolicy,
    Score,
    EvaluateBlindChallenge,
    Decide,
    Verdict,
}

impl EvaluationStage {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStage::CollectSignals => "COLLECT_SIGNALS",
            EvaluationStage::SelectScenarioPolicy => "SELECT_SCENARIO_POLICY",
            EvaluationStage::Score => "SCORE",
            EvaluationStage::EvaluateBlindChallenge => "EVALUATE_BLIND_CHALLENGE",
            EvaluationStage::Decide => "DECIDE",
            EvaluationStage::Verdict => "VERDICT",
        }
    }
}

fn enter(stage: EvaluationStage, device_id: &str) {
    tracing::debug!(stage = stage.as_str(), device_id = %device_id, "evaluation stage");
}

/// Policy view for one (scenario, device): scenario overrides first, then
/// the parameters of every experiment variant the device is bucketed into.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioProfile {
    pub scenario: String,
    pub known_scenario: bool,
    pub scoring: ScoringProfile,
    pub medium_threshold: f64,
    pub actions: ActionTable,
    pub blind_challenge_enabled: bool,
    pub experiment_buckets: BTreeMap<String, u8>,
}

impl ScenarioProfile {
    pub fn resolve(policy: &Policy, scenario: &str, device_id: &str) -> Self {
        let rules = &policy.rules;
        let mut scoring = ScoringProfile::from_rules(rules);
        let mut medium_threshold = rules.medium_threshold;
        let mut actions = rules.actions;

        let scenario_override = rules.scenarios.get(scenario);
        if let Some(o) = scenario_override {
            if let Some(t) = o.threshold {
                scoring.threshold = t;
            }
            if let Some(m) = o.medium_threshold {
                medium_threshold = m;
            }
            scoring
                .category_weights
                .extend(o.category_weights.iter().map(|(k, v)| (k.clone(), *v)));
            if let Some(a) = o.actions {
                actions = a;
            }
        } else if scenario != DEFAULT_SCENARIO {
            tracing::debug!(scenario = %scenario, "unknown scenario; using default rules");
        }

        let experiment_buckets = assign_buckets(policy, device_id);
        let mut blind_challenge_enabled = policy.blind_challenge.enabled;
        for experiment in policy.active_experiments() {
            let bucket = experiment_buckets.get(&experiment.key).copied().unwrap_or(0);
            let Some(variant) = experiment.variant_for(bucket) else {
                continue;
            };
            let p = &variant.parameters;
            if let Some(t) = p.threshold {
                scoring.threshold = t;
            }
            if let Some(m) = p.medium_threshold {
                medium_threshold = m;
            }
            scoring
                .category_weights
                .extend(p.category_weights.iter().map(|(k, v)| (k.clone(), *v)));
            if let Some(enabled) = p.blind_challenge_enabled {
                blind_challenge_enabled = enabled;
            }
        }

        // Overrides are validated separately; the pair can still cross.
        medium_threshold = medium_threshold.min(scoring.threshold);

        Self {
            scenario: scenario.to_string(),
            known_scenario: scenario_override.is_some(),
            scoring,
            medium_threshold,
            actions,
            blind_challenge_enabled,
            experiment_buckets,
        }
    }
}

/// Tier thresholds and score after per-device jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionThresholds {
    pub high: f64,
    pub medium: f64,
    pub score: f64,
}

impl DecisionThresholds {
    pub fn select(
        policy: &Policy,
        profile: &ScenarioProfile,
        device_id: &str,
        final_score: f64,
    ) -> Self {
        let base = Self {
            high: profile.scoring.threshold,
            medium: profile.medium_threshold,
            score: final_score,
        };
        let Some(planner) = MutationPlanner::from_policy(policy) else {
            return base;
        };
        let mutation = planner.for_device(device_id);
        let threshold_bp =
            mutation.jitter_bp(SCOPE_THRESHOLD_JITTER, policy.mutation.threshold_jitter_bp);
        let score_bp = mutation.jitter_bp(SCOPE_SCORE_JITTER, policy.mutation.score_jitter_bp);
        let high = apply_jitter_bp(base.high, threshold_bp);
        Self {
            high,
            medium: apply_jitter_bp(base.medium, threshold_bp).min(high),
            score: apply_jitter_bp(base.score, score_bp),
        }
    }

    pub fn tier(&self) -> RiskTier {
        if self.score >= self.high {
            RiskTier::High
        } else if self.score >= self.medium {
            RiskTier::Medium
        } else {
            RiskTier::Low
        }
    }
}

/// Blacklist lookup in fixed order: device id, IP, then asserted signal tags.
pub fn blacklist_hit(
    policy: &Policy,
    snapshot: &EvaluationSnapshot,
    signals: &[Signal],
) -> Option<String> {
    let list = &policy.blacklist;
    if list.contains_device(snapshot.device_id.as_str()) {
        return Some(format!("device:{}", snapshot.device_id.as_str()));
    }
    if list.contains_ip(snapshot.network.ip_address.as_deref()) {
        let ip = snapshot.network.ip_address.as_deref().unwrap_or_default();
        return Some(format!("ip:{ip}"));
    }
    let tags: Vec<String> = signals
        .iter()
        .filter(|s| s.is_asserted())
        .flat_map(Signal::tags)
        .collect();
    list.first_matching_tag(tags.iter().map(String::as_str))
        .map(|tag| format!("signal:{tag}"))
}

pub fn is_whitelisted(policy: &Policy, snapshot: &EvaluationSnapshot) -> bool {
    policy.whitelist.contains_device(snapshot.device_id.as_str())
        || policy
            .whitelist
            .contains_ip(snapshot.network.ip_address.as_deref())
}

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self::new(DecisionConfig::mvp_v1())
    }
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// One full evaluation against `policy`. Never blocks on network I/O
    /// and never fails: provider problems surface in `provider_failures`.
    pub fn evaluate(
        &self,
        registry: &ProviderRegistry,
        snapshot: Arc<EvaluationSnapshot>,
        policy: &Policy,
        scenario: &str,
    ) -> RiskReport {
        let device_id = snapshot.device_id.as_str();
        enter(EvaluationStage::CollectSignals, device_id);
        let options =
            CollectOptions::from_policy(policy, device_id, self.config.max_collection_workers);
        let outcome = registry.collect_with(&snapshot, &options);
        if !outcome.skipped_disabled.is_empty() {
            tracing::debug!(
                skipped = ?outcome.skipped_disabled,
                "detectors disabled by policy toggles"
            );
        }

        let (verdict, score_report) = self.decide(&snapshot, policy, scenario, outcome.signals);
        RiskReport {
            verdict,
            score_report,
            provider_failures: outcome.failures,
            server_fields: outcome.server_fields,
        }
    }

    /// Every stage after collection, on an already collected signal set.
    pub fn decide(
        &self,
        snapshot: &EvaluationSnapshot,
        policy: &Policy,
        scenario: &str,
        signals: Vec<Signal>,
    ) -> (Verdict, ScoreReport) {
        let device_id = snapshot.device_id.as_str();
        enter(EvaluationStage::SelectScenarioPolicy, device_id);
        let profile = ScenarioProfile::resolve(policy, scenario, device_id);

        enter(EvaluationStage::Score, device_id);
        let score_report = score_with_profile(&signals, &profile.scoring);

        enter(EvaluationStage::EvaluateBlindChallenge, device_id);
        let blind = if profile.blind_challenge_enabled {
            let config = BlindChallengeConfig {
                enabled: true,
                ..policy.blind_challenge.clone()
            };
            blind_challenge::evaluate(&config, &signals)
        } else {
            BlindChallengeOutcome::default()
        };
        let final_score = (score_report.total + blind.penalty).clamp(SCORE_MIN, SCORE_MAX);

        enter(EvaluationStage::Decide, device_id);
        let thresholds = DecisionThresholds::select(policy, &profile, device_id, final_score);
        let blacklist_hit = blacklist_hit(policy, snapshot, &signals);
        let whitelisted = is_whitelisted(policy, snapshot);
        let hard_override = score_report.hard_override_applied;

        let (tier, action, reason_code) = if blacklist_hit.is_some() {
            (RiskTier::High, Action::Block, reason_codes::DECISION_BLACKLIST_HIT)
        } else {
            let tier = if hard_override {
                RiskTier::High
            } else {
                thresholds.tier()
            };
            let mut action = profile.actions.action_for(tier);
            let mut reason_code = if hard_override {
                reason_codes::DECISION_HARD_OVERRIDE
            } else {
                reason_codes::DECISION_OK_THRESHOLD
            };

            let category_action = category_action(policy, &signals);
            if let Some(escalated) = category_action.filter(|a| *a > action) {
                action = action.escalate(escalated);
                reason_code = reason_codes::DECISION_CATEGORY_ACTION;
            }
            if whitelisted && !hard_override && action != Action::Allow {
                action = Action::Allow;
                reason_code = reason_codes::DECISION_WHITELIST_DOWNGRADE;
            }
            (tier, action, reason_code)
        };

        enter(EvaluationStage::Verdict, device_id);
        let verdict = Verdict {
            score: final_score,
            tier,
            action,
            fired_rule_ids: blind.fired_rule_ids,
            contributing_signal_ids: contributing_signal_ids(&signals, &profile.scoring),
            policy_version: policy.version,
            scenario: profile.scenario,
            experiment_buckets: profile.experiment_buckets,
            blacklist_hit,
            whitelisted,
            reason_code: Some(reason_code),
        };
        log_verdict(&verdict, reason_code);
        (verdict, score_report)
    }
}

// Strictest per-category action among categories holding a conclusive
// positive signal.
fn category_action(policy: &Policy, signals: &[Signal]) -> Option<Action> {
    signals
        .iter()
        .filter(|s| s.state.is_conclusive_positive())
        .filter_map(|s| policy.rules.category_actions.get(&s.category).copied())
        .max()
}

fn log_verdict(verdict: &Verdict, reason_code: ReasonCodeId) {
    tracing::debug!(
        action = verdict.action.as_str(),
        tier = verdict.tier.as_str(),
        score = verdict.score,
        policy_version = verdict.policy_version,
        scenario = %verdict.scenario,
        reason_code = reason_code.0,
        "verdict rendered"
    );
}

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use riskguard_contracts::policy::{BlindChallengeConfig, BlindChallengeRule};
use riskguard_contracts::signal::{Signal, SignalState};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlindChallengeOutcome {
    pub fired_rule_ids: Vec<String>,
    pub penalty: f64,
}

/// Facts the rule predicates are evaluated against, computed once per
/// signal set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalFacts<'a> {
    asserted_ids: BTreeSet<&'a str>,
    tampered_count: u32,
    risk_layers: BTreeSet<u8>,
    cross_layer_inconsistency: bool,
}

impl<'a> SignalFacts<'a> {
    pub fn from_signals(signals: &'a [Signal]) -> Self {
        let mut facts = SignalFacts::default();
        let mut asserted_layers: BTreeMap<&str, BTreeSet<u8>> = BTreeMap::new();
        let mut clear_layers: BTreeMap<&str, BTreeSet<u8>> = BTreeMap::new();

        for signal in signals {
            if signal.state == SignalState::Tampered {
                facts.tampered_count = facts.tampered_count.saturating_add(1);
            }
            if signal.is_asserted() {
                facts.asserted_ids.insert(signal.id.as_str());
                facts.risk_layers.insert(signal.layer);
                asserted_layers
                    .entry(signal.category.as_str())
                    .or_default()
                    .insert(signal.layer);
            } else if signal.state.is_hard_clear() {
                clear_layers
                    .entry(signal.category.as_str())
                    .or_default()
                    .insert(signal.layer);
            }
        }

        // One layer reports risk while another layer of the same category
        // reports a conclusive clear.
        facts.cross_layer_inconsistency = asserted_layers.iter().any(|(category, risky)| {
            clear_layers
                .get(category)
                .is_some_and(|clear| risky.iter().any(|l| clear.iter().any(|c| c != l)))
        });
        facts
    }

    pub fn tampered_count(&self) -> u32 {
        self.tampered_count
    }

    pub fn distinct_risk_layers(&self) -> u32 {
        self.risk_layers.len() as u32
    }

    pub fn has_cross_layer_inconsistency(&self) -> bool {
        self.cross_layer_inconsistency
    }
}

pub fn rule_fires(rule: &BlindChallengeRule, facts: &SignalFacts<'_>) -> bool {
    let all_of = rule
        .all_of_signal_ids
        .iter()
        .all(|id| facts.asserted_ids.contains(id.as_str()));
    let any_of = rule.any_of_signal_ids.is_empty()
        || rule
            .any_of_signal_ids
            .iter()
            .any(|id| facts.asserted_ids.contains(id.as_str()));
    all_of
        && any_of
        && facts.tampered_count >= rule.min_tampered_count
        && facts.distinct_risk_layers() >= rule.min_distinct_risk_layers
        && (!rule.require_cross_layer_inconsistency || facts.cross_layer_inconsistency)
}

/// Discrete penalty from the rule set, independent of the weighted sum.
pub fn evaluate(config: &BlindChallengeConfig, signals: &[Signal]) -> BlindChallengeOutcome {
    if !config.enabled || config.rules.is_empty() {
        return BlindChallengeOutcome::default();
    }
    let facts = SignalFacts::from_signals(signals);
    let mut out = BlindChallengeOutcome::default();
    for rule in &config.rules {
        if rule_fires(rule, &facts) {
            out.fired_rule_ids.push(rule.id.clone());
            out.penalty += rule.weight;
        }
    }
    out.penalty = out.penalty.min(config.max_penalty).max(0.0);
    out
}

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use riskguard_contracts::policy::{Policy, PolicyRules, SCORE_MAX, SCORE_MIN};
use riskguard_contracts::report::ScoreReport;
use riskguard_contracts::signal::{Signal, SignalState};

/// Weights, ceilings and the override threshold the scorer works from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringProfile {
    pub threshold: f64,
    pub category_weights: BTreeMap<String, f64>,
    pub default_category_weight: f64,
    pub category_caps: BTreeMap<String, f64>,
    pub default_category_cap: f64,
    pub conclusive_categories: BTreeSet<String>,
}

impl ScoringProfile {
    pub fn from_rules(rules: &PolicyRules) -> Self {
        Self {
            threshold: rules.threshold,
            category_weights: rules.category_weights.clone(),
            default_category_weight: rules.default_category_weight,
            category_caps: rules.category_caps.clone(),
            default_category_cap: rules.default_category_cap,
            conclusive_categories: rules.conclusive_categories.clone(),
        }
    }

    pub fn weight(&self, category: &str) -> f64 {
        self.category_weights
            .get(category)
            .copied()
            .unwrap_or(self.default_category_weight)
    }

    pub fn cap(&self, category: &str) -> f64 {
        self.category_caps
            .get(category)
            .copied()
            .unwrap_or(self.default_category_cap)
    }

    pub fn contribution(&self, signal: &Signal) -> f64 {
        self.weight(&signal.category) * signal.effective_score()
    }

    pub fn triggers_override(&self, signal: &Signal) -> bool {
        signal.state.is_conclusive_positive() && self.conclusive_categories.contains(&signal.category)
    }
}

pub fn score(signals: &[Signal], policy: &Policy) -> ScoreReport {
    score_with_profile(signals, &ScoringProfile::from_rules(&policy.rules))
}

/// Pure aggregation: weighted per-category sums, per-category ceilings,
/// clamp to `[0, 100]`, then the conclusive-category floor.
pub fn score_with_profile(signals: &[Signal], profile: &ScoringProfile) -> ScoreReport {
    let mut raw: BTreeMap<String, f64> = BTreeMap::new();
    let mut hard_override = false;
    let mut asserted = 0usize;
    let mut no_evidence = 0usize;

    for signal in signals {
        match signal.state {
            SignalState::Unavailable | SignalState::ServerRequired => no_evidence += 1,
            state if state.is_asserted() => asserted += 1,
            _ => {}
        }
        if profile.triggers_override(signal) {
            hard_override = true;
        }
        let contribution = profile.contribution(signal);
        if contribution > 0.0 {
            *raw.entry(signal.category.clone()).or_insert(0.0) += contribution;
        }
    }

    let category_totals: BTreeMap<String, f64> = raw
        .into_iter()
        .map(|(category, sum)| {
            let capped = sum.min(profile.cap(&category)).clamp(SCORE_MIN, SCORE_MAX);
            (category, capped)
        })
        .collect();

    let mut total = category_totals
        .values()
        .sum::<f64>()
        .clamp(SCORE_MIN, SCORE_MAX);
    if hard_override && total < profile.threshold {
        total = profile.threshold;
    }
    let is_high_risk = total >= profile.threshold;

    let summary = format!(
        "signals={} asserted={} no_evidence={} categories={} total={:.2}{}",
        signals.len(),
        asserted,
        no_evidence,
        category_totals.len(),
        total,
        if hard_override { " hard_override" } else { "" }
    );

    ScoreReport {
        total,
        is_high_risk,
        signals: signals.to_vec(),
        summary,
        category_totals,
        hard_override_applied: hard_override,
    }
}

/// Qualified ids of signals that moved the score.
pub fn contributing_signal_ids(signals: &[Signal], profile: &ScoringProfile) -> Vec<String> {
    signals
        .iter()
        .filter(|s| profile.contribution(s) > 0.0 || profile.triggers_override(s))
        .map(Signal::qualified_id)
        .collect()
}

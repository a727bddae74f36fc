#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::validate_range;
use crate::policy::{Action, RiskTier, SCORE_MAX, SCORE_MIN};
use crate::signal::Signal;
use crate::{ContractViolation, ReasonCodeId, Validate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreReport {
    pub total: f64,
    pub is_high_risk: bool,
    pub signals: Vec<Signal>,
    pub summary: String,
    pub category_totals: BTreeMap<String, f64>,
    pub hard_override_applied: bool,
}

impl Validate for ScoreReport {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_range("score_report.total", self.total, SCORE_MIN, SCORE_MAX)?;
        for total in self.category_totals.values() {
            validate_range("score_report.category_totals", *total, SCORE_MIN, SCORE_MAX)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderFailureReason {
    Error,
    Panicked,
    TimedOut,
    InvalidSignal,
}

impl ProviderFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderFailureReason::Error => "ERROR",
            ProviderFailureReason::Panicked => "PANICKED",
            ProviderFailureReason::TimedOut => "TIMED_OUT",
            ProviderFailureReason::InvalidSignal => "INVALID_SIGNAL",
        }
    }
}

/// One provider's collection was skipped; never fatal to the evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub provider_id: String,
    pub reason: ProviderFailureReason,
    pub message: String,
}

/// Backend-aggregated fields; merged into the report, never scored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerFields {
    pub ip_reputation: Option<String>,
    pub asn: Option<u32>,
    pub co_location_count: Option<u32>,
    pub extra: BTreeMap<String, String>,
}

impl ServerFields {
    /// Field-wise merge; values already present win.
    pub fn merged_with(mut self, other: ServerFields) -> ServerFields {
        self.ip_reputation = self.ip_reputation.or(other.ip_reputation);
        self.asn = self.asn.or(other.asn);
        self.co_location_count = self.co_location_count.or(other.co_location_count);
        for (k, v) in other.extra {
            self.extra.entry(k).or_insert(v);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub score: f64,
    pub tier: RiskTier,
    pub action: Action,
    pub fired_rule_ids: Vec<String>,
    pub contributing_signal_ids: Vec<String>,
    pub policy_version: i64,
    pub scenario: String,
    pub experiment_buckets: BTreeMap<String, u8>,
    pub blacklist_hit: Option<String>,
    pub whitelisted: bool,
    #[serde(skip)]
    pub reason_code: Option<ReasonCodeId>,
}

impl Validate for Verdict {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_range("verdict.score", self.score, SCORE_MIN, SCORE_MAX)?;
        if self.blacklist_hit.is_some() && self.action != Action::Block {
            return Err(ContractViolation::InvalidValue {
                field: "verdict.action",
                reason: "blacklist hit must block",
            });
        }
        Ok(())
    }
}

/// Final output of one evaluation, handed to the host for rendering or
/// transmission. Evidence values inside `signals` are untrusted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskReport {
    pub verdict: Verdict,
    pub score_report: ScoreReport,
    pub provider_failures: Vec<ProviderFailure>,
    pub server_fields: BTreeMap<String, ServerFields>,
}

impl RiskReport {
    pub fn signals(&self) -> &[Signal] {
        &self.score_report.signals
    }

    /// Returns a new report with `fields` attached under `provider_id`.
    pub fn enrich(mut self, provider_id: impl Into<String>, fields: ServerFields) -> RiskReport {
        let provider_id = provider_id.into();
        let merged = match self.server_fields.remove(&provider_id) {
            Some(existing) => existing.merged_with(fields),
            None => fields,
        };
        self.server_fields.insert(provider_id, merged);
        self
    }
}

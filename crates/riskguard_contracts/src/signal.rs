#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{validate_non_negative, validate_range, validate_token};
use crate::{ContractViolation, Validate};

pub const SIGNAL_TOKEN_MAX_LEN: usize = 96;
pub const SIGNAL_EVIDENCE_MAX_ENTRIES: usize = 64;
pub const SIGNAL_EVIDENCE_KEY_MAX_LEN: usize = 64;
pub const SIGNAL_EVIDENCE_VALUE_MAX_LEN: usize = 1024;

/// Evidence entry whose value is exposed as an additional signal tag.
pub const SIGNAL_TAG_EVIDENCE_KEY: &str = "tag";

/// Evidential strength of a signal.
///
/// Only `Hard`, `Soft` and `Tampered` ever contribute score. `Unavailable`
/// means the environment could not produce the signal and is never a clean
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalState {
    Hard { detected: bool },
    Soft { confidence: f64 },
    Tampered,
    ServerRequired,
    Unavailable,
}

impl SignalState {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalState::Hard { detected: true } => "HARD_DETECTED",
            SignalState::Hard { detected: false } => "HARD_CLEAR",
            SignalState::Soft { .. } => "SOFT",
            SignalState::Tampered => "TAMPERED",
            SignalState::ServerRequired => "SERVER_REQUIRED",
            SignalState::Unavailable => "UNAVAILABLE",
        }
    }

    /// Multiplier applied to the raw signal score.
    pub fn score_factor(self) -> f64 {
        match self {
            SignalState::Hard { detected: true } | SignalState::Tampered => 1.0,
            SignalState::Soft { confidence } => confidence,
            SignalState::Hard { detected: false }
            | SignalState::ServerRequired
            | SignalState::Unavailable => 0.0,
        }
    }

    pub fn is_conclusive_positive(self) -> bool {
        matches!(
            self,
            SignalState::Hard { detected: true } | SignalState::Tampered
        )
    }

    pub fn is_asserted(self) -> bool {
        match self {
            SignalState::Hard { detected } => detected,
            SignalState::Tampered => true,
            SignalState::Soft { confidence } => confidence > 0.0,
            SignalState::ServerRequired | SignalState::Unavailable => false,
        }
    }

    pub fn is_hard_clear(self) -> bool {
        matches!(self, SignalState::Hard { detected: false })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    pub category: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: String,
    pub category: String,
    pub score: f64,
    #[serde(default)]
    pub evidence: BTreeMap<String, String>,
    pub state: SignalState,
    #[serde(default)]
    pub layer: u8,
    #[serde(default = "default_weight_hint")]
    pub weight_hint: f64,
}

fn default_weight_hint() -> f64 {
    1.0
}

impl Signal {
    pub fn v1(
        category: impl Into<String>,
        id: impl Into<String>,
        score: f64,
        state: SignalState,
    ) -> Result<Self, ContractViolation> {
        let signal = Self::unchecked(category.into(), id.into(), score, state);
        signal.validate()?;
        Ok(signal)
    }

    pub fn hard(
        category: impl Into<String>,
        id: impl Into<String>,
        score: f64,
        detected: bool,
    ) -> Result<Self, ContractViolation> {
        Self::v1(category, id, score, SignalState::Hard { detected })
    }

    pub fn soft(
        category: impl Into<String>,
        id: impl Into<String>,
        score: f64,
        confidence: f64,
    ) -> Result<Self, ContractViolation> {
        Self::v1(category, id, score, SignalState::Soft { confidence })
    }

    pub fn tampered(
        category: impl Into<String>,
        id: impl Into<String>,
        score: f64,
    ) -> Result<Self, ContractViolation> {
        Self::v1(category, id, score, SignalState::Tampered)
    }

    pub fn server_required(
        category: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        Self::v1(category, id, 0.0, SignalState::ServerRequired)
    }

    pub fn unavailable(
        category: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        Self::v1(category, id, 0.0, SignalState::Unavailable)
    }

    fn unchecked(category: String, id: String, score: f64, state: SignalState) -> Self {
        Self {
            id,
            category,
            score,
            evidence: BTreeMap::new(),
            state,
            layer: 0,
            weight_hint: default_weight_hint(),
        }
    }

    pub fn with_evidence(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.evidence.insert(key.into(), value.into());
        self
    }

    pub fn with_layer(mut self, layer: u8) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_weight_hint(mut self, weight_hint: f64) -> Self {
        self.weight_hint = weight_hint;
        self
    }

    pub fn key(&self) -> SignalKey {
        SignalKey {
            category: self.category.clone(),
            id: self.id.clone(),
        }
    }

    pub fn qualified_id(&self) -> String {
        format!("{}/{}", self.category, self.id)
    }

    pub fn effective_score(&self) -> f64 {
        self.score * self.state.score_factor()
    }

    pub fn is_asserted(&self) -> bool {
        self.state.is_asserted()
    }

    /// Qualified name plus the optional `tag` evidence value.
    pub fn tags(&self) -> Vec<String> {
        let mut tags = vec![self.qualified_id()];
        if let Some(tag) = self.evidence.get(SIGNAL_TAG_EVIDENCE_KEY) {
            if !tag.trim().is_empty() {
                tags.push(tag.clone());
            }
        }
        tags
    }
}

impl Validate for Signal {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("signal.id", &self.id, SIGNAL_TOKEN_MAX_LEN)?;
        validate_token("signal.category", &self.category, SIGNAL_TOKEN_MAX_LEN)?;
        validate_non_negative("signal.score", self.score)?;
        validate_non_negative("signal.weight_hint", self.weight_hint)?;
        if let SignalState::Soft { confidence } = self.state {
            validate_range("signal.state.confidence", confidence, 0.0, 1.0)?;
        }
        if self.evidence.len() > SIGNAL_EVIDENCE_MAX_ENTRIES {
            return Err(ContractViolation::InvalidValue {
                field: "signal.evidence",
                reason: "too many entries",
            });
        }
        for (key, value) in &self.evidence {
            validate_token("signal.evidence.key", key, SIGNAL_EVIDENCE_KEY_MAX_LEN)?;
            if value.len() > SIGNAL_EVIDENCE_VALUE_MAX_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "signal.evidence.value",
                    reason: "exceeds max length",
                });
            }
        }
        Ok(())
    }
}

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{validate_non_negative, validate_token};
use crate::{ContractViolation, UnixTimeMs, Validate};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "device_id",
                reason: "must not be empty",
            });
        }
        if id.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "device_id",
                reason: "must be <= 128 chars",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub ip_address: Option<String>,
    pub vpn_active: bool,
    pub proxy_enabled: bool,
    pub interface_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorSummary {
    pub touch_event_count: u32,
    pub sensor_sample_count: u32,
    pub motion_variance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorDetection {
    pub total_score: f64,
    pub high_risk: bool,
    pub detected_at: UnixTimeMs,
}

/// Read-only evidence bundle handed to every provider for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSnapshot {
    pub device_id: DeviceId,
    pub device_fingerprint: BTreeMap<String, String>,
    pub network: NetworkState,
    pub behavior: BehaviorSummary,
    pub prior_detection: Option<PriorDetection>,
    pub captured_at: UnixTimeMs,
}

impl EvaluationSnapshot {
    pub fn v1(
        device_id: DeviceId,
        device_fingerprint: BTreeMap<String, String>,
        network: NetworkState,
        behavior: BehaviorSummary,
        prior_detection: Option<PriorDetection>,
        captured_at: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let snapshot = Self {
            device_id,
            device_fingerprint,
            network,
            behavior,
            prior_detection,
            captured_at,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Snapshot carrying only a device id; used by hosts that feed all
    /// evidence through providers.
    pub fn minimal(device_id: DeviceId, captured_at: UnixTimeMs) -> Self {
        Self {
            device_id,
            device_fingerprint: BTreeMap::new(),
            network: NetworkState::default(),
            behavior: BehaviorSummary::default(),
            prior_detection: None,
            captured_at,
        }
    }
}

impl Validate for EvaluationSnapshot {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.device_fingerprint.len() > 256 {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_snapshot.device_fingerprint",
                reason: "must be <= 256 entries",
            });
        }
        if let Some(ip) = &self.network.ip_address {
            validate_token("evaluation_snapshot.network.ip_address", ip, 64)?;
        }
        if self.network.interface_names.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "evaluation_snapshot.network.interface_names",
                reason: "must be <= 64 entries",
            });
        }
        validate_non_negative(
            "evaluation_snapshot.behavior.motion_variance",
            self.behavior.motion_variance,
        )?;
        if let Some(prior) = &self.prior_detection {
            validate_non_negative(
                "evaluation_snapshot.prior_detection.total_score",
                prior.total_score,
            )?;
        }
        Ok(())
    }
}

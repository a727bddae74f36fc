#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use riskguard_contracts::policy::{BucketingStrategy, Policy};
use sha2::{Digest, Sha256};

const MODULAR_SLOTS: u64 = 10_000;

/// Deterministic experiment assignment; `1` means "in the experiment".
pub fn bucket(
    strategy: BucketingStrategy,
    device_id: &str,
    experiment_key: &str,
    traffic_fraction: f64,
) -> u8 {
    let fraction = if traffic_fraction.is_finite() {
        traffic_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    match strategy {
        BucketingStrategy::ConsistentHash => {
            consistent_hash_bucket(device_id, experiment_key, fraction)
        }
        BucketingStrategy::ModularHash => modular_hash_bucket(device_id, experiment_key, fraction),
    }
}

/// Buckets for every active experiment of `policy`, keyed by experiment key.
pub fn assign_buckets(policy: &Policy, device_id: &str) -> BTreeMap<String, u8> {
    policy
        .active_experiments()
        .map(|e| {
            (
                e.key.clone(),
                bucket(policy.bucketing_strategy, device_id, &e.key, e.traffic_fraction),
            )
        })
        .collect()
}

// A device's point on [0, 1) depends only on (key, device), so raising the
// fraction only ever moves devices from bucket 0 to bucket 1.
fn consistent_hash_bucket(device_id: &str, experiment_key: &str, fraction: f64) -> u8 {
    let h = hash64(&[
        &b"riskguard.bucket.consistent.v1"[..],
        experiment_key.as_bytes(),
        device_id.as_bytes(),
    ]);
    let unit = (h >> 11) as f64 / (1u64 << 53) as f64;
    u8::from(unit < fraction)
}

// The fraction is part of the hash input, so any reconfiguration reshuffles.
fn modular_hash_bucket(device_id: &str, experiment_key: &str, fraction: f64) -> u8 {
    let fraction_bp = (fraction * MODULAR_SLOTS as f64).round() as u64;
    let h = hash64(&[
        &b"riskguard.bucket.modular.v1"[..],
        device_id.as_bytes(),
        experiment_key.as_bytes(),
        &fraction_bp.to_be_bytes()[..],
    ]);
    u8::from(h % MODULAR_SLOTS < fraction_bp)
}

fn hash64(parts: &[&[u8]]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#![forbid(unsafe_code)]

use riskguard_contracts::policy::{Policy, SCORE_MAX, SCORE_MIN};
use sha2::{Digest, Sha256};

pub const SCOPE_PROVIDER_ORDER: &str = "provider_order";
pub const SCOPE_SIGNAL_ORDER: &str = "signal_order";
pub const SCOPE_THRESHOLD_JITTER: &str = "threshold_jitter";
pub const SCOPE_SCORE_JITTER: &str = "score_jitter";

const BASIS_POINTS: f64 = 10_000.0;

/// Derives reproducible permutations and jitter from `(seed, epoch, scope,
/// device)`. The epoch is the policy version, so values move when a new
/// policy lands and stay fixed for a device within one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationPlanner {
    seed: u64,
    epoch: i64,
}

impl MutationPlanner {
    pub fn new(seed: u64, epoch: i64) -> Self {
        Self { seed, epoch }
    }

    /// `None` when the policy leaves mutation disabled.
    pub fn from_policy(policy: &Policy) -> Option<Self> {
        if !policy.mutation.enabled {
            return None;
        }
        Some(Self::new(policy.mutation.seed, policy.version))
    }

    pub fn for_device(self, device_id: &str) -> DeviceMutation {
        DeviceMutation {
            planner: self,
            device_id: device_id.to_string(),
        }
    }

    pub fn stream(&self, scope: &str, device_id: &str) -> MutationStream {
        let mut hasher = Sha256::new();
        hasher.update(b"riskguard.mutation.v1\0");
        hasher.update(self.seed.to_be_bytes());
        hasher.update(self.epoch.to_be_bytes());
        hasher.update(scope.as_bytes());
        hasher.update([0u8]);
        hasher.update(device_id.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        MutationStream { key, counter: 0 }
    }

    /// Fisher-Yates over `0..len`.
    pub fn permutation(&self, scope: &str, device_id: &str, len: usize) -> Vec<usize> {
        let mut out: Vec<usize> = (0..len).collect();
        let mut stream = self.stream(scope, device_id);
        for i in (1..len).rev() {
            let j = stream.next_below(i as u64 + 1) as usize;
            out.swap(i, j);
        }
        out
    }

    /// Signed jitter in `[-max_bp, max_bp]`.
    pub fn jitter_bp(&self, scope: &str, device_id: &str, max_bp: u32) -> i32 {
        if max_bp == 0 {
            return 0;
        }
        let span = u64::from(max_bp) * 2 + 1;
        let draw = self.stream(scope, device_id).next_below(span) as i64;
        (draw - i64::from(max_bp)) as i32
    }
}

/// A planner bound to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMutation {
    planner: MutationPlanner,
    device_id: String,
}

impl DeviceMutation {
    pub fn permutation(&self, scope: &str, len: usize) -> Vec<usize> {
        self.planner.permutation(scope, &self.device_id, len)
    }

    pub fn jitter_bp(&self, scope: &str, max_bp: u32) -> i32 {
        self.planner.jitter_bp(scope, &self.device_id, max_bp)
    }

    /// Reorders `items` by the scope's permutation.
    pub fn shuffle<T>(&self, scope: &str, items: Vec<T>) -> Vec<T> {
        let order = self.permutation(scope, items.len());
        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        order
            .into_iter()
            .filter_map(|i| slots.get_mut(i).and_then(Option::take))
            .collect()
    }
}

pub struct MutationStream {
    key: [u8; 32],
    counter: u64,
}

impl MutationStream {
    pub fn next_u64(&mut self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Uniform draw in `0..bound` without modulo bias.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        if bound <= 1 {
            return 0;
        }
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let v = self.next_u64();
            if v < zone {
                return v % bound;
            }
        }
    }
}

/// Scales a score-domain value by `bp` basis points and clamps to `[0, 100]`.
pub fn apply_jitter_bp(value: f64, bp: i32) -> f64 {
    let scaled = value * (1.0 + f64::from(bp) / BASIS_POINTS);
    scaled.clamp(SCORE_MIN, SCORE_MAX)
}

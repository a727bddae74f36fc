#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use riskguard_contracts::policy::Policy;
use riskguard_contracts::report::{ProviderFailure, ProviderFailureReason, ServerFields};
use riskguard_contracts::signal::{Signal, SignalKey};
use riskguard_contracts::snapshot::EvaluationSnapshot;
use riskguard_contracts::Validate;

use crate::mutation::{DeviceMutation, MutationPlanner, SCOPE_PROVIDER_ORDER, SCOPE_SIGNAL_ORDER};
use crate::provider::SignalProvider;

pub const DEFAULT_MAX_COLLECTION_WORKERS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOptions {
    pub max_workers: usize,
    pub budget: Option<Duration>,
    pub disabled_providers: BTreeSet<String>,
    pub provider_shuffle: Option<DeviceMutation>,
    pub signal_shuffle: Option<DeviceMutation>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_COLLECTION_WORKERS,
            budget: None,
            disabled_providers: BTreeSet::new(),
            provider_shuffle: None,
            signal_shuffle: None,
        }
    }
}

impl CollectOptions {
    /// Toggles, detection budget and shuffles as configured by `policy`.
    pub fn from_policy(policy: &Policy, device_id: &str, max_workers: usize) -> Self {
        let disabled_providers = policy
            .detector_toggles
            .keys()
            .filter(|id| !policy.is_detector_enabled(id))
            .cloned()
            .collect();
        let mutation = MutationPlanner::from_policy(policy).map(|p| p.for_device(device_id));
        let provider_shuffle = mutation
            .clone()
            .filter(|_| policy.mutation.shuffle_providers);
        let signal_shuffle = mutation.filter(|_| policy.mutation.shuffle_signals);
        Self {
            max_workers,
            budget: Some(Duration::from_millis(policy.rules.max_detection_duration_ms)),
            disabled_providers,
            provider_shuffle,
            signal_shuffle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionOutcome {
    pub signals: Vec<Signal>,
    pub failures: Vec<ProviderFailure>,
    pub server_fields: BTreeMap<String, ServerFields>,
    pub skipped_disabled: Vec<String>,
    pub invocation_order: Vec<String>,
}

struct ProviderRun {
    signals: Result<Vec<Signal>, ProviderFailure>,
    server_fields: Option<ServerFields>,
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn SignalProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.provider_ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&mut self, provider: P)
    where
        P: SignalProvider + 'static,
    {
        self.register_shared(Arc::new(provider));
    }

    /// Replaces a provider with the same id in place, keeping its slot.
    pub fn register_shared(&mut self, provider: Arc<dyn SignalProvider>) {
        match self.providers.iter_mut().find(|p| p.id() == provider.id()) {
            Some(slot) => *slot = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn unregister(&mut self, provider_id: &str) -> Option<Arc<dyn SignalProvider>> {
        let idx = self.providers.iter().position(|p| p.id() == provider_id)?;
        Some(self.providers.remove(idx))
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn collect(&self, snapshot: &Arc<EvaluationSnapshot>) -> Vec<Signal> {
        self.collect_with(snapshot, &CollectOptions::default()).signals
    }

    pub fn collect_with(
        &self,
        snapshot: &Arc<EvaluationSnapshot>,
        options: &CollectOptions,
    ) -> CollectionOutcome {
        let mut outcome = CollectionOutcome::default();

        let mut slots: Vec<(usize, Arc<dyn SignalProvider>)> = Vec::new();
        for provider in &self.providers {
            if options.disabled_providers.contains(provider.id()) {
                outcome.skipped_disabled.push(provider.id().to_string());
                continue;
            }
            slots.push((slots.len(), provider.clone()));
        }
        if slots.is_empty() {
            return outcome;
        }

        let invocation: Vec<(usize, Arc<dyn SignalProvider>)> = match &options.provider_shuffle {
            Some(mutation) => mutation.shuffle(SCOPE_PROVIDER_ORDER, slots.clone()),
            None => slots.clone(),
        };
        outcome.invocation_order = invocation.iter().map(|(_, p)| p.id().to_string()).collect();

        let mut runs = run_providers(invocation, snapshot, options);

        let mut seen: BTreeSet<SignalKey> = BTreeSet::new();
        let mut signals = Vec::new();
        for (slot, provider) in &slots {
            let provider_id = provider.id().to_string();
            let Some(run) = runs[*slot].take() else {
                tracing::warn!(
                    provider_id = %provider_id,
                    "signal provider exceeded detection budget; abandoned"
                );
                outcome.failures.push(ProviderFailure {
                    provider_id,
                    reason: ProviderFailureReason::TimedOut,
                    message: "exceeded detection budget".to_string(),
                });
                continue;
            };
            if let Some(fields) = run.server_fields {
                outcome.server_fields.insert(provider_id.clone(), fields);
            }
            match run.signals {
                Ok(emitted) => {
                    let mut rejected = 0usize;
                    for signal in emitted {
                        if signal.validate().is_err() {
                            rejected += 1;
                            continue;
                        }
                        if seen.insert(signal.key()) {
                            signals.push(signal);
                        }
                    }
                    if rejected > 0 {
                        tracing::warn!(
                            provider_id = %provider_id,
                            rejected,
                            "dropped signals failing contract validation"
                        );
                        outcome.failures.push(ProviderFailure {
                            provider_id,
                            reason: ProviderFailureReason::InvalidSignal,
                            message: format!("{rejected} signal(s) failed validation"),
                        });
                    }
                }
                Err(failure) => {
                    tracing::warn!(
                        provider_id = %failure.provider_id,
                        reason = failure.reason.as_str(),
                        message = ?failure.message,
                        "signal provider failed; skipping"
                    );
                    outcome.failures.push(failure);
                }
            }
        }

        outcome.signals = match &options.signal_shuffle {
            Some(mutation) => mutation.shuffle(SCOPE_SIGNAL_ORDER, signals),
            None => signals,
        };
        outcome
    }
}

/// Runs providers on a bounded pool; results are indexed by registration
/// slot. Slots still `None` on return were abandoned at the deadline.
fn run_providers(
    invocation: Vec<(usize, Arc<dyn SignalProvider>)>,
    snapshot: &Arc<EvaluationSnapshot>,
    options: &CollectOptions,
) -> Vec<Option<ProviderRun>> {
    let total = invocation.len();
    let mut runs: Vec<Option<ProviderRun>> = (0..total).map(|_| None).collect();
    let deadline = options.budget.map(|b| Instant::now() + b);

    let queue = Arc::new(Mutex::new(VecDeque::from(invocation)));
    let cancelled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<(usize, ProviderRun)>();

    let workers = options.max_workers.clamp(1, total);
    let mut spawned = 0usize;
    for n in 0..workers {
        let queue = queue.clone();
        let cancelled = cancelled.clone();
        let snapshot = snapshot.clone();
        let tx = tx.clone();
        let spawn = thread::Builder::new()
            .name(format!("riskguard-collect-{n}"))
            .spawn(move || loop {
                if cancelled.load(Ordering::Acquire) {
                    break;
                }
                let next = match queue.lock() {
                    Ok(mut q) => q.pop_front(),
                    Err(_) => None,
                };
                let Some((slot, provider)) = next else {
                    break;
                };
                let run = run_isolated(provider.as_ref(), &snapshot);
                if tx.send((slot, run)).is_err() {
                    break;
                }
            });
        match spawn {
            Ok(_) => spawned += 1,
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn collection worker");
            }
        }
    }
    drop(tx);

    if spawned == 0 {
        let pending: Vec<(usize, Arc<dyn SignalProvider>)> = match queue.lock() {
            Ok(mut q) => q.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for (slot, provider) in pending {
            runs[slot] = Some(run_isolated(provider.as_ref(), snapshot));
        }
        return runs;
    }

    let mut received = 0usize;
    while received < total {
        let next = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                rx.recv_timeout(deadline - now)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok((slot, run)) => {
                runs[slot] = Some(run);
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    cancelled.store(true, Ordering::Release);
    runs
}

fn run_isolated(provider: &dyn SignalProvider, snapshot: &EvaluationSnapshot) -> ProviderRun {
    let provider_id = provider.id().to_string();
    let signals = match panic::catch_unwind(AssertUnwindSafe(|| provider.collect(snapshot))) {
        Ok(Ok(signals)) => Ok(signals),
        Ok(Err(err)) => Err(ProviderFailure {
            provider_id: provider_id.clone(),
            reason: ProviderFailureReason::Error,
            message: err.message().to_string(),
        }),
        Err(payload) => Err(ProviderFailure {
            provider_id: provider_id.clone(),
            reason: ProviderFailureReason::Panicked,
            message: panic_message(payload.as_ref()),
        }),
    };
    let server_fields = if signals.is_ok() {
        panic::catch_unwind(AssertUnwindSafe(|| provider.server_aggregate_fields(snapshot)))
            .ok()
            .flatten()
    } else {
        None
    };
    ProviderRun {
        signals,
        server_fields,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "provider panicked".to_string()
}

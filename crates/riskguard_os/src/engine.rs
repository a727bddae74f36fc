#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, RwLock};

use riskguard_contracts::policy::Policy;
use riskguard_contracts::report::RiskReport;
use riskguard_contracts::snapshot::EvaluationSnapshot;
use riskguard_contracts::Validate;
use riskguard_engines::decision::{DecisionConfig, DecisionEngine};
use riskguard_engines::provider::SignalProvider;
use riskguard_engines::registry::ProviderRegistry;
use riskguard_storage::policy_cache::{
    FilePolicyStore, InMemoryPolicyStore, PolicyCache, PolicyStore, StorageError,
};

use crate::config::RiskEngineConfig;
use crate::policy_fetch::UreqPolicyTransport;
use crate::policy_provider::PolicyProvider;

#[derive(Debug)]
pub enum EngineError {
    Storage(StorageError),
    Dispatch(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Storage(e) => write!(f, "engine storage setup failed: {e}"),
            EngineError::Dispatch(msg) => write!(f, "evaluation dispatch failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e)
    }
}

/// Explicitly constructed engine context: provider registry, decision
/// engine and policy provider. Hosts build one and pass it around.
pub struct RiskEngine {
    decision: DecisionEngine,
    registry: RwLock<ProviderRegistry>,
    policy: Arc<PolicyProvider>,
}

impl fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiskEngine")
            .field("decision", &self.decision)
            .field("providers", &self.provider_ids())
            .field("policy", &self.policy)
            .finish()
    }
}

impl RiskEngine {
    pub fn new(config: &RiskEngineConfig, policy: Arc<PolicyProvider>) -> Self {
        Self {
            decision: DecisionEngine::new(DecisionConfig {
                max_collection_workers: config.max_collection_workers,
            }),
            registry: RwLock::new(ProviderRegistry::new()),
            policy,
        }
    }

    /// Process-boundary convenience: env config, file cache when a cache
    /// directory is configured, and the blocking HTTP transport.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_config(RiskEngineConfig::from_env())
    }

    pub fn from_config(config: RiskEngineConfig) -> Result<Self, EngineError> {
        let p = &config.policy;
        let store: Arc<dyn PolicyStore> = match &p.cache_dir {
            Some(dir) => Arc::new(FilePolicyStore::new(dir.clone())),
            None => Arc::new(InMemoryPolicyStore::new()),
        };
        let cache = Arc::new(PolicyCache::open(store, &p.cache_namespace, p.cache_max_entries)?);
        let transport = Arc::new(UreqPolicyTransport::new(p.fetch_timeout_ms));
        let provider = Arc::new(PolicyProvider::new(p.clone(), transport, cache));
        Ok(Self::new(&config, provider))
    }

    pub fn policy_provider(&self) -> &Arc<PolicyProvider> {
        &self.policy
    }

    pub fn register_provider<P>(&self, provider: P)
    where
        P: SignalProvider + 'static,
    {
        self.register_shared_provider(Arc::new(provider));
    }

    pub fn register_shared_provider(&self, provider: Arc<dyn SignalProvider>) {
        match self.registry.write() {
            Ok(mut registry) => registry.register_shared(provider),
            Err(_) => tracing::warn!("provider registry lock poisoned; registration dropped"),
        }
    }

    pub fn unregister_provider(&self, provider_id: &str) -> bool {
        match self.registry.write() {
            Ok(mut registry) => registry.unregister(provider_id).is_some(),
            Err(_) => false,
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        match self.registry.read() {
            Ok(registry) => registry.provider_ids(),
            Err(_) => Vec::new(),
        }
    }

    /// Evaluates against the current cached policy (or the fallback).
    pub fn evaluate(&self, snapshot: EvaluationSnapshot, scenario: &str) -> RiskReport {
        let policy = self.policy.current_policy();
        self.evaluate_with_policy(snapshot, &policy, scenario)
    }

    pub fn evaluate_with_policy(
        &self,
        snapshot: EvaluationSnapshot,
        policy: &Policy,
        scenario: &str,
    ) -> RiskReport {
        if let Err(violation) = snapshot.validate() {
            tracing::warn!(
                device_id = %snapshot.device_id.as_str(),
                violation = %violation,
                "evaluation snapshot out of contract; evaluating anyway"
            );
        }
        // Registry handles are cheap clones; no lock is held while
        // providers run.
        let registry = match self.registry.read() {
            Ok(registry) => registry.clone(),
            Err(_) => ProviderRegistry::new(),
        };
        self.decision
            .evaluate(&registry, Arc::new(snapshot), policy, scenario)
    }

    /// Runs [`Self::evaluate`] on tokio's blocking pool so async callers
    /// (for example a UI event loop) never block on collection.
    pub async fn evaluate_async(
        self: &Arc<Self>,
        snapshot: EvaluationSnapshot,
        scenario: impl Into<String>,
    ) -> Result<RiskReport, EngineError> {
        let engine = Arc::clone(self);
        let scenario = scenario.into();
        tokio::task::spawn_blocking(move || engine.evaluate(snapshot, &scenario))
            .await
            .map_err(|err| EngineError::Dispatch(err.to_string()))
    }
}

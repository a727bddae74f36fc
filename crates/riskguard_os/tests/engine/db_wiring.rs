#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use riskguard_contracts::policy::{Action, Policy, RiskTier};
use riskguard_contracts::report::{ProviderFailureReason, ServerFields};
use riskguard_contracts::signal::Signal;
use riskguard_contracts::snapshot::{DeviceId, EvaluationSnapshot};
use riskguard_contracts::UnixTimeMs;
use riskguard_engines::provider::{ProviderError, SignalProvider};
use riskguard_os::config::{PolicyProviderConfig, RiskEngineConfig};
use riskguard_os::engine::RiskEngine;
use riskguard_os::policy_fetch::{FetchFailure, PolicyResponse, PolicyTransport};
use riskguard_os::policy_provider::PolicyProvider;
use riskguard_storage::policy_cache::PolicyCache;

struct QueueTransport {
    bodies: Mutex<Vec<String>>,
}

impl PolicyTransport for QueueTransport {
    fn fetch(&self, _url: &str) -> Result<PolicyResponse, FetchFailure> {
        let mut bodies = self.bodies.lock().unwrap();
        if bodies.is_empty() {
            return Err(FetchFailure::transport("offline"));
        }
        Ok(PolicyResponse {
            status: 200,
            body: bodies.remove(0),
        })
    }
}

struct HookProbe;

impl SignalProvider for HookProbe {
    fn id(&self) -> &str {
        "hook_probe"
    }

    fn collect(&self, snapshot: &EvaluationSnapshot) -> Result<Vec<Signal>, ProviderError> {
        let mut signals = vec![Signal::hard("runtime", "hook_detected", 55.0, true)
            .map_err(|e| ProviderError::new(e.to_string()))?];
        if snapshot.network.vpn_active {
            signals.push(
                Signal::soft("network", "vpn_active", 20.0, 0.5)
                    .map_err(|e| ProviderError::new(e.to_string()))?,
            );
        }
        Ok(signals)
    }
}

struct CountingProbe {
    calls: Arc<AtomicUsize>,
}

impl SignalProvider for CountingProbe {
    fn id(&self) -> &str {
        "counting_probe"
    }

    fn collect(&self, _snapshot: &EvaluationSnapshot) -> Result<Vec<Signal>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Signal::server_required("network", "ip_reputation")
            .map_err(|e| ProviderError::new(e.to_string()))?])
    }

    fn server_aggregate_fields(&self, snapshot: &EvaluationSnapshot) -> Option<ServerFields> {
        snapshot.network.ip_address.as_ref().map(|_| ServerFields {
            co_location_count: Some(1),
            ..ServerFields::default()
        })
    }
}

struct CrashingProbe;

impl SignalProvider for CrashingProbe {
    fn id(&self) -> &str {
        "crashing_probe"
    }

    fn collect(&self, _snapshot: &EvaluationSnapshot) -> Result<Vec<Signal>, ProviderError> {
        panic!("native probe fault");
    }
}

fn snapshot() -> EvaluationSnapshot {
    let mut s = EvaluationSnapshot::minimal(DeviceId::new("device_42").unwrap(), UnixTimeMs(1));
    s.network.ip_address = Some("198.51.100.7".to_string());
    s
}

fn policy_json(version: i64, payment_high: &str) -> String {
    let mut p: serde_json::Value =
        serde_json::from_str(&Policy::default_v1().to_json().unwrap()).unwrap();
    p["version"] = serde_json::json!(version);
    p["policy"]["scenarios"]["payment"]["actions"] =
        serde_json::json!({ "low": "allow", "medium": "challenge", "high": payment_high });
    p.to_string()
}

fn engine_with(bodies: Vec<String>) -> Arc<RiskEngine> {
    let provider = Arc::new(PolicyProvider::new(
        PolicyProviderConfig::mvp_v1().with_endpoint("http://policy.test/v1"),
        Arc::new(QueueTransport {
            bodies: Mutex::new(bodies),
        }),
        Arc::new(PolicyCache::in_memory(5)),
    ));
    Arc::new(RiskEngine::new(&RiskEngineConfig::mvp_v1(), provider))
}

#[test]
fn at_engine_db_01_payment_scenario_blocks_under_fetched_policy() {
    let engine = engine_with(vec![policy_json(1, "block")]);
    engine.register_provider(HookProbe);
    engine.policy_provider().fetch_now().unwrap();

    let payment = engine.evaluate(snapshot(), "payment");
    assert_eq!(payment.verdict.policy_version, 1);
    assert_eq!(payment.verdict.tier, RiskTier::High);
    assert_eq!(payment.verdict.action, Action::Block);

    let login = engine.evaluate(snapshot(), "login");
    assert_eq!(login.verdict.tier, RiskTier::Medium);
    assert_eq!(login.verdict.action, Action::Challenge);
}

#[test]
fn at_engine_db_02_policy_update_applies_to_next_evaluation() {
    let engine = engine_with(vec![policy_json(1, "block"), policy_json(2, "challenge")]);
    engine.register_provider(HookProbe);
    engine.policy_provider().fetch_now().unwrap();
    assert_eq!(engine.evaluate(snapshot(), "payment").verdict.action, Action::Block);

    engine.policy_provider().fetch_now().unwrap();
    let report = engine.evaluate(snapshot(), "payment");
    assert_eq!(report.verdict.policy_version, 2);
    assert_eq!(report.verdict.action, Action::Challenge);

    // Offline now: the last known-good policy stays in force.
    assert!(engine.policy_provider().fetch_now().is_err());
    assert_eq!(engine.evaluate(snapshot(), "payment").verdict.policy_version, 2);
}

#[test]
fn at_engine_db_03_crashing_provider_is_isolated_in_report() {
    let engine = engine_with(vec![]);
    let calls = Arc::new(AtomicUsize::new(0));
    engine.register_provider(CrashingProbe);
    engine.register_provider(HookProbe);
    engine.register_provider(CountingProbe {
        calls: calls.clone(),
    });

    let report = engine.evaluate(snapshot(), "default");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.provider_failures.len(), 1);
    assert_eq!(report.provider_failures[0].provider_id, "crashing_probe");
    assert_eq!(report.provider_failures[0].reason, ProviderFailureReason::Panicked);
    assert_eq!(report.signals().len(), 2);
    assert!(report.score_report.summary.contains("no_evidence=1"));
    assert_eq!(
        report.server_fields["counting_probe"].co_location_count,
        Some(1)
    );

    let enriched = report.clone().enrich(
        "counting_probe",
        ServerFields {
            ip_reputation: Some("datacenter".to_string()),
            ..ServerFields::default()
        },
    );
    assert_eq!(
        enriched.server_fields["counting_probe"].ip_reputation.as_deref(),
        Some("datacenter")
    );
    assert_eq!(report.server_fields["counting_probe"].ip_reputation, None);
}

#[test]
fn at_engine_db_04_unregister_removes_provider() {
    let engine = engine_with(vec![]);
    engine.register_provider(HookProbe);
    assert_eq!(engine.provider_ids(), vec!["hook_probe".to_string()]);
    assert!(engine.unregister_provider("hook_probe"));
    assert!(!engine.unregister_provider("hook_probe"));
    assert!(engine.evaluate(snapshot(), "payment").signals().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_engine_db_05_async_evaluation_matches_sync() {
    let engine = engine_with(vec![policy_json(3, "block")]);
    engine.register_provider(HookProbe);
    engine.policy_provider().fetch_now().unwrap();

    let mut vpn = snapshot();
    vpn.network.vpn_active = true;
    let sync = engine.evaluate(vpn.clone(), "payment");
    let from_async = engine.evaluate_async(vpn, "payment").await.unwrap();
    assert_eq!(from_async, sync);
    assert_eq!(from_async.verdict.action, Action::Block);
}

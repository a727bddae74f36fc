#![forbid(unsafe_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use riskguard_contracts::policy::Policy;
use riskguard_os::config::PolicyProviderConfig;
use riskguard_os::policy_fetch::{FetchFailure, PolicyResponse, PolicyTransport, UreqPolicyTransport};
use riskguard_os::policy_provider::{
    reason_codes, PolicyProvider, PolicyRejection, PolicyUpdate, PolicyUpdateError,
};
use riskguard_storage::policy_cache::{FilePolicyStore, PolicyCache, PolicyStore};
use tempfile::TempDir;

/// Replays scripted responses in order; the last one repeats.
struct ScriptedTransport {
    responses: Mutex<Vec<(u16, String)>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn new(responses: Vec<(u16, String)>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        })
    }
}

impl PolicyTransport for ScriptedTransport {
    fn fetch(&self, _url: &str) -> Result<PolicyResponse, FetchFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        let (status, body) = responses
            .get(n)
            .or_else(|| responses.last())
            .cloned()
            .unwrap_or((503, String::new()));
        Ok(PolicyResponse { status, body })
    }
}

/// Blocks inside `fetch` until released, to hold the in-flight flag.
struct GatedTransport {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
    body: String,
}

impl PolicyTransport for GatedTransport {
    fn fetch(&self, _url: &str) -> Result<PolicyResponse, FetchFailure> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            let _ = tx.send(());
        }
        let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
        Ok(PolicyResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

fn policy_json(version: i64) -> String {
    let mut p = Policy::default_v1();
    p.version = version;
    p.to_json().unwrap()
}

fn policy(version: i64) -> Policy {
    let mut p = Policy::default_v1();
    p.version = version;
    p
}

fn config() -> PolicyProviderConfig {
    PolicyProviderConfig::mvp_v1().with_endpoint("http://policy.test/v1")
}

fn provider(transport: Arc<dyn PolicyTransport>) -> PolicyProvider {
    PolicyProvider::new(config(), transport, Arc::new(PolicyCache::in_memory(5)))
}

fn single_response_server(status_line: &'static str, body: String) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    listener
        .set_nonblocking(true)
        .expect("set nonblocking listener");
    let handle = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match listener.accept() {
                Ok((mut stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
                    let mut req_buf = [0_u8; 4096];
                    let _ = stream.read(&mut req_buf);
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    stream
                        .write_all(response.as_bytes())
                        .expect("write response");
                    let _ = stream.flush();
                    break;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
    });
    (format!("http://{addr}/policy"), handle)
}

#[test]
fn at_policy_db_01_failures_keep_last_known_good_policy() {
    let mut out_of_range: serde_json::Value = serde_json::from_str(&policy_json(9)).unwrap();
    out_of_range["policy"]["threshold"] = serde_json::json!(150.0);
    let transport = ScriptedTransport::new(vec![
        (200, policy_json(3)),
        (500, String::new()),
        (200, out_of_range.to_string()),
        (200, "{not json".to_string()),
    ]);
    let provider = provider(transport);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = observed.clone();
    provider.on_error(move |err| sink.lock().unwrap().push(err.reason_code()));

    assert_eq!(
        provider.fetch_now().unwrap(),
        PolicyUpdate::Applied {
            version: 3,
            previous: None
        }
    );
    let known_good = provider.current_policy();

    assert!(matches!(
        provider.fetch_now(),
        Err(PolicyUpdateError::FetchFailure(FetchFailure {
            status: Some(500),
            ..
        }))
    ));
    assert!(matches!(
        provider.fetch_now(),
        Err(PolicyUpdateError::ValidationFailure(PolicyRejection::Decode(_)))
    ));
    assert!(matches!(
        provider.fetch_now(),
        Err(PolicyUpdateError::ValidationFailure(_))
    ));

    assert_eq!(provider.current_policy(), known_good);
    assert_eq!(provider.cache().available_versions(), vec![3]);
    assert_eq!(
        *observed.lock().unwrap(),
        vec![
            reason_codes::POLICY_FETCH_FAILED,
            reason_codes::POLICY_VALIDATION_FAILED,
            reason_codes::POLICY_VALIDATION_FAILED,
        ]
    );
}

#[test]
fn at_policy_db_02_no_cache_falls_back_to_preset() {
    let provider = provider(ScriptedTransport::new(vec![(500, String::new())]));
    assert!(provider.fetch_now().is_err());
    assert_eq!(*provider.current_policy(), Policy::default_v1());
}

#[test]
fn at_policy_db_03_stale_rejected_equal_is_noop() {
    let transport = ScriptedTransport::new(vec![
        (200, policy_json(5)),
        (200, policy_json(4)),
        (200, policy_json(5)),
        (200, policy_json(6)),
    ]);
    let provider = provider(transport);
    let notified = Arc::new(Mutex::new(Vec::new()));
    let sink = notified.clone();
    provider.subscribe(move |p| sink.lock().unwrap().push(p.version));

    assert!(provider.fetch_now().is_ok());
    let stale = provider.fetch_now().unwrap_err();
    assert_eq!(stale.reason_code(), reason_codes::POLICY_STALE_VERSION);
    assert!(matches!(
        stale,
        PolicyUpdateError::ValidationFailure(PolicyRejection::Stale {
            current: 5,
            fetched: 4
        })
    ));
    assert_eq!(
        provider.fetch_now().unwrap(),
        PolicyUpdate::Unchanged { version: 5 }
    );
    assert_eq!(
        provider.fetch_now().unwrap(),
        PolicyUpdate::Applied {
            version: 6,
            previous: Some(5)
        }
    );
    assert_eq!(*notified.lock().unwrap(), vec![5, 6]);
}

#[test]
fn at_policy_db_04_rollback_notifies_and_unknown_version_fails() {
    let transport = ScriptedTransport::new(vec![(200, policy_json(1)), (200, policy_json(2))]);
    let provider = provider(transport);
    provider.fetch_now().unwrap();
    provider.fetch_now().unwrap();

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    provider.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let update = provider.rollback(1).unwrap();
    assert_eq!(
        update,
        PolicyUpdate::RolledBack {
            version: 1,
            previous: Some(2)
        }
    );
    assert_eq!(update.reason_code(), reason_codes::POLICY_OK_ROLLED_BACK);
    assert_eq!(provider.current_policy().version, 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    let err = provider.rollback(42).unwrap_err();
    assert!(matches!(err, PolicyUpdateError::VersionNotCached { version: 42 }));
    assert_eq!(err.reason_code(), reason_codes::POLICY_VERSION_NOT_CACHED);
    assert_eq!(provider.current_policy().version, 1);
}

#[test]
fn at_policy_db_05_concurrent_fetch_fails_fast() {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let provider = Arc::new(provider(Arc::new(GatedTransport {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
        body: policy_json(1),
    })));

    let background = {
        let provider = provider.clone();
        thread::spawn(move || provider.fetch_now())
    };
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(provider.is_fetching());
    assert!(matches!(
        provider.fetch_now(),
        Err(PolicyUpdateError::AlreadyFetching)
    ));

    release_tx.send(()).unwrap();
    assert!(background.join().unwrap().is_ok());
    assert!(!provider.is_fetching());
}

#[test]
fn at_policy_db_06_real_transport_against_loopback_server() {
    let (url, server) = single_response_server("200 OK", policy_json(12));
    let provider = PolicyProvider::new(
        PolicyProviderConfig::mvp_v1().with_endpoint(url),
        Arc::new(UreqPolicyTransport::new(2_000)),
        Arc::new(PolicyCache::in_memory(5)),
    );
    let update = provider.fetch_now().unwrap();
    server.join().unwrap();
    assert_eq!(update.reason_code(), reason_codes::POLICY_OK_APPLIED);
    assert_eq!(provider.current_policy().version, 12);
}

#[test]
fn at_policy_db_07_cached_policy_restored_after_restart() {
    let dir = TempDir::new().unwrap();
    let open_cache = || {
        let store: Arc<dyn PolicyStore> = Arc::new(FilePolicyStore::new(dir.path()));
        Arc::new(PolicyCache::open(store, "default", 5).unwrap())
    };
    {
        let provider = PolicyProvider::new(
            config(),
            ScriptedTransport::new(vec![(200, policy_json(8))]),
            open_cache(),
        );
        provider.fetch_now().unwrap();
    }
    let restarted = PolicyProvider::new(
        config(),
        ScriptedTransport::new(vec![(503, String::new())]),
        open_cache(),
    );
    assert_eq!(restarted.current_policy().version, 8);
    assert!(restarted.fetch_now().is_err());
    assert_eq!(restarted.current_policy().version, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn at_policy_db_08_refresher_fetches_on_interval_and_stops() {
    let transport = ScriptedTransport::new(vec![
        (500, String::new()),
        (200, policy_json(1)),
        (200, policy_json(2)),
    ]);
    let mut config = config();
    config.refresh_interval_ms = 20;
    let provider = Arc::new(PolicyProvider::new(
        config,
        transport.clone(),
        Arc::new(PolicyCache::in_memory(5)),
    ));
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    provider.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handle = provider.spawn_refresh_loop();
    let deadline = Instant::now() + Duration::from_secs(5);
    while provider.current_policy().version < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert_eq!(provider.current_policy().version, 2);
    assert!(failures.load(Ordering::SeqCst) >= 1);
    assert!(!provider.is_fetching());
    let calls_after_stop = transport.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(transport.calls.load(Ordering::SeqCst), calls_after_stop);
}

#[test]
fn at_policy_db_09_local_json_goes_through_sanitize() {
    let provider = provider(ScriptedTransport::new(vec![]));
    let mut local: serde_json::Value = serde_json::from_str(&policy_json(4)).unwrap();
    local["experiments"] = serde_json::json!([
        { "key": "a", "trafficFraction": 0.7 },
        { "key": "b", "trafficFraction": 0.7 }
    ]);
    let update = provider.apply_local_json(&local.to_string()).unwrap();
    assert_eq!(update.reason_code(), reason_codes::POLICY_OK_APPLIED);
    let current = provider.current_policy();
    assert!(current.active_traffic_sum() <= 1.0);
    assert!(matches!(
        provider.apply_local_json("[]"),
        Err(PolicyUpdateError::ValidationFailure(PolicyRejection::Decode(_)))
    ));
}

#[test]
fn at_policy_db_10_concurrent_local_updates_end_at_highest_version() {
    for _ in 0..200 {
        let provider = Arc::new(provider(ScriptedTransport::new(Vec::new())));
        provider.apply_local(policy(1)).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = [2, 3]
            .into_iter()
            .map(|version| {
                let provider = provider.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    provider.apply_local(policy(version))
                })
            })
            .collect();
        for worker in workers {
            match worker.join().unwrap() {
                Ok(_) => {}
                Err(PolicyUpdateError::ValidationFailure(PolicyRejection::Stale {
                    current: 3,
                    fetched: 2,
                })) => {}
                Err(other) => panic!("unexpected update failure: {other}"),
            }
        }
        assert_eq!(provider.current_policy().version, 3);
        assert_eq!(provider.cache().available_versions().last(), Some(&3));
    }
}

#[test]
fn at_policy_db_11_rollback_holds_until_strictly_newer_version() {
    let transport = ScriptedTransport::new(vec![
        (200, policy_json(1)),
        (200, policy_json(2)),
        (200, policy_json(2)),
        (200, policy_json(3)),
    ]);
    let provider = provider(transport);
    provider.fetch_now().unwrap();
    provider.fetch_now().unwrap();
    provider.rollback(1).unwrap();

    // The server still serves the version that was rolled back from.
    assert_eq!(
        provider.fetch_now().unwrap(),
        PolicyUpdate::Unchanged { version: 1 }
    );
    assert_eq!(provider.current_policy().version, 1);
    assert!(matches!(
        provider.apply_local(policy(2)),
        Ok(PolicyUpdate::Unchanged { version: 1 })
    ));

    assert_eq!(
        provider.fetch_now().unwrap(),
        PolicyUpdate::Applied {
            version: 3,
            previous: Some(1)
        }
    );
    assert_eq!(provider.current_policy().version, 3);

    // A newer version clears the hold, so rolling forward works again.
    provider.rollback(2).unwrap();
    assert_eq!(provider.current_policy().version, 2);
}

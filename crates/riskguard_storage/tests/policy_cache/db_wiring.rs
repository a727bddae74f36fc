#![forbid(unsafe_code)]

use std::fs;
use std::sync::Arc;

use riskguard_contracts::policy::Policy;
use riskguard_storage::policy_cache::{
    FilePolicyStore, InMemoryPolicyStore, PolicyCache, PolicyStore, StorageError,
    DEFAULT_CACHE_MAX_ENTRIES,
};
use tempfile::TempDir;

fn policy(version: i64) -> Arc<Policy> {
    let mut p = Policy::default_v1();
    p.version = version;
    Arc::new(p)
}

fn file_store(dir: &TempDir) -> Arc<dyn PolicyStore> {
    Arc::new(FilePolicyStore::new(dir.path()))
}

#[test]
fn at_cache_db_01_file_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let cache = PolicyCache::open(file_store(&dir), "tenant_a", DEFAULT_CACHE_MAX_ENTRIES).unwrap();
        for v in 1..=7 {
            cache.save(policy(v)).unwrap();
        }
    }
    assert!(dir.path().join("tenant_a.policy-cache.json").exists());

    let reopened = PolicyCache::open(file_store(&dir), "tenant_a", DEFAULT_CACHE_MAX_ENTRIES).unwrap();
    assert_eq!(reopened.available_versions(), vec![3, 4, 5, 6, 7]);
    assert!(reopened.current().is_none());
    assert_eq!(reopened.load().unwrap().version, 7);
    assert_eq!(reopened.current().unwrap().version, 7);
}

#[test]
fn at_cache_db_02_namespaces_are_isolated() {
    let dir = TempDir::new().unwrap();
    let a = PolicyCache::open(file_store(&dir), "a", 5).unwrap();
    let b = PolicyCache::open(file_store(&dir), "b", 5).unwrap();
    a.save(policy(1)).unwrap();
    assert_eq!(a.available_versions(), vec![1]);
    assert!(b.available_versions().is_empty());
    assert!(b.load().is_none());
}

#[test]
fn at_cache_db_03_export_then_import_into_fresh_namespace() {
    let source = PolicyCache::in_memory(5);
    for v in [2, 4, 6] {
        source.save(policy(v)).unwrap();
    }
    let exported = source.export_all().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(parsed.as_array().map(Vec::len), Some(3));
    assert_eq!(parsed[0]["version"], 2);
    assert!(parsed[0].get("cachedAt").is_some());

    let target = PolicyCache::in_memory(2);
    assert_eq!(target.import_all(&exported).unwrap(), 3);
    assert_eq!(target.available_versions(), vec![4, 6]);
}

#[test]
fn at_cache_db_04_import_skips_invalid_entries() {
    let cache = PolicyCache::in_memory(5);
    cache.save(policy(1)).unwrap();
    let mut entries: serde_json::Value = serde_json::from_str(&cache.export_all().unwrap()).unwrap();
    let mut mismatched = entries[0].clone();
    mismatched["version"] = serde_json::json!(9);
    let mut out_of_range = entries[0].clone();
    out_of_range["version"] = serde_json::json!(5);
    out_of_range["policy"]["version"] = serde_json::json!(5);
    out_of_range["policy"]["policy"]["threshold"] = serde_json::json!(150.0);
    if let Some(list) = entries.as_array_mut() {
        list.push(mismatched);
        list.push(out_of_range);
    }

    let target = PolicyCache::in_memory(5);
    assert_eq!(target.import_all(&entries.to_string()).unwrap(), 1);
    assert_eq!(target.available_versions(), vec![1]);
    assert!(matches!(
        target.import_all("{not json"),
        Err(StorageError::Decode(_))
    ));
}

#[test]
fn at_cache_db_05_corrupt_file_starts_empty_and_recovers() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("default.policy-cache.json"), "[{oops").unwrap();
    let cache = PolicyCache::open(file_store(&dir), "default", 5).unwrap();
    assert!(cache.available_versions().is_empty());
    cache.save(policy(3)).unwrap();

    let reopened = PolicyCache::open(file_store(&dir), "default", 5).unwrap();
    assert_eq!(reopened.available_versions(), vec![3]);
}

#[test]
fn at_cache_db_06_reset_clears_memory_and_store() {
    let dir = TempDir::new().unwrap();
    let cache = PolicyCache::open(file_store(&dir), "default", 5).unwrap();
    cache.save(policy(1)).unwrap();
    cache.reset().unwrap();
    assert!(cache.available_versions().is_empty());
    assert!(cache.current().is_none());
    assert!(!dir.path().join("default.policy-cache.json").exists());
    // Resetting an already empty namespace is fine.
    cache.reset().unwrap();
}

#[test]
fn at_cache_db_07_in_memory_store_shared_between_caches() {
    let store: Arc<dyn PolicyStore> = Arc::new(InMemoryPolicyStore::new());
    let first = PolicyCache::open(store.clone(), "default", 5).unwrap();
    first.save(policy(11)).unwrap();
    let second = PolicyCache::open(store, "default", 5).unwrap();
    assert_eq!(second.available_versions(), vec![11]);
}

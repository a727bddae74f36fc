#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use riskguard_contracts::policy::Policy;
use riskguard_contracts::{ContractViolation, UnixTimeMs, Validate};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CACHE_NAMESPACE: &str = "default";
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 5;
pub const CACHE_MAX_ENTRIES_LIMIT: usize = 64;
pub const CACHE_NAMESPACE_MAX_LEN: usize = 64;
const CACHE_FILE_SUFFIX: &str = ".policy-cache.json";

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Decode(serde_json::Error),
    ContractViolation(ContractViolation),
    VersionMismatch { entry_version: i64, policy_version: i64 },
    LockPoisoned { what: &'static str },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "policy cache io error: {e}"),
            StorageError::Decode(e) => write!(f, "policy cache decode error: {e}"),
            StorageError::ContractViolation(v) => write!(f, "policy cache contract violation: {v}"),
            StorageError::VersionMismatch {
                entry_version,
                policy_version,
            } => write!(
                f,
                "cache entry version {entry_version} does not match policy version {policy_version}"
            ),
            StorageError::LockPoisoned { what } => write!(f, "{what} lock poisoned"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(e) => Some(e),
            StorageError::Decode(e) => Some(e),
            StorageError::ContractViolation(v) => Some(v),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Decode(e)
    }
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPolicyEntry {
    pub version: i64,
    pub policy: Policy,
    pub cached_at: UnixTimeMs,
}

impl CachedPolicyEntry {
    pub fn v1(policy: Policy, cached_at: UnixTimeMs) -> Result<Self, StorageError> {
        let entry = Self {
            version: policy.version,
            policy,
            cached_at,
        };
        entry.check()?;
        Ok(entry)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.version != self.policy.version {
            return Err(StorageError::VersionMismatch {
                entry_version: self.version,
                policy_version: self.policy.version,
            });
        }
        self.policy.validate()?;
        Ok(())
    }
}

/// Durable backing for one cache namespace. Entries are written whole.
pub trait PolicyStore: Send + Sync {
    fn read_entries(&self, namespace: &str) -> Result<Vec<CachedPolicyEntry>, StorageError>;

    fn write_entries(
        &self,
        namespace: &str,
        entries: &[CachedPolicyEntry],
    ) -> Result<(), StorageError>;

    fn clear(&self, namespace: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    namespaces: Mutex<BTreeMap<String, Vec<CachedPolicyEntry>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyStore for InMemoryPolicyStore {
    fn read_entries(&self, namespace: &str) -> Result<Vec<CachedPolicyEntry>, StorageError> {
        let namespaces = self.namespaces.lock().map_err(|_| StorageError::LockPoisoned {
            what: "in-memory policy store",
        })?;
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }

    fn write_entries(
        &self,
        namespace: &str,
        entries: &[CachedPolicyEntry],
    ) -> Result<(), StorageError> {
        let mut namespaces = self.namespaces.lock().map_err(|_| StorageError::LockPoisoned {
            what: "in-memory policy store",
        })?;
        namespaces.insert(namespace.to_string(), entries.to_vec());
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        let mut namespaces = self.namespaces.lock().map_err(|_| StorageError::LockPoisoned {
            what: "in-memory policy store",
        })?;
        namespaces.remove(namespace);
        Ok(())
    }
}

/// One JSON array per namespace at `<dir>/<namespace>.policy-cache.json`.
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    dir: PathBuf,
}

impl FilePolicyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}{CACHE_FILE_SUFFIX}"))
    }
}

impl PolicyStore for FilePolicyStore {
    fn read_entries(&self, namespace: &str) -> Result<Vec<CachedPolicyEntry>, StorageError> {
        let path = self.path_for(namespace);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    fn write_entries(
        &self,
        namespace: &str,
        entries: &[CachedPolicyEntry],
    ) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(namespace);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn clear(&self, namespace: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(namespace)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_namespace(namespace: &str) -> Result<(), ContractViolation> {
    if namespace.is_empty() || namespace.len() > CACHE_NAMESPACE_MAX_LEN {
        return Err(ContractViolation::InvalidValue {
            field: "policy_cache.namespace",
            reason: "must be 1..=64 chars",
        });
    }
    if !namespace
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || namespace.starts_with('.')
    {
        return Err(ContractViolation::InvalidValue {
            field: "policy_cache.namespace",
            reason: "must be ASCII alphanumeric, '-', '_' or '.', not starting with '.'",
        });
    }
    Ok(())
}

/// Bounded set of distinct policy versions plus the current-policy pointer.
///
/// Saving is last-writer-wins per version. Once more than `max_entries`
/// versions are held, the lowest versions are evicted. Store failures are
/// logged and returned but never undo the in-memory update.
pub struct PolicyCache {
    namespace: String,
    max_entries: usize,
    store: Arc<dyn PolicyStore>,
    entries: Mutex<BTreeMap<i64, CachedPolicyEntry>>,
    current: RwLock<Option<Arc<Policy>>>,
}

impl fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyCache")
            .field("namespace", &self.namespace)
            .field("max_entries", &self.max_entries)
            .field("versions", &self.available_versions())
            .finish()
    }
}

impl PolicyCache {
    pub fn in_memory(max_entries: usize) -> Self {
        Self::from_parts(
            Arc::new(InMemoryPolicyStore::new()),
            DEFAULT_CACHE_NAMESPACE.to_string(),
            max_entries,
            BTreeMap::new(),
        )
    }

    /// Opens `namespace` on `store`. Unreadable or invalid persisted entries
    /// are skipped with a warning; the cache then starts from what remains.
    pub fn open(
        store: Arc<dyn PolicyStore>,
        namespace: &str,
        max_entries: usize,
    ) -> Result<Self, StorageError> {
        validate_namespace(namespace)?;
        let persisted = match store.read_entries(namespace) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "policy cache unreadable; starting empty");
                Vec::new()
            }
        };
        let mut entries = BTreeMap::new();
        for entry in persisted {
            match entry.check() {
                Ok(()) => {
                    entries.insert(entry.version, entry);
                }
                Err(e) => {
                    tracing::warn!(
                        namespace = %namespace,
                        version = entry.version,
                        error = %e,
                        "dropping invalid persisted policy entry"
                    );
                }
            }
        }
        Ok(Self::from_parts(store, namespace.to_string(), max_entries, entries))
    }

    fn from_parts(
        store: Arc<dyn PolicyStore>,
        namespace: String,
        max_entries: usize,
        mut entries: BTreeMap<i64, CachedPolicyEntry>,
    ) -> Self {
        let max_entries = max_entries.clamp(1, CACHE_MAX_ENTRIES_LIMIT);
        prune(&mut entries, max_entries, None);
        Self {
            namespace,
            max_entries,
            store,
            entries: Mutex::new(entries),
            current: RwLock::new(None),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// The current policy pointer; a cheap clone, never blocks on I/O.
    pub fn current(&self) -> Option<Arc<Policy>> {
        match self.current.read() {
            Ok(current) => current.clone(),
            Err(_) => None,
        }
    }

    /// Entry for the current policy, else the highest cached version. Only
    /// a cache with no current policy (fresh open, or after `reset`) adopts
    /// the highest version as current.
    pub fn load(&self) -> Option<CachedPolicyEntry> {
        let entries = self.entries.lock().ok()?;
        if let Some(current) = self.current() {
            if let Some(entry) = entries.get(&current.version) {
                return Some(entry.clone());
            }
        }
        let (_, latest) = entries.iter().next_back()?;
        let latest = latest.clone();
        drop(entries);
        self.set_current(Arc::new(latest.policy.clone()));
        Some(latest)
    }

    /// Caches `policy`, makes it current and persists the namespace. The
    /// saved version is never the one evicted, so `current` always has a
    /// cached entry behind it and `load` returns it unchanged.
    pub fn save(&self, policy: Arc<Policy>) -> Result<(), StorageError> {
        let entry = CachedPolicyEntry::v1(policy.as_ref().clone(), UnixTimeMs::now())?;
        let version = entry.version;
        let snapshot = {
            let mut entries = self.lock_entries()?;
            entries.insert(version, entry);
            prune(&mut entries, self.max_entries, Some(version));
            entries.values().cloned().collect::<Vec<_>>()
        };
        self.set_current(policy);
        self.persist(&snapshot)
    }

    /// Points `current` at a cached version. Newer versions stay cached.
    pub fn rollback(&self, to_version: i64) -> Option<Arc<Policy>> {
        let policy = {
            let entries = self.entries.lock().ok()?;
            Arc::new(entries.get(&to_version)?.policy.clone())
        };
        self.set_current(policy.clone());
        tracing::info!(namespace = %self.namespace, version = to_version, "policy rolled back");
        Some(policy)
    }

    /// Cached versions in ascending order.
    pub fn available_versions(&self) -> Vec<i64> {
        match self.entries.lock() {
            Ok(entries) => entries.keys().copied().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn export_all(&self) -> Result<String, StorageError> {
        let entries = self.lock_entries()?;
        let list: Vec<&CachedPolicyEntry> = entries.values().collect();
        Ok(serde_json::to_string_pretty(&list)?)
    }

    /// Merges a JSON array produced by `export_all`. Invalid entries are
    /// skipped; the count of accepted entries is returned.
    pub fn import_all(&self, json: &str) -> Result<usize, StorageError> {
        let incoming: Vec<CachedPolicyEntry> = serde_json::from_str(json)?;
        let mut accepted = 0usize;
        let current_version = self.current().map(|p| p.version);
        let snapshot = {
            let mut entries = self.lock_entries()?;
            for entry in incoming {
                if let Err(e) = entry.check() {
                    tracing::warn!(
                        namespace = %self.namespace,
                        version = entry.version,
                        error = %e,
                        "skipping invalid imported policy entry"
                    );
                    continue;
                }
                entries.insert(entry.version, entry);
                accepted += 1;
            }
            prune(&mut entries, self.max_entries, current_version);
            entries.values().cloned().collect::<Vec<_>>()
        };
        self.persist(&snapshot)?;
        Ok(accepted)
    }

    /// Drops every entry and the current pointer, in memory and on the store.
    pub fn reset(&self) -> Result<(), StorageError> {
        self.lock_entries()?.clear();
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
        self.store.clear(&self.namespace).map_err(|e| {
            tracing::warn!(namespace = %self.namespace, error = %e, "policy cache clear failed");
            e
        })
    }

    fn set_current(&self, policy: Arc<Policy>) {
        match self.current.write() {
            Ok(mut current) => *current = Some(policy),
            Err(poisoned) => *poisoned.into_inner() = Some(policy),
        }
    }

    fn lock_entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<i64, CachedPolicyEntry>>, StorageError> {
        self.entries.lock().map_err(|_| StorageError::LockPoisoned {
            what: "policy cache entries",
        })
    }

    fn persist(&self, entries: &[CachedPolicyEntry]) -> Result<(), StorageError> {
        self.store
            .write_entries(&self.namespace, entries)
            .map_err(|e| {
                tracing::warn!(
                    namespace = %self.namespace,
                    error = %e,
                    "policy cache persistence failed; in-memory state kept"
                );
                e
            })
    }
}

/// Evicts lowest versions first, never `keep`.
fn prune(entries: &mut BTreeMap<i64, CachedPolicyEntry>, max_entries: usize, keep: Option<i64>) {
    while entries.len() > max_entries {
        let Some(victim) = entries.keys().copied().find(|v| Some(*v) != keep) else {
            break;
        };
        entries.remove(&victim);
    }
}

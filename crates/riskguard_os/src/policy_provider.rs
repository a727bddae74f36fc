#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use riskguard_contracts::policy::{Policy, PolicyDecodeError, SanitizedPolicy};
use riskguard_contracts::{ContractViolation, ReasonCodeId};
use riskguard_storage::policy_cache::{PolicyCache, StorageError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PolicyProviderConfig;
use crate::policy_fetch::{FetchFailure, PolicyTransport};

pub mod reason_codes {
    use riskguard_contracts::ReasonCodeId;

    // Policy distribution reason-code namespace ("RP").
    pub const POLICY_OK_APPLIED: ReasonCodeId = ReasonCodeId(0x5250_0001);
    pub const POLICY_OK_UNCHANGED: ReasonCodeId = ReasonCodeId(0x5250_0002);
    pub const POLICY_OK_ROLLED_BACK: ReasonCodeId = ReasonCodeId(0x5250_0003);

    pub const POLICY_ALREADY_FETCHING: ReasonCodeId = ReasonCodeId(0x5250_0010);
    pub const POLICY_FETCH_FAILED: ReasonCodeId = ReasonCodeId(0x5250_0011);
    pub const POLICY_VALIDATION_FAILED: ReasonCodeId = ReasonCodeId(0x5250_0012);
    pub const POLICY_STALE_VERSION: ReasonCodeId = ReasonCodeId(0x5250_0013);
    pub const POLICY_CONFIGURATION_INVALID: ReasonCodeId = ReasonCodeId(0x5250_0014);
    pub const POLICY_CACHE_WRITE_FAILED: ReasonCodeId = ReasonCodeId(0x5250_0015);
    pub const POLICY_VERSION_NOT_CACHED: ReasonCodeId = ReasonCodeId(0x5250_0016);
}

/// Why a fetched policy was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyRejection {
    Decode(PolicyDecodeError),
    Stale { current: i64, fetched: i64 },
}

impl fmt::Display for PolicyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyRejection::Decode(e) => write!(f, "{e}"),
            PolicyRejection::Stale { current, fetched } => write!(
                f,
                "fetched policy version {fetched} is older than current version {current}"
            ),
        }
    }
}

#[derive(Debug)]
pub enum PolicyUpdateError {
    AlreadyFetching,
    FetchFailure(FetchFailure),
    ValidationFailure(PolicyRejection),
    ConfigurationInvalid(Vec<ContractViolation>),
    Storage(StorageError),
    VersionNotCached { version: i64 },
}

impl PolicyUpdateError {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            PolicyUpdateError::AlreadyFetching => reason_codes::POLICY_ALREADY_FETCHING,
            PolicyUpdateError::FetchFailure(_) => reason_codes::POLICY_FETCH_FAILED,
            PolicyUpdateError::ValidationFailure(PolicyRejection::Stale { .. }) => {
                reason_codes::POLICY_STALE_VERSION
            }
            PolicyUpdateError::ValidationFailure(_) => reason_codes::POLICY_VALIDATION_FAILED,
            PolicyUpdateError::ConfigurationInvalid(_) => reason_codes::POLICY_CONFIGURATION_INVALID,
            PolicyUpdateError::Storage(_) => reason_codes::POLICY_CACHE_WRITE_FAILED,
            PolicyUpdateError::VersionNotCached { .. } => reason_codes::POLICY_VERSION_NOT_CACHED,
        }
    }
}

impl fmt::Display for PolicyUpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyUpdateError::AlreadyFetching => write!(f, "a policy fetch is already in flight"),
            PolicyUpdateError::FetchFailure(e) => write!(f, "policy fetch failed: {e}"),
            PolicyUpdateError::ValidationFailure(e) => write!(f, "policy rejected: {e}"),
            PolicyUpdateError::ConfigurationInvalid(warnings) => {
                write!(f, "local policy adjusted ({} warning(s))", warnings.len())?;
                for w in warnings {
                    write!(f, "; {w}")?;
                }
                Ok(())
            }
            PolicyUpdateError::Storage(e) => write!(f, "policy cache write failed: {e}"),
            PolicyUpdateError::VersionNotCached { version } => {
                write!(f, "policy version {version} is not cached")
            }
        }
    }
}

impl std::error::Error for PolicyUpdateError {}

impl From<FetchFailure> for PolicyUpdateError {
    fn from(e: FetchFailure) -> Self {
        PolicyUpdateError::FetchFailure(e)
    }
}

impl From<PolicyDecodeError> for PolicyUpdateError {
    fn from(e: PolicyDecodeError) -> Self {
        PolicyUpdateError::ValidationFailure(PolicyRejection::Decode(e))
    }
}

impl From<StorageError> for PolicyUpdateError {
    fn from(e: StorageError) -> Self {
        PolicyUpdateError::Storage(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyUpdate {
    Applied { version: i64, previous: Option<i64> },
    Unchanged { version: i64 },
    RolledBack { version: i64, previous: Option<i64> },
}

impl PolicyUpdate {
    pub fn reason_code(&self) -> ReasonCodeId {
        match self {
            PolicyUpdate::Applied { .. } => reason_codes::POLICY_OK_APPLIED,
            PolicyUpdate::Unchanged { .. } => reason_codes::POLICY_OK_UNCHANGED,
            PolicyUpdate::RolledBack { .. } => reason_codes::POLICY_OK_ROLLED_BACK,
        }
    }
}

type PolicySubscriber = Arc<dyn Fn(&Arc<Policy>) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&PolicyUpdateError) + Send + Sync>;

/// Guarded by `PolicyProvider::updates`; every version check and pointer
/// change happens under that one lock.
#[derive(Debug, Default)]
struct UpdateState {
    /// Set by a rollback: versions up to this one are not re-applied.
    pinned_through: Option<i64>,
}

/// Clears the in-flight flag on every exit path, unwinding included.
struct InFlightGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a Mutex<bool>) -> Option<Self> {
        let mut in_flight = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *in_flight {
            return None;
        }
        *in_flight = true;
        Some(Self { flag })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        match self.flag.lock() {
            Ok(mut in_flight) => *in_flight = false,
            Err(poisoned) => *poisoned.into_inner() = false,
        }
    }
}

/// Owns remote policy distribution: fetch, validation, cache update and
/// fan-out to subscribers. The decision path only ever calls
/// [`PolicyProvider::current_policy`], which never touches the network.
pub struct PolicyProvider {
    config: PolicyProviderConfig,
    transport: Arc<dyn PolicyTransport>,
    cache: Arc<PolicyCache>,
    fallback: Arc<Policy>,
    fallback_warnings: Vec<ContractViolation>,
    in_flight: Mutex<bool>,
    updates: Mutex<UpdateState>,
    subscribers: Mutex<Vec<PolicySubscriber>>,
    error_observers: Mutex<Vec<ErrorObserver>>,
}

impl fmt::Debug for PolicyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyProvider")
            .field("endpoint", &self.config.endpoint)
            .field("cache", &self.cache)
            .field("fallback_version", &self.fallback.version)
            .finish()
    }
}

impl PolicyProvider {
    /// Falls back to the configured preset until a policy is cached.
    pub fn new(
        config: PolicyProviderConfig,
        transport: Arc<dyn PolicyTransport>,
        cache: Arc<PolicyCache>,
    ) -> Self {
        let fallback = Policy::preset(config.fallback_preset);
        Self::with_fallback(config, transport, cache, fallback)
    }

    /// Uses a caller-built fallback. It is sanitized, never rejected; any
    /// adjustment is logged and kept in [`Self::configuration_warnings`].
    pub fn with_fallback(
        config: PolicyProviderConfig,
        transport: Arc<dyn PolicyTransport>,
        cache: Arc<PolicyCache>,
        fallback: Policy,
    ) -> Self {
        let SanitizedPolicy { policy, warnings } = fallback.sanitize();
        for w in &warnings {
            tracing::warn!(warning = %w, "fallback policy adjusted");
        }
        if cache.current().is_none() {
            if let Some(entry) = cache.load() {
                tracing::info!(version = entry.version, "restored cached policy");
            }
        }
        Self {
            config,
            transport,
            cache,
            fallback: Arc::new(policy),
            fallback_warnings: warnings,
            in_flight: Mutex::new(false),
            updates: Mutex::new(UpdateState::default()),
            subscribers: Mutex::new(Vec::new()),
            error_observers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PolicyProviderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub fn configuration_warnings(&self) -> &[ContractViolation] {
        &self.fallback_warnings
    }

    /// Last known-good policy, else the fallback. Never `None`.
    pub fn current_policy(&self) -> Arc<Policy> {
        self.cache
            .current()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn is_fetching(&self) -> bool {
        match self.in_flight.lock() {
            Ok(flag) => *flag,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&Arc<Policy>) + Send + Sync + 'static,
    {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Arc::new(subscriber));
        }
    }

    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&PolicyUpdateError) + Send + Sync + 'static,
    {
        if let Ok(mut observers) = self.error_observers.lock() {
            observers.push(Arc::new(observer));
        }
    }

    /// One fetch-validate-apply pass. A concurrent call fails fast with
    /// `AlreadyFetching`; every failure leaves the current policy in place.
    pub fn fetch_now(&self) -> Result<PolicyUpdate, PolicyUpdateError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return Err(self.report(PolicyUpdateError::AlreadyFetching));
        };
        match self.fetch_and_apply() {
            Ok(update) => Ok(update),
            Err(err) => Err(self.report(err)),
        }
    }

    fn fetch_and_apply(&self) -> Result<PolicyUpdate, PolicyUpdateError> {
        let url = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| FetchFailure::transport("no policy endpoint configured"))?;
        let response = self.transport.fetch(url)?;
        if response.status != 200 {
            return Err(FetchFailure::http_status(response.status).into());
        }
        let fetched = Policy::from_json(&response.body)?;
        self.apply(fetched)
    }

    /// Applies a policy built or loaded on the device. Out-of-range values
    /// are clamped and reported as `ConfigurationInvalid` instead of failing.
    pub fn apply_local(&self, policy: Policy) -> Result<PolicyUpdate, PolicyUpdateError> {
        let SanitizedPolicy { policy, warnings } = policy.sanitize();
        if !warnings.is_empty() {
            self.report(PolicyUpdateError::ConfigurationInvalid(warnings));
        }
        self.apply(policy).map_err(|err| self.report(err))
    }

    pub fn apply_local_json(&self, body: &str) -> Result<PolicyUpdate, PolicyUpdateError> {
        match Policy::decode(body) {
            Ok(policy) => self.apply_local(policy),
            Err(err) => Err(self.report(err.into())),
        }
    }

    /// Re-points the current policy at a cached version and notifies
    /// subscribers.
    ///
    /// The rolled-back version stays current until a policy newer than
    /// every version cached at rollback time arrives. Re-serving the version
    /// rolled back from yields `Unchanged`.
    pub fn rollback(&self, to_version: i64) -> Result<PolicyUpdate, PolicyUpdateError> {
        let mut state = self.lock_updates();
        let previous = self.cache.current().map(|p| p.version);
        let Some(policy) = self.cache.rollback(to_version) else {
            drop(state);
            return Err(self.report(PolicyUpdateError::VersionNotCached {
                version: to_version,
            }));
        };
        state.pinned_through = self
            .cache
            .available_versions()
            .into_iter()
            .chain(previous)
            .max()
            .filter(|highest| *highest > to_version);
        drop(state);
        self.notify(&policy);
        Ok(PolicyUpdate::RolledBack {
            version: to_version,
            previous,
        })
    }

    fn apply(&self, candidate: Policy) -> Result<PolicyUpdate, PolicyUpdateError> {
        let mut state = self.lock_updates();
        let previous = self.cache.current().map(|p| p.version);
        if let Some(current) = previous {
            if candidate.version < current {
                return Err(PolicyUpdateError::ValidationFailure(PolicyRejection::Stale {
                    current,
                    fetched: candidate.version,
                }));
            }
            if candidate.version == current {
                tracing::debug!(version = current, "policy version unchanged");
                return Ok(PolicyUpdate::Unchanged { version: current });
            }
            if state.pinned_through.is_some_and(|pin| candidate.version <= pin) {
                tracing::debug!(
                    version = candidate.version,
                    current,
                    "policy version held back by rollback"
                );
                return Ok(PolicyUpdate::Unchanged { version: current });
            }
        }

        let version = candidate.version;
        let fingerprint = candidate.fingerprint();
        let policy = Arc::new(candidate);
        // Only a persistence failure leaves the saved policy current.
        let persist_failure = match self.cache.save(policy.clone()) {
            Ok(()) => None,
            Err(err) if self.cache.current().map(|p| p.version) == Some(version) => Some(err),
            Err(err) => return Err(err.into()),
        };
        state.pinned_through = None;
        drop(state);

        if let Some(err) = persist_failure {
            self.report(err.into());
        }
        tracing::info!(
            version,
            previous = ?previous,
            fingerprint = %fingerprint,
            "policy update applied"
        );
        self.notify(&policy);
        Ok(PolicyUpdate::Applied { version, previous })
    }

    fn lock_updates(&self) -> MutexGuard<'_, UpdateState> {
        match self.updates.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, policy: &Arc<Policy>) {
        let subscribers = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };
        for subscriber in subscribers {
            subscriber(policy);
        }
    }

    fn report(&self, err: PolicyUpdateError) -> PolicyUpdateError {
        tracing::warn!(
            reason_code = err.reason_code().0,
            error = %err,
            "policy update failed"
        );
        let observers = match self.error_observers.lock() {
            Ok(observers) => observers.clone(),
            Err(_) => return err,
        };
        for observer in observers {
            observer(&err);
        }
        err
    }

    /// Starts the periodic refresher on the current tokio runtime. The first
    /// fetch runs immediately. Fetches run on the blocking pool, so a
    /// shutdown mid-fetch still lets that fetch finish and clear its flag.
    pub fn spawn_refresh_loop(self: &Arc<Self>) -> RefreshHandle {
        let provider = Arc::clone(self);
        let period = Duration::from_millis(self.config.refresh_interval_ms.max(1));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let worker = Arc::clone(&provider);
                        match tokio::task::spawn_blocking(move || worker.fetch_now()).await {
                            Ok(Ok(update)) => {
                                tracing::debug!(outcome = ?update, "policy refresh pass");
                            }
                            // Already logged and delivered to observers.
                            Ok(Err(_)) => {}
                            Err(join_err) => {
                                tracing::warn!(error = %join_err, "policy refresh pass aborted");
                            }
                        }
                    }
                }
            }
            tracing::debug!("policy refresher stopped");
        });
        RefreshHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

pub struct RefreshHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Stops the refresher and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

//! Main FactStore struct tying all components together.

use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::query::FactSpec;
use crate::subscription::{
    ChangeNotifier, ChannelObserver, EngineContext, FactObserver, NotifierConfig, Subscription,
    SubscriptionEngine, SubscriptionEvent, SubscriptionRequest, TimerPool,
};
use crate::tokens::{StateSnapshot, StateToken, TokenStore};
use crate::transform::{RequestedVersions, TransformationRegistry, Transformations, Transformer};
use crate::types::{AggregateId, Fact, FactId, Serial, StoreStats};
use crossbeam_channel::{bounded, Receiver};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Materialized facts kept in memory.
    pub fact_cache_size: usize,

    /// Fsync the fact log every N publish batches.
    pub sync_interval: u64,

    /// Default catchup page size.
    pub fetch_size: usize,

    /// Liveness probe interval of the listening connection.
    pub probe_interval: Duration,

    /// Wait between reconnect attempts.
    pub reconnect_backoff: Duration,

    /// Worker threads running debounced follow passes.
    pub timer_workers: usize,

    /// State tokens older than this are treated as unknown.
    pub token_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./factstore"),
            create_if_missing: true,
            fact_cache_size: 10_000,
            sync_interval: crate::db::FactLog::DEFAULT_SYNC_INTERVAL,
            fetch_size: 50,
            probe_interval: Duration::from_secs(15),
            reconnect_backoff: Duration::from_secs(1),
            timer_workers: 2,
            token_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FST\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// The fact store.
///
/// Provides a unified interface for:
/// - Publishing facts, plain or guarded by a state token
/// - Subscribing to history and live facts
/// - Reading single facts, transformed to a requested version
/// - Catalog queries over namespaces and types
pub struct FactStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    db: Arc<Database>,

    tokens: TokenStore,

    transformer: Arc<Transformer>,

    notifier: Arc<ChangeNotifier>,

    timers: Arc<TimerPool>,

    engine: SubscriptionEngine,
}

impl FactStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        Self::open_or_create_with_registry(config, Arc::new(Transformations::new()))
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        Self::create_with_registry(config, Arc::new(Transformations::new()))
    }

    /// Open an existing store.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_registry(config, Arc::new(Transformations::new()))
    }

    pub fn open_or_create_with_registry(
        config: StoreConfig,
        registry: Arc<dyn TransformationRegistry>,
    ) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open_with_registry(config, registry)
        } else if config.create_if_missing {
            Self::create_with_registry(config, registry)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    pub fn create_with_registry(
        config: StoreConfig,
        registry: Arc<dyn TransformationRegistry>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        if config.path.join("MANIFEST").exists() {
            return Err(StoreError::InvalidOperation(format!(
                "store already exists at {}",
                config.path.display()
            )));
        }
        Self::write_manifest(&config.path)?;

        tracing::info!(path = %config.path.display(), "creating fact store");
        Self::start(config, lock_file, registry)
    }

    pub fn open_with_registry(
        config: StoreConfig,
        registry: Arc<dyn TransformationRegistry>,
    ) -> Result<Self> {
        if !config.path.join("MANIFEST").exists() {
            return Err(StoreError::NotInitialized);
        }
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        tracing::info!(path = %config.path.display(), "opening fact store");
        Self::start(config, lock_file, registry)
    }

    fn start(
        config: StoreConfig,
        lock_file: File,
        registry: Arc<dyn TransformationRegistry>,
    ) -> Result<Self> {
        let db = Arc::new(Database::open(
            config.path.join("facts.log"),
            config.sync_interval,
            config.fact_cache_size,
        )?);

        let notifier = Arc::new(ChangeNotifier::start(
            db.clone(),
            NotifierConfig {
                probe_interval: config.probe_interval,
                reconnect_backoff: config.reconnect_backoff,
            },
        )?);
        let timers = Arc::new(TimerPool::new(config.timer_workers)?);
        let transformer = Arc::new(Transformer::new(registry));

        let engine = SubscriptionEngine::new(EngineContext {
            db: Arc::clone(&db),
            notifier: Arc::clone(&notifier),
            timers: Arc::clone(&timers),
            transformer: Arc::clone(&transformer),
            default_fetch_size: config.fetch_size.max(1),
        });
        let tokens = TokenStore::new(Arc::clone(&db), config.token_ttl);

        Ok(Self {
            config,
            _lock_file: lock_file,
            db,
            tokens,
            transformer,
            notifier,
            timers,
            engine,
        })
    }

    // --- Publishing ---

    /// Publish a batch. Serials are assigned and visible before this returns.
    pub fn publish(&self, facts: Vec<Fact>) -> Result<Vec<Serial>> {
        self.db.publish(facts)
    }

    /// Publish a batch only if the state behind `token` is unchanged.
    pub fn publish_if_unchanged(&self, facts: Vec<Fact>, token: &StateToken) -> Result<bool> {
        self.tokens.publish_if_unchanged(facts, token)
    }

    // --- Subscriptions ---

    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: impl FactObserver + 'static,
    ) -> Result<Subscription> {
        self.engine.subscribe(request, Box::new(observer))
    }

    /// Subscribe with events delivered to a bounded channel.
    pub fn subscribe_channel(
        &self,
        request: SubscriptionRequest,
        capacity: usize,
    ) -> Result<(Subscription, Receiver<SubscriptionEvent>)> {
        let (sender, receiver) = bounded(capacity.max(1));
        let subscription = self.subscribe(request, ChannelObserver::new(sender))?;
        Ok((subscription, receiver))
    }

    // --- Reads ---

    pub fn fetch_by_id(&self, id: &FactId) -> Result<Option<Fact>> {
        self.db.fact_by_id(id)
    }

    /// Fetch a fact transformed to `version`.
    pub fn fetch_by_id_and_version(&self, id: &FactId, version: u32) -> Result<Option<Fact>> {
        let fact = match self.db.fact_by_id(id)? {
            Some(fact) => fact,
            None => return Ok(None),
        };
        let mut requested = RequestedVersions::new();
        requested.add(fact.ns(), fact.header.fact_type.clone(), version);
        self.transformer
            .transform_if_necessary(fact, &requested)
            .map(Some)
    }

    pub fn serial_of(&self, id: &FactId) -> Option<Serial> {
        self.db.serial_of(id)
    }

    pub fn latest_serial(&self) -> Serial {
        self.db.latest_serial()
    }

    // --- Tokens ---

    /// Current last fact per aggregate.
    pub fn state_for(&self, aggregates: impl IntoIterator<Item = AggregateId>) -> StateSnapshot {
        self.tokens.state_for(aggregates)
    }

    pub fn create_token(&self, snapshot: &StateSnapshot) -> Result<StateToken> {
        self.tokens.create(snapshot)
    }

    pub fn state_of(&self, token: &StateToken) -> Result<Option<StateSnapshot>> {
        self.tokens.state_of(token)
    }

    pub fn invalidate_token(&self, token: &StateToken) -> Result<()> {
        self.tokens.invalidate(token)
    }

    pub fn purge_expired_tokens(&self) -> Result<usize> {
        self.tokens.purge_expired()
    }

    // --- Catalog ---

    pub fn enumerate_namespaces(&self) -> Vec<String> {
        self.db.namespaces()
    }

    pub fn enumerate_types(&self, ns: &str) -> Vec<String> {
        self.db.types(ns)
    }

    // --- Store Operations ---

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            fact_count: self.db.fact_count() as u64,
            latest_serial: self.db.latest_serial(),
            namespace_count: self.db.namespaces().len() as u64,
            token_count: self.tokens.count() as u64,
            staged_catchup_rows: self.db.staged_rows() as u64,
            active_subscriptions: self.engine.active_count() as u64,
            log_size_bytes: self.db.log_size(),
        }
    }

    /// Sync the fact log to disk.
    pub fn sync(&self) -> Result<()> {
        self.db.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Drop every listening connection, as a backend restart would. The
    /// notifier reconnects on its own.
    pub fn terminate_listeners(&self) -> usize {
        self.db.terminate_listeners()
    }

    /// Registered follow-mode triggers.
    pub fn registered_triggers(&self) -> usize {
        self.notifier.registered()
    }

    /// Reconnects of the listening connection since open.
    pub fn notifier_reconnects(&self) -> u64 {
        self.notifier.reconnects()
    }

    /// Facts currently matching `specs`, in serial order.
    pub fn query(&self, specs: &[FactSpec]) -> Result<Vec<Fact>> {
        let query = crate::query::QueryBuilder::new(specs).build(Serial::ZERO);
        let matcher = crate::query::PostQueryMatcher::new(specs)?;
        Ok(self
            .db
            .query(&query)?
            .into_iter()
            .filter(|fact| matcher.test(fact))
            .collect())
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for FactStore {
    fn drop(&mut self) {
        self.engine.close_all();
        self.notifier.shutdown();
        self.timers.shutdown();
        self.db.close_listeners();
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

//! Embedded relational backend.
//!
//! Three tables live here:
//! - the fact table: an append-only log file plus in-memory indices, with a
//!   unique index on fact id;
//! - the catchup table: `(client id, serial)` staging rows pinning the result
//!   set of a catchup pass;
//! - the token table: serialized state snapshots keyed by token, persisted
//!   in `tokens.log` next to the fact log.
//!
//! Writes to the fact table go through [`FactTableLock`], the single
//! exclusive write-scoped lock. Reads take no lock beyond the index read
//! guard and only see stamped rows. Every committed publish posts a
//! [`Notification`] to each listening connection.

mod index;
mod log;
mod notify;
mod token_log;

pub use index::{FactIndex, IndexRow};
pub use log::{FactLog, RecoveredRow};
pub use notify::{ListenConnection, Notification, NotificationSource};

use crate::error::{Result, StoreError};
use crate::query::FactQuery;
use crate::tokens::StateToken;
use crate::types::{AggregateId, Fact, FactId, Serial, Timestamp};
use lru::LruCache;
use notify::ListenerTable;
use token_log::TokenLog;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-unique id partitioning the catchup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

/// One row of the token table.
#[derive(Clone, Debug)]
pub struct TokenRow {
    pub created: Timestamp,
    /// MessagePack-encoded snapshot.
    pub snapshot: Vec<u8>,
}

/// The backend.
pub struct Database {
    log: FactLog,
    index: RwLock<FactIndex>,

    /// Exclusive write-scoped lock on the fact table.
    fact_table_lock: Mutex<()>,

    /// Materialized facts by serial.
    cache: Mutex<LruCache<Serial, Fact>>,

    catchup: Mutex<BTreeSet<(ClientId, Serial)>>,
    next_client_id: AtomicU64,

    tokens: RwLock<HashMap<StateToken, TokenRow>>,
    token_log: TokenLog,

    listeners: Arc<ListenerTable>,
}

impl Database {
    /// Open the fact table at `path`, rebuilding indices from the log. The
    /// token table is loaded from `tokens.log` in the same directory.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64, cache_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let (log, rows) = FactLog::open(path, sync_interval)?;
        let (token_log, tokens) = TokenLog::open(path.with_file_name("tokens.log"))?;

        let mut index = FactIndex::new();
        let mut last = Serial::ZERO;
        for RecoveredRow { offset, header } in rows {
            let serial = header.serial.ok_or_else(|| {
                StoreError::InvalidFormat(format!("row at offset {} has no serial", offset))
            })?;
            if serial <= last {
                return Err(StoreError::Corruption {
                    serial,
                    reason: format!("serial not increasing (previous {})", last),
                });
            }
            last = serial;
            index.add(serial, offset, header);
        }
        index.stamp_through(last);
        tracing::info!(
            facts = index.count(),
            latest_serial = %last,
            tokens = tokens.len(),
            "fact table opened"
        );

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            log,
            index: RwLock::new(index),
            fact_table_lock: Mutex::new(()),
            cache: Mutex::new(LruCache::new(cache_size)),
            catchup: Mutex::new(BTreeSet::new()),
            next_client_id: AtomicU64::new(1),
            tokens: RwLock::new(tokens),
            token_log,
            listeners: Arc::new(ListenerTable::new()),
        })
    }

    // --- Fact Table ---

    /// Take the exclusive fact-table lock.
    pub fn lock_fact_table(&self) -> FactTableLock<'_> {
        FactTableLock {
            db: self,
            _guard: self.fact_table_lock.lock(),
        }
    }

    /// Insert a batch under the fact-table lock.
    pub fn publish(&self, facts: Vec<Fact>) -> Result<Vec<Serial>> {
        self.lock_fact_table().insert(facts)
    }

    /// Highest visible serial.
    pub fn latest_serial(&self) -> Serial {
        self.index.read().stamped()
    }

    pub fn serial_of(&self, id: &FactId) -> Option<Serial> {
        self.index.read().serial_of(id)
    }

    pub fn fact_by_serial(&self, serial: Serial) -> Result<Option<Fact>> {
        let offset = match self.index.read().row(serial) {
            Some(row) => row.offset,
            None => return Ok(None),
        };
        self.materialize(serial, offset).map(Some)
    }

    pub fn fact_by_id(&self, id: &FactId) -> Result<Option<Fact>> {
        match self.serial_of(id) {
            Some(serial) => self.fact_by_serial(serial),
            None => Ok(None),
        }
    }

    /// Id of the last fact referencing `agg`, read without the lock.
    pub fn last_fact_for(&self, agg: &AggregateId) -> Option<FactId> {
        self.index.read().last_fact_for(agg)
    }

    /// Run a query, returning matching facts in serial order.
    pub fn query(&self, query: &FactQuery) -> Result<Vec<Fact>> {
        tracing::trace!(predicate = query.text(), "running fact query");
        self.matching_rows(query)
            .into_iter()
            .map(|(serial, offset)| self.materialize(serial, offset))
            .collect()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.index.read().namespaces()
    }

    pub fn types(&self, ns: &str) -> Vec<String> {
        self.index.read().types(ns)
    }

    pub fn fact_count(&self) -> usize {
        self.index.read().count()
    }

    pub fn log_size(&self) -> u64 {
        self.log.size()
    }

    pub fn sync(&self) -> Result<()> {
        self.log.sync()?;
        self.token_log.sync()
    }

    // --- Catchup Table ---

    pub fn next_client_id(&self) -> ClientId {
        ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert the serial of every row matching `query` under `client`.
    pub fn stage_catchup(&self, client: ClientId, query: &FactQuery) -> Result<usize> {
        let rows = self.matching_rows(query);
        let mut staging = self.catchup.lock();
        for (serial, _) in &rows {
            staging.insert((client, *serial));
        }
        Ok(rows.len())
    }

    /// Up to `limit` staged facts of `client` after `after`, in serial order.
    pub fn catchup_page(&self, client: ClientId, after: Serial, limit: usize) -> Result<Vec<Fact>> {
        let serials: Vec<Serial> = {
            let staging = self.catchup.lock();
            staging
                .range((client, after.next())..=(client, Serial(u64::MAX)))
                .take(limit)
                .map(|(_, serial)| *serial)
                .collect()
        };

        let mut page = Vec::with_capacity(serials.len());
        for serial in serials {
            let offset = self.index.read().row(serial).map(|row| row.offset);
            match offset {
                Some(offset) => page.push(self.materialize(serial, offset)?),
                None => {
                    return Err(StoreError::Corruption {
                        serial,
                        reason: "staged serial has no fact row".into(),
                    })
                }
            }
        }
        Ok(page)
    }

    /// Delete the staging rows of `client`. Idempotent.
    pub fn clear_catchup(&self, client: ClientId) -> usize {
        let mut staging = self.catchup.lock();
        let staged: Vec<_> = staging
            .range((client, Serial::ZERO)..=(client, Serial(u64::MAX)))
            .copied()
            .collect();
        for key in &staged {
            staging.remove(key);
        }
        staged.len()
    }

    pub fn staged_rows(&self) -> usize {
        self.catchup.lock().len()
    }

    // --- Token Table ---

    /// Persist a token row, then make it visible.
    pub fn insert_token(&self, token: StateToken, row: TokenRow) -> Result<()> {
        let mut tokens = self.tokens.write();
        self.token_log.insert(&token, &row)?;
        tokens.insert(token, row);
        Ok(())
    }

    pub fn token(&self, token: &StateToken) -> Option<TokenRow> {
        self.tokens.read().get(token).cloned()
    }

    /// Delete a token row. The row is gone from memory even if recording
    /// the delete fails.
    pub fn delete_token(&self, token: &StateToken) -> Result<bool> {
        let mut tokens = self.tokens.write();
        if tokens.remove(token).is_none() {
            return Ok(false);
        }
        self.token_log.delete(token)?;
        Ok(true)
    }

    /// Delete tokens created before `cutoff`, compacting the token file.
    pub fn purge_tokens_before(&self, cutoff: Timestamp) -> Result<usize> {
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, row| row.created >= cutoff);
        let purged = before - tokens.len();
        if purged > 0 {
            self.token_log.rewrite(&tokens)?;
        }
        Ok(purged)
    }

    pub fn token_count(&self) -> usize {
        self.tokens.read().len()
    }

    // --- Notifications ---

    /// Drop every listening connection.
    pub fn terminate_listeners(&self) -> usize {
        let count = self.listeners.terminate_all();
        tracing::info!(connections = count, "terminated listening connections");
        count
    }

    /// Refuse new listening connections and drop existing ones.
    pub fn close_listeners(&self) {
        self.listeners.shutdown();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.count()
    }

    // --- Private Helpers ---

    fn matching_rows(&self, query: &FactQuery) -> Vec<(Serial, u64)> {
        let index = self.index.read();
        index
            .candidates(query.namespaces(), query.after())
            .into_iter()
            .filter_map(|serial| {
                index
                    .row(serial)
                    .filter(|row| query.matches(serial, &row.header))
                    .map(|row| (serial, row.offset))
            })
            .collect()
    }

    fn materialize(&self, serial: Serial, offset: u64) -> Result<Fact> {
        if let Some(fact) = self.cache.lock().get(&serial) {
            return Ok(fact.clone());
        }

        let fact = self.log.read_at(offset)?;
        if fact.serial() != Some(serial) {
            return Err(StoreError::Corruption {
                serial,
                reason: format!("row at offset {} holds serial {:?}", offset, fact.serial()),
            });
        }
        self.cache.lock().put(serial, fact.clone());
        Ok(fact)
    }
}

impl NotificationSource for Database {
    fn listen(&self) -> Result<Box<dyn ListenConnection>> {
        self.listeners.listen()
    }
}

/// Holder of the exclusive fact-table lock.
///
/// Reads made through the holder cannot be invalidated by another publish
/// until it is dropped.
pub struct FactTableLock<'a> {
    db: &'a Database,
    _guard: MutexGuard<'a, ()>,
}

impl FactTableLock<'_> {
    pub fn last_fact_for(&self, agg: &AggregateId) -> Option<FactId> {
        self.db.index.read().last_fact_for(agg)
    }

    /// Insert a batch: validate, write rows, index them, then stamp the
    /// whole batch and notify listeners.
    pub fn insert(&mut self, mut facts: Vec<Fact>) -> Result<Vec<Serial>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        self.validate(&facts)?;

        let first = self.db.index.read().last_assigned().next();
        let serials: Vec<Serial> = (0..facts.len() as u64)
            .map(|i| Serial(first.0 + i))
            .collect();

        let rows: Vec<_> = serials.iter().copied().zip(facts.iter()).collect();
        let offsets = self.db.log.append_batch(&rows)?;

        {
            let mut index = self.db.index.write();
            for ((fact, serial), offset) in facts.iter_mut().zip(&serials).zip(offsets) {
                fact.header.serial = Some(*serial);
                index.add(*serial, offset, fact.header.clone());
            }
        }

        let last = serials[serials.len() - 1];
        self.db.index.write().stamp_through(last);
        self.db.listeners.notify_all();

        tracing::debug!(count = serials.len(), first = %first, last = %last, "facts published");
        Ok(serials)
    }

    fn validate(&self, facts: &[Fact]) -> Result<()> {
        let index = self.db.index.read();
        let mut seen = HashSet::with_capacity(facts.len());
        for fact in facts {
            let id = fact.id();
            if fact.ns().is_empty() {
                return Err(StoreError::InvalidFact {
                    id,
                    reason: "namespace must not be empty".into(),
                });
            }
            if fact.version() == 0 {
                return Err(StoreError::InvalidFact {
                    id,
                    reason: "version must be positive".into(),
                });
            }
            if !seen.insert(id) || index.contains_id(&id) {
                return Err(StoreError::DuplicateFactId(id));
            }
        }
        Ok(())
    }
}

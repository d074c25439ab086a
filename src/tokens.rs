//! Optimistic-concurrency tokens.
//!
//! A [`StateToken`] names a snapshot of "last fact id per aggregate" taken at
//! some point. [`TokenStore::publish_if_unchanged`] publishes only if none of
//! the aggregates moved since.

use crate::db::{Database, TokenRow};
use crate::error::Result;
use crate::types::{AggregateId, Fact, FactId, Serial, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Opaque handle to a stored [`StateSnapshot`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateToken(pub Uuid);

impl StateToken {
    pub fn new() -> Self {
        StateToken(Uuid::new_v4())
    }
}

impl Default for StateToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateToken({})", self.0)
    }
}

impl fmt::Display for StateToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate id -> id of the last fact referencing it (`None` = no fact yet).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub aggregates: BTreeMap<AggregateId, Option<FactId>>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agg: AggregateId, last: Option<FactId>) -> Self {
        self.aggregates.insert(agg, last);
        self
    }

    /// Expected last fact for `agg`. Aggregates not in the snapshot are
    /// expected to have no facts.
    pub fn expected(&self, agg: &AggregateId) -> Option<FactId> {
        self.aggregates.get(agg).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }
}

/// Token table operations and the guarded publish.
pub struct TokenStore {
    db: Arc<Database>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(db: Arc<Database>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Current state of `aggregates`, read without the fact-table lock.
    pub fn state_for(&self, aggregates: impl IntoIterator<Item = AggregateId>) -> StateSnapshot {
        let aggregates = aggregates
            .into_iter()
            .map(|agg| (agg, self.db.last_fact_for(&agg)))
            .collect();
        StateSnapshot { aggregates }
    }

    /// Persist `snapshot` under a fresh token.
    pub fn create(&self, snapshot: &StateSnapshot) -> Result<StateToken> {
        let token = StateToken::new();
        let row = TokenRow {
            created: Timestamp::now(),
            snapshot: rmp_serde::to_vec_named(snapshot)?,
        };
        self.db.insert_token(token, row)?;
        tracing::debug!(token = %token, aggregates = snapshot.len(), "state token created");
        Ok(token)
    }

    /// The stored snapshot, or `None` if the token is unknown or expired.
    pub fn state_of(&self, token: &StateToken) -> Result<Option<StateSnapshot>> {
        let row = match self.db.token(token) {
            Some(row) => row,
            None => return Ok(None),
        };
        if row.created < self.expiry_cutoff() {
            return Ok(None);
        }
        Ok(Some(rmp_serde::from_slice(&row.snapshot)?))
    }

    /// Delete `token`. Idempotent.
    pub fn invalidate(&self, token: &StateToken) -> Result<()> {
        if self.db.delete_token(token)? {
            tracing::debug!(token = %token, "state token invalidated");
        }
        Ok(())
    }

    /// Publish `facts` only if no aggregate referenced by them or by the
    /// token's snapshot has changed since the snapshot was taken.
    ///
    /// Returns `Ok(false)` when state changed or the token is unknown. The
    /// token is consumed either way.
    pub fn publish_if_unchanged(
        &self,
        facts: Vec<Fact>,
        token: &StateToken,
    ) -> Result<bool> {
        let result = self.guarded_publish(facts, token);
        if let Err(e) = self.invalidate(token) {
            tracing::warn!(token = %token, error = %e, "cannot record token invalidation");
        }
        result
    }

    /// Delete tokens older than the configured time-to-live.
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.db.purge_tokens_before(self.expiry_cutoff())?;
        if purged > 0 {
            tracing::info!(purged, "expired state tokens purged");
        }
        Ok(purged)
    }

    pub fn count(&self) -> usize {
        self.db.token_count()
    }

    fn guarded_publish(&self, facts: Vec<Fact>, token: &StateToken) -> Result<bool> {
        let snapshot = match self.state_of(token)? {
            Some(snapshot) => snapshot,
            None => {
                tracing::debug!(token = %token, "unknown or expired state token");
                return Ok(false);
            }
        };

        let mut aggregates: BTreeSet<AggregateId> = snapshot.aggregates.keys().copied().collect();
        for fact in &facts {
            aggregates.extend(fact.header.aggregate_ids.iter().copied());
        }

        let mut table = self.db.lock_fact_table();
        for agg in &aggregates {
            let current = table.last_fact_for(agg);
            if current != snapshot.expected(agg) {
                tracing::debug!(
                    token = %token,
                    aggregate = %agg,
                    "aggregate changed since snapshot, publish refused"
                );
                return Ok(false);
            }
        }

        let serials: Vec<Serial> = table.insert(facts)?;
        tracing::debug!(token = %token, published = serials.len(), "guarded publish committed");
        Ok(true)
    }

    fn expiry_cutoff(&self) -> Timestamp {
        let ttl = i64::try_from(self.ttl.as_micros()).unwrap_or(i64::MAX);
        Timestamp::now().saturating_sub_micros(ttl)
    }
}

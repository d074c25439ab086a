//! In-memory indices over the fact table.

use crate::types::{AggregateId, FactHeader, FactId, Serial};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// Index entry for one fact row.
#[derive(Clone, Debug)]
pub struct IndexRow {
    /// Offset of the row in the fact log.
    pub offset: u64,
    /// Header with serial stamped.
    pub header: Arc<FactHeader>,
}

/// Indices mapping serials, ids, namespaces and aggregates to fact rows.
///
/// Rows are added unstamped and become visible to readers only once
/// [`FactIndex::stamp_through`] has moved the watermark past them.
#[derive(Debug, Default)]
pub struct FactIndex {
    /// Serial -> row.
    rows: BTreeMap<Serial, IndexRow>,

    /// Unique index on fact id.
    by_id: HashMap<FactId, Serial>,

    /// Namespace -> serials.
    by_namespace: HashMap<String, BTreeSet<Serial>>,

    /// Namespace -> known types.
    types: BTreeMap<String, BTreeSet<String>>,

    /// Aggregate -> serials of the facts referencing it, ascending.
    by_aggregate: HashMap<AggregateId, Vec<Serial>>,

    /// Highest serial handed out.
    last_assigned: Serial,

    /// Highest serial visible to readers.
    stamped: Serial,
}

impl FactIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next serial.
    pub fn next_serial(&mut self) -> Serial {
        self.last_assigned = self.last_assigned.next();
        self.last_assigned
    }

    /// Add a row. It stays invisible until stamped.
    pub fn add(&mut self, serial: Serial, offset: u64, header: FactHeader) {
        let header = Arc::new(header);

        self.by_id.insert(header.id, serial);
        self.by_namespace
            .entry(header.ns.clone())
            .or_default()
            .insert(serial);
        if let Some(ref fact_type) = header.fact_type {
            self.types
                .entry(header.ns.clone())
                .or_default()
                .insert(fact_type.clone());
        } else {
            self.types.entry(header.ns.clone()).or_default();
        }
        for agg in &header.aggregate_ids {
            self.by_aggregate.entry(*agg).or_default().push(serial);
        }
        self.last_assigned = self.last_assigned.max(serial);
        self.rows.insert(serial, IndexRow { offset, header });
    }

    /// Make every row up to and including `serial` visible.
    pub fn stamp_through(&mut self, serial: Serial) {
        self.stamped = self.stamped.max(serial.min(self.last_assigned));
    }

    /// Highest serial handed out, stamped or not.
    pub fn last_assigned(&self) -> Serial {
        self.last_assigned
    }

    /// Highest visible serial.
    pub fn stamped(&self) -> Serial {
        self.stamped
    }

    /// Whether an id is taken, stamped or not.
    pub fn contains_id(&self, id: &FactId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Serial of a visible fact.
    pub fn serial_of(&self, id: &FactId) -> Option<Serial> {
        self.by_id
            .get(id)
            .copied()
            .filter(|serial| *serial <= self.stamped)
    }

    /// A visible row.
    pub fn row(&self, serial: Serial) -> Option<&IndexRow> {
        if serial > self.stamped {
            return None;
        }
        self.rows.get(&serial)
    }

    /// Visible serials in any of `namespaces` strictly after `after`, ascending.
    pub fn candidates<'a>(
        &self,
        namespaces: impl IntoIterator<Item = &'a str>,
        after: Serial,
    ) -> Vec<Serial> {
        if after >= self.stamped {
            return Vec::new();
        }
        let range = (Bound::Excluded(after), Bound::Included(self.stamped));

        let mut merged = BTreeSet::new();
        for ns in namespaces {
            if let Some(serials) = self.by_namespace.get(ns) {
                merged.extend(serials.range(range));
            }
        }
        merged.into_iter().collect()
    }

    /// Id of the last visible fact referencing `agg`.
    pub fn last_fact_for(&self, agg: &AggregateId) -> Option<FactId> {
        let serial = self
            .by_aggregate
            .get(agg)?
            .iter()
            .rev()
            .find(|serial| **serial <= self.stamped)?;
        self.rows.get(serial).map(|row| row.header.id)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn types(&self, ns: &str) -> Vec<String> {
        self.types
            .get(ns)
            .map(|types| types.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of indexed rows.
    pub fn count(&self) -> usize {
        self.rows.len()
    }
}

//! Core types for the fact store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Unique identifier for a fact (assigned by the writer).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactId(pub Uuid);

impl FactId {
    /// Create a new random fact id.
    pub fn new() -> Self {
        FactId(Uuid::new_v4())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactId({})", self.0)
    }
}

impl fmt::Display for FactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an aggregate a fact refers to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateId(pub Uuid);

impl AggregateId {
    pub fn new() -> Self {
        AggregateId(Uuid::new_v4())
    }
}

impl Default for AggregateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AggregateId({})", self.0)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned position in the global log. Serial 0 means "before the first fact".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Serial(pub u64);

impl Serial {
    pub const ZERO: Serial = Serial(0);

    pub fn next(self) -> Self {
        Serial(self.0 + 1)
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.0)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. Clocks before the epoch read as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    pub fn saturating_sub_micros(self, micros: i64) -> Self {
        Timestamp(self.0.saturating_sub(micros))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The structured envelope of a fact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FactHeader {
    pub id: FactId,

    pub ns: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<String>,

    /// Schema version of the payload.
    pub version: u32,

    #[serde(rename = "aggIds", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aggregate_ids: BTreeSet<AggregateId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    /// Stamped by the store right after insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<Serial>,
}

/// One immutable event record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub header: FactHeader,
    pub payload: serde_json::Value,
}

impl Fact {
    /// Create a version-1 fact in `ns` with a fresh id.
    pub fn new(ns: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            header: FactHeader {
                id: FactId::new(),
                ns: ns.into(),
                fact_type: None,
                version: 1,
                aggregate_ids: BTreeSet::new(),
                meta: BTreeMap::new(),
                serial: None,
            },
            payload,
        }
    }

    /// Create a fact from any serializable payload.
    pub fn json(ns: impl Into<String>, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self::new(ns, serde_json::to_value(payload)?))
    }

    pub fn with_id(mut self, id: FactId) -> Self {
        self.header.id = id;
        self
    }

    pub fn with_type(mut self, fact_type: impl Into<String>) -> Self {
        self.header.fact_type = Some(fact_type.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.header.version = version;
        self
    }

    pub fn with_aggregate(mut self, id: AggregateId) -> Self {
        self.header.aggregate_ids.insert(id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.meta.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> FactId {
        self.header.id
    }

    pub fn ns(&self) -> &str {
        &self.header.ns
    }

    pub fn fact_type(&self) -> Option<&str> {
        self.header.fact_type.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.header.version
    }

    /// The serial, once the store has stamped it.
    pub fn serial(&self) -> Option<Serial> {
        self.header.serial
    }

    /// JSON view used by filter predicates: `{ "header": .., "payload": .. }`.
    pub fn to_json_view(&self) -> serde_json::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "header": serde_json::to_value(&self.header)?,
            "payload": self.payload,
        }))
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub fact_count: u64,
    pub latest_serial: Serial,
    pub namespace_count: u64,
    pub token_count: u64,
    pub staged_catchup_rows: u64,
    pub active_subscriptions: u64,
    pub log_size_bytes: u64,
}

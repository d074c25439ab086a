//! Turns fact specs into a backend query bound to a starting serial.

use crate::types::{AggregateId, FactHeader, Serial};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// One matching criterion of a subscription.
///
/// Every set field must hold for a fact to match. `filter` is evaluated in
/// memory after the backend query (see [`crate::query::PostQueryMatcher`]).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactSpec {
    pub ns: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fact_type: Option<String>,

    /// Payload version the consumer wants to receive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(rename = "aggId", default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<AggregateId>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl FactSpec {
    /// Match every fact in a namespace.
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_aggregate(mut self, id: AggregateId) -> Self {
        self.aggregate_id = Some(id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// A bound query parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Param {
    Serial(Serial),
    Text(String),
    Aggregate(AggregateId),
}

/// Reference to a parameter by its 1-based placeholder position (`$n`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamRef(usize);

impl ParamRef {
    pub fn position(self) -> usize {
        self.0
    }
}

/// One conjunct of a spec's predicate.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Namespace(ParamRef),
    Type(ParamRef),
    Aggregate(ParamRef),
    Meta { key: ParamRef, value: ParamRef },
}

/// `serial > $1 AND (spec1 OR spec2 OR ...)`, with its parameter list.
///
/// The predicate text and the parameters are produced in one left-to-right
/// pass, so placeholder `$n` is always `params[n - 1]`.
#[derive(Clone, Debug)]
pub struct FactQuery {
    text: String,
    params: Vec<Param>,
    after: ParamRef,
    specs: Vec<Vec<Condition>>,
}

impl FactQuery {
    /// Predicate text.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// The exclusive lower bound.
    pub fn after(&self) -> Serial {
        match self.param(self.after) {
            Some(Param::Serial(serial)) => *serial,
            _ => Serial::ZERO,
        }
    }

    /// Namespaces named by the specs, used to narrow the scan.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> + '_ {
        self.specs.iter().flat_map(move |conditions| {
            conditions.iter().filter_map(move |c| match c {
                Condition::Namespace(r) => match self.param(*r) {
                    Some(Param::Text(ns)) => Some(ns.as_str()),
                    _ => None,
                },
                _ => None,
            })
        })
    }

    /// Evaluate the predicate against one row.
    pub fn matches(&self, serial: Serial, header: &FactHeader) -> bool {
        serial > self.after()
            && self
                .specs
                .iter()
                .any(|conditions| conditions.iter().all(|c| self.holds(c, header)))
    }

    fn holds(&self, condition: &Condition, header: &FactHeader) -> bool {
        match condition {
            Condition::Namespace(r) => {
                matches!(self.param(*r), Some(Param::Text(ns)) if *ns == header.ns)
            }
            Condition::Type(r) => match self.param(*r) {
                Some(Param::Text(t)) => header.fact_type.as_deref() == Some(t.as_str()),
                _ => false,
            },
            Condition::Aggregate(r) => match self.param(*r) {
                Some(Param::Aggregate(agg)) => header.aggregate_ids.contains(agg),
                _ => false,
            },
            Condition::Meta { key, value } => match (self.param(*key), self.param(*value)) {
                (Some(Param::Text(k)), Some(Param::Text(v))) => header.meta.get(k) == Some(v),
                _ => false,
            },
        }
    }

    fn param(&self, r: ParamRef) -> Option<&Param> {
        r.0.checked_sub(1).and_then(|i| self.params.get(i))
    }
}

/// Builds [`FactQuery`]s for one subscription's specs.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    specs: Vec<FactSpec>,
}

impl QueryBuilder {
    pub fn new(specs: &[FactSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
        }
    }

    /// Build the query for rows strictly after `after`.
    pub fn build(&self, after: Serial) -> FactQuery {
        let mut binder = Binder::default();
        let mut text = String::new();

        let after_ref = binder.bind(Param::Serial(after));
        let _ = write!(text, "serial > ${}", after_ref.0);

        if self.specs.is_empty() {
            text.push_str(" AND FALSE");
            return FactQuery {
                text,
                params: binder.params,
                after: after_ref,
                specs: Vec::new(),
            };
        }

        text.push_str(" AND (");
        let mut specs = Vec::with_capacity(self.specs.len());
        for (i, spec) in self.specs.iter().enumerate() {
            if i > 0 {
                text.push_str(" OR ");
            }
            let mut conditions = Vec::new();

            let ns = binder.bind(Param::Text(spec.ns.clone()));
            let _ = write!(text, "(header.ns = ${}", ns.0);
            conditions.push(Condition::Namespace(ns));

            if let Some(ref fact_type) = spec.fact_type {
                let r = binder.bind(Param::Text(fact_type.clone()));
                let _ = write!(text, " AND header.type = ${}", r.0);
                conditions.push(Condition::Type(r));
            }

            if let Some(agg) = spec.aggregate_id {
                let r = binder.bind(Param::Aggregate(agg));
                let _ = write!(text, " AND ${} = ANY(header.aggIds)", r.0);
                conditions.push(Condition::Aggregate(r));
            }

            for (key, value) in &spec.meta {
                let key = binder.bind(Param::Text(key.clone()));
                let value = binder.bind(Param::Text(value.clone()));
                let _ = write!(text, " AND header.meta->>${} = ${}", key.0, value.0);
                conditions.push(Condition::Meta { key, value });
            }

            text.push(')');
            specs.push(conditions);
        }
        text.push(')');

        FactQuery {
            text,
            params: binder.params,
            after: after_ref,
            specs,
        }
    }
}

#[derive(Default)]
struct Binder {
    params: Vec<Param>,
}

impl Binder {
    fn bind(&mut self, param: Param) -> ParamRef {
        self.params.push(param);
        ParamRef(self.params.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fact;
    use serde_json::json;

    #[test]
    fn test_text_and_params_line_up() {
        let agg = AggregateId::new();
        let query = QueryBuilder::new(&[
            FactSpec::ns("users").with_type("Created").with_meta("tenant", "t1"),
            FactSpec::ns("orders").with_aggregate(agg),
        ])
        .build(Serial(10));

        assert_eq!(
            query.text(),
            "serial > $1 AND ((header.ns = $2 AND header.type = $3 AND header.meta->>$4 = $5) \
             OR (header.ns = $6 AND $7 = ANY(header.aggIds)))"
        );
        assert_eq!(
            query.params(),
            &[
                Param::Serial(Serial(10)),
                Param::Text("users".into()),
                Param::Text("Created".into()),
                Param::Text("tenant".into()),
                Param::Text("t1".into()),
                Param::Text("orders".into()),
                Param::Aggregate(agg),
            ]
        );
        assert_eq!(query.after(), Serial(10));
        assert_eq!(query.namespaces().collect::<Vec<_>>(), vec!["users", "orders"]);
    }

    #[test]
    fn test_empty_specs_match_nothing() {
        let query = QueryBuilder::new(&[]).build(Serial::ZERO);
        assert_eq!(query.text(), "serial > $1 AND FALSE");
        let fact = Fact::new("ns", json!({}));
        assert!(!query.matches(Serial(1), &fact.header));
    }

    #[test]
    fn test_matches_or_of_conjunctions() {
        let agg = AggregateId::new();
        let query = QueryBuilder::new(&[
            FactSpec::ns("a").with_type("T"),
            FactSpec::ns("b").with_aggregate(agg).with_meta("k", "v"),
        ])
        .build(Serial(5));

        let a_t = Fact::new("a", json!({})).with_type("T");
        let a_u = Fact::new("a", json!({})).with_type("U");
        let b_full = Fact::new("b", json!({})).with_aggregate(agg).with_meta("k", "v");
        let b_no_meta = Fact::new("b", json!({})).with_aggregate(agg);

        assert!(query.matches(Serial(6), &a_t.header));
        assert!(!query.matches(Serial(5), &a_t.header));
        assert!(!query.matches(Serial(6), &a_u.header));
        assert!(query.matches(Serial(7), &b_full.header));
        assert!(!query.matches(Serial(7), &b_no_meta.header));
    }
}

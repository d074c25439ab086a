//! Secondary in-memory filtering for predicates the backend cannot evaluate.

use super::builder::FactSpec;
use super::filter::FilterExpr;
use crate::error::Result;
use crate::types::Fact;

/// Per-subscription matcher applied to rows returned by the backend query.
///
/// When no spec carries a filter this accepts everything without looking at
/// the row. Otherwise a fact is accepted if any spec accepts it; a spec
/// without a filter accepts every row of its own namespace/type/aggregate.
#[derive(Clone, Debug)]
pub enum PostQueryMatcher {
    AcceptAll,
    Filtered(Vec<SpecEvaluator>),
}

/// Evaluator for one spec.
#[derive(Clone, Debug)]
pub struct SpecEvaluator {
    spec: FactSpec,
    filter: Option<FilterExpr>,
}

impl SpecEvaluator {
    fn accepts(&self, fact: &Fact, view: &serde_json::Value) -> bool {
        if !header_matches(&self.spec, fact) {
            return false;
        }
        match self.filter {
            Some(ref filter) => filter.evaluate(view),
            None => true,
        }
    }
}

impl PostQueryMatcher {
    /// Build the matcher, parsing every filter up front.
    pub fn new(specs: &[FactSpec]) -> Result<Self> {
        if specs.iter().all(|s| s.filter.is_none()) {
            return Ok(PostQueryMatcher::AcceptAll);
        }

        let evaluators = specs
            .iter()
            .map(|spec| {
                let filter = spec.filter.as_deref().map(FilterExpr::parse).transpose()?;
                Ok(SpecEvaluator {
                    spec: spec.clone(),
                    filter,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PostQueryMatcher::Filtered(evaluators))
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, PostQueryMatcher::AcceptAll)
    }

    /// Whether `fact` passes.
    pub fn test(&self, fact: &Fact) -> bool {
        match self {
            PostQueryMatcher::AcceptAll => true,
            PostQueryMatcher::Filtered(evaluators) => {
                let view = match fact.to_json_view() {
                    Ok(view) => view,
                    Err(e) => {
                        tracing::warn!(fact = %fact.id(), error = %e, "cannot build filter view, rejecting fact");
                        return false;
                    }
                };
                evaluators.iter().any(|e| e.accepts(fact, &view))
            }
        }
    }
}

/// The backend half of a spec, re-checked so a filter is only applied to
/// rows its own spec selected.
fn header_matches(spec: &FactSpec, fact: &Fact) -> bool {
    let header = &fact.header;
    header.ns == spec.ns
        && spec
            .fact_type
            .as_ref()
            .map_or(true, |t| header.fact_type.as_ref() == Some(t))
        && spec
            .aggregate_id
            .map_or(true, |agg| header.aggregate_ids.contains(&agg))
        && spec
            .meta
            .iter()
            .all(|(k, v)| header.meta.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use serde_json::json;

    #[test]
    fn test_no_filters_is_noop() {
        let matcher =
            PostQueryMatcher::new(&[FactSpec::ns("a"), FactSpec::ns("b").with_type("T")]).unwrap();
        assert!(matcher.is_noop());
        assert!(matcher.test(&Fact::new("zzz", json!(null))));
    }

    #[test]
    fn test_or_across_specs() {
        let matcher = PostQueryMatcher::new(&[
            FactSpec::ns("orders").with_filter("payload.amount > 100"),
            FactSpec::ns("refunds"),
        ])
        .unwrap();
        assert!(!matcher.is_noop());

        assert!(matcher.test(&Fact::new("orders", json!({"amount": 150}))));
        assert!(!matcher.test(&Fact::new("orders", json!({"amount": 50}))));
        // Unfiltered spec accepts its own namespace.
        assert!(matcher.test(&Fact::new("refunds", json!({"amount": 1}))));
    }

    #[test]
    fn test_filter_only_applies_to_its_spec() {
        let matcher = PostQueryMatcher::new(&[
            FactSpec::ns("a").with_filter("payload.ok = true"),
            FactSpec::ns("b").with_filter("payload.ok = false"),
        ])
        .unwrap();

        assert!(matcher.test(&Fact::new("a", json!({"ok": true}))));
        assert!(!matcher.test(&Fact::new("a", json!({"ok": false}))));
        assert!(matcher.test(&Fact::new("b", json!({"ok": false}))));
    }

    #[test]
    fn test_malformed_filter_fails_construction() {
        let result = PostQueryMatcher::new(&[FactSpec::ns("a").with_filter("payload.x =")]);
        assert!(matches!(result, Err(StoreError::InvalidFilter { .. })));
    }
}

//! Schema-version transformation of fact payloads.
//!
//! Consumers state which payload versions they understand per
//! (namespace, type) through [`RequestedVersions`]. The [`Transformer`]
//! converts facts stored at another version through a chain of registered
//! steps.

mod chain;
mod registry;

pub use chain::TransformationChain;
pub use registry::{StepFn, TransformationRegistry, TransformationStep, Transformations};

use crate::error::{Result, StoreError};
use crate::query::FactSpec;
use crate::types::Fact;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Versions a consumer accepts, keyed by (namespace, type).
///
/// Owned by one subscription or call; there is no process-wide registry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestedVersions {
    versions: HashMap<(String, Option<String>), BTreeSet<u32>>,
}

impl RequestedVersions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the `version` of every spec that requests one.
    ///
    /// Chains are registered per type, so a version without a type cannot be
    /// honored and is refused.
    pub fn from_specs(specs: &[FactSpec]) -> Result<Self> {
        let mut requested = Self::new();
        for spec in specs {
            let version = match spec.version {
                Some(version) => version,
                None => continue,
            };
            if spec.fact_type.is_none() {
                return Err(StoreError::InvalidOperation(format!(
                    "version {} requested for namespace '{}' without a type",
                    version, spec.ns
                )));
            }
            requested.add(spec.ns.clone(), spec.fact_type.clone(), version);
        }
        Ok(requested)
    }

    pub fn add(&mut self, ns: impl Into<String>, fact_type: Option<String>, version: u32) {
        self.versions
            .entry((ns.into(), fact_type))
            .or_default()
            .insert(version);
    }

    pub fn get(&self, ns: &str, fact_type: Option<&str>) -> Option<&BTreeSet<u32>> {
        self.versions
            .get(&(ns.to_string(), fact_type.map(str::to_string)))
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

type ChainKey = (String, String, u32, u32);

/// Applies transformation chains, caching resolved chains for the life of
/// the process.
pub struct Transformer {
    registry: Arc<dyn TransformationRegistry>,
    chains: RwLock<HashMap<ChainKey, Option<Arc<TransformationChain>>>>,
}

impl Transformer {
    pub fn new(registry: Arc<dyn TransformationRegistry>) -> Self {
        Self {
            registry,
            chains: RwLock::new(HashMap::new()),
        }
    }

    /// Return `fact` at a version the consumer requested.
    ///
    /// Facts nobody asked a version for, or already at a requested version,
    /// pass through untouched. Otherwise the highest requested version with
    /// a chain wins.
    pub fn transform_if_necessary(&self, mut fact: Fact, requested: &RequestedVersions) -> Result<Fact> {
        let wanted = match requested.get(fact.ns(), fact.fact_type()) {
            Some(wanted) if !wanted.is_empty() => wanted,
            _ => return Ok(fact),
        };
        let from = fact.version();
        if wanted.contains(&from) {
            return Ok(fact);
        }

        let no_chain = || StoreError::Transformation {
            ns: fact.ns().to_string(),
            fact_type: fact.fact_type().unwrap_or_default().to_string(),
            from,
            requested: wanted.iter().copied().collect(),
        };
        let fact_type = match fact.fact_type() {
            Some(fact_type) => fact_type.to_string(),
            None => return Err(no_chain()),
        };

        let chain = wanted
            .iter()
            .rev()
            .find_map(|to| self.chain(fact.ns(), &fact_type, from, *to));
        let chain = match chain {
            Some(chain) => chain,
            None => return Err(no_chain()),
        };

        let payload = std::mem::take(&mut fact.payload);
        fact.payload = chain
            .apply(payload)
            .map_err(|(step_from, step_to, reason)| StoreError::TransformationStep {
                ns: fact.ns().to_string(),
                fact_type: fact_type.clone(),
                from: step_from,
                to: step_to,
                reason,
            })?;
        fact.header.version = chain.to;

        tracing::trace!(fact = %fact.id(), from, to = chain.to, "fact transformed");
        Ok(fact)
    }

    /// Resolved chain for `(ns, fact_type)` from `from` to `to`.
    pub fn chain(&self, ns: &str, fact_type: &str, from: u32, to: u32) -> Option<Arc<TransformationChain>> {
        let key = (ns.to_string(), fact_type.to_string(), from, to);
        if let Some(cached) = self.chains.read().get(&key) {
            return cached.clone();
        }

        let steps = self.registry.steps(ns, fact_type);
        let chain = TransformationChain::resolve(&steps, from, to).map(Arc::new);
        if chain.is_none() {
            tracing::debug!(ns, fact_type, from, to, "no transformation chain");
        }
        self.chains.write().insert(key, chain.clone());
        chain
    }

    pub fn cached_chains(&self) -> usize {
        self.chains.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn registry() -> Arc<Transformations> {
        let mut t = Transformations::new();
        t.register("users", "Created", 1, 2, |mut v: Value| {
            let name = v["name"].take();
            Ok(json!({"fullName": name}))
        })
        .register("users", "Created", 2, 3, |v: Value| {
            Ok(json!({"person": v}))
        })
        .register("users", "Broken", 1, 2, |_| Err("boom".to_string()));
        Arc::new(t)
    }

    fn requested(ns: &str, fact_type: &str, versions: &[u32]) -> RequestedVersions {
        let mut r = RequestedVersions::new();
        for v in versions {
            r.add(ns, Some(fact_type.to_string()), *v);
        }
        r
    }

    #[test]
    fn test_no_preference_passes_through() {
        let transformer = Transformer::new(registry());
        let fact = Fact::new("users", json!({"name": "ada"})).with_type("Created");
        let out = transformer
            .transform_if_necessary(fact.clone(), &RequestedVersions::new())
            .unwrap();
        assert_eq!(out, fact);
        assert_eq!(transformer.cached_chains(), 0);
    }

    #[test]
    fn test_requested_stored_version_is_identity() {
        let transformer = Transformer::new(registry());
        let fact = Fact::new("users", json!({"name": "ada"}))
            .with_type("Created")
            .with_version(2);
        let out = transformer
            .transform_if_necessary(fact.clone(), &requested("users", "Created", &[2, 3]))
            .unwrap();
        assert_eq!(out, fact);
    }

    #[test]
    fn test_highest_requested_version_chosen() {
        let transformer = Transformer::new(registry());
        let fact = Fact::new("users", json!({"name": "ada"})).with_type("Created");
        let out = transformer
            .transform_if_necessary(fact.clone(), &requested("users", "Created", &[2, 3]))
            .unwrap();

        assert_eq!(out.version(), 3);
        assert_eq!(out.payload, json!({"person": {"fullName": "ada"}}));
        assert_eq!(out.id(), fact.id());
        assert_eq!(out.fact_type(), Some("Created"));
    }

    #[test]
    fn test_falls_back_to_lower_reachable_version() {
        let transformer = Transformer::new(registry());
        let fact = Fact::new("users", json!({"name": "ada"})).with_type("Created");
        let out = transformer
            .transform_if_necessary(fact, &requested("users", "Created", &[2, 9]))
            .unwrap();
        assert_eq!(out.version(), 2);
    }

    #[test]
    fn test_missing_chain_is_an_error() {
        let transformer = Transformer::new(registry());
        let fact = Fact::new("users", json!({})).with_type("Created").with_version(3);
        let err = transformer
            .transform_if_necessary(fact, &requested("users", "Created", &[1]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Transformation { from: 3, .. }));

        let fact = Fact::new("users", json!({})).with_type("Broken");
        let err = transformer
            .transform_if_necessary(fact, &requested("users", "Broken", &[2]))
            .unwrap_err();
        assert!(matches!(err, StoreError::TransformationStep { from: 1, to: 2, .. }));
    }

    #[test]
    fn test_chains_are_cached() {
        let transformer = Transformer::new(registry());
        assert!(transformer.chain("users", "Created", 1, 3).is_some());
        assert!(transformer.chain("users", "Created", 1, 3).is_some());
        assert!(transformer.chain("users", "Created", 3, 1).is_none());
        assert_eq!(transformer.cached_chains(), 2);
    }

    #[test]
    fn test_versions_from_specs() {
        let specs = vec![
            FactSpec::ns("users").with_type("Created").with_version(2),
            FactSpec::ns("users").with_type("Deleted"),
        ];
        let requested = RequestedVersions::from_specs(&specs).unwrap();
        assert!(requested.get("users", Some("Created")).unwrap().contains(&2));
        assert!(requested.get("users", Some("Deleted")).is_none());
    }

    #[test]
    fn test_version_without_type_refused() {
        let specs = vec![
            FactSpec::ns("users").with_type("Created").with_version(2),
            FactSpec::ns("users").with_version(3),
        ];
        let err = RequestedVersions::from_specs(&specs).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }
}

//! Registered transformation steps.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Step function: converts one payload, or explains why it cannot.
pub type StepFn = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// One registered conversion between two adjacent schema versions.
#[derive(Clone)]
pub struct TransformationStep {
    pub from: u32,
    pub to: u32,
    apply: StepFn,
}

impl TransformationStep {
    pub fn new<F>(from: u32, to: u32, apply: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            from,
            to,
            apply: Arc::new(apply),
        }
    }

    pub fn apply(&self, payload: Value) -> std::result::Result<Value, String> {
        (self.apply)(payload)
    }
}

impl fmt::Debug for TransformationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransformationStep({} -> {})", self.from, self.to)
    }
}

/// Source of transformation steps, e.g. a schema registry.
pub trait TransformationRegistry: Send + Sync {
    /// Every step registered for `(ns, fact_type)`.
    fn steps(&self, ns: &str, fact_type: &str) -> Vec<TransformationStep>;
}

/// In-memory registry.
#[derive(Clone, Debug, Default)]
pub struct Transformations {
    steps: HashMap<(String, String), Vec<TransformationStep>>,
}

impl Transformations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. A later step for the same `from`/`to` replaces the
    /// earlier one.
    pub fn register<F>(
        &mut self,
        ns: impl Into<String>,
        fact_type: impl Into<String>,
        from: u32,
        to: u32,
        apply: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        let steps = self.steps.entry((ns.into(), fact_type.into())).or_default();
        steps.retain(|s| !(s.from == from && s.to == to));
        steps.push(TransformationStep::new(from, to, apply));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl TransformationRegistry for Transformations {
    fn steps(&self, ns: &str, fact_type: &str) -> Vec<TransformationStep> {
        self.steps
            .get(&(ns.to_string(), fact_type.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

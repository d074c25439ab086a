//! Chain resolution over registered steps.

use super::registry::TransformationStep;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Ordered steps converting a payload from one version to another.
#[derive(Clone, Debug)]
pub struct TransformationChain {
    pub from: u32,
    pub to: u32,
    steps: Vec<TransformationStep>,
}

impl TransformationChain {
    /// Shortest chain from `from` to `to` through `steps`, if any.
    ///
    /// `from == to` yields the empty identity chain.
    pub fn resolve(steps: &[TransformationStep], from: u32, to: u32) -> Option<Self> {
        if from == to {
            return Some(Self {
                from,
                to,
                steps: Vec::new(),
            });
        }

        // Breadth-first: version -> index of the step that reached it.
        let mut reached: HashMap<u32, usize> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(version) = queue.pop_front() {
            for (i, step) in steps.iter().enumerate() {
                if step.from != version || step.to == from || reached.contains_key(&step.to) {
                    continue;
                }
                reached.insert(step.to, i);
                if step.to == to {
                    return Some(Self::walk_back(steps, &reached, from, to));
                }
                queue.push_back(step.to);
            }
        }
        None
    }

    fn walk_back(
        steps: &[TransformationStep],
        reached: &HashMap<u32, usize>,
        from: u32,
        to: u32,
    ) -> Self {
        let mut path = Vec::new();
        let mut version = to;
        while version != from {
            let step = &steps[reached[&version]];
            path.push(step.clone());
            version = step.from;
        }
        path.reverse();
        Self {
            from,
            to,
            steps: path,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply each step in order. On failure returns the failing step's
    /// versions and reason.
    pub fn apply(&self, mut payload: Value) -> std::result::Result<Value, (u32, u32, String)> {
        for step in &self.steps {
            payload = step
                .apply(payload)
                .map_err(|reason| (step.from, step.to, reason))?;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(from: u32, to: u32) -> TransformationStep {
        TransformationStep::new(from, to, move |mut v: Value| {
            v.get_mut("path")
                .and_then(Value::as_array_mut)
                .ok_or("no path")?
                .push(json!(to));
            Ok(v)
        })
    }

    #[test]
    fn test_identity_chain() {
        let chain = TransformationChain::resolve(&[], 3, 3).unwrap();
        assert!(chain.is_identity());
        assert_eq!(chain.apply(json!({"a": 1})).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_shortest_path_wins() {
        let steps = vec![step(1, 2), step(2, 3), step(3, 4), step(1, 3)];
        let chain = TransformationChain::resolve(&steps, 1, 4).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.apply(json!({"path": []})).unwrap(),
            json!({"path": [3, 4]})
        );
    }

    #[test]
    fn test_downcast_and_unreachable() {
        let steps = vec![step(2, 1), step(1, 2)];
        assert_eq!(TransformationChain::resolve(&steps, 2, 1).unwrap().len(), 1);
        assert!(TransformationChain::resolve(&steps, 1, 3).is_none());
    }

    #[test]
    fn test_failing_step_reports_versions() {
        let steps = vec![step(1, 2)];
        let chain = TransformationChain::resolve(&steps, 1, 2).unwrap();
        let (from, to, _) = chain.apply(json!("not an object")).unwrap_err();
        assert_eq!((from, to), (1, 2));
    }
}

use crate::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Accumulating key/value map of node outputs within a single run.
///
/// The run input lives under [`WorkingState::INPUT_KEY`]; each completed node
/// contributes its output under its own id. Branch labels selected by a node
/// are kept next to its output so conditional edges can be evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingState {
    values: BTreeMap<String, Value>,
    branches: BTreeMap<NodeId, BTreeSet<String>>,
}

impl WorkingState {
    pub const INPUT_KEY: &'static str = "input";

    pub fn new(input: Value) -> Self {
        let mut values = BTreeMap::new();
        values.insert(Self::INPUT_KEY.to_string(), input);
        Self {
            values,
            branches: BTreeMap::new(),
        }
    }

    pub fn input(&self) -> &Value {
        self.values.get(Self::INPUT_KEY).unwrap_or(&Value::Null)
    }

    /// Merge a node's output under its namespaced key.
    pub fn merge(&mut self, node: &NodeId, output: Value, branches: &[String]) {
        self.values.insert(node.as_str().to_string(), output);
        if !branches.is_empty() {
            self.branches
                .insert(node.clone(), branches.iter().cloned().collect());
        }
    }

    /// Output of a node, if it has completed.
    pub fn output_of(&self, node: &NodeId) -> Option<&Value> {
        self.values.get(node.as_str())
    }

    pub fn branches_of(&self, node: &NodeId) -> impl Iterator<Item = &str> {
        self.branches
            .get(node)
            .into_iter()
            .flat_map(|labels| labels.iter().map(String::as_str))
    }

    pub fn selected(&self, node: &NodeId, label: &str) -> bool {
        self.branches
            .get(node)
            .map(|labels| labels.contains(label))
            .unwrap_or(false)
    }

    /// Look up a dotted path such as `grade.verdict` or `input.items.0`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let mut current = self.values.get(head)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Flatten into one JSON object, as handed to templates and the CLI.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

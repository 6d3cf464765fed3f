use async_trait::async_trait;
use relaycore::{Step, StepContext, StepError, StepMetadata, StepOutput, WorkingState};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Comparison applied by a [`ConditionRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    Exists,
    Truthy,
}

/// `path op value => branch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    pub path: String,
    pub op: RuleOp,
    #[serde(default)]
    pub value: Value,
    pub branch: String,
}

impl ConditionRule {
    pub fn matches(&self, state: &WorkingState) -> bool {
        let actual = state.get(&self.path);
        match self.op {
            RuleOp::Exists => actual.is_some_and(|v| !v.is_null()),
            RuleOp::Truthy => actual.is_some_and(is_truthy),
            RuleOp::Eq => actual.is_some_and(|v| loosely_equal(v, &self.value)),
            RuleOp::Ne => !actual.is_some_and(|v| loosely_equal(v, &self.value)),
            RuleOp::Gt => compare(actual, &self.value).is_some_and(|o| o.is_gt()),
            RuleOp::Gte => compare(actual, &self.value).is_some_and(|o| o.is_ge()),
            RuleOp::Lt => compare(actual, &self.value).is_some_and(|o| o.is_lt()),
            RuleOp::Lte => compare(actual, &self.value).is_some_and(|o| o.is_le()),
            RuleOp::Contains => actual.is_some_and(|v| contains(v, &self.value)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => actual == expected,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let actual = actual?;
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => match (actual.as_str(), expected.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(s) => expected.as_str().is_some_and(|e| s.contains(e)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct ConditionConfig {
    #[serde(default)]
    rules: Vec<ConditionRule>,
    /// Take the label straight from a working-state string
    #[serde(default)]
    branch_from: Option<String>,
    #[serde(default)]
    default: Option<String>,
    /// Stop at the first matching rule instead of selecting all of them
    #[serde(default)]
    first_match: bool,
}

fn parse_config(config: &Value) -> Result<ConditionConfig, StepError> {
    serde_json::from_value(config.clone())
        .map_err(|e| StepError::Configuration(format!("condition config: {}", e)))
}

/// Default `condition-step`: selects branch labels from the working state.
///
/// Every matching rule selects its branch, so several outgoing edges can
/// fire at once unless `first_match` is set. With no match the `default`
/// label is selected.
pub struct ConditionStep;

#[async_trait]
impl Step for ConditionStep {
    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, StepError> {
        let config = parse_config(&ctx.config)?;
        let mut selected: Vec<String> = Vec::new();

        if let Some(path) = &config.branch_from {
            if let Some(label) = ctx.state.get(path).and_then(Value::as_str) {
                selected.push(label.trim().to_string());
            }
        }

        for rule in &config.rules {
            if config.first_match && !selected.is_empty() {
                break;
            }
            if rule.matches(&ctx.state) && !selected.contains(&rule.branch) {
                selected.push(rule.branch.clone());
            }
        }

        if selected.is_empty() {
            match &config.default {
                Some(label) => selected.push(label.clone()),
                None => {
                    return Err(StepError::ExecutionFailed(
                        "no condition matched and no default branch".to_string(),
                    ))
                }
            }
        }

        tracing::debug!(node_id = %ctx.node_id, branches = ?selected, "condition evaluated");

        let data = json!({
            "branch": selected[0],
            "branches": selected,
        });
        Ok(selected
            .into_iter()
            .fold(StepOutput::new(data), |out, label| out.with_branch(label)))
    }

    fn validate_config(&self, config: &Value) -> Result<(), StepError> {
        let config = parse_config(config)?;
        if config.rules.is_empty() && config.branch_from.is_none() && config.default.is_none() {
            return Err(StepError::Configuration(
                "condition needs rules, branch_from or a default".to_string(),
            ));
        }
        Ok(())
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Select branch labels from the working state".to_string(),
            category: "control".to_string(),
            branches: Vec::new(),
        }
    }
}

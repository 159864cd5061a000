//! ABOUTME: Declarative workflow definitions: steps, dependencies, retry, failure policy
//! ABOUTME: Validation covers unique ids, dependency closure, acyclicity, and retry bounds

use aishell_core::{AiShellError, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Predicate evaluated over the run's state map by conditional steps.
///
/// Keys address step outputs: `"a"` is step `a`'s whole result, and
/// `"a/output"` descends into it with JSON-pointer segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals { key: String, value: Value },
    Exists { key: String },
    Truthy { key: String },
    Not { condition: Box<Condition> },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    /// Evaluate against the state map
    #[must_use]
    pub fn evaluate(&self, state: &BTreeMap<String, Value>) -> bool {
        match self {
            Self::Equals { key, value } => lookup(state, key) == Some(value),
            Self::Exists { key } => lookup(state, key).is_some(),
            Self::Truthy { key } => match lookup(state, key) {
                Some(Value::Bool(b)) => *b,
                Some(Value::Null) | None => false,
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Number(n)) => n.as_f64() != Some(0.0),
                Some(Value::Array(a)) => !a.is_empty(),
                Some(Value::Object(o)) => !o.is_empty(),
            },
            Self::Not { condition } => !condition.evaluate(state),
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(state)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(state)),
        }
    }
}

fn lookup<'a>(state: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a Value> {
    let (step, pointer) = match key.split_once('/') {
        Some((step, rest)) => (step, Some(rest)),
        None => (key, None),
    };
    let root = state.get(step)?;
    match pointer {
        Some(rest) => root.pointer(&format!("/{rest}")),
        None => Some(root),
    }
}

/// Type-specific payload of a workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepType {
    /// Invoke a registered tool through the safety controller
    Tool {
        tool_name: String,
        #[serde(default)]
        parameters: Value,
        /// Overrides the orchestrator-generated idempotency key
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    /// Evaluate a predicate and take one of two branches. Steps named in
    /// either branch must depend on this step; the untaken branch is
    /// marked skipped.
    Conditional {
        condition: Condition,
        #[serde(default)]
        if_true: Vec<String>,
        #[serde(default)]
        if_false: Vec<String>,
    },
    /// Invoke a callable registered with the orchestrator by name
    Custom {
        function_name: String,
        #[serde(default)]
        parameters: Value,
    },
    /// Dispatch a task to a specialist agent and wait for its terminal
    /// status
    Agent { agent_kind: String, task: Value },
    /// Execute a nested registered workflow; its result becomes the step
    /// result
    SubWorkflow {
        workflow_id: String,
        #[serde(default)]
        initial_state: BTreeMap<String, Value>,
    },
}

/// What a step's failure does to the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Abort the run; in-flight steps cancel
    #[default]
    FailWorkflow,
    /// Record the failure and keep scheduling independent steps
    Continue,
    /// Mark transitive dependents skipped and keep going
    SkipDependents,
}

/// One node of the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub config: StepType,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, config: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            config,
            dependencies: BTreeSet::new(),
            retry_policy: None,
            timeout: None,
            on_failure: OnFailure::default(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }
}

/// A declarative DAG of steps.
///
/// Definitions are stable serializable documents; unknown fields are
/// rejected strictly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn add_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Look up a step by id
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Direct dependents of each step
    #[must_use]
    pub fn dependents(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.dependencies {
                map.entry(dep.clone()).or_default().push(step.id.clone());
            }
        }
        map
    }

    /// Transitive dependents of a step, in declaration order
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let dependents = self.dependents();
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for next in dependents.get(&current).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    frontier.push(next.clone());
                }
            }
        }
        self.steps
            .iter()
            .filter(|s| seen.contains(&s.id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Validate the definition: non-empty, unique step ids, resolvable
    /// dependencies and branch references, acyclic graph, sane retry
    /// policies.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(AiShellError::InvalidWorkflow {
                message: format!("workflow '{}' has no steps", self.id),
            });
        }

        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !ids.insert(&step.id) {
                return Err(AiShellError::InvalidWorkflow {
                    message: format!("duplicate step id '{}' in workflow '{}'", step.id, self.id),
                });
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(AiShellError::UnknownStep {
                        step_id: dep.clone(),
                    });
                }
                if dep == &step.id {
                    return Err(AiShellError::CyclicDependency {
                        workflow_id: self.id.clone(),
                    });
                }
            }
            if let Some(policy) = &step.retry_policy {
                policy.validate()?;
            }
            if let StepType::Conditional {
                if_true, if_false, ..
            } = &step.config
            {
                for target in if_true.iter().chain(if_false) {
                    if !ids.contains(target.as_str()) {
                        return Err(AiShellError::UnknownStep {
                            step_id: target.clone(),
                        });
                    }
                    let Some(target_step) = self.step(target) else {
                        continue;
                    };
                    if !target_step.dependencies.contains(&step.id) {
                        return Err(AiShellError::InvalidWorkflow {
                            message: format!(
                                "branch step '{target}' must depend on conditional '{}'",
                                step.id
                            ),
                        });
                    }
                }
            }
        }

        self.execution_order()?;
        Ok(())
    }

    /// Kahn-style topological order over dependencies, stable by
    /// declaration order among ready siblings. Fails with
    /// `CyclicDependency` when the graph has a cycle.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .steps
            .iter()
            .map(|s| (s.id.as_str(), s.dependencies.len()))
            .collect();
        let dependents = self.dependents();

        let mut order = Vec::with_capacity(self.steps.len());
        let mut done: HashSet<&str> = HashSet::new();

        while order.len() < self.steps.len() {
            let mut progressed = false;
            for step in &self.steps {
                let id = step.id.as_str();
                if !done.contains(id) && in_degree.get(id) == Some(&0) {
                    done.insert(id);
                    order.push(step.id.clone());
                    progressed = true;
                    for dependent in dependents.get(id).into_iter().flatten() {
                        if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }
            if !progressed {
                return Err(AiShellError::CyclicDependency {
                    workflow_id: self.id.clone(),
                });
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_step(id: &str) -> WorkflowStep {
        WorkflowStep::new(
            id,
            StepType::Tool {
                tool_name: "echo".to_string(),
                parameters: json!({"s": id}),
                idempotency_key: None,
            },
        )
    }

    #[test]
    fn test_empty_workflow_is_invalid() {
        let def = WorkflowDefinition::new("wf", "empty");
        let err = def.validate().unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::InvalidWorkflow);
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let def = WorkflowDefinition::new("wf", "dup")
            .add_step(tool_step("a"))
            .add_step(tool_step("a"));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = WorkflowDefinition::new("wf", "unknown")
            .add_step(tool_step("a").with_dependency("ghost"));
        let err = def.validate().unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::UnknownStep);
    }

    #[test]
    fn test_cycle_rejected() {
        let def = WorkflowDefinition::new("wf", "cycle")
            .add_step(tool_step("a").with_dependency("b"))
            .add_step(tool_step("b").with_dependency("a"));
        let err = def.validate().unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::CyclicDependency);
    }

    #[test]
    fn test_execution_order_respects_declaration_among_ready() {
        let def = WorkflowDefinition::new("wf", "diamond")
            .add_step(tool_step("a"))
            .add_step(tool_step("b").with_dependency("a"))
            .add_step(tool_step("c").with_dependency("a"))
            .add_step(
                tool_step("d")
                    .with_dependency("b")
                    .with_dependency("c"),
            );
        assert_eq!(def.execution_order().unwrap(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_branch_steps_must_depend_on_conditional() {
        let def = WorkflowDefinition::new("wf", "cond")
            .add_step(tool_step("seed"))
            .add_step(WorkflowStep::new(
                "gate",
                StepType::Conditional {
                    condition: Condition::Exists {
                        key: "seed".to_string(),
                    },
                    if_true: vec!["t".to_string()],
                    if_false: vec![],
                },
            ))
            // "t" does not depend on "gate"
            .add_step(tool_step("t"));
        let err = def.validate().unwrap_err();
        assert_eq!(err.kind(), aishell_core::ErrorKind::InvalidWorkflow);
    }

    #[test]
    fn test_serde_round_trip_is_identity() {
        let def = WorkflowDefinition::new("wf", "round-trip")
            .with_description("serde identity")
            .add_step(
                tool_step("a")
                    .with_retry(RetryPolicy::default())
                    .with_timeout(Duration::from_secs(5))
                    .with_on_failure(OnFailure::Continue),
            )
            .add_step(
                WorkflowStep::new(
                    "gate",
                    StepType::Conditional {
                        condition: Condition::Equals {
                            key: "a/output".to_string(),
                            value: json!("x"),
                        },
                        if_true: vec!["done".to_string()],
                        if_false: vec![],
                    },
                )
                .with_dependency("a"),
            )
            .add_step(
                WorkflowStep::new(
                    "done",
                    StepType::Custom {
                        function_name: "finish".to_string(),
                        parameters: json!({}),
                    },
                )
                .with_dependency("gate"),
            );

        let serialized = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&serialized).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let raw = json!({
            "id": "wf",
            "name": "strict",
            "steps": [],
            "surprise": true
        });
        assert!(serde_json::from_value::<WorkflowDefinition>(raw).is_err());
    }

    #[test]
    fn test_condition_evaluation() {
        let mut state = BTreeMap::new();
        state.insert("a".to_string(), json!({"output": "x", "rows": 3}));

        assert!(Condition::Equals {
            key: "a/output".to_string(),
            value: json!("x"),
        }
        .evaluate(&state));
        assert!(Condition::Exists {
            key: "a/rows".to_string(),
        }
        .evaluate(&state));
        assert!(!Condition::Truthy {
            key: "b".to_string(),
        }
        .evaluate(&state));
        assert!(Condition::Not {
            condition: Box::new(Condition::Exists {
                key: "missing".to_string()
            }),
        }
        .evaluate(&state));
    }

    #[test]
    fn test_transitive_dependents() {
        let def = WorkflowDefinition::new("wf", "chain")
            .add_step(tool_step("a"))
            .add_step(tool_step("b").with_dependency("a"))
            .add_step(tool_step("c").with_dependency("b"))
            .add_step(tool_step("d"));
        assert_eq!(def.transitive_dependents("a"), vec!["b", "c"]);
        assert!(def.transitive_dependents("d").is_empty());
    }
}

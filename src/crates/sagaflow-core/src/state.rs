//! State algebra: schemas, merge rules and the reducer
//!
//! A workflow's state is an immutable JSON-object record. Steps never mutate
//! it directly; they return a sparse [`StateUpdate`] and the schema's reducer
//! folds it in according to each field's declared [`MergeRule`]:
//!
//! | Rule | Behavior |
//! |------|----------|
//! | [`MergeRule::Replace`] | New value overwrites the old (default) |
//! | [`MergeRule::Append`] | Sequences concatenate, order preserved |
//! | [`MergeRule::Merge`] | Mappings gain new keys, collisions take the new value |
//!
//! Reduction is pure and deterministic, which is what makes event-sourced
//! rebuilds possible: replaying the committed updates through
//! [`StateSchema::reduce`] reproduces the engine's in-memory state exactly.
//! The update-combining operator [`StateSchema::combine`] satisfies
//! `reduce(reduce(s, u1), u2) == reduce(s, combine(u1, u2))`.
//!
//! Merge rules are validated against the field's declared shape when the
//! schema is registered: `Append` on a non-sequence field is rejected with
//! diagnostic AGSR001, `Merge` on a non-mapping field with AGSR002.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{Result, WorkflowError};

/// How concurrent writes to a field are folded together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Last write wins
    Replace,
    /// Concatenate onto a sequence, order preserved, no de-duplication
    Append,
    /// Add keys into a mapping; colliding keys take the new value
    Merge,
}

/// Declared shape of a state field, checked against its merge rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldShape {
    Scalar,
    Sequence,
    Mapping,
}

#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    shape: FieldShape,
    rule: MergeRule,
}

/// A sparse state update: only the fields being changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateUpdate(pub Map<String, Value>);

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field assignment
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.0.insert(field.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Interpret a JSON value as an update; must be an object or null
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(WorkflowError::State(format!(
                "state update must be an object, got {other}"
            ))),
        }
    }
}

/// Immutable state record of one workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub fields: Map<String, Value>,
}

impl WorkflowState {
    /// Build the initial state from a JSON object (or null for empty)
    pub fn new(workflow_id: impl Into<String>, initial: Value) -> Result<Self> {
        let fields = match initial {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(WorkflowError::State(format!(
                    "initial state must be an object, got {other}"
                )))
            }
        };
        Ok(Self {
            workflow_id: workflow_id.into(),
            fields,
        })
    }

    pub fn empty(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            fields: Map::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

/// Field registry with per-field merge rules
///
/// Built once per state shape at program init and shared read-only across
/// every workflow definition that names it.
#[derive(Default)]
pub struct StateSchema {
    id: String,
    fields: HashMap<String, FieldSpec>,
}

impl StateSchema {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register a field, validating the merge rule against the shape
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        shape: FieldShape,
        rule: MergeRule,
    ) -> Result<()> {
        let name = name.into();
        match (rule, shape) {
            (MergeRule::Append, shape) if shape != FieldShape::Sequence => {
                return Err(WorkflowError::Validation(format!(
                    "AGSR001: append merge rule requires a sequence-typed field, \
                     but '{name}' is declared {shape:?}"
                )));
            }
            (MergeRule::Merge, shape) if shape != FieldShape::Mapping => {
                return Err(WorkflowError::Validation(format!(
                    "AGSR002: merge rule requires a mapping-typed field, \
                     but '{name}' is declared {shape:?}"
                )));
            }
            _ => {}
        }
        self.fields.insert(name, FieldSpec { shape, rule });
        Ok(())
    }

    /// Fluent variant of [`Self::add_field`]
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        shape: FieldShape,
        rule: MergeRule,
    ) -> Result<Self> {
        self.add_field(name, shape, rule)?;
        Ok(self)
    }

    /// Merge rule for a field; undeclared fields replace
    fn rule_for(&self, field: &str) -> MergeRule {
        self.fields
            .get(field)
            .map(|spec| spec.rule)
            .unwrap_or(MergeRule::Replace)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }

    /// Apply a sparse update, producing the next state
    ///
    /// Pure: the input state is untouched, fields absent from the update are
    /// carried over unchanged.
    pub fn reduce(&self, state: &WorkflowState, update: &StateUpdate) -> Result<WorkflowState> {
        let mut fields = state.fields.clone();
        for (name, incoming) in &update.0 {
            let current = fields.get(name);
            let next = apply_rule(self.rule_for(name), name, current, incoming)?;
            fields.insert(name.clone(), next);
        }
        Ok(WorkflowState {
            workflow_id: state.workflow_id.clone(),
            fields,
        })
    }

    /// Combine two updates so a single reduction replays both
    ///
    /// Field-wise: replace keeps the later value, append concatenates, merge
    /// folds mappings left-to-right.
    pub fn combine(&self, first: &StateUpdate, second: &StateUpdate) -> Result<StateUpdate> {
        let mut combined = first.0.clone();
        for (name, incoming) in &second.0 {
            let current = combined.get(name);
            let next = apply_rule(self.rule_for(name), name, current, incoming)?;
            combined.insert(name.clone(), next);
        }
        Ok(StateUpdate(combined))
    }
}

fn apply_rule(
    rule: MergeRule,
    field: &str,
    current: Option<&Value>,
    incoming: &Value,
) -> Result<Value> {
    match rule {
        MergeRule::Replace => Ok(incoming.clone()),
        MergeRule::Append => match (current, incoming) {
            (Some(Value::Array(curr)), Value::Array(upd)) => {
                let mut next = curr.clone();
                next.extend_from_slice(upd);
                Ok(Value::Array(next))
            }
            (Some(Value::Array(curr)), single) => {
                let mut next = curr.clone();
                next.push(single.clone());
                Ok(Value::Array(next))
            }
            (None | Some(Value::Null), Value::Array(upd)) => Ok(Value::Array(upd.clone())),
            (None | Some(Value::Null), single) => Ok(Value::Array(vec![single.clone()])),
            (Some(other), _) => Err(WorkflowError::State(format!(
                "append rule on field '{field}' requires a sequence, found {other}"
            ))),
        },
        MergeRule::Merge => match (current, incoming) {
            (Some(Value::Object(curr)), Value::Object(upd)) => {
                let mut next = curr.clone();
                for (key, value) in upd {
                    next.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(next))
            }
            (None | Some(Value::Null), Value::Object(upd)) => Ok(Value::Object(upd.clone())),
            (_, other) => Err(WorkflowError::State(format!(
                "merge rule on field '{field}' requires mappings, found {other}"
            ))),
        },
    }
}

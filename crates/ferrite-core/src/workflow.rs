//! Parsed workflow payloads and expression-evaluation contexts.
//!
//! The workflow-file parser is an external collaborator: it turns raw YAML
//! into one [`JobPayload`] per job (static matrices already multiplied out).
//! This crate only consumes the per-job documents it produces.

use crate::ids::JobKey;
use crate::status::Status;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single-job document produced by the workflow parser.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobPayload {
    /// Symbolic job key from the workflow file.
    pub key: JobKey,
    /// Human-readable job name (matrix cells carry their cell suffix).
    pub name: String,
    #[serde(default)]
    pub needs: Vec<JobKey>,
    /// Required runner labels.
    #[serde(default)]
    pub runs_on: Vec<String>,
    /// Raw concurrency-group expression text; empty means no group declared.
    #[serde(default)]
    pub raw_concurrency_group: String,
    #[serde(default)]
    pub raw_cancel_in_progress: bool,
    /// Raw strategy/matrix expression text; empty means no deferred matrix.
    #[serde(default)]
    pub raw_strategy: String,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_parallel: u32,
    /// Raw conditional expression (`if:`), evaluated by the external
    /// expression evaluator when dependencies did not all succeed.
    #[serde(default)]
    pub if_expr: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Variables declared for the job, handed through to step execution.
    #[serde(default)]
    pub variables: HashMap<String, String>,
    /// The serializable single-job document, re-parseable by the external
    /// parser and handed to runners verbatim.
    pub source: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    pub name: String,
    #[serde(default)]
    pub run: String,
}

/// Recorded outcome of a needed job, exposed to expressions as
/// `needs.<key>.result` and `needs.<key>.outputs.<name>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeedContext {
    pub result: Status,
    pub outputs: HashMap<String, String>,
}

/// Variable context handed to the external expression evaluator.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    pub variables: HashMap<String, String>,
    pub needs: HashMap<String, NeedContext>,
    /// Trigger-event payload, when evaluating trigger-scoped expressions.
    pub event: Option<serde_json::Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_need(mut self, key: impl Into<String>, need: NeedContext) -> Self {
        self.needs.insert(key.into(), need);
        self
    }

    /// Flatten the context into dotted variable keys
    /// (`needs.<key>.result`, `needs.<key>.outputs.<name>`).
    pub fn flatten(&self) -> HashMap<String, String> {
        let mut flat = self.variables.clone();
        for (key, need) in &self.needs {
            flat.insert(format!("needs.{key}.result"), need.result.to_string());
            for (name, value) in &need.outputs {
                flat.insert(format!("needs.{key}.outputs.{name}"), value.clone());
            }
        }
        flat
    }
}

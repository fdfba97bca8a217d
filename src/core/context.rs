//! Expression context - the values `${{ }}` templates and `if:` conditions see

use crate::core::{
    condition::{render_template, Condition, ExpressionError, Resolver, Value},
    matrix::Combination,
    state::JobResult,
    trigger::TriggerEvent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Flattened context: every value is stored under its full dotted path
/// (`github.ref`, `needs.build.result`, `steps.deploy.outputs.page_url`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpressionContext {
    values: HashMap<String, String>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a run: the `github` values of the event plus `vars`
    pub fn for_run(
        workflow: &str,
        event: &TriggerEvent,
        default_branch: &str,
        execution_id: Uuid,
        vars: &HashMap<String, String>,
    ) -> Self {
        let mut ctx = Self::new();
        ctx.set("github.workflow", workflow);
        ctx.set("github.event_name", event.kind.as_str());
        ctx.set("github.ref", &event.git_ref);
        ctx.set("github.ref_name", event.ref_name());
        ctx.set("github.sha", &event.sha);
        ctx.set("github.actor", &event.actor);
        ctx.set("github.default_branch", default_branch);
        ctx.set("github.run_id", &execution_id.to_string());
        if let Some(base) = &event.base_ref {
            ctx.set("github.base_ref", base);
        }
        if let Some(action) = &event.action {
            ctx.set("github.event.action", action);
        }
        for (key, value) in vars {
            ctx.set(&format!("vars.{}", key), value);
        }
        ctx
    }

    pub fn set(&mut self, path: &str, value: &str) {
        self.values.insert(path.to_string(), value.to_string());
    }

    pub fn get(&self, path: &str) -> Option<&String> {
        self.values.get(path)
    }

    pub fn set_matrix(&mut self, combination: &Combination) {
        for (key, value) in combination.iter() {
            self.set(&format!("matrix.{}", key), value);
        }
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.set(&format!("env.{}", key), value);
    }

    /// Record a predecessor job's result and outputs under `needs.<job>`
    pub fn set_need(&mut self, job_id: &str, result: JobResult, outputs: &HashMap<String, String>) {
        self.set(&format!("needs.{}.result", job_id), result.as_str());
        for (key, value) in outputs {
            self.set(&format!("needs.{}.outputs.{}", job_id, key), value);
        }
    }

    /// Record a finished step under `steps.<id>`
    pub fn set_step(&mut self, step_id: &str, outcome: &str, outputs: &HashMap<String, String>) {
        self.set(&format!("steps.{}.outcome", step_id), outcome);
        for (key, value) in outputs {
            self.set(&format!("steps.{}.outputs.{}", step_id, key), value);
        }
    }

    /// Render a template string against this context
    pub fn render(&self, template: &str) -> Result<String, ExpressionError> {
        render_template(template, self)
    }

    pub fn evaluate(&self, condition: &Condition) -> bool {
        condition.evaluate(self)
    }

    /// Every `env.*` entry, keyed by variable name
    pub fn env_vars(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("env.").map(|name| (name.to_string(), v.clone())))
            .collect()
    }
}

impl Resolver for ExpressionContext {
    fn resolve(&self, path: &str) -> Value {
        self.values
            .get(path)
            .map(|v| Value::String(v.clone()))
            .unwrap_or(Value::Null)
    }
}

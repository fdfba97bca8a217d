//! Workflow domain model

use crate::core::{
    config::WorkflowConfig,
    job::{ConcurrencyPolicy, Job, JobDefaults, JobInstance},
    state::{JobResult, JobState, RunState},
    trigger::{TriggerEvent, Triggers},
};
use anyhow::Result;
use std::collections::{HashMap, HashSet};

/// A loaded workflow with its expanded job instances
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Workflow name
    pub name: String,

    /// Environment shared by every job
    pub env: HashMap<String, String>,

    pub triggers: Triggers,

    /// Workflow-level concurrency group
    pub concurrency: Option<ConcurrencyPolicy>,

    /// Jobs indexed by ID
    pub jobs: HashMap<String, Job>,

    /// Job instances indexed by instance ID
    pub instances: HashMap<String, JobInstance>,

    /// Run state
    pub state: RunState,

    /// Job IDs in dependency order
    execution_order: Vec<String>,
}

impl Workflow {
    /// Create a workflow from configuration
    pub fn from_config(config: &WorkflowConfig) -> Result<Self> {
        let defaults = JobDefaults {
            timeout_secs: config
                .default_timeout_secs
                .unwrap_or(JobDefaults::default().timeout_secs),
        };

        let mut jobs = HashMap::new();
        let mut instances = HashMap::new();
        for job_config in &config.jobs {
            let job = Job::from_config(job_config, &defaults)?;
            for instance in job.instances() {
                instances.insert(instance.id.clone(), instance);
            }
            jobs.insert(job.id.clone(), job);
        }

        let declared: Vec<&str> = config.jobs.iter().map(|j| j.id.as_str()).collect();
        let execution_order = Self::topological_sort(&jobs, &declared);

        Ok(Workflow {
            name: config.name.clone(),
            env: config.env.clone(),
            triggers: config.triggers()?,
            concurrency: config.concurrency.as_ref().map(ConcurrencyPolicy::from_config),
            jobs,
            instances,
            state: RunState::new(),
            execution_order,
        })
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn instance(&self, id: &str) -> Option<&JobInstance> {
        self.instances.get(id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut JobInstance> {
        self.instances.get_mut(id)
    }

    /// Instances of a job, in matrix order
    pub fn instances_of(&self, job_id: &str) -> Vec<&JobInstance> {
        let mut instances: Vec<&JobInstance> = self
            .instances
            .values()
            .filter(|i| i.job_id == job_id)
            .collect();
        let order: Vec<String> = self
            .jobs
            .get(job_id)
            .map(|job| job.instances().into_iter().map(|i| i.id).collect())
            .unwrap_or_default();
        instances.sort_by_key(|i| order.iter().position(|id| *id == i.id));
        instances
    }

    /// Combined result of a job; `None` while any instance is unfinished
    pub fn job_result(&self, job_id: &str) -> Option<JobResult> {
        let instances = self.instances_of(job_id);
        if instances.is_empty() {
            return None;
        }
        let mut results = Vec::with_capacity(instances.len());
        for instance in instances {
            results.push(instance.state.result()?);
        }
        JobResult::combine(results)
    }

    /// Outputs of a job, merged across its successful instances
    pub fn job_outputs(&self, job_id: &str) -> HashMap<String, String> {
        let mut outputs = HashMap::new();
        for instance in self.instances_of(job_id) {
            if matches!(instance.state, JobState::Completed { .. }) {
                outputs.extend(instance.outputs.clone());
            }
        }
        outputs
    }

    /// Pending instances whose `needs` are all resolved, in dependency order
    pub fn ready_instances(&self) -> Vec<&JobInstance> {
        self.execution_order
            .iter()
            .filter_map(|job_id| self.jobs.get(job_id))
            .filter(|job| job.needs.iter().all(|dep| self.job_result(dep).is_some()))
            .flat_map(|job| self.instances_of(&job.id))
            .filter(|instance| matches!(instance.state, JobState::Pending))
            .collect()
    }

    /// Get running instances
    pub fn running_instances(&self) -> Vec<&JobInstance> {
        self.instances
            .values()
            .filter(|i| matches!(i.state, JobState::Running { .. }))
            .collect()
    }

    /// Check if any instance failed
    pub fn has_failed(&self) -> bool {
        self.instances
            .values()
            .any(|i| matches!(i.state, JobState::Failed { .. }))
    }

    pub fn is_triggered_by(&self, event: &TriggerEvent) -> bool {
        self.triggers.matches(event)
    }

    /// Get the execution order
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Topologically sort jobs; ties keep declaration order
    fn topological_sort(jobs: &HashMap<String, Job>, declared: &[&str]) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut temp_visited = HashSet::new();

        for job_id in declared {
            if !visited.contains(*job_id) {
                Self::visit(job_id, jobs, &mut visited, &mut temp_visited, &mut result);
            }
        }

        result
    }

    fn visit(
        job_id: &str,
        jobs: &HashMap<String, Job>,
        visited: &mut HashSet<String>,
        temp_visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(job_id) || temp_visited.contains(job_id) {
            return;
        }

        temp_visited.insert(job_id.to_string());

        if let Some(job) = jobs.get(job_id) {
            for dep in &job.needs {
                Self::visit(dep, jobs, visited, temp_visited, result);
            }
        }

        temp_visited.remove(job_id);
        visited.insert(job_id.to_string());
        result.push(job_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const CI: &str = r#"
name: ci
on: [push, pull_request]
jobs:
  - id: test
    needs: [lint-format]
    strategy:
      matrix:
        python-version: ["3.10", "3.11", "3.12"]
    steps:
      - run: pytest
  - id: lint-format
    needs: [lint-check]
    steps:
      - run: ruff format --check
  - id: lint-check
    steps:
      - run: ruff check
"#;

    fn completed() -> JobState {
        JobState::Completed {
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_topological_sort() {
        let workflow = WorkflowConfig::from_yaml(CI).unwrap().to_workflow().unwrap();
        assert_eq!(workflow.execution_order(), &["lint-check", "lint-format", "test"]);
        assert_eq!(workflow.instances.len(), 5);
    }

    #[test]
    fn test_ready_instances_follow_needs() {
        let mut workflow = WorkflowConfig::from_yaml(CI).unwrap().to_workflow().unwrap();

        let ready: Vec<&str> = workflow.ready_instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ready, vec!["lint-check"]);

        workflow.instance_mut("lint-check").unwrap().state = completed();
        workflow.instance_mut("lint-format").unwrap().state = completed();

        let ready: Vec<&str> = workflow.ready_instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ready, vec!["test (3.10)", "test (3.11)", "test (3.12)"]);
    }

    #[test]
    fn test_job_result_combines_instances() {
        let mut workflow = WorkflowConfig::from_yaml(CI).unwrap().to_workflow().unwrap();
        workflow.instance_mut("test (3.10)").unwrap().state = completed();
        workflow.instance_mut("test (3.11)").unwrap().state = JobState::Failed {
            error: "2 tests failed".to_string(),
            started_at: Utc::now(),
            failed_at: Utc::now(),
        };
        assert_eq!(workflow.job_result("test"), None);

        workflow.instance_mut("test (3.12)").unwrap().state = completed();
        assert_eq!(workflow.job_result("test"), Some(JobResult::Failure));
        assert!(workflow.has_failed());
    }
}

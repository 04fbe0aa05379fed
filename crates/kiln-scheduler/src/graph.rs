//! Job graph construction and validation.

use kiln_core::job::{ExecutableJob, ExecutableStep, StepKind};
use kiln_core::pipeline::{ActionRef, Invocation, JobSpec, PipelineSpec, StepSpec};
use kiln_core::ports::ActionCatalog;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Pipeline declares no jobs")]
    EmptyPipeline,
    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),
    #[error("Job `{0}` declares no steps")]
    EmptyJob(String),
    #[error("Job `{job}` step {step}: command is empty")]
    EmptyCommand { job: String, step: usize },
    #[error("Job `{job}` step {step}: {reason}")]
    InvalidAction {
        job: String,
        step: usize,
        reason: String,
    },
    #[error("Job `{job}` step {step}: no handler for action `{action}`")]
    UnresolvedAction {
        job: String,
        step: usize,
        action: String,
    },
    #[error("Job `{job}`: timeout must be at least one minute")]
    InvalidTimeout { job: String },
    #[error("Job `{job}` needs unknown job `{dependency}`")]
    UnknownDependency { job: String, dependency: String },
    #[error("Job `{0}` depends on itself")]
    SelfDependency(String),
    #[error("Cycle detected in job dependencies")]
    CycleDetected,
}

impl From<GraphError> for kiln_core::Error {
    fn from(err: GraphError) -> Self {
        kiln_core::Error::Spec(err.to_string())
    }
}

/// Validated jobs plus their dependency edges.
#[derive(Debug)]
pub struct JobGraph {
    jobs: Vec<ExecutableJob>,
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl JobGraph {
    /// Jobs in declaration order.
    pub fn jobs(&self) -> &[ExecutableJob] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<ExecutableJob> {
        self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn job(&self, name: &str) -> Option<&ExecutableJob> {
        self.name_to_index
            .get(name)
            .and_then(|&idx| self.graph.node_weight(idx))
            .map(|&i| &self.jobs[i])
    }

    /// Jobs that must finish before `name` may start.
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.job(name).map(|j| j.needs.as_slice()).unwrap_or_default()
    }

    /// Jobs that wait on `name`.
    pub fn dependents(&self, name: &str) -> Vec<&ExecutableJob> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                let mut dependents: Vec<&ExecutableJob> = self
                    .graph
                    .neighbors_directed(idx, petgraph::Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .map(|&i| &self.jobs[i])
                    .collect();
                dependents.sort_by_key(|j| j.index);
                dependents
            })
            .unwrap_or_default()
    }

    /// Jobs with no dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&ExecutableJob> {
        self.jobs.iter().filter(|j| j.needs.is_empty()).collect()
    }

    pub fn topological_order(&self) -> Result<Vec<&ExecutableJob>, GraphError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .map(|&i| &self.jobs[i])
                    .collect()
            })
            .map_err(|_| GraphError::CycleDetected)
    }
}

/// Builds a [`JobGraph`] from a declaration.
#[derive(Default)]
pub struct JobGraphBuilder {
    catalog: Option<Arc<dyn ActionCatalog>>,
}

impl JobGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject action steps the catalog cannot run.
    pub fn with_catalog(mut self, catalog: Arc<dyn ActionCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(&self, spec: &PipelineSpec) -> Result<JobGraph, GraphError> {
        if spec.jobs.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }

        let mut jobs = Vec::with_capacity(spec.jobs.len());
        for (index, job) in spec.jobs.iter().enumerate() {
            jobs.push(self.build_job(index, job)?);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for job in &jobs {
            let idx = graph.add_node(job.index);
            if name_to_index.insert(job.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateJob(job.name.clone()));
            }
        }

        for job in &jobs {
            let job_idx = name_to_index[&job.name];
            for dep in &job.needs {
                if dep == &job.name {
                    return Err(GraphError::SelfDependency(job.name.clone()));
                }
                let dep_idx = name_to_index.get(dep).ok_or_else(|| GraphError::UnknownDependency {
                    job: job.name.clone(),
                    dependency: dep.clone(),
                })?;
                graph.update_edge(*dep_idx, job_idx, ());
            }
        }

        let job_graph = JobGraph {
            jobs,
            graph,
            name_to_index,
        };

        // Verify no cycles
        job_graph.topological_order()?;

        Ok(job_graph)
    }

    fn build_job(&self, index: usize, job: &JobSpec) -> Result<ExecutableJob, GraphError> {
        if job.steps.is_empty() {
            return Err(GraphError::EmptyJob(job.name.clone()));
        }

        let steps = job
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| self.build_step(&job.name, i, step))
            .collect::<Result<Vec<_>, _>>()?;

        let mut needs: Vec<String> = Vec::with_capacity(job.needs.len());
        for dep in &job.needs {
            if !needs.contains(dep) {
                needs.push(dep.clone());
            }
        }

        Ok(ExecutableJob {
            index,
            name: job.name.clone(),
            runner_label: job.runner_label.clone(),
            needs,
            env: job.env.clone(),
            timeout: minutes(job.timeout_minutes, &job.name)?,
            steps,
        })
    }

    fn build_step(&self, job: &str, index: usize, step: &StepSpec) -> Result<ExecutableStep, GraphError> {
        let kind = match &step.invocation {
            Invocation::Command(command) => {
                if command.run.trim().is_empty() {
                    return Err(GraphError::EmptyCommand {
                        job: job.to_string(),
                        step: index,
                    });
                }
                StepKind::Command {
                    run: command.run.clone(),
                    shell: command.shell.clone(),
                }
            }
            Invocation::Action(invocation) => {
                let action =
                    ActionRef::parse(&invocation.uses).map_err(|e| GraphError::InvalidAction {
                        job: job.to_string(),
                        step: index,
                        reason: e.to_string(),
                    })?;
                if let Some(catalog) = &self.catalog {
                    if !catalog.resolves(&action) {
                        return Err(GraphError::UnresolvedAction {
                            job: job.to_string(),
                            step: index,
                            action: action.to_string(),
                        });
                    }
                }
                StepKind::Action {
                    action,
                    with: invocation.with.clone(),
                }
            }
        };

        Ok(ExecutableStep {
            index,
            name: step.display_name(),
            env: step.env.clone(),
            timeout: minutes(step.timeout_minutes, job)?,
            kind,
        })
    }
}

fn minutes(value: Option<u64>, job: &str) -> Result<Option<Duration>, GraphError> {
    match value {
        None => Ok(None),
        Some(0) => Err(GraphError::InvalidTimeout {
            job: job.to_string(),
        }),
        Some(m) => Ok(Some(Duration::from_secs(m.saturating_mul(60)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::pipeline::{JobSpec, StepSpec};

    fn job(name: &str, needs: Vec<&str>) -> JobSpec {
        JobSpec::new(name)
            .with_needs(needs)
            .with_step(StepSpec::command("echo test"))
    }

    struct OnlyCheckout;

    impl ActionCatalog for OnlyCheckout {
        fn resolves(&self, action: &ActionRef) -> bool {
            action.name == "actions/checkout"
        }
    }

    #[test]
    fn test_independent_jobs_keep_declaration_order() {
        let spec = PipelineSpec::new()
            .with_job(job("check", vec![]))
            .with_job(job("clippy", vec![]))
            .with_job(job("fmt", vec![]));

        let graph = JobGraphBuilder::new().build(&spec).unwrap();
        let names: Vec<&str> = graph.jobs().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["check", "clippy", "fmt"]);
        assert_eq!(graph.roots().len(), 3);
    }

    #[test]
    fn test_linear_graph() {
        let spec = PipelineSpec::new()
            .with_job(job("build", vec![]))
            .with_job(job("test", vec!["build"]))
            .with_job(job("deploy", vec!["test"]));

        let graph = JobGraphBuilder::new().build(&spec).unwrap();

        let roots = graph.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "build");
        assert_eq!(graph.dependencies("deploy"), ["test".to_string()]);

        let order: Vec<&str> = graph
            .topological_order()
            .unwrap()
            .iter()
            .map(|j| j.name.as_str())
            .collect();
        assert_eq!(order, vec!["build", "test", "deploy"]);
    }

    #[test]
    fn test_fan_out() {
        let spec = PipelineSpec::new()
            .with_job(job("build", vec![]))
            .with_job(job("unit", vec!["build"]))
            .with_job(job("integration", vec!["build"]))
            .with_job(job("deploy", vec!["unit", "integration"]));

        let graph = JobGraphBuilder::new().build(&spec).unwrap();
        let dependents: Vec<&str> = graph.dependents("build").iter().map(|j| j.name.as_str()).collect();
        assert_eq!(dependents, vec!["unit", "integration"]);
    }

    #[test]
    fn test_duplicate_job_names() {
        let spec = PipelineSpec::new()
            .with_job(job("check", vec![]))
            .with_job(job("check", vec![]));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::DuplicateJob(name)) if name == "check"
        ));
    }

    #[test]
    fn test_duplicate_job_names_from_yaml() {
        let spec = PipelineSpec::from_yaml(
            r#"
on: push
jobs:
  check:
    steps:
      - run: cargo check
  check:
    steps:
      - run: cargo check --release
"#,
        )
        .unwrap();
        assert_eq!(spec.jobs.len(), 2);
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::DuplicateJob(name)) if name == "check"
        ));
    }

    #[test]
    fn test_empty_pipeline() {
        assert!(matches!(
            JobGraphBuilder::new().build(&PipelineSpec::new()),
            Err(GraphError::EmptyPipeline)
        ));
    }

    #[test]
    fn test_job_without_steps() {
        let spec = PipelineSpec::new().with_job(JobSpec::new("empty"));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::EmptyJob(_))
        ));
    }

    #[test]
    fn test_blank_command() {
        let spec =
            PipelineSpec::new().with_job(JobSpec::new("check").with_step(StepSpec::command("  \n")));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::EmptyCommand { step: 0, .. })
        ));
    }

    #[test]
    fn test_malformed_action() {
        let spec = PipelineSpec::new()
            .with_job(JobSpec::new("check").with_step(StepSpec::action("actions/checkout")));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::InvalidAction { .. })
        ));
    }

    #[test]
    fn test_unresolved_action_with_catalog() {
        let spec = PipelineSpec::new().with_job(
            JobSpec::new("check")
                .with_step(StepSpec::action("actions/checkout@v4"))
                .with_step(StepSpec::action("actions/cache@v4")),
        );

        // Without a catalog any well-formed reference is accepted.
        assert!(JobGraphBuilder::new().build(&spec).is_ok());

        let result = JobGraphBuilder::new()
            .with_catalog(Arc::new(OnlyCheckout))
            .build(&spec);
        assert!(matches!(
            result,
            Err(GraphError::UnresolvedAction { step: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_and_self_dependencies() {
        let spec = PipelineSpec::new().with_job(job("test", vec!["build"]));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::UnknownDependency { .. })
        ));

        let spec = PipelineSpec::new().with_job(job("test", vec!["test"]));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::SelfDependency(_))
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let spec = PipelineSpec::new()
            .with_job(job("a", vec!["b"]))
            .with_job(job("b", vec!["a"]));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::CycleDetected)
        ));
    }

    #[test]
    fn test_timeouts_converted() {
        let spec = PipelineSpec::new().with_job(
            JobSpec::new("check")
                .with_timeout_minutes(10)
                .with_step(StepSpec::command("cargo check").with_timeout_minutes(2)),
        );
        let graph = JobGraphBuilder::new().build(&spec).unwrap();
        let check = graph.job("check").unwrap();
        assert_eq!(check.timeout, Some(Duration::from_secs(600)));
        assert_eq!(check.steps[0].timeout, Some(Duration::from_secs(120)));

        let spec = PipelineSpec::new()
            .with_job(JobSpec::new("check").with_step(StepSpec::command("x").with_timeout_minutes(0)));
        assert!(matches!(
            JobGraphBuilder::new().build(&spec),
            Err(GraphError::InvalidTimeout { .. })
        ));
    }

    #[test]
    fn test_graph_errors_are_spec_errors() {
        let err: kiln_core::Error = GraphError::CycleDetected.into();
        assert!(err.is_fatal());
    }
}

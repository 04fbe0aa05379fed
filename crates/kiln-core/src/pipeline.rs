//! Pipeline declaration types.
//!
//! These types represent the user-authored pipeline YAML. The loader accepts
//! both the native spelling (`triggers`, `runner_label`) and the GitHub
//! workflow spelling (`on`, `runs-on`, `timeout-minutes`) of the same keys.

use crate::{Error, Result};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

/// A parsed pipeline declaration. Read-only once loaded.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct PipelineSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "on", default, deserialize_with = "deserialize_triggers")]
    #[schemars(with = "Option<TriggerDeclaration>")]
    pub triggers: Vec<TriggerRule>,
    /// Jobs in declaration order. Duplicate names are kept so that graph
    /// construction can reject them.
    #[serde(deserialize_with = "deserialize_jobs")]
    #[schemars(with = "IndexMap<String, JobSpec>")]
    pub jobs: Vec<JobSpec>,
}

impl PipelineSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a declaration from YAML.
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read and parse a declaration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Spec(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn with_trigger(mut self, rule: TriggerRule) -> Self {
        self.triggers.push(rule);
        self
    }

    pub fn with_job(mut self, job: JobSpec) -> Self {
        self.jobs.push(job);
        self
    }

    /// JSON schema of the declaration format.
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(PipelineSpec)
    }

    /// Look up a job by name (first match in declaration order).
    pub fn job(&self, name: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition under which the pipeline runs.
///
/// `branches: None` means no filter: every branch matches. `Some` restricts
/// matches to the listed patterns only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRule {
    pub event: EventKind,
    pub branches: Option<Vec<String>>,
    pub branches_ignore: Vec<String>,
}

impl TriggerRule {
    pub fn new(event: EventKind) -> Self {
        Self {
            event,
            branches: None,
            branches_ignore: Vec::new(),
        }
    }

    pub fn push() -> Self {
        Self::new(EventKind::Push)
    }

    pub fn pull_request() -> Self {
        Self::new(EventKind::PullRequest)
    }

    pub fn with_branches<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_branches_ignore<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.branches_ignore = patterns.into_iter().map(Into::into).collect();
        self
    }
}

/// Per-kind filter as written in YAML.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
struct TriggerFilter {
    #[serde(default)]
    branches: Option<Vec<String>>,
    #[serde(default, alias = "branches-ignore")]
    branches_ignore: Vec<String>,
}

/// The accepted shapes of the `triggers` key.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(untagged)]
enum TriggerDeclaration {
    Single(EventKind),
    Kinds(Vec<EventKind>),
    Filters(IndexMap<EventKind, Option<TriggerFilter>>),
}

fn deserialize_triggers<'de, D>(deserializer: D) -> std::result::Result<Vec<TriggerRule>, D::Error>
where
    D: Deserializer<'de>,
{
    let declaration = Option::<TriggerDeclaration>::deserialize(deserializer)?;
    let rules = match declaration {
        None => Vec::new(),
        Some(TriggerDeclaration::Single(kind)) => vec![TriggerRule::new(kind)],
        Some(TriggerDeclaration::Kinds(kinds)) => kinds.into_iter().map(TriggerRule::new).collect(),
        Some(TriggerDeclaration::Filters(filters)) => filters
            .into_iter()
            .map(|(event, filter)| {
                let filter = filter.unwrap_or_default();
                TriggerRule {
                    event,
                    branches: filter.branches,
                    branches_ignore: filter.branches_ignore,
                }
            })
            .collect(),
    };
    Ok(rules)
}

fn deserialize_jobs<'de, D>(deserializer: D) -> std::result::Result<Vec<JobSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<JobSpec>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of job name to job definition")
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut jobs = Vec::new();
            while let Some((name, mut job)) = map.next_entry::<String, JobSpec>()? {
                job.name = name;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

/// Accepts scalar values (strings, numbers, booleans) for environment maps.
fn deserialize_env<'de, D>(deserializer: D) -> std::result::Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = IndexMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                serde_json::Value::Bool(_) | serde_json::Value::Number(_) => value.to_string(),
                other => {
                    return Err(de::Error::custom(format!(
                        "env value for `{}` must be a scalar, got {}",
                        key, other
                    )));
                }
            };
            Ok((key, value))
        })
        .collect()
}

/// `needs: build` and `needs: [build, lint]` are both accepted.
fn deserialize_needs<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

/// An independently schedulable unit of work.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Taken from the mapping key.
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_runner_label", alias = "runs-on")]
    pub runner_label: String,
    #[serde(default, deserialize_with = "deserialize_needs")]
    #[schemars(with = "Vec<String>")]
    pub needs: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_env")]
    #[schemars(with = "IndexMap<String, String>")]
    pub env: IndexMap<String, String>,
    /// Limit on the whole job, in minutes. Also the default limit for each
    /// step that sets none of its own.
    #[serde(default, alias = "timeout-minutes")]
    pub timeout_minutes: Option<u64>,
    #[schemars(with = "Vec<RawStep>")]
    pub steps: Vec<StepSpec>,
}

fn default_runner_label() -> String {
    "local".to_string()
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runner_label: default_runner_label(),
            needs: Vec::new(),
            env: IndexMap::new(),
            timeout_minutes: None,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

/// Step as written in YAML, before `uses`/`run` are resolved into an
/// [`Invocation`].
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub(crate) struct RawStep {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    #[schemars(with = "IndexMap<String, serde_json::Value>")]
    with: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default, deserialize_with = "deserialize_env")]
    #[schemars(with = "IndexMap<String, String>")]
    env: IndexMap<String, String>,
    #[serde(default, alias = "timeout-minutes")]
    timeout_minutes: Option<u64>,
}

/// The smallest unit of execution within a job.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawStep")]
pub struct StepSpec {
    pub name: Option<String>,
    pub env: IndexMap<String, String>,
    pub timeout_minutes: Option<u64>,
    pub invocation: Invocation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Action(ActionInvocation),
    Command(CommandInvocation),
}

/// Reference to an external reusable action plus its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    /// `identifier@version`, validated by the graph builder.
    pub uses: String,
    pub with: IndexMap<String, serde_json::Value>,
}

/// A literal shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandInvocation {
    pub run: String,
    pub shell: Option<String>,
}

impl TryFrom<RawStep> for StepSpec {
    type Error = String;

    fn try_from(raw: RawStep) -> std::result::Result<Self, Self::Error> {
        let invocation = match (raw.uses, raw.run) {
            (Some(uses), None) => Invocation::Action(ActionInvocation {
                uses,
                with: raw.with,
            }),
            (None, Some(run)) => Invocation::Command(CommandInvocation {
                run,
                shell: raw.shell,
            }),
            (Some(_), Some(_)) => {
                return Err("a step must declare either `uses` or `run`, not both".to_string());
            }
            (None, None) => {
                return Err("a step must declare one of `uses` or `run`".to_string());
            }
        };

        Ok(StepSpec {
            name: raw.name,
            env: raw.env,
            timeout_minutes: raw.timeout_minutes,
            invocation,
        })
    }
}

impl StepSpec {
    pub fn command(run: impl Into<String>) -> Self {
        Self::from_invocation(Invocation::Command(CommandInvocation {
            run: run.into(),
            shell: None,
        }))
    }

    pub fn action(uses: impl Into<String>) -> Self {
        Self::from_invocation(Invocation::Action(ActionInvocation {
            uses: uses.into(),
            with: IndexMap::new(),
        }))
    }

    fn from_invocation(invocation: Invocation) -> Self {
        Self {
            name: None,
            env: IndexMap::new(),
            timeout_minutes: None,
            invocation,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an action parameter. Ignored for command steps.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        if let Invocation::Action(action) = &mut self.invocation {
            action.with.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }

    /// Name used in reports: the declared name, else the action reference,
    /// else the first line of the command.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.invocation {
            Invocation::Action(action) => action.uses.clone(),
            Invocation::Command(command) => {
                let first = command.run.lines().next().unwrap_or("").trim();
                if first.chars().count() > 60 {
                    let truncated: String = first.chars().take(57).collect();
                    format!("{}...", truncated)
                } else {
                    first.to_string()
                }
            }
        }
    }
}

/// A parsed `identifier@version` action reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionRef {
    pub name: String,
    pub version: String,
}

impl ActionRef {
    /// Parse an action reference (e.g. `actions/checkout@v4`).
    pub fn parse(s: &str) -> Result<Self> {
        let (name, version) = s
            .split_once('@')
            .ok_or_else(|| Error::spec(format!("action `{}` is missing an @version", s)))?;
        let name = name.trim();
        let version = version.trim();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(Error::spec(format!("action `{}` has an invalid identifier", s)));
        }
        if version.is_empty() || version.chars().any(char::is_whitespace) {
            return Err(Error::spec(format!("action `{}` has an invalid version", s)));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

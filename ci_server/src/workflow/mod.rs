//! Workflow definitions: the GitHub Actions subset the runner understands.

pub mod expr;
pub mod graph;
pub mod trigger;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

pub use graph::{GraphError, JobGraph};
pub use trigger::{BranchFilter, Event, Triggers};

/// The BIRTHNON test + deploy workflow, built into the binary.
pub const BIRTHNON_WORKFLOW: &str = include_str!("../../workflows/birthnon.yml");

static SECRET_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"secrets\.([A-Za-z_][A-Za-z0-9_]*)").unwrap());

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("workflow defines no jobs")]
    EmptyWorkflow,

    #[error("job '{job}' step {index}: {message}")]
    InvalidStep {
        job: String,
        index: usize,
        message: String,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub name: String,
    pub on: Triggers,
    #[serde(default, deserialize_with = "string_map")]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub defaults: Defaults,
    pub jobs: IndexMap<String, Job>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub run: RunDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunDefaults {
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Job {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub runs_on: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub needs: Vec<String>,
    #[serde(rename = "if", default, deserialize_with = "optional_scalar")]
    pub if_cond: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub defaults: Defaults,
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    pub id: Option<String>,
    pub name: Option<String>,
    pub uses: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub with: IndexMap<String, String>,
    #[serde(default, deserialize_with = "optional_scalar")]
    pub run: Option<String>,
    #[serde(default, deserialize_with = "string_map")]
    pub env: IndexMap<String, String>,
    #[serde(rename = "if", default, deserialize_with = "optional_scalar")]
    pub if_cond: Option<String>,
    pub working_directory: Option<String>,
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Step {
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return format!("Run {uses}");
        }
        let first_line = self
            .run
            .as_deref()
            .and_then(|r| r.lines().find(|l| !l.trim().is_empty()))
            .unwrap_or_default()
            .trim();
        format!("Run {first_line}")
    }
}

impl Job {
    pub fn display_name(&self, id: &str) -> String {
        self.name.clone().unwrap_or_else(|| id.to_string())
    }

    /// Working directory for `run` steps: step, then job, then workflow default.
    pub fn working_directory<'a>(
        &'a self,
        step: &'a Step,
        workflow: &'a Workflow,
    ) -> Option<&'a str> {
        step.working_directory
            .as_deref()
            .or(self.defaults.run.working_directory.as_deref())
            .or(workflow.defaults.run.working_directory.as_deref())
    }
}

impl Workflow {
    pub fn from_yaml(source: &str) -> Result<Self, WorkflowError> {
        let workflow: Workflow = serde_yaml::from_str(source)?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn load(path: &Path) -> Result<Self, WorkflowError> {
        let source = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    /// The embedded BIRTHNON workflow.
    pub fn birthnon() -> Result<Self, WorkflowError> {
        Self::from_yaml(BIRTHNON_WORKFLOW)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.jobs.is_empty() {
            return Err(WorkflowError::EmptyWorkflow);
        }

        for (id, job) in &self.jobs {
            if job.steps.is_empty() {
                return Err(WorkflowError::InvalidStep {
                    job: id.clone(),
                    index: 0,
                    message: "job has no steps".to_string(),
                });
            }
            for (index, step) in job.steps.iter().enumerate() {
                let message = match (&step.uses, &step.run) {
                    (Some(_), Some(_)) => "step has both `uses` and `run`",
                    (None, None) => "step needs `uses` or `run`",
                    _ => continue,
                };
                return Err(WorkflowError::InvalidStep {
                    job: id.clone(),
                    index: index + 1,
                    message: message.to_string(),
                });
            }
        }

        JobGraph::from_workflow(self)?;
        Ok(())
    }

    /// Every secret referenced as `secrets.NAME`, sorted.
    pub fn referenced_secrets(&self) -> Vec<String> {
        let mut texts: Vec<&str> = self.env.values().map(String::as_str).collect();
        for job in self.jobs.values() {
            texts.extend(job.if_cond.as_deref());
            texts.extend(job.env.values().map(String::as_str));
            for step in &job.steps {
                texts.extend(step.run.as_deref());
                texts.extend(step.if_cond.as_deref());
                texts.extend(step.with.values().map(String::as_str));
                texts.extend(step.env.values().map(String::as_str));
            }
        }

        let names: BTreeSet<String> = texts
            .iter()
            .flat_map(|text| SECRET_REF.captures_iter(text))
            .map(|caps| caps[1].to_string())
            .collect();
        names.into_iter().collect()
    }
}

// ── Lenient scalar deserialisation (YAML numbers/bools as strings) ──

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl From<Scalar> for String {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::String(s) => s,
            Scalar::Bool(b) => b.to_string(),
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
        }
    }
}

fn string_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<IndexMap<String, Scalar>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into()))
        .collect())
}

fn optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Scalar> = Option::deserialize(deserializer)?;
    Ok(raw.map(String::from))
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let raw: Option<OneOrMany> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

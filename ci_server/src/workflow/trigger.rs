//! Trigger rules: which events start a workflow run.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An event that may start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Push {
        branch: String,
        sha: String,
    },
    PullRequest {
        number: u64,
        base_branch: String,
        head_branch: String,
        sha: String,
    },
    Manual {
        branch: String,
        sha: String,
    },
}

impl Event {
    /// Event name as exposed through `github.event_name`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Push { .. } => "push",
            Event::PullRequest { .. } => "pull_request",
            Event::Manual { .. } => "workflow_dispatch",
        }
    }

    /// Fully qualified ref the run is for (`github.ref`).
    pub fn git_ref(&self) -> String {
        match self {
            Event::Push { branch, .. } | Event::Manual { branch, .. } => {
                format!("refs/heads/{branch}")
            }
            Event::PullRequest { number, .. } => format!("refs/pull/{number}/merge"),
        }
    }

    /// Short ref name (`github.ref_name`).
    pub fn ref_name(&self) -> String {
        match self {
            Event::Push { branch, .. } | Event::Manual { branch, .. } => branch.clone(),
            Event::PullRequest { number, .. } => format!("{number}/merge"),
        }
    }

    /// Branch whose contents the run checks out.
    pub fn branch(&self) -> &str {
        match self {
            Event::Push { branch, .. } | Event::Manual { branch, .. } => branch,
            Event::PullRequest { head_branch, .. } => head_branch,
        }
    }

    pub fn sha(&self) -> &str {
        match self {
            Event::Push { sha, .. } | Event::Manual { sha, .. } => sha,
            Event::PullRequest { sha, .. } => sha,
        }
    }
}

/// Branch filter of a `push` / `pull_request` trigger.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BranchFilter {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub branches_ignore: Vec<String>,
}

impl BranchFilter {
    /// Match a branch. Patterns are evaluated in order; a `!` prefix negates.
    pub fn matches(&self, branch: &str) -> bool {
        if self.branches_ignore.iter().any(|p| branch_glob(p, branch)) {
            return false;
        }
        if self.branches.is_empty() {
            return true;
        }

        let mut matched = false;
        for pattern in &self.branches {
            match pattern.strip_prefix('!') {
                Some(negated) if branch_glob(negated, branch) => matched = false,
                Some(_) => {}
                None if branch_glob(pattern, branch) => matched = true,
                None => {}
            }
        }
        matched
    }
}

fn branch_glob(pattern: &str, branch: &str) -> bool {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(pattern) {
        Ok(compiled) => compiled.matches_with(branch, options),
        Err(_) => pattern == branch,
    }
}

/// The `on:` block of a workflow.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawTriggers")]
pub struct Triggers {
    pub push: Option<BranchFilter>,
    pub pull_request: Option<BranchFilter>,
}

impl Triggers {
    pub fn matches(&self, event: &Event) -> bool {
        match event {
            Event::Push { branch, .. } => self.push.as_ref().is_some_and(|f| f.matches(branch)),
            Event::PullRequest { base_branch, .. } => self
                .pull_request
                .as_ref()
                .is_some_and(|f| f.matches(base_branch)),
            Event::Manual { .. } => true,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTriggers {
    Event(String),
    Events(Vec<String>),
    Map(IndexMap<String, Option<BranchFilter>>),
}

impl From<RawTriggers> for Triggers {
    fn from(raw: RawTriggers) -> Self {
        let entries: Vec<(String, Option<BranchFilter>)> = match raw {
            RawTriggers::Event(name) => vec![(name, None)],
            RawTriggers::Events(names) => names.into_iter().map(|n| (n, None)).collect(),
            RawTriggers::Map(map) => map.into_iter().collect(),
        };

        let mut triggers = Triggers::default();
        for (name, filter) in entries {
            match name.as_str() {
                "push" => triggers.push = Some(filter.unwrap_or_default()),
                "pull_request" => triggers.pull_request = Some(filter.unwrap_or_default()),
                // Manual builds run regardless of the declared triggers.
                "workflow_dispatch" => {}
                other => tracing::debug!(event = other, "Ignoring unsupported trigger"),
            }
        }
        triggers
    }
}

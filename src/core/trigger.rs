//! Trigger events and the `on:` filters that decide which workflows they start

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of event that starts a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Release,
    WorkflowDispatch,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
            EventKind::Release => "release",
            EventKind::WorkflowDispatch => "workflow_dispatch",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" => Ok(EventKind::PullRequest),
            "release" => Ok(EventKind::Release),
            "workflow_dispatch" => Ok(EventKind::WorkflowDispatch),
            other => bail!("Unknown event '{}'", other),
        }
    }
}

/// A concrete event delivered to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: EventKind,

    /// Fully qualified ref, e.g. `refs/heads/main` or `refs/tags/v1.2.0`
    pub git_ref: String,

    /// Target branch of a pull request
    pub base_ref: Option<String>,

    /// Event activity type, e.g. `published` for releases
    pub action: Option<String>,

    pub sha: String,

    pub actor: String,
}

impl TriggerEvent {
    pub fn new(kind: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: qualify_ref(&git_ref.into()),
            base_ref: None,
            action: None,
            sha: "0000000000000000000000000000000000000000".to_string(),
            actor: "stagegate".to_string(),
        }
    }

    /// A push of `branch`
    pub fn push(branch: &str) -> Self {
        Self::new(EventKind::Push, format!("refs/heads/{}", branch))
    }

    /// A pull request `number` targeting `base_branch`
    pub fn pull_request(number: u64, base_branch: &str) -> Self {
        let mut event = Self::new(EventKind::PullRequest, format!("refs/pull/{}/merge", number));
        event.base_ref = Some(base_branch.to_string());
        event
    }

    /// A release for `tag` with the given activity type
    pub fn release(tag: &str, action: &str) -> Self {
        let mut event = Self::new(EventKind::Release, format!("refs/tags/{}", tag));
        event.action = Some(action.to_string());
        event
    }

    /// A manual dispatch on `branch`
    pub fn dispatch(branch: &str) -> Self {
        Self::new(EventKind::WorkflowDispatch, format!("refs/heads/{}", branch))
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = sha.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Short ref name (`main`, `v1.2.0`, `42/merge`)
    pub fn ref_name(&self) -> &str {
        self.branch()
            .or_else(|| self.tag())
            .or_else(|| self.git_ref.strip_prefix("refs/pull/"))
            .unwrap_or(&self.git_ref)
    }

    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    /// True only for a push whose ref is the given branch
    pub fn is_push_to(&self, branch: &str) -> bool {
        self.kind == EventKind::Push && self.branch() == Some(branch)
    }
}

/// Expand a short branch name into `refs/heads/<name>`; fully qualified refs pass through
pub fn qualify_ref(git_ref: &str) -> String {
    if git_ref.starts_with("refs/") {
        git_ref.to_string()
    } else {
        format!("refs/heads/{}", git_ref)
    }
}

/// Branch/tag glob (`*` stays within a path segment, `**` crosses segments)
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut expr = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    expr.push_str(".*");
                }
                '*' => expr.push_str("[^/]*"),
                '?' => expr.push_str("[^/]"),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .with_context(|| format!("Invalid ref pattern '{}'", pattern))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// Branch and tag filters for push / pull_request
#[derive(Debug, Clone, Default)]
pub struct RefFilter {
    pub branches: Vec<GlobPattern>,
    pub tags: Vec<GlobPattern>,
}

impl RefFilter {
    fn matches_branch(&self, branch: &str) -> bool {
        if self.branches.is_empty() {
            // tags-only filters do not run for branch pushes
            return self.tags.is_empty();
        }
        self.branches.iter().any(|p| p.matches(branch))
    }

    fn matches_tag(&self, tag: &str) -> bool {
        if self.tags.is_empty() {
            return self.branches.is_empty();
        }
        self.tags.iter().any(|p| p.matches(tag))
    }
}

/// Parsed form of a workflow's `on:` section
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    pub push: Option<RefFilter>,
    pub pull_request: Option<RefFilter>,
    /// Accepted release activity types; empty accepts all
    pub release: Option<Vec<String>>,
    pub workflow_dispatch: bool,
}

impl Triggers {
    /// Parse `on:` in any of its shapes: a single event name, a list of
    /// names, or a mapping of event name to filter (or null).
    pub fn from_value(value: &Value) -> Result<Self> {
        let mut triggers = Triggers::default();
        match value {
            Value::Null => {}
            Value::String(event) => triggers.enable(event, &Value::Null)?,
            Value::Sequence(events) => {
                for event in events {
                    let name = event
                        .as_str()
                        .context("Trigger list entries must be event names")?;
                    triggers.enable(name, &Value::Null)?;
                }
            }
            Value::Mapping(map) => {
                for (key, filter) in map {
                    let name = key.as_str().context("Trigger keys must be event names")?;
                    triggers.enable(name, filter)?;
                }
            }
            _ => bail!("'on' must be an event name, a list, or a mapping"),
        }
        Ok(triggers)
    }

    fn enable(&mut self, event: &str, filter: &Value) -> Result<()> {
        match EventKind::from_str(event)? {
            EventKind::Push => self.push = Some(parse_ref_filter(filter)?),
            EventKind::PullRequest => self.pull_request = Some(parse_ref_filter(filter)?),
            EventKind::Release => {
                self.release = Some(string_list(mapping_get(filter, "types"))?);
            }
            EventKind::WorkflowDispatch => self.workflow_dispatch = true,
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.push.is_none()
            && self.pull_request.is_none()
            && self.release.is_none()
            && !self.workflow_dispatch
    }

    /// Check whether `event` starts a run
    pub fn matches(&self, event: &TriggerEvent) -> bool {
        match event.kind {
            EventKind::Push => self.push.as_ref().is_some_and(|filter| {
                if let Some(branch) = event.branch() {
                    filter.matches_branch(branch)
                } else if let Some(tag) = event.tag() {
                    filter.matches_tag(tag)
                } else {
                    false
                }
            }),
            EventKind::PullRequest => self.pull_request.as_ref().is_some_and(|filter| {
                match event.base_ref.as_deref() {
                    Some(base) => {
                        let base = base.strip_prefix("refs/heads/").unwrap_or(base);
                        filter.branches.is_empty() || filter.branches.iter().any(|p| p.matches(base))
                    }
                    None => filter.branches.is_empty(),
                }
            }),
            EventKind::Release => self.release.as_ref().is_some_and(|types| {
                let action = event.action.as_deref().unwrap_or("published");
                types.is_empty() || types.iter().any(|t| t == action)
            }),
            EventKind::WorkflowDispatch => self.workflow_dispatch,
        }
    }

    /// Names of the enabled events, for display
    pub fn event_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.push.is_some() {
            names.push(EventKind::Push.as_str());
        }
        if self.pull_request.is_some() {
            names.push(EventKind::PullRequest.as_str());
        }
        if self.release.is_some() {
            names.push(EventKind::Release.as_str());
        }
        if self.workflow_dispatch {
            names.push(EventKind::WorkflowDispatch.as_str());
        }
        names
    }
}

fn mapping_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.as_mapping().and_then(|m| m.get(Value::String(key.to_string())))
}

fn string_list(value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .context("Filter entries must be strings")
            })
            .collect(),
        Some(_) => bail!("Filter must be a string or a list of strings"),
    }
}

fn parse_ref_filter(filter: &Value) -> Result<RefFilter> {
    if !matches!(filter, Value::Null | Value::Mapping(_)) {
        bail!("Event filter must be a mapping");
    }
    let compile = |key: &str| -> Result<Vec<GlobPattern>> {
        string_list(mapping_get(filter, key))?
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect()
    };
    Ok(RefFilter {
        branches: compile("branches")?,
        tags: compile("tags")?,
    })
}

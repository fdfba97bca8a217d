//! Workflow commands emitted on step output (`::error file=..::msg`, `::set-output`)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Notice,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
        }
    }
}

/// An inline diagnostic attached to a job, e.g. a lint violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub col: Option<u32>,
    pub title: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
                if let Some(col) = self.col {
                    write!(f, ":{}", col)?;
                }
            }
            write!(f, ": ")?;
        }
        write!(f, "{}", self.severity.as_str())?;
        if let Some(title) = &self.title {
            write!(f, " [{}]", title)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCommand {
    Annotation(Diagnostic),
    SetOutput { name: String, value: String },
}

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^::(error|warning|notice|set-output)(?:\s+([^:]*))?::(.*)$")
            .expect("workflow command regex is valid")
    })
}

/// Parse a single output line; `None` when it is not a workflow command
pub fn parse_line(line: &str) -> Option<WorkflowCommand> {
    let caps = command_regex().captures(line.trim_end_matches('\r'))?;
    let command = caps.get(1)?.as_str();
    let properties = parse_properties(caps.get(2).map(|m| m.as_str()).unwrap_or(""));
    let data = unescape_data(caps.get(3).map(|m| m.as_str()).unwrap_or(""));

    let property = |key: &str| {
        properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    if command == "set-output" {
        return property("name").map(|name| WorkflowCommand::SetOutput { name, value: data });
    }

    let severity = match command {
        "error" => Severity::Error,
        "warning" => Severity::Warning,
        _ => Severity::Notice,
    };

    Some(WorkflowCommand::Annotation(Diagnostic {
        severity,
        message: data,
        file: property("file"),
        line: property("line").and_then(|v| v.parse().ok()),
        col: property("col").and_then(|v| v.parse().ok()),
        title: property("title"),
    }))
}

/// Parse every workflow command in a block of output
pub fn parse_output(text: &str) -> Vec<WorkflowCommand> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_properties(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_string(), unescape_property(value.trim())))
        })
        .collect()
}

fn unescape_data(s: &str) -> String {
    s.replace("%0D", "\r").replace("%0A", "\n").replace("%25", "%")
}

fn unescape_property(s: &str) -> String {
    s.replace("%0D", "\r")
        .replace("%0A", "\n")
        .replace("%3A", ":")
        .replace("%2C", ",")
        .replace("%25", "%")
}

//! Entity model - tasks, dependency edges, resource annotations, notes

use super::error::TaskError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned, monotonic task identifier
pub type TaskId = i64;

/// Task status enum - the only five values the store accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Blocked,
        Self::Completed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled end normal flow (the `status` override can still re-open)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                TaskError::validation(format!(
                    "invalid status '{}' (expected one of: pending, in_progress, blocked, completed, cancelled)",
                    s
                ))
            })
    }
}

/// Why a task is blocked; decides whether the system may lift the block on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOrigin {
    /// Derived from unmet dependencies, auto-unblock allowed
    Dependencies,
    /// Set by a person or agent, only lifted explicitly
    Manual,
}

impl BlockOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dependencies => "dependencies",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for BlockOrigin {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dependencies" => Ok(Self::Dependencies),
            "manual" => Ok(Self::Manual),
            other => Err(TaskError::validation(format!("invalid block origin '{}'", other))),
        }
    }
}

/// What a task does to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Touch,
    Adds,
    Removes,
    Modifies,
    Depends,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        Self::Touch,
        Self::Adds,
        Self::Removes,
        Self::Modifies,
        Self::Depends,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Touch => "touch",
            Self::Adds => "adds",
            Self::Removes => "removes",
            Self::Modifies => "modifies",
            Self::Depends => "depends",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TaskError::validation(format!("invalid resource kind '{}'", s)))
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: TaskError| FromSqlError::Other(e.to_string().into()))
            }
        }
    };
}

sql_text_enum!(TaskStatus);
sql_text_enum!(BlockOrigin);
sql_text_enum!(ResourceKind);

/// A unit of work tracked in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assignee: Option<String>,
    pub priority: i64,
    pub due_date: Option<NaiveDate>,
    pub blocked_reason: Option<String>,
    pub block_origin: Option<BlockOrigin>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new task; status always starts as `pending`
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub assignee: Option<String>,
    pub priority: i64,
    pub due_date: Option<NaiveDate>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Partial update of plain task fields (status goes through the state machine)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub priority: Option<i64>,
    pub due_date: Option<NaiveDate>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Names of the fields this update touches, for the event payload
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.title.is_some() {
            names.push("title");
        }
        if self.description.is_some() {
            names.push("description");
        }
        if self.assignee.is_some() {
            names.push("assignee");
        }
        if self.priority.is_some() {
            names.push("priority");
        }
        if self.due_date.is_some() {
            names.push("due_date");
        }
        names
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assignee: Option<String>,
}

/// `task_id` depends on `depends_on`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub task_id: TaskId,
    pub depends_on: TaskId,
}

/// Parsed `KIND:VALUE` argument, e.g. `removes:endpoint:DELETE /api/foo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub resource: String,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, resource: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
        }
    }

    /// `touch:file:<path>`
    pub fn file(path: &str) -> Self {
        Self::new(ResourceKind::Touch, format!("file:{}", path))
    }
}

impl FromStr for ResourceSpec {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, resource) = s.split_once(':').ok_or_else(|| {
            TaskError::validation(format!(
                "resource '{}' must be KIND:VALUE, e.g. modifies:endpoint:GET /api/foo",
                s
            ))
        })?;
        if resource.is_empty() {
            return Err(TaskError::validation(format!(
                "resource '{}' has an empty VALUE",
                s
            )));
        }
        Ok(Self::new(kind.parse()?, resource))
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub task_id: TaskId,
    pub kind: ResourceKind,
    pub resource: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable free-text annotation on a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub task_id: TaskId,
    pub content: String,
    pub file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Parse a `YYYY-MM-DD` due date
pub fn parse_due_date(s: &str) -> Result<NaiveDate, TaskError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| TaskError::validation(format!("invalid due date '{}' (expected YYYY-MM-DD)", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<TaskStatus>().unwrap(), TaskStatus::InProgress);
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
        let err = "done".parse::<TaskStatus>().unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_status_serde_matches_store_text() {
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_resource_spec_keeps_colons_in_value() {
        let spec: ResourceSpec = "removes:endpoint:DELETE /api/foo".parse().unwrap();
        assert_eq!(spec.kind, ResourceKind::Removes);
        assert_eq!(spec.resource, "endpoint:DELETE /api/foo");
        assert_eq!(spec.to_string(), "removes:endpoint:DELETE /api/foo");
    }

    #[test]
    fn test_resource_spec_rejects_malformed() {
        assert!(matches!(
            "feature".parse::<ResourceSpec>(),
            Err(TaskError::Validation(msg)) if msg.contains("KIND:VALUE")
        ));
        assert!("deletes:file:a.rs".parse::<ResourceSpec>().is_err());
        assert!("touch:".parse::<ResourceSpec>().is_err());
    }

    #[test]
    fn test_file_shorthand() {
        let spec = ResourceSpec::file("src/lib.rs");
        assert_eq!(spec.to_string(), "touch:file:src/lib.rs");
    }

    #[test]
    fn test_update_field_names() {
        let update = TaskUpdate {
            title: Some("x".into()),
            priority: Some(2),
            ..TaskUpdate::default()
        };
        assert_eq!(update.field_names(), vec!["title", "priority"]);
        assert!(TaskUpdate::default().is_empty());
    }

    #[test]
    fn test_due_date() {
        assert_eq!(
            parse_due_date("2026-03-01").unwrap(),
            NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
        );
        assert!(parse_due_date("next friday").is_err());
    }
}

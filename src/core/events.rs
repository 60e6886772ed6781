//! Event log records
//!
//! Every mutation appends at least one event inside its transaction. The
//! log is append-only and is what `watch` replays.

use super::error::TaskError;
use super::model::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of event stored in the `type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskStarted,
    TaskBlocked,
    TaskUnblocked,
    TaskCompleted,
    TaskAssigned,
    DependencyAdded,
    DependencyRemoved,
    DependencySatisfied,
    ResourceAdded,
    NoteAdded,
    ImpactConflict,
    ImpactNotice,
    DoctorCycle,
}

impl EventKind {
    pub const ALL: [EventKind; 16] = [
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskStatusChanged,
        Self::TaskStarted,
        Self::TaskBlocked,
        Self::TaskUnblocked,
        Self::TaskCompleted,
        Self::TaskAssigned,
        Self::DependencyAdded,
        Self::DependencyRemoved,
        Self::DependencySatisfied,
        Self::ResourceAdded,
        Self::NoteAdded,
        Self::ImpactConflict,
        Self::ImpactNotice,
        Self::DoctorCycle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskStatusChanged => "task_status_changed",
            Self::TaskStarted => "task_started",
            Self::TaskBlocked => "task_blocked",
            Self::TaskUnblocked => "task_unblocked",
            Self::TaskCompleted => "task_completed",
            Self::TaskAssigned => "task_assigned",
            Self::DependencyAdded => "dependency_added",
            Self::DependencyRemoved => "dependency_removed",
            Self::DependencySatisfied => "dependency_satisfied",
            Self::ResourceAdded => "resource_added",
            Self::NoteAdded => "note_added",
            Self::ImpactConflict => "impact_conflict",
            Self::ImpactNotice => "impact_notice",
            Self::DoctorCycle => "doctor_cycle",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TaskError::validation(format!("unknown event type '{}'", s)))
    }
}

/// A stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub actor: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub task_id: Option<TaskId>,
    pub target_task_id: Option<TaskId>,
    pub payload: serde_json::Value,
}

impl Event {
    /// Task an assignee filter is checked against: the target if any, else the subject
    pub fn filter_task(&self) -> Option<TaskId> {
        self.target_task_id.or(self.task_id)
    }

    /// One-line rendering used by `watch`
    pub fn to_line(&self) -> String {
        let fmt_id = |id: Option<TaskId>| id.map_or_else(|| "-".to_string(), |id| id.to_string());
        let mut line = format!(
            "{} {} {} task={} target={} actor={}",
            self.id,
            self.created_at.format("%Y-%m-%dT%H:%M:%SZ"),
            self.kind,
            fmt_id(self.task_id),
            fmt_id(self.target_task_id),
            self.actor
        );
        if let serde_json::Value::Object(map) = &self.payload {
            for (key, value) in map {
                match value {
                    serde_json::Value::String(s) => line.push_str(&format!(" {}={}", key, s)),
                    other => line.push_str(&format!(" {}={}", key, other)),
                }
            }
        }
        line
    }

    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// An event about to be appended; id and timestamp are assigned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub actor: String,
    pub task_id: Option<TaskId>,
    pub target_task_id: Option<TaskId>,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(kind: EventKind, actor: &str) -> Self {
        Self {
            kind,
            actor: actor.to_string(),
            task_id: None,
            target_task_id: None,
            payload: serde_json::json!({}),
        }
    }

    pub fn task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn target(mut self, target_task_id: TaskId) -> Self {
        self.target_task_id = Some(target_task_id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

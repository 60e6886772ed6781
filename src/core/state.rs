//! Task state machine
//!
//! Which command may move a task out of which status, and what status (and
//! blocked reason) it lands in. The store enforces the reason invariant;
//! this module decides the target.

use super::error::{Result, TaskError};
use super::model::{BlockOrigin, Task, TaskId, TaskStatus};
use super::store::Txn;

/// Reason used when a block carries no explanation of its own
pub const MANUAL_BLOCK_REASON: &str = "Blocked manually";

/// Status-changing commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Block,
    Unblock,
    Complete,
    /// Admin `status <new>`; never refused
    Override,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::Complete => "complete",
            Self::Override => "status",
        }
    }

    /// Whether this command may be applied to a task currently in `from`
    pub fn allowed_from(&self, from: TaskStatus) -> bool {
        use TaskStatus::*;
        match self {
            Self::Start | Self::Block => !from.is_terminal(),
            Self::Unblock => from == Blocked,
            Self::Complete | Self::Override => true,
        }
    }

    /// `ValidationError` unless the transition is legal for `task`
    pub fn check(&self, task: &Task) -> Result<()> {
        if self.allowed_from(task.status) {
            Ok(())
        } else {
            Err(TaskError::validation(format!(
                "cannot {} task {}: it is {}",
                self.name(),
                task.id,
                task.status
            )))
        }
    }
}

/// Resolved target of a status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Any status but `blocked`; clears the blocked reason
    Active(TaskStatus),
    Blocked { reason: String, origin: BlockOrigin },
}

impl StatusChange {
    /// `start`: blocked when anything is unmet, otherwise in progress
    pub fn for_start(unmet: &[TaskId]) -> Self {
        if unmet.is_empty() {
            Self::Active(TaskStatus::InProgress)
        } else {
            Self::from_unmet(unmet)
        }
    }

    /// Dependency-derived block with a synthesized reason
    pub fn from_unmet(unmet: &[TaskId]) -> Self {
        Self::Blocked {
            reason: blocked_reason(unmet),
            origin: BlockOrigin::Dependencies,
        }
    }

    /// Explicit `block`
    pub fn manual(reason: Option<&str>) -> Self {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(MANUAL_BLOCK_REASON);
        Self::Blocked {
            reason: reason.to_string(),
            origin: BlockOrigin::Manual,
        }
    }

    /// Admin override. Moving into `blocked` uses the supplied reason, else
    /// one synthesized from unmet dependencies, else the manual default.
    pub fn for_override(target: TaskStatus, reason: Option<&str>, unmet: &[TaskId]) -> Self {
        match target {
            TaskStatus::Blocked => match reason.map(str::trim).filter(|r| !r.is_empty()) {
                Some(reason) => Self::manual(Some(reason)),
                None if !unmet.is_empty() => Self::from_unmet(unmet),
                None => Self::manual(None),
            },
            other => Self::Active(other),
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Active(status) => *status,
            Self::Blocked { .. } => TaskStatus::Blocked,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Active(_) => None,
            Self::Blocked { reason, .. } => Some(reason),
        }
    }

    /// Persist the change
    pub fn apply(&self, txn: &Txn<'_>, id: TaskId) -> Result<Task> {
        match self {
            Self::Active(TaskStatus::Blocked) => Err(TaskError::validation(format!(
                "task {} cannot be blocked without a reason",
                id
            ))),
            Self::Active(status) => txn.write_status(id, *status, None, None),
            Self::Blocked { reason, origin } => {
                txn.write_status(id, TaskStatus::Blocked, Some(reason), Some(*origin))
            }
        }
    }
}

/// `Blocked by: 3, 5`
pub fn blocked_reason(unmet: &[TaskId]) -> String {
    let ids: Vec<String> = unmet.iter().map(|id| id.to_string()).collect();
    format!("Blocked by: {}", ids.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::NewTask;
    use crate::core::store::Store;

    #[test]
    fn test_start_guard() {
        assert_eq!(
            StatusChange::for_start(&[]),
            StatusChange::Active(TaskStatus::InProgress)
        );
        assert_eq!(
            StatusChange::for_start(&[2, 7]),
            StatusChange::Blocked {
                reason: "Blocked by: 2, 7".to_string(),
                origin: BlockOrigin::Dependencies,
            }
        );
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(Transition::Start.allowed_from(Pending));
        assert!(Transition::Start.allowed_from(Blocked));
        assert!(!Transition::Start.allowed_from(Completed));
        assert!(!Transition::Block.allowed_from(Cancelled));
        assert!(Transition::Unblock.allowed_from(Blocked));
        assert!(!Transition::Unblock.allowed_from(Pending));
        for status in TaskStatus::ALL {
            assert!(Transition::Complete.allowed_from(status));
            assert!(Transition::Override.allowed_from(status));
        }
    }

    #[test]
    fn test_override_reason_precedence() {
        let supplied = StatusChange::for_override(TaskStatus::Blocked, Some("waiting on api"), &[3]);
        assert_eq!(supplied.reason(), Some("waiting on api"));

        let synthesized = StatusChange::for_override(TaskStatus::Blocked, None, &[3]);
        assert_eq!(synthesized.reason(), Some("Blocked by: 3"));

        let fallback = StatusChange::for_override(TaskStatus::Blocked, Some("  "), &[]);
        assert_eq!(fallback.reason(), Some(MANUAL_BLOCK_REASON));

        let reopen = StatusChange::for_override(TaskStatus::Pending, Some("ignored"), &[3]);
        assert_eq!(reopen, StatusChange::Active(TaskStatus::Pending));
        assert_eq!(reopen.reason(), None);
    }

    #[test]
    fn test_apply_keeps_reason_invariant() {
        let mut store = Store::open_in_memory().unwrap();
        let task = store
            .write(|txn| {
                let task = txn.create_task(&NewTask::new("a"))?;
                StatusChange::manual(None).apply(txn, task.id)?;
                StatusChange::Active(TaskStatus::InProgress).apply(txn, task.id)
            })
            .unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.blocked_reason.is_none());

        let err = store
            .write(|txn| StatusChange::Active(TaskStatus::Blocked).apply(txn, task.id))
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_check_message() {
        let mut store = Store::open_in_memory().unwrap();
        let task = store
            .write(|txn| {
                let task = txn.create_task(&NewTask::new("a"))?;
                StatusChange::Active(TaskStatus::Completed).apply(txn, task.id)
            })
            .unwrap();
        let err = Transition::Start.check(&task).unwrap_err();
        assert!(err.to_string().contains("cannot start task"));
        assert!(err.to_string().contains("completed"));
    }
}

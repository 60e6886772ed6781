//! Blocking propagation - keeps `blocked` consistent with the dependency graph
//!
//! Runs inside the caller's transaction. Changes triggered by another task
//! (a completion, a new or removed edge) never touch a manual block; only the
//! maintenance sweep, which recomputes every blocked task from scratch, may
//! lift one.

use super::error::Result;
use super::events::{EventKind, NewEvent};
use super::model::{BlockOrigin, Task, TaskId, TaskStatus};
use super::state::StatusChange;
use super::store::Txn;
use serde_json::json;

/// After an edge from `task_id` was added: block it if anything is unmet.
/// Returns the unmet dependencies when the task was blocked.
/// A task already blocked by hand keeps its own reason.
pub fn block_if_unmet(txn: &Txn<'_>, actor: &str, task_id: TaskId) -> Result<Option<Vec<TaskId>>> {
    let unmet = txn.unmet_dependencies(task_id)?;
    if unmet.is_empty() {
        return Ok(None);
    }
    if is_manual_block(&txn.get_task(task_id)?) {
        log::debug!("Task {} stays manually blocked", task_id);
        return Ok(Some(unmet));
    }
    let change = StatusChange::from_unmet(&unmet);
    change.apply(txn, task_id)?;
    txn.append_event(
        &NewEvent::new(EventKind::TaskBlocked, actor)
            .task(task_id)
            .payload(json!({ "reason": change.reason(), "blockers": unmet })),
    )?;
    log::info!("Task {} blocked by {:?}", task_id, unmet);
    Ok(Some(unmet))
}

/// One hop after `completed` finished: re-check each direct dependent,
/// auto-unblocking those with nothing left unmet. Returns the unblocked ids.
pub fn after_completion(txn: &Txn<'_>, actor: &str, completed: TaskId) -> Result<Vec<TaskId>> {
    let mut unblocked = Vec::new();
    for dependent in txn.dependents_of(completed)? {
        if try_auto_unblock(txn, actor, dependent, Recheck::Triggered)? {
            unblocked.push(dependent);
        }
        txn.append_event(
            &NewEvent::new(EventKind::DependencySatisfied, actor)
                .task(completed)
                .target(dependent),
        )?;
    }
    Ok(unblocked)
}

/// After an edge from `task_id` was removed: unblock it if nothing is unmet
pub fn after_edge_removed(txn: &Txn<'_>, actor: &str, task_id: TaskId) -> Result<bool> {
    try_auto_unblock(txn, actor, task_id, Recheck::Triggered)
}

/// Maintenance pass over every blocked task, manual blocks included
pub fn sweep_blocked(txn: &Txn<'_>, actor: &str) -> Result<Vec<TaskId>> {
    let mut unblocked = Vec::new();
    for task_id in txn.task_ids_with_status(TaskStatus::Blocked)? {
        if try_auto_unblock(txn, actor, task_id, Recheck::Sweep)? {
            unblocked.push(task_id);
        }
    }
    Ok(unblocked)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recheck {
    /// Caused by a change to some edge or dependency; manual blocks are kept
    Triggered,
    /// Full recomputation by `doctor`
    Sweep,
}

fn is_manual_block(task: &Task) -> bool {
    task.status == TaskStatus::Blocked
        && task.block_origin == Some(BlockOrigin::Manual)
        && task.blocked_reason.is_some()
}

/// `blocked -> pending` when no dependency is unmet
fn try_auto_unblock(txn: &Txn<'_>, actor: &str, task_id: TaskId, recheck: Recheck) -> Result<bool> {
    let task = txn.get_task(task_id)?;
    if task.status != TaskStatus::Blocked {
        return Ok(false);
    }
    let manual = is_manual_block(&task);
    if manual && recheck == Recheck::Triggered {
        return Ok(false);
    }
    if !txn.unmet_dependencies(task_id)?.is_empty() {
        return Ok(false);
    }
    StatusChange::Active(TaskStatus::Pending).apply(txn, task_id)?;
    txn.append_event(
        &NewEvent::new(EventKind::TaskUnblocked, actor)
            .task(task_id)
            .payload(json!({ "auto": true, "manual": manual })),
    )?;
    log::info!("Task {} auto-unblocked", task_id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::NewTask;
    use crate::core::store::Store;

    fn setup() -> (Store, TaskId, TaskId) {
        let mut store = Store::open_in_memory().unwrap();
        let (a, b) = store
            .write(|txn| {
                let a = txn.create_task(&NewTask::new("a"))?.id;
                let b = txn.create_task(&NewTask::new("b"))?.id;
                txn.add_dependency(a, b)?;
                Ok((a, b))
            })
            .unwrap();
        (store, a, b)
    }

    #[test]
    fn test_block_if_unmet() {
        let (mut store, a, b) = setup();
        let unmet = store.write(|txn| block_if_unmet(txn, "tester", a)).unwrap();
        assert_eq!(unmet, Some(vec![b]));
        let task = store.read(|txn| txn.get_task(a)).unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blocked_reason.as_deref(), Some("Blocked by: 2"));
        assert_eq!(task.block_origin, Some(BlockOrigin::Dependencies));
    }

    #[test]
    fn test_nothing_unmet_leaves_status() {
        let (mut store, a, b) = setup();
        let unmet = store
            .write(|txn| {
                StatusChange::Active(TaskStatus::Completed).apply(txn, b)?;
                block_if_unmet(txn, "tester", a)
            })
            .unwrap();
        assert_eq!(unmet, None);
        assert_eq!(
            store.read(|txn| txn.get_task(a)).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_completion_unblocks_one_hop() {
        let (mut store, a, b) = setup();
        let unblocked = store
            .write(|txn| {
                block_if_unmet(txn, "tester", a)?;
                StatusChange::Active(TaskStatus::Completed).apply(txn, b)?;
                after_completion(txn, "tester", b)
            })
            .unwrap();
        assert_eq!(unblocked, vec![a]);
        let task = store.read(|txn| txn.get_task(a)).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.blocked_reason.is_none());

        let kinds: Vec<EventKind> = store
            .read(|txn| txn.list_events_since(0))
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::TaskBlocked,
                EventKind::TaskUnblocked,
                EventKind::DependencySatisfied
            ]
        );
    }

    #[test]
    fn test_manual_block_survives_completion_but_not_sweep() {
        let (mut store, a, b) = setup();
        let unblocked = store
            .write(|txn| {
                StatusChange::manual(Some("waiting on design")).apply(txn, a)?;
                StatusChange::Active(TaskStatus::Completed).apply(txn, b)?;
                after_completion(txn, "tester", b)
            })
            .unwrap();
        assert!(unblocked.is_empty());
        let task = store.read(|txn| txn.get_task(a)).unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.blocked_reason.as_deref(), Some("waiting on design"));

        let swept = store.write(|txn| sweep_blocked(txn, "doctor")).unwrap();
        assert_eq!(swept, vec![a]);
        assert_eq!(
            store.read(|txn| txn.get_task(a)).unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn test_new_edge_keeps_manual_reason() {
        let (mut store, a, b) = setup();
        let unmet = store
            .write(|txn| {
                StatusChange::manual(Some("needs design review")).apply(txn, a)?;
                block_if_unmet(txn, "tester", a)
            })
            .unwrap();
        assert_eq!(unmet, Some(vec![b]));
        let task = store.read(|txn| txn.get_task(a)).unwrap();
        assert_eq!(task.blocked_reason.as_deref(), Some("needs design review"));
        assert_eq!(task.block_origin, Some(BlockOrigin::Manual));
        let events = store.read(|txn| txn.list_events_since(0)).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_removed_edge_unblocks_dependency_block_only() {
        let (mut store, a, b) = setup();
        let lifted = store
            .write(|txn| {
                block_if_unmet(txn, "tester", a)?;
                txn.remove_dependency(a, b)?;
                after_edge_removed(txn, "tester", a)
            })
            .unwrap();
        assert!(lifted);

        let lifted = store
            .write(|txn| {
                txn.add_dependency(a, b)?;
                StatusChange::manual(None).apply(txn, a)?;
                txn.remove_dependency(a, b)?;
                after_edge_removed(txn, "tester", a)
            })
            .unwrap();
        assert!(!lifted);
        assert_eq!(
            store.read(|txn| txn.get_task(a)).unwrap().status,
            TaskStatus::Blocked
        );
    }

    #[test]
    fn test_sweep_resolves_multi_hop_chain() {
        // c -> b -> a, both dependents blocked; completing a and b out of band
        let mut store = Store::open_in_memory().unwrap();
        let c = store
            .write(|txn| {
                let a = txn.create_task(&NewTask::new("a"))?.id;
                let b = txn.create_task(&NewTask::new("b"))?.id;
                let c = txn.create_task(&NewTask::new("c"))?.id;
                txn.add_dependency(b, a)?;
                txn.add_dependency(c, b)?;
                block_if_unmet(txn, "tester", b)?;
                block_if_unmet(txn, "tester", c)?;
                StatusChange::Active(TaskStatus::Completed).apply(txn, a)?;
                StatusChange::Active(TaskStatus::Completed).apply(txn, b)?;
                Ok(c)
            })
            .unwrap();
        let unblocked = store.write(|txn| sweep_blocked(txn, "doctor")).unwrap();
        assert_eq!(unblocked, vec![c]);
    }
}

//! Command layer - one method per command, one transaction per call
//!
//! The acting identity is always passed in; nothing here reads the
//! environment. Every mutating command appends its events inside the same
//! transaction as its writes.

use crate::config::Config;
use crate::core::impact::{self, Impact};
use crate::core::propagate;
use crate::core::state::{StatusChange, Transition};
use crate::core::{
    DependencyGraph, EventKind, NewEvent, NewTask, Note, Resource, ResourceSpec, Result, Store,
    Task, TaskFilter, TaskId, TaskStatus, TaskUpdate, Txn,
};
use crate::core::{Dependency, TaskError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::path::Path;

/// Everything `show` prints about one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetails {
    pub task: Task,
    pub depends_on: Vec<TaskId>,
    pub unmet: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub resources: Vec<Resource>,
    pub notes: Vec<Note>,
}

/// Result of `depend`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependOutcome {
    /// False when the edge already existed
    pub added: bool,
    /// Unmet dependencies when the task ended up blocked
    pub blocked_by: Option<Vec<TaskId>>,
}

/// Result of `undepend`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UndependOutcome {
    /// False when there was no such edge
    pub removed: bool,
    /// The task went back to `pending` because nothing is left unmet
    pub unblocked: bool,
}

/// Side effects of a task reaching `completed`
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub task: Task,
    pub unblocked: Vec<TaskId>,
    pub impacts: Vec<Impact>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub cycles: Vec<Vec<TaskId>>,
    /// Blocked tasks that had no reason and got one synthesized
    pub repaired: Vec<TaskId>,
    pub unblocked: Vec<TaskId>,
}

impl DoctorReport {
    pub fn is_clean(&self) -> bool {
        self.cycles.is_empty() && self.repaired.is_empty() && self.unblocked.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockedTask {
    pub task: Task,
    pub unmet: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepsView {
    pub task: Task,
    pub dependencies: Vec<Task>,
    pub dependents: Vec<Task>,
}

/// Full JSON snapshot written by `export`
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub exported_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<Dependency>,
    pub resources: Vec<Resource>,
    pub notes: Vec<Note>,
}

/// Task engine over one store handle
pub struct Engine {
    store: Store,
}

impl Engine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Open the configured database, creating the schema if needed
    pub fn open(config: &Config) -> Result<Self> {
        Ok(Self::new(Store::open(&config.db_path, config.store_options())?))
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    // --- task lifecycle --------------------------------------------------

    /// `add`: create a task plus its initial edges and annotations
    pub fn add(
        &mut self,
        actor: &str,
        new: &NewTask,
        depends_on: &[TaskId],
        resources: &[ResourceSpec],
    ) -> Result<Task> {
        let task = self.store.write(|txn| {
            let task = txn.create_task(new)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskCreated, actor)
                    .task(task.id)
                    .payload(json!({ "title": task.title })),
            )?;
            for &on in depends_on {
                depend_tx(txn, actor, task.id, on)?;
            }
            for spec in resources {
                resource_tx(txn, actor, task.id, spec)?;
            }
            txn.get_task(task.id)
        })?;
        log::info!("Created task {} ({})", task.id, task.title);
        Ok(task)
    }

    pub fn list(&mut self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.read(|txn| txn.list_tasks(filter))
    }

    pub fn show(&mut self, id: TaskId) -> Result<TaskDetails> {
        self.store.read(|txn| {
            Ok(TaskDetails {
                task: txn.get_task(id)?,
                depends_on: txn.dependencies_of(id)?,
                unmet: txn.unmet_dependencies(id)?,
                dependents: txn.dependents_of(id)?,
                resources: txn.resources_of(id)?,
                notes: txn.notes_of(id)?,
            })
        })
    }

    /// `update`: plain fields only. An empty update changes nothing and
    /// records nothing.
    pub fn update(&mut self, actor: &str, id: TaskId, update: &TaskUpdate) -> Result<Task> {
        if update.is_empty() {
            return self.store.read(|txn| txn.get_task(id));
        }
        self.store.write(|txn| {
            let task = txn.update_task(id, update)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskUpdated, actor)
                    .task(id)
                    .payload(json!({ "fields": update.field_names() })),
            )?;
            Ok(task)
        })
    }

    pub fn assign(&mut self, actor: &str, id: TaskId, assignee: &str) -> Result<Task> {
        let assignee = assignee.trim();
        if assignee.is_empty() {
            return Err(TaskError::validation("assignee must not be empty"));
        }
        self.store.write(|txn| {
            let task = txn.update_task(
                id,
                &TaskUpdate {
                    assignee: Some(assignee.to_string()),
                    ..TaskUpdate::default()
                },
            )?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskAssigned, actor)
                    .task(id)
                    .payload(json!({ "assignee": assignee })),
            )?;
            Ok(task)
        })
    }

    // --- status ----------------------------------------------------------

    /// `status <new>`: unconditional override. Reaching `completed` runs
    /// the same propagation and impact checks as `complete`.
    pub fn set_status(
        &mut self,
        actor: &str,
        id: TaskId,
        status: TaskStatus,
        reason: Option<&str>,
    ) -> Result<Completion> {
        self.store.write(|txn| {
            let before = txn.get_task(id)?;
            Transition::Override.check(&before)?;
            let unmet = if status == TaskStatus::Blocked {
                txn.unmet_dependencies(id)?
            } else {
                Vec::new()
            };
            let change = StatusChange::for_override(status, reason, &unmet);
            let task = change.apply(txn, id)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskStatusChanged, actor)
                    .task(id)
                    .payload(json!({
                        "status": status.as_str(),
                        "from": before.status.as_str(),
                        "reason": change.reason(),
                    })),
            )?;
            if status == TaskStatus::Completed {
                finish_tx(txn, actor, task)
            } else {
                Ok(Completion {
                    task,
                    unblocked: Vec::new(),
                    impacts: Vec::new(),
                })
            }
        })
    }

    /// `start`: in progress when every dependency is completed, blocked otherwise
    pub fn start(&mut self, actor: &str, id: TaskId) -> Result<Task> {
        self.store.write(|txn| {
            let task = txn.get_task(id)?;
            Transition::Start.check(&task)?;
            let unmet = txn.unmet_dependencies(id)?;
            let change = StatusChange::for_start(&unmet);
            let task = change.apply(txn, id)?;
            let event = match change.reason() {
                Some(reason) => NewEvent::new(EventKind::TaskBlocked, actor)
                    .task(id)
                    .payload(json!({ "reason": reason, "blockers": unmet })),
                None => NewEvent::new(EventKind::TaskStarted, actor).task(id),
            };
            txn.append_event(&event)?;
            Ok(task)
        })
    }

    /// `block`: manual block, never lifted automatically
    pub fn block(&mut self, actor: &str, id: TaskId, reason: Option<&str>) -> Result<Task> {
        self.store.write(|txn| {
            Transition::Block.check(&txn.get_task(id)?)?;
            let change = StatusChange::manual(reason);
            let task = change.apply(txn, id)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskBlocked, actor)
                    .task(id)
                    .payload(json!({ "reason": change.reason(), "manual": true })),
            )?;
            Ok(task)
        })
    }

    /// `unblock`: back to pending regardless of dependencies
    pub fn unblock(&mut self, actor: &str, id: TaskId) -> Result<Task> {
        self.store.write(|txn| {
            Transition::Unblock.check(&txn.get_task(id)?)?;
            let task = StatusChange::Active(TaskStatus::Pending).apply(txn, id)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskUnblocked, actor)
                    .task(id)
                    .payload(json!({ "auto": false })),
            )?;
            Ok(task)
        })
    }

    /// `complete`: from any status; unblocks direct dependents and reports
    /// resource impacts
    pub fn complete(&mut self, actor: &str, id: TaskId, message: Option<&str>) -> Result<Completion> {
        let completion = self.store.write(|txn| {
            Transition::Complete.check(&txn.get_task(id)?)?;
            let task = StatusChange::Active(TaskStatus::Completed).apply(txn, id)?;
            txn.append_event(
                &NewEvent::new(EventKind::TaskCompleted, actor)
                    .task(id)
                    .payload(json!({ "message": message })),
            )?;
            finish_tx(txn, actor, task)
        })?;
        log::info!(
            "Completed task {}: {} unblocked, {} impacts",
            id,
            completion.unblocked.len(),
            completion.impacts.len()
        );
        Ok(completion)
    }

    // --- graph -----------------------------------------------------------

    /// `depend <id> --on <on>`. Adding an existing edge is a no-op that is
    /// still recorded. Self-dependencies are accepted.
    pub fn depend(&mut self, actor: &str, id: TaskId, on: TaskId) -> Result<DependOutcome> {
        self.store.write(|txn| depend_tx(txn, actor, id, on))
    }

    /// `undepend`. A dependency block with nothing left unmet is lifted in
    /// the same transaction; a manual block stays.
    pub fn undepend(&mut self, actor: &str, id: TaskId, on: TaskId) -> Result<UndependOutcome> {
        self.store.write(|txn| {
            let removed = txn.remove_dependency(id, on)?;
            txn.append_event(
                &NewEvent::new(EventKind::DependencyRemoved, actor)
                    .task(id)
                    .payload(json!({ "on": on, "removed": removed })),
            )?;
            let unblocked = removed && propagate::after_edge_removed(txn, actor, id)?;
            Ok(UndependOutcome { removed, unblocked })
        })
    }

    pub fn deps(&mut self, id: TaskId) -> Result<DepsView> {
        self.store.read(|txn| {
            let task = txn.get_task(id)?;
            let dependencies = txn
                .dependencies_of(id)?
                .into_iter()
                .map(|dep| txn.get_task(dep))
                .collect::<Result<Vec<_>>>()?;
            let dependents = txn
                .dependents_of(id)?
                .into_iter()
                .map(|dep| txn.get_task(dep))
                .collect::<Result<Vec<_>>>()?;
            Ok(DepsView {
                task,
                dependencies,
                dependents,
            })
        })
    }

    /// Pending tasks that could start right now
    pub fn ready(&mut self) -> Result<Vec<Task>> {
        self.store.read(|txn| {
            let tasks = txn.list_tasks(&TaskFilter::default())?;
            let ready = DependencyGraph::load(txn)?.ready_tasks(&tasks);
            Ok(tasks.into_iter().filter(|t| ready.contains(&t.id)).collect())
        })
    }

    pub fn blocked(&mut self) -> Result<Vec<BlockedTask>> {
        self.store.read(|txn| {
            let filter = TaskFilter {
                status: Some(TaskStatus::Blocked),
                ..TaskFilter::default()
            };
            txn.list_tasks(&filter)?
                .into_iter()
                .map(|task| -> Result<BlockedTask> {
                    let unmet = txn.unmet_dependencies(task.id)?;
                    Ok(BlockedTask { task, unmet })
                })
                .collect()
        })
    }

    // --- annotations -----------------------------------------------------

    pub fn note(&mut self, actor: &str, id: TaskId, text: &str, file: Option<&str>) -> Result<Note> {
        self.store.write(|txn| {
            let note = txn.add_note(id, text, file)?;
            txn.append_event(
                &NewEvent::new(EventKind::NoteAdded, actor)
                    .task(id)
                    .payload(json!({ "note": note.id, "file": file })),
            )?;
            Ok(note)
        })
    }

    pub fn notes(&mut self, task: Option<TaskId>, limit: usize) -> Result<Vec<Note>> {
        self.store.read(|txn| {
            if let Some(id) = task {
                txn.ensure_task(id)?;
            }
            txn.recent_notes(task, limit)
        })
    }

    /// `resource <id> KIND:VALUE...`, all in one transaction
    pub fn add_resources(
        &mut self,
        actor: &str,
        id: TaskId,
        specs: &[ResourceSpec],
    ) -> Result<Vec<Resource>> {
        if specs.is_empty() {
            return Err(TaskError::validation("at least one KIND:VALUE resource is required"));
        }
        self.store.write(|txn| {
            specs
                .iter()
                .map(|spec| resource_tx(txn, actor, id, spec))
                .collect()
        })
    }

    /// `link <id> <path>`: shorthand for `touch:file:<path>`
    pub fn link(&mut self, actor: &str, id: TaskId, path: &str) -> Result<Resource> {
        let spec = ResourceSpec::file(path);
        self.store.write(|txn| resource_tx(txn, actor, id, &spec))
    }

    // --- maintenance -----------------------------------------------------

    /// `doctor`: report cycles, repair reason-less blocks, then auto-unblock
    /// every dependency-blocked task whose dependencies are now satisfied
    pub fn doctor(&mut self, actor: &str) -> Result<DoctorReport> {
        let report = self.store.write(|txn| {
            let mut report = DoctorReport {
                cycles: DependencyGraph::load(txn)?.find_cycles(),
                ..DoctorReport::default()
            };
            for cycle in &report.cycles {
                log::warn!("Dependency cycle: {:?}", cycle);
                txn.append_event(
                    &NewEvent::new(EventKind::DoctorCycle, actor).payload(json!({ "cycle": cycle })),
                )?;
            }

            for id in txn.blocked_without_reason()? {
                if propagate::block_if_unmet(txn, actor, id)?.is_some() {
                    report.repaired.push(id);
                }
            }

            report.unblocked = propagate::sweep_blocked(txn, actor)?;
            Ok(report)
        })?;
        log::info!(
            "Doctor: {} cycles, {} repaired, {} unblocked",
            report.cycles.len(),
            report.repaired.len(),
            report.unblocked.len()
        );
        Ok(report)
    }

    pub fn snapshot(&mut self) -> Result<Snapshot> {
        self.store.read(|txn| {
            let mut tasks = txn.list_tasks(&TaskFilter::default())?;
            tasks.sort_by_key(|t| t.id);
            Ok(Snapshot {
                exported_at: txn.now(),
                tasks,
                dependencies: txn.edges()?,
                resources: txn.all_resources()?,
                notes: txn.recent_notes(None, usize::MAX)?.into_iter().rev().collect(),
            })
        })
    }

    /// `export <file>`: pretty JSON snapshot
    pub fn export(&mut self, path: &Path) -> Result<Snapshot> {
        let snapshot = self.snapshot()?;
        std::fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        log::info!("Exported {} tasks to {}", snapshot.tasks.len(), path.display());
        Ok(snapshot)
    }
}

fn depend_tx(txn: &Txn<'_>, actor: &str, id: TaskId, on: TaskId) -> Result<DependOutcome> {
    let added = txn.add_dependency(id, on)?;
    if !added {
        log::debug!("Dependency {} -> {} already present", id, on);
    }
    txn.append_event(
        &NewEvent::new(EventKind::DependencyAdded, actor)
            .task(id)
            .payload(json!({ "on": on, "duplicate": !added })),
    )?;
    let blocked_by = propagate::block_if_unmet(txn, actor, id)?;
    Ok(DependOutcome { added, blocked_by })
}

fn resource_tx(txn: &Txn<'_>, actor: &str, id: TaskId, spec: &ResourceSpec) -> Result<Resource> {
    let resource = txn.add_resource(id, spec)?;
    txn.append_event(
        &NewEvent::new(EventKind::ResourceAdded, actor)
            .task(id)
            .payload(json!({ "kind": spec.kind.as_str(), "resource": spec.resource })),
    )?;
    Ok(resource)
}

/// Completion side effects: one-hop propagation first, then impact analysis
fn finish_tx(txn: &Txn<'_>, actor: &str, task: Task) -> Result<Completion> {
    let unblocked = propagate::after_completion(txn, actor, task.id)?;
    let impacts = impact::run(txn, actor, task.id)?;
    Ok(Completion {
        task,
        unblocked,
        impacts,
    })
}

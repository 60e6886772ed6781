//! Impact analysis - resource overlap checks run when a task completes
//!
//! Detection only: findings become `impact_conflict` / `impact_notice`
//! events and never change another task.

use super::error::Result;
use super::events::{EventKind, NewEvent};
use super::model::{ResourceKind, TaskId};
use super::store::Txn;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Conflict,
    Notice,
}

impl ImpactLevel {
    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::Conflict => EventKind::ImpactConflict,
            Self::Notice => EventKind::ImpactNotice,
        }
    }
}

/// What completing a task with a `kind` annotation means for others
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpactRule {
    pub level: ImpactLevel,
    /// Annotation kinds on other tasks that are affected
    pub affected: &'static [ResourceKind],
    /// Past-tense verb recorded in the event payload
    pub action: &'static str,
}

/// Rule table; `touch` and `depends` on the completing side never impact anyone
pub fn rule_for(kind: ResourceKind) -> Option<ImpactRule> {
    use ResourceKind::*;
    match kind {
        Removes => Some(ImpactRule {
            level: ImpactLevel::Conflict,
            affected: &[Touch, Adds, Modifies, Depends],
            action: "removed",
        }),
        Modifies => Some(ImpactRule {
            level: ImpactLevel::Notice,
            affected: &[Depends, Touch, Modifies],
            action: "modified",
        }),
        Adds => Some(ImpactRule {
            level: ImpactLevel::Notice,
            affected: &[Depends],
            action: "added",
        }),
        Touch | Depends => None,
    }
}

/// One detected overlap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Impact {
    pub level: ImpactLevel,
    pub source: TaskId,
    pub target: TaskId,
    pub resource: String,
    pub action: &'static str,
}

/// Compare every annotation of `task_id` against all other tasks
pub fn analyze(txn: &Txn<'_>, task_id: TaskId) -> Result<Vec<Impact>> {
    let mut impacts = Vec::new();
    for annotation in txn.resources_of(task_id)? {
        let Some(rule) = rule_for(annotation.kind) else {
            continue;
        };
        for target in txn.tasks_holding(&annotation.resource, rule.affected, task_id)? {
            impacts.push(Impact {
                level: rule.level,
                source: task_id,
                target,
                resource: annotation.resource.clone(),
                action: rule.action,
            });
        }
    }
    Ok(impacts)
}

/// Append one event per impact
pub fn record(txn: &Txn<'_>, actor: &str, impacts: &[Impact]) -> Result<()> {
    for impact in impacts {
        if impact.level == ImpactLevel::Conflict {
            log::warn!(
                "Task {} {} {} still used by task {}",
                impact.source,
                impact.action,
                impact.resource,
                impact.target
            );
        }
        txn.append_event(
            &NewEvent::new(impact.level.event_kind(), actor)
                .task(impact.source)
                .target(impact.target)
                .payload(json!({ "resource": impact.resource, "action": impact.action })),
        )?;
    }
    Ok(())
}

/// Analyze and record in one step; returns what was found
pub fn run(txn: &Txn<'_>, actor: &str, task_id: TaskId) -> Result<Vec<Impact>> {
    let impacts = analyze(txn, task_id)?;
    record(txn, actor, &impacts)?;
    Ok(impacts)
}

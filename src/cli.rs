//! Command-line surface for `tm`
//!
//! Parsing lives here together with the output formatting; every
//! subcommand maps onto exactly one [`Engine`] call.

use crate::config::{self, Config};
use crate::core::{
    parse_due_date, Event, EventWatcher, NewTask, ResourceSpec, Task, TaskFilter, TaskId,
    TaskError, TaskStatus, TaskUpdate,
};
use crate::engine::{Completion, DoctorReport, Engine, TaskDetails};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared task tracker for humans and agents working on one codebase
#[derive(Debug, Parser)]
#[command(name = "tm", version, about = "Dependency-aware task tracker")]
pub struct Cli {
    /// Path to the SQLite database (overrides TM_DB / TM_DB_DIR)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database and schema
    Init,

    /// Add a task
    Add {
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        assignee: Option<String>,
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i64,
        /// Due date, YYYY-MM-DD
        #[arg(long)]
        due: Option<String>,
        /// Task ids this one depends on
        #[arg(long, num_args = 1..)]
        depends: Vec<TaskId>,
        /// File paths, stored as touch:file:PATH
        #[arg(long, num_args = 1..)]
        link: Vec<String>,
        /// KIND:VALUE, e.g. removes:endpoint:DELETE /api/foo
        #[arg(long, num_args = 1..)]
        resource: Vec<ResourceSpec>,
    },

    /// List tasks, highest priority first
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long, conflicts_with = "me")]
        assignee: Option<String>,
        /// Only tasks assigned to TM_ASSIGNEE or the current actor
        #[arg(long)]
        me: bool,
        #[arg(long)]
        json: bool,
    },

    /// Show one task with its edges, resources and notes
    Show {
        id: TaskId,
        #[arg(long)]
        json: bool,
    },

    /// Update plain task fields
    Update {
        id: TaskId,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        priority: Option<i64>,
        #[arg(long)]
        due: Option<String>,
    },

    /// Force a status (admin override)
    Status {
        id: TaskId,
        status: TaskStatus,
        /// Reason when forcing `blocked`
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Start a task, or block it if dependencies are unmet
    Start { id: TaskId },

    /// Block a task by hand
    Block {
        id: TaskId,
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Move a blocked task back to pending
    Unblock { id: TaskId },

    /// Complete a task, unblock dependents and run impact checks
    Complete {
        id: TaskId,
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Add a dependency edge
    Depend {
        id: TaskId,
        #[arg(long)]
        on: TaskId,
    },

    /// Remove a dependency edge
    Undepend {
        id: TaskId,
        #[arg(long)]
        on: TaskId,
    },

    Assign {
        id: TaskId,
        #[arg(short, long)]
        assignee: String,
    },

    /// Attach a note
    Note {
        id: TaskId,
        text: String,
        /// File the note is about
        #[arg(long)]
        file: Option<String>,
    },

    /// Recent notes, newest first
    Notes {
        #[arg(long)]
        task: Option<TaskId>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Attach resource annotations (KIND:VALUE)
    Resource {
        id: TaskId,
        #[arg(required = true)]
        resources: Vec<ResourceSpec>,
    },

    /// Link a file path (touch:file:PATH)
    Link { id: TaskId, path: String },

    /// Stream the event log
    Watch {
        /// Only events after this id
        #[arg(long, default_value_t = 0)]
        since: i64,
        /// Keep polling until interrupted
        #[arg(long)]
        follow: bool,
        /// Poll interval in seconds
        #[arg(long)]
        interval: Option<f64>,
        #[arg(long, conflicts_with = "me")]
        assignee: Option<String>,
        #[arg(long)]
        me: bool,
        #[arg(long)]
        json: bool,
    },

    /// Report cycles and repair blocked tasks
    Doctor,

    /// Pending tasks whose dependencies are all completed
    Ready,

    /// Blocked tasks with their unmet dependencies
    Blocked,

    /// Dependencies and dependents of a task
    Deps { id: TaskId },

    /// Write a JSON snapshot
    Export { file: PathBuf },
}

impl Command {
    /// Long-running commands that stop on Ctrl-C
    pub fn follows(&self) -> bool {
        matches!(self, Command::Watch { follow: true, .. })
    }
}

/// Who runs the command, resolved once from the environment
#[derive(Debug, Clone)]
pub struct Identity {
    pub actor: String,
    pub me: String,
}

impl Identity {
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).ok();
        let actor = config::resolve_actor(env);
        let me = config::resolve_me(env, &actor);
        Self { actor, me }
    }
}

/// Run one parsed command to completion
pub async fn execute(cli: Cli, identity: &Identity, cancel: CancellationToken) -> Result<()> {
    let config = Config::load(cli.db.as_deref())?;
    log::debug!("Using database {}", config.db_path.display());
    let mut engine = Engine::open(&config)?;
    let actor = identity.actor.as_str();

    match cli.command {
        Command::Init => {
            println!("Initialized task store at {}", config.db_path.display());
        }
        Command::Add {
            title,
            description,
            assignee,
            priority,
            due,
            depends,
            link,
            resource,
        } => {
            let new = NewTask {
                title,
                description: description.unwrap_or_default(),
                assignee,
                priority,
                due_date: due.as_deref().map(parse_due_date).transpose()?,
            };
            let mut resources: Vec<ResourceSpec> =
                link.iter().map(|path| ResourceSpec::file(path)).collect();
            resources.extend(resource);
            let task = engine.add(actor, &new, &depends, &resources)?;
            println!("Created task {}: {}", task.id, task.title);
            if let Some(reason) = &task.blocked_reason {
                println!("  blocked: {}", reason);
            }
        }
        Command::List {
            status,
            assignee,
            me,
            json,
        } => {
            let filter = TaskFilter {
                status,
                assignee: if me { Some(identity.me.clone()) } else { assignee },
            };
            let tasks = engine.list(&filter)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else if tasks.is_empty() {
                println!("No tasks");
            } else {
                for task in &tasks {
                    println!("{}", task_line(task));
                }
            }
        }
        Command::Show { id, json } => {
            let details = engine.show(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&details)?);
            } else {
                print_details(&details);
            }
        }
        Command::Update {
            id,
            title,
            description,
            assignee,
            priority,
            due,
        } => {
            let update = TaskUpdate {
                title,
                description,
                assignee,
                priority,
                due_date: due.as_deref().map(parse_due_date).transpose()?,
            };
            let task = engine.update(actor, id, &update)?;
            if update.is_empty() {
                println!("Nothing to update for task {}", task.id);
            } else {
                println!("Updated task {}: {}", task.id, update.field_names().join(", "));
            }
        }
        Command::Status { id, status, reason } => {
            let completion = engine.set_status(actor, id, status, reason.as_deref())?;
            println!("Task {} is now {}", id, completion.task.status);
            print_completion(&completion);
        }
        Command::Start { id } => {
            let task = engine.start(actor, id)?;
            match &task.blocked_reason {
                Some(reason) => println!("Task {} blocked: {}", id, reason),
                None => println!("Started task {}", id),
            }
        }
        Command::Block { id, reason } => {
            let task = engine.block(actor, id, reason.as_deref())?;
            println!(
                "Task {} blocked: {}",
                id,
                task.blocked_reason.as_deref().unwrap_or_default()
            );
        }
        Command::Unblock { id } => {
            engine.unblock(actor, id)?;
            println!("Task {} is now pending", id);
        }
        Command::Complete { id, message } => {
            let completion = engine.complete(actor, id, message.as_deref())?;
            println!("Completed task {}", id);
            print_completion(&completion);
        }
        Command::Depend { id, on } => {
            let outcome = engine.depend(actor, id, on)?;
            if outcome.added {
                println!("Task {} now depends on {}", id, on);
            } else {
                println!("Task {} already depends on {}", id, on);
            }
            if let Some(unmet) = outcome.blocked_by {
                println!("  blocked by: {}", join_ids(&unmet, ", "));
            }
        }
        Command::Undepend { id, on } => {
            let outcome = engine.undepend(actor, id, on)?;
            if outcome.removed {
                println!("Task {} no longer depends on {}", id, on);
            } else {
                println!("Task {} did not depend on {}", id, on);
            }
            if outcome.unblocked {
                println!("  unblocked {}", id);
            }
        }
        Command::Assign { id, assignee } => {
            let task = engine.assign(actor, id, &assignee)?;
            println!(
                "Assigned task {} to {}",
                id,
                task.assignee.as_deref().unwrap_or_default()
            );
        }
        Command::Note { id, text, file } => {
            let note = engine.note(actor, id, &text, file.as_deref())?;
            println!("Added note {} to task {}", note.id, id);
        }
        Command::Notes { task, limit } => {
            for note in engine.notes(task, limit)? {
                let file = note.file.map(|f| format!(" [{}]", f)).unwrap_or_default();
                println!(
                    "#{} task {} {}{}: {}",
                    note.id,
                    note.task_id,
                    note.created_at.format("%Y-%m-%d %H:%M"),
                    file,
                    note.content
                );
            }
        }
        Command::Resource { id, resources } => {
            for resource in engine.add_resources(actor, id, &resources)? {
                println!("Task {}: {} {}", id, resource.kind, resource.resource);
            }
        }
        Command::Link { id, path } => {
            let resource = engine.link(actor, id, &path)?;
            println!("Task {}: {} {}", id, resource.kind, resource.resource);
        }
        Command::Watch {
            since,
            follow,
            interval,
            assignee,
            me,
            json,
        } => {
            let filter = if me { Some(identity.me.clone()) } else { assignee };
            let mut watcher = EventWatcher::new(since, filter);
            let print = |event: &Event| {
                if json {
                    println!("{}", event.to_json_line());
                } else {
                    println!("{}", event.to_line());
                }
            };
            for event in watcher.poll(engine.store_mut())? {
                print(&event);
            }
            if follow {
                let every = follow_interval(interval, config.watch_interval())?;
                watcher
                    .follow(engine.store_mut(), every, cancel, print)
                    .await?;
            }
        }
        Command::Doctor => {
            let report = engine.doctor(actor)?;
            print_doctor(&report);
        }
        Command::Ready => {
            for task in engine.ready()? {
                println!("{}", task_line(&task));
            }
        }
        Command::Blocked => {
            for blocked in engine.blocked()? {
                println!("{}", task_line(&blocked.task));
                if !blocked.unmet.is_empty() {
                    println!("      waiting on: {}", join_ids(&blocked.unmet, ", "));
                }
            }
        }
        Command::Deps { id } => {
            let view = engine.deps(id)?;
            println!("{}", task_line(&view.task));
            println!("Depends on:");
            print_related(&view.dependencies);
            println!("Needed by:");
            print_related(&view.dependents);
        }
        Command::Export { file } => {
            let snapshot = engine.export(&file)?;
            println!(
                "Exported {} tasks, {} dependencies to {}",
                snapshot.tasks.len(),
                snapshot.dependencies.len(),
                file.display()
            );
        }
    }
    Ok(())
}

fn join_ids(ids: &[TaskId], sep: &str) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(sep)
}

/// `  12  blocked      p2  alice  Title (Blocked by: 3)`
fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{:>4}  {:<11}  p{:<2} {:<10} {}",
        task.id,
        task.status.as_str(),
        task.priority,
        task.assignee.as_deref().unwrap_or("-"),
        task.title
    );
    if let Some(due) = task.due_date {
        line.push_str(&format!("  due {}", due));
    }
    if let Some(reason) = &task.blocked_reason {
        line.push_str(&format!("  ({})", reason));
    }
    line
}

fn print_related(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("  -");
    }
    for task in tasks {
        println!("  {:>4}  {:<11}  {}", task.id, task.status.as_str(), task.title);
    }
}

fn print_details(details: &TaskDetails) {
    let task = &details.task;
    println!("ID:          {}", task.id);
    println!("Title:       {}", task.title);
    println!("Status:      {}", task.status);
    if let Some(reason) = &task.blocked_reason {
        println!("Blocked:     {}", reason);
    }
    println!("Assignee:    {}", task.assignee.as_deref().unwrap_or("-"));
    println!("Priority:    {}", task.priority);
    println!(
        "Due:         {}",
        task.due_date.map(|d| d.to_string()).unwrap_or_else(|| "-".into())
    );
    println!("Created:     {}", task.created_at.to_rfc3339());
    println!("Updated:     {}", task.updated_at.to_rfc3339());
    if !task.description.is_empty() {
        println!("Description:\n{}\n", task.description);
    }
    let ids = |ids: &[TaskId]| {
        if ids.is_empty() {
            "-".to_string()
        } else {
            join_ids(ids, ", ")
        }
    };
    println!("Depends on:  {}", ids(&details.depends_on));
    println!("Unmet:       {}", ids(&details.unmet));
    println!("Needed by:   {}", ids(&details.dependents));
    if !details.resources.is_empty() {
        println!("Resources:");
        for r in &details.resources {
            println!("  {} {}", r.kind, r.resource);
        }
    }
    if !details.notes.is_empty() {
        println!("Notes:");
        for note in &details.notes {
            let file = note.file.as_deref().map(|f| format!(" [{}]", f)).unwrap_or_default();
            println!("  {}{}: {}", note.created_at.format("%Y-%m-%d %H:%M"), file, note.content);
        }
    }
}

/// `--interval` in seconds, falling back to the configured poll interval
fn follow_interval(secs: Option<f64>, default: Duration) -> std::result::Result<Duration, TaskError> {
    let Some(secs) = secs else {
        return Ok(default);
    };
    let invalid = || {
        TaskError::validation(format!(
            "interval must be a positive number of seconds, got {}",
            secs
        ))
    };
    if secs.is_nan() || secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

fn print_completion(completion: &Completion) {
    for id in &completion.unblocked {
        println!("  unblocked {}", id);
    }
    for impact in &completion.impacts {
        println!(
            "  {:?}: task {} uses {} ({})",
            impact.level, impact.target, impact.resource, impact.action
        );
    }
}

fn print_doctor(report: &DoctorReport) {
    for cycle in &report.cycles {
        println!("cycle detected: {}", join_ids(cycle, " -> "));
    }
    for id in &report.repaired {
        println!("repaired {}", id);
    }
    for id in &report.unblocked {
        println!("unblocked {}", id);
    }
    if report.is_clean() {
        println!("No problems found");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_with_everything() {
        let cli = Cli::try_parse_from([
            "tm",
            "add",
            "Ship it",
            "--depends",
            "1",
            "2",
            "--link",
            "src/lib.rs",
            "--resource",
            "removes:endpoint:DELETE /api/foo",
            "-p",
            "-1",
        ])
        .unwrap();
        match cli.command {
            Command::Add {
                depends,
                link,
                resource,
                priority,
                ..
            } => {
                assert_eq!(depends, vec![1, 2]);
                assert_eq!(link, vec!["src/lib.rs".to_string()]);
                assert_eq!(resource[0].resource, "endpoint:DELETE /api/foo");
                assert_eq!(priority, -1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(Cli::try_parse_from(["tm", "status", "1", "done"]).is_err());
        assert!(Cli::try_parse_from(["tm", "resource", "1", "nokind"]).is_err());
        assert!(Cli::try_parse_from(["tm", "depend", "1"]).is_err());
        assert!(Cli::try_parse_from(["tm", "list", "--me", "--assignee", "x"]).is_err());
    }

    #[test]
    fn test_only_follow_watch_follows() {
        let follow = Cli::try_parse_from(["tm", "watch", "--follow"]).unwrap();
        assert!(follow.command.follows());
        let once = Cli::try_parse_from(["tm", "watch"]).unwrap();
        assert!(!once.command.follows());
        let list = Cli::try_parse_from(["tm", "list"]).unwrap();
        assert!(!list.command.follows());
    }

    #[test]
    fn test_follow_interval() {
        let default = Duration::from_millis(500);
        assert_eq!(follow_interval(None, default).unwrap(), default);
        assert_eq!(
            follow_interval(Some(0.25), default).unwrap(),
            Duration::from_millis(250)
        );
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30] {
            let err = follow_interval(Some(bad), default).unwrap_err();
            assert!(matches!(err, TaskError::Validation(_)), "{} gave {:?}", bad, err);
            assert_eq!(err.exit_code(), 2);
        }
    }

    #[test]
    fn test_task_line() {
        let now = chrono::Utc::now();
        let task = Task {
            id: 3,
            title: "Write docs".into(),
            description: String::new(),
            status: TaskStatus::Blocked,
            assignee: None,
            priority: 1,
            due_date: None,
            blocked_reason: Some("Blocked by: 1".into()),
            block_origin: None,
            created_at: now,
            updated_at: now,
        };
        let line = task_line(&task);
        assert!(line.starts_with("   3  blocked"));
        assert!(line.ends_with("(Blocked by: 1)"));
    }
}

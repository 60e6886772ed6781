//! SQLite-backed store
//!
//! Every command runs in exactly one transaction. Writers take the lock up
//! front (`BEGIN IMMEDIATE`), so two agents can never interleave the reads
//! and writes of their commands. A writer that finds the database locked
//! waits for `busy_timeout`, then the whole command is retried a bounded
//! number of times before `StoreBusy` is surfaced.

use super::error::{Result, TaskError};
use super::events::{Event, NewEvent};
use super::model::{
    BlockOrigin, Dependency, NewTask, Note, Resource, ResourceKind, ResourceSpec, Task,
    TaskFilter, TaskId, TaskStatus, TaskUpdate,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'pending'
    CHECK (status IN ('pending','in_progress','blocked','completed','cancelled')),
  assignee TEXT,
  priority INTEGER NOT NULL DEFAULT 0,
  due_date TEXT,
  blocked_reason TEXT,
  block_origin TEXT CHECK (block_origin IN ('dependencies','manual')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dependencies (
  task_id INTEGER NOT NULL,
  depends_on_task_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (task_id, depends_on_task_id),
  FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE,
  FOREIGN KEY (depends_on_task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS notes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id INTEGER NOT NULL,
  content TEXT NOT NULL,
  file TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS resources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('touch','adds','removes','modifies','depends')),
  resource TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  created_at TEXT NOT NULL,
  actor TEXT NOT NULL,
  type TEXT NOT NULL,
  task_id INTEGER,
  target_task_id INTEGER,
  payload TEXT NOT NULL DEFAULT '{}',
  FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE SET NULL,
  FOREIGN KEY (target_task_id) REFERENCES tasks(id) ON DELETE SET NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_assignee ON tasks(assignee);
CREATE INDEX IF NOT EXISTS idx_deps_depends ON dependencies(depends_on_task_id);
CREATE INDEX IF NOT EXISTS idx_resources_task ON resources(task_id);
CREATE INDEX IF NOT EXISTS idx_resources_res ON resources(resource);
";

const TASK_COLUMNS: &str = "id, title, description, status, assignee, priority, due_date, \
     blocked_reason, block_origin, created_at, updated_at";

/// Lock handling knobs
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long SQLite itself waits on a locked database
    pub busy_timeout: Duration,
    /// Extra whole-command retries after the busy timeout expired
    pub busy_retries: u32,
    /// Sleep before retry `n` is `retry_backoff * n`
    pub retry_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            busy_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// Handle to the shared task database
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    options: StoreOptions,
}

impl Store {
    /// Open (and create if needed) the database at `path`
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(options.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!("SQLite refused WAL mode, using {}", mode);
        }
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut store = Self {
            conn,
            path: Some(path.to_path_buf()),
            options,
        };
        store.install_schema()?;
        log::debug!("Opened store at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let mut store = Self {
            conn,
            path: None,
            options: StoreOptions::default(),
        };
        store.install_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn install_schema(&mut self) -> Result<()> {
        self.write(|txn| {
            txn.conn.execute_batch(SCHEMA)?;
            Ok(())
        })
    }

    /// Run one logical command in a serializable write transaction.
    ///
    /// `op` may run more than once when the store is contended, so it must
    /// only touch the database. Any error rolls back every write `op` made,
    /// events included.
    pub fn write<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        self.run(TransactionBehavior::Immediate, op)
    }

    /// Run a read-only command against one consistent snapshot
    pub fn read<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        self.run(TransactionBehavior::Deferred, op)
    }

    fn run<T, F>(&mut self, behavior: TransactionBehavior, mut op: F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.run_once(behavior, &mut op) {
                Err(err) if err.is_busy() && attempt <= self.options.busy_retries => {
                    log::warn!(
                        "Store busy (attempt {}/{}), retrying",
                        attempt,
                        self.options.busy_retries + 1
                    );
                    std::thread::sleep(self.options.retry_backoff * attempt);
                }
                Err(err) if err.is_busy() => {
                    return Err(TaskError::StoreBusy { attempts: attempt });
                }
                other => return other.map_err(TaskError::into_integrity),
            }
        }
    }

    fn run_once<T, F>(&mut self, behavior: TransactionBehavior, op: &mut F) -> Result<T>
    where
        F: FnMut(&Txn<'_>) -> Result<T>,
    {
        let tx = self.conn.transaction_with_behavior(behavior)?;
        // Dropping `tx` on the error path rolls it back
        let value = op(&Txn {
            conn: &tx,
            now: Utc::now(),
        })?;
        tx.commit()?;
        Ok(value)
    }
}

/// Operations available inside one transaction
pub struct Txn<'a> {
    conn: &'a Connection,
    now: DateTime<Utc>,
}

impl<'a> Txn<'a> {
    /// Timestamp shared by every row this transaction writes
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    // --- tasks -----------------------------------------------------------

    pub fn create_task(&self, new: &NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(TaskError::validation("task title must not be empty"));
        }
        self.conn.execute(
            "INSERT INTO tasks(title, description, status, assignee, priority, due_date, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.title,
                new.description,
                TaskStatus::Pending,
                new.assignee,
                new.priority,
                new.due_date,
                self.now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        log::debug!("Inserted task {}", id);
        self.get_task(id)
    }

    pub fn find_task(&self, id: TaskId) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], task_from_row).optional()?)
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        self.find_task(id)?.ok_or(TaskError::NotFound(id))
    }

    /// `NotFound` unless the task exists
    pub fn ensure_task(&self, id: TaskId) -> Result<()> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if exists {
            Ok(())
        } else {
            Err(TaskError::NotFound(id))
        }
    }

    /// Tasks ordered by priority (highest first), then most recently updated
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = format!("SELECT {} FROM tasks WHERE 1=1", TASK_COLUMNS);
        let mut args: Vec<&dyn ToSql> = Vec::new();
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            args.push(status);
        }
        if let Some(assignee) = &filter.assignee {
            sql.push_str(" AND assignee = ?");
            args.push(assignee);
        }
        sql.push_str(" ORDER BY priority DESC, updated_at DESC, id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Ids of every task in `status`, in creation order
    pub fn task_ids_with_status(&self, status: TaskStatus) -> Result<Vec<TaskId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM tasks WHERE status = ?1 ORDER BY id")?;
        let ids = stmt.query_map([status], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Blocked tasks with no reason, left behind by writers predating the invariant
    pub fn blocked_without_reason(&self) -> Result<Vec<TaskId>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM tasks WHERE status = 'blocked' AND blocked_reason IS NULL ORDER BY id",
        )?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_task(&self, id: TaskId, update: &TaskUpdate) -> Result<Task> {
        self.ensure_task(id)?;
        if update.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(TaskError::validation("task title must not be empty"));
        }
        let mut sets = vec!["updated_at = ?"];
        let mut args: Vec<&dyn ToSql> = Vec::new();
        args.push(&self.now);
        if let Some(title) = &update.title {
            sets.push("title = ?");
            args.push(title);
        }
        if let Some(description) = &update.description {
            sets.push("description = ?");
            args.push(description);
        }
        if let Some(assignee) = &update.assignee {
            sets.push("assignee = ?");
            args.push(assignee);
        }
        if let Some(priority) = &update.priority {
            sets.push("priority = ?");
            args.push(priority);
        }
        if let Some(due_date) = &update.due_date {
            sets.push("due_date = ?");
            args.push(due_date);
        }
        args.push(&id);
        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        self.conn.execute(&sql, args.as_slice())?;
        self.get_task(id)
    }

    /// Write status columns. A blocked status needs a reason; every other
    /// status clears reason and origin.
    pub fn write_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        reason: Option<&str>,
        origin: Option<BlockOrigin>,
    ) -> Result<Task> {
        self.ensure_task(id)?;
        let (reason, origin) = if status == TaskStatus::Blocked {
            let reason = reason.ok_or_else(|| {
                TaskError::validation(format!("task {} cannot be blocked without a reason", id))
            })?;
            (Some(reason), Some(origin.unwrap_or(BlockOrigin::Manual)))
        } else {
            (None, None)
        };
        self.conn.execute(
            "UPDATE tasks SET status = ?1, blocked_reason = ?2, block_origin = ?3, updated_at = ?4 \
             WHERE id = ?5",
            params![status, reason, origin, self.now, id],
        )?;
        log::debug!("Task {} -> {}", id, status);
        self.get_task(id)
    }

    // --- dependencies ----------------------------------------------------

    /// Insert the edge; `false` when it already existed
    pub fn add_dependency(&self, task_id: TaskId, depends_on: TaskId) -> Result<bool> {
        self.ensure_task(task_id)?;
        self.ensure_task(depends_on)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO dependencies(task_id, depends_on_task_id, created_at) \
             VALUES (?1, ?2, ?3)",
            params![task_id, depends_on, self.now],
        )?;
        Ok(inserted == 1)
    }

    /// Delete the edge; `false` when there was none
    pub fn remove_dependency(&self, task_id: TaskId, depends_on: TaskId) -> Result<bool> {
        self.ensure_task(task_id)?;
        self.ensure_task(depends_on)?;
        let removed = self.conn.execute(
            "DELETE FROM dependencies WHERE task_id = ?1 AND depends_on_task_id = ?2",
            params![task_id, depends_on],
        )?;
        Ok(removed == 1)
    }

    /// Tasks `task_id` depends on, in edge insertion order
    pub fn dependencies_of(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.id_column(
            "SELECT depends_on_task_id FROM dependencies WHERE task_id = ?1 ORDER BY rowid",
            task_id,
        )
    }

    /// Tasks that depend on `task_id`, in edge insertion order
    pub fn dependents_of(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.id_column(
            "SELECT task_id FROM dependencies WHERE depends_on_task_id = ?1 ORDER BY rowid",
            task_id,
        )
    }

    /// Dependencies of `task_id` whose status is not `completed`
    pub fn unmet_dependencies(&self, task_id: TaskId) -> Result<Vec<TaskId>> {
        self.id_column(
            "SELECT d.depends_on_task_id FROM dependencies d \
             JOIN tasks t ON t.id = d.depends_on_task_id \
             WHERE d.task_id = ?1 AND t.status != 'completed' ORDER BY d.rowid",
            task_id,
        )
    }

    /// Every edge, in insertion order
    pub fn edges(&self) -> Result<Vec<Dependency>> {
        let mut stmt = self
            .conn
            .prepare("SELECT task_id, depends_on_task_id FROM dependencies ORDER BY rowid")?;
        let edges = stmt.query_map([], |row| {
            Ok(Dependency {
                task_id: row.get(0)?,
                depends_on: row.get(1)?,
            })
        })?;
        Ok(edges.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn id_column(&self, sql: &str, id: TaskId) -> Result<Vec<TaskId>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt.query_map([id], |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- resources -------------------------------------------------------

    pub fn add_resource(&self, task_id: TaskId, spec: &ResourceSpec) -> Result<Resource> {
        self.ensure_task(task_id)?;
        self.conn.execute(
            "INSERT INTO resources(task_id, kind, resource, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, spec.kind, spec.resource, self.now],
        )?;
        Ok(Resource {
            id: self.conn.last_insert_rowid(),
            task_id,
            kind: spec.kind,
            resource: spec.resource.clone(),
            created_at: self.now,
        })
    }

    pub fn resources_of(&self, task_id: TaskId) -> Result<Vec<Resource>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, kind, resource, created_at FROM resources \
             WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([task_id], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_resources(&self) -> Result<Vec<Resource>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, kind, resource, created_at FROM resources ORDER BY id",
        )?;
        let rows = stmt.query_map([], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Other tasks holding `resource` with one of `kinds`, each listed once,
    /// ordered by their first matching annotation
    pub fn tasks_holding(
        &self,
        resource: &str,
        kinds: &[ResourceKind],
        exclude: TaskId,
    ) -> Result<Vec<TaskId>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "SELECT task_id FROM resources WHERE resource = ? AND task_id != ? AND kind IN ({}) \
             GROUP BY task_id ORDER BY MIN(id)",
            placeholders
        );
        let mut args: Vec<&dyn ToSql> = Vec::new();
        args.push(&resource);
        args.push(&exclude);
        for kind in kinds {
            args.push(kind);
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt.query_map(args.as_slice(), |row| row.get(0))?;
        Ok(ids.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- notes -----------------------------------------------------------

    pub fn add_note(&self, task_id: TaskId, content: &str, file: Option<&str>) -> Result<Note> {
        self.ensure_task(task_id)?;
        if content.trim().is_empty() {
            return Err(TaskError::validation("note must not be empty"));
        }
        self.conn.execute(
            "INSERT INTO notes(task_id, content, file, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, content, file, self.now],
        )?;
        Ok(Note {
            id: self.conn.last_insert_rowid(),
            task_id,
            content: content.to_string(),
            file: file.map(str::to_string),
            created_at: self.now,
        })
    }

    /// Notes of one task, oldest first
    pub fn notes_of(&self, task_id: TaskId) -> Result<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, content, file, created_at FROM notes WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([task_id], note_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Newest notes first, optionally for one task
    pub fn recent_notes(&self, task_id: Option<TaskId>, limit: usize) -> Result<Vec<Note>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, content, file, created_at FROM notes \
             WHERE ?1 IS NULL OR task_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit], note_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- events ----------------------------------------------------------

    pub fn append_event(&self, event: &NewEvent) -> Result<Event> {
        let payload = serde_json::to_string(&event.payload)?;
        self.conn.execute(
            "INSERT INTO events(created_at, actor, type, task_id, target_task_id, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.now,
                event.actor,
                event.kind.as_str(),
                event.task_id,
                event.target_task_id,
                payload,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        log::debug!("Event {} {} task={:?}", id, event.kind, event.task_id);
        Ok(Event {
            id,
            created_at: self.now,
            actor: event.actor.clone(),
            kind: event.kind,
            task_id: event.task_id,
            target_task_id: event.target_task_id,
            payload: event.payload.clone(),
        })
    }

    /// Events with id greater than `cursor`, oldest first
    pub fn list_events_since(&self, cursor: i64) -> Result<Vec<Event>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at, actor, type, task_id, target_task_id, payload FROM events \
             WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([cursor], event_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Current assignee of a task, `None` for unassigned or unknown tasks
    pub fn assignee_of(&self, task_id: TaskId) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT assignee FROM tasks WHERE id = ?1",
                [task_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        self.conn
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: row.get("status")?,
        assignee: row.get("assignee")?,
        priority: row.get("priority")?,
        due_date: row.get("due_date")?,
        blocked_reason: row.get("blocked_reason")?,
        block_origin: row.get("block_origin")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        kind: row.get("kind")?,
        resource: row.get("resource")?,
        created_at: row.get("created_at")?,
    })
}

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        content: row.get("content")?,
        file: row.get("file")?,
        created_at: row.get("created_at")?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let kind: String = row.get("type")?;
    let payload: String = row.get("payload")?;
    Ok(Event {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        actor: row.get("actor")?,
        kind: kind
            .parse()
            .map_err(|e: TaskError| conversion_error(3, e))?,
        task_id: row.get("task_id")?,
        target_task_id: row.get("target_task_id")?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(6, e))?,
    })
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

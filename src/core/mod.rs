//! Core engine - store, task model, dependency graph, propagation, events

mod error;
mod events;
mod graph;
mod model;
mod store;

pub mod impact;
pub mod propagate;
pub mod state;
pub mod watch;

pub use error::{Result, TaskError};
pub use events::{Event, EventKind, NewEvent};
pub use graph::DependencyGraph;
pub use model::{
    parse_due_date, BlockOrigin, Dependency, NewTask, Note, Resource, ResourceKind, ResourceSpec,
    Task, TaskFilter, TaskId, TaskStatus, TaskUpdate,
};
pub use store::{Store, StoreOptions, Txn};
pub use watch::EventWatcher;

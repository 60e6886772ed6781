//! tasklane - dependency-aware task tracker shared by humans and agents
//!
//! Tasks live in one SQLite database that several processes may write at
//! once. Dependencies block and unblock tasks automatically, completing a
//! task checks resource annotations for impact on other tasks, and every
//! change is appended to an event log that `watch` can follow.

pub mod cli;
pub mod config;
pub mod core;
pub mod engine;

// Re-exports
pub use config::Config;
pub use core::{
    DependencyGraph, Event, EventKind, EventWatcher, NewTask, ResourceKind, ResourceSpec, Result,
    Store, StoreOptions, Task, TaskError, TaskFilter, TaskId, TaskStatus, TaskUpdate,
};
pub use engine::{Completion, DependOutcome, DoctorReport, Engine, TaskDetails, UndependOutcome};

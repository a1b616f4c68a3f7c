//! workpoll: a poll-driven workflow engine.
//!
//! Workflows are graphs of actions joined by conditional, optionally
//! time-delayed transitions. Starting a workflow creates an instance and its
//! first workitem; each [`manager::JobManager`] cycle then runs and checks
//! workitems through their job executors, fires transitions of finished
//! ones and closes instances whose work is all done.

pub mod config;
pub mod definition;
pub mod error;
pub mod expr;
pub mod instance;
pub mod interval;
pub mod job;
pub mod manager;
pub mod model;
pub mod store;
pub mod transition;
pub mod ui;
pub mod workflow;
pub mod workitem;

pub use error::{EngineError, JobError, Result};
pub use job::{JobExecutor, JobKind, JobRegistry, JobValues};
pub use manager::{CycleReport, JobManager};
pub use store::{MemoryStore, Store};

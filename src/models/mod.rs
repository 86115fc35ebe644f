//! Domain models for foreman.
//!
//! # Core Concepts
//!
//! - [`Project`]: top-level unit of work, moving through coarse [`Phase`]s.
//! - [`Component`]: node in a project's decomposition forest.
//! - [`Task`]: atomic unit of executable work inside one component, with its
//!   [`Dependency`] edges and [`AcceptanceCriterion`]s.
//! - [`LogEntry`]: append-only audit row; a task's rows are its execution events.
//! - [`ProgressSnapshot`]: live, in-memory view of a running task.
//!
//! Workers are transient and only appear as string ids on tasks and log rows.

mod component;
mod event;
mod progress;
mod project;
mod task;

pub use component::*;
pub use event::*;
pub use progress::*;
pub use project::*;
pub use task::*;

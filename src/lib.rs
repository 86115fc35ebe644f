//! foreman: orchestration core for hierarchical work.
//!
//! Projects own a forest of components; components own tasks. Tasks move
//! through a state machine ([`lifecycle`]), wait on each other through the
//! [`resolver`], and are executed by bounded worker loops ([`runner`]) whose
//! file access goes through a per-task [`gateway`]. Live progress is kept by
//! the [`progress`] tracker and everything durable lives in the [`db`].

pub mod action;
pub mod api;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod lifecycle;
pub mod models;
pub mod planner;
pub mod progress;
pub mod registry;
pub mod resolver;
pub mod runner;
pub mod scheduler;

pub use error::{Error, Result, ServiceError};

//! Boundary to the external reasoning service.
//!
//! The core treats the service as an opaque function from text to text that
//! may time out or fail. [`Executor`] is that capability; concrete roles (the
//! task runner, the planner) each hold one instead of sharing a base type.

mod cli;
mod rate_limit;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServiceError;

pub use cli::CliExecutor;
pub use rate_limit::{RateLimited, RateLimiter};

#[async_trait]
pub trait Executor: Send + Sync {
    /// Send `prompt` with `system` instructions and return the raw response.
    async fn invoke(&self, prompt: &str, system: &str) -> Result<String, ServiceError>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn invoke(&self, prompt: &str, system: &str) -> Result<String, ServiceError> {
        (**self).invoke(prompt, system).await
    }
}

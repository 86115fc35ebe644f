use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::Executor;
use crate::config::ExecutorConfig;
use crate::error::ServiceError;

/// Stderr kept from a failed invocation.
const MAX_STDERR: usize = 500;

/// Runs a command-line reasoning client once per call, passing the prompt as
/// the last argument and reading the response from stdout.
#[derive(Debug, Clone)]
pub struct CliExecutor {
    config: ExecutorConfig,
}

impl CliExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn invoke(&self, prompt: &str, system: &str) -> Result<String, ServiceError> {
        let full_prompt = if system.is_empty() {
            prompt.to_string()
        } else {
            format!("System: {}\n\nUser: {}", system, prompt)
        };

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args).arg(&full_prompt);
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let output = match tokio::time::timeout(self.timeout(), cmd.output()).await {
            Err(_) => return Err(ServiceError::Timeout(self.timeout())),
            Ok(Err(e)) => {
                return Err(ServiceError::Transport(format!(
                    "failed to run {}: {}",
                    self.config.program, e
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.config.program, output.status)
            } else {
                truncate(stderr.trim(), MAX_STDERR)
            };
            return Err(ServiceError::Service(message));
        }

        let response = String::from_utf8_lossy(&output.stdout).into_owned();
        tracing::debug!(
            "{} responded in {:.1}s ({} chars)",
            self.config.program,
            start.elapsed().as_secs_f64(),
            response.len()
        );
        Ok(response)
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::Executor;
use crate::config::RateLimitConfig;
use crate::error::ServiceError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Sliding-window limiter shared by every worker in the process.
///
/// A slot is reserved when a call is admitted, so concurrent callers can
/// never overshoot either window.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<Windows>,
}

#[derive(Default)]
struct Windows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl Windows {
    fn expire(&mut self, now: Instant) {
        while self.minute.front().is_some_and(|t| now.duration_since(*t) >= MINUTE) {
            self.minute.pop_front();
        }
        while self.hour.front().is_some_and(|t| now.duration_since(*t) >= HOUR) {
            self.hour.pop_front();
        }
    }
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Reserve a slot now, or return how long until one frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.expire(now);

        let mut wait = Duration::ZERO;
        if windows.minute.len() >= self.config.requests_per_minute {
            if let Some(oldest) = windows.minute.front() {
                wait = wait.max(MINUTE.saturating_sub(now.duration_since(*oldest)));
            }
        }
        if windows.hour.len() >= self.config.requests_per_hour {
            if let Some(oldest) = windows.hour.front() {
                wait = wait.max(HOUR.saturating_sub(now.duration_since(*oldest)));
            }
        }

        if wait > Duration::ZERO {
            return Err(wait);
        }
        windows.minute.push_back(now);
        windows.hour.push_back(now);
        Ok(())
    }

    /// Wait until a slot is free and reserve it. Returns the time spent
    /// waiting.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        while let Err(wait) = self.try_acquire() {
            let (minute, hour) = self.usage();
            tracing::info!(
                minute,
                hour,
                "Rate limit reached, waiting {:.1}s",
                wait.as_secs_f64()
            );
            tokio::time::sleep(wait).await;
        }
        start.elapsed()
    }

    /// Calls admitted in the current minute and hour windows.
    pub fn usage(&self) -> (usize, usize) {
        let mut windows = self.windows.lock();
        windows.expire(Instant::now());
        (windows.minute.len(), windows.hour.len())
    }
}

/// Wraps an executor so every call first takes a slot from a shared limiter.
pub struct RateLimited<E> {
    inner: E,
    limiter: Arc<RateLimiter>,
}

impl<E> RateLimited<E> {
    pub fn new(inner: E, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<E: Executor> Executor for RateLimited<E> {
    async fn invoke(&self, prompt: &str, system: &str) -> Result<String, ServiceError> {
        let waited = self.limiter.acquire().await;
        if waited > Duration::ZERO {
            tracing::info!("Waited {:.1}s for rate limit", waited.as_secs_f64());
        }
        self.inner.invoke(prompt, system).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: usize, per_hour: usize) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: per_minute,
            requests_per_hour: per_hour,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn minute_window_slides() {
        let limiter = limiter(2, 100);
        assert!(limiter.try_acquire().is_ok());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.try_acquire().is_ok());

        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(50));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.try_acquire().is_ok());
        assert_eq!(limiter.usage(), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn hour_window_caps_total_calls() {
        let limiter = limiter(100, 2);
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_secs(3480));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_until_a_slot_frees() {
        let limiter = limiter(1, 100);
        assert_eq!(limiter.acquire().await, Duration::ZERO);

        let waited = limiter.acquire().await;
        assert_eq!(waited, Duration::from_secs(60));
    }
}

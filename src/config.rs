use std::time::Duration;

/// Longest reservation or redelivery delay a queue backend honours.
pub const MAX_QUEUE_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Delivery and retry settings for the task queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How long a reserved task stays invisible before it is handed out again.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a failing task is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first redelivery; doubles per attempt up to `max_backoff`.
    pub retry_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on how long the consumer sleeps when the queue looks empty.
    pub poll_interval: Duration,
    /// Upper bound on a single enqueue.
    pub enqueue_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout.min(MAX_QUEUE_DELAY);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Delay before redelivering a task whose `attempt`-th delivery failed (1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

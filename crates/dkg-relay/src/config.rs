//! Relay tuning knobs

use std::time::Duration;

/// Name of the topic every operator registers on first
pub const DEFAULT_TOPIC: &str = "default";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the shared inbound queue
    pub inbound_capacity: usize,
    /// Capacity of each subscriber's outbound queue
    pub outbound_capacity: usize,
    /// Capacity of the runner's job request queue
    pub job_queue_capacity: usize,
    /// Retries allowed per payload after the first attempt
    pub max_retries: u32,
    /// Unit of the linear retry backoff
    pub retry_backoff: Duration,
    /// Timeout for a single `/consume` call
    pub delivery_timeout: Duration,
    /// Maximum number of payload hashes tracked per subscriber
    pub retry_ledger_capacity: usize,
    /// How long a run result is kept before cleanup drops it
    pub result_ttl: Duration,
    /// Topic that registration defaults to and derived topics draw from
    pub default_topic: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 50,
            outbound_capacity: 50,
            job_queue_capacity: 10,
            max_retries: 10,
            retry_backoff: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(10),
            retry_ledger_capacity: 4096,
            result_ttl: Duration::from_secs(24 * 60 * 60),
            default_topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl RelayConfig {
    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the linear backoff unit
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the per-request delivery timeout
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set inbound and outbound queue capacities
    pub fn with_queue_capacity(mut self, inbound: usize, outbound: usize) -> Self {
        self.inbound_capacity = inbound.max(1);
        self.outbound_capacity = outbound.max(1);
        self
    }

    /// Set the retry ledger cap
    pub fn with_retry_ledger_capacity(mut self, capacity: usize) -> Self {
        self.retry_ledger_capacity = capacity.max(1);
        self
    }

    /// Set the result time-to-live
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Backoff before the given retry (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.retry_backoff.saturating_mul(retry)
    }
}

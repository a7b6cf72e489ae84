//! Runtime configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GraphError, Result};

/// Smallest threshold that still fits one edge and both of its endpoints
pub const MIN_TRANSACTION_THRESHOLD: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    /// Maximum nodes + edges committed in a single store transaction
    pub transaction_threshold: usize,
    /// Attempts per batch before a conflict is reported as fatal
    pub max_retries: u32,
    /// First backoff delay, doubled on every further attempt
    pub retry_base_delay: Duration,
    /// Independent contraction runs per partition; the smallest cut wins
    pub partition_passes: usize,
    /// Expiry of cached node rows. `None` keeps them until invalidated.
    pub cache_ttl: Option<Duration>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            transaction_threshold: 100,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(50),
            partition_passes: 2,
            cache_ttl: None,
        }
    }
}

impl GraphConfig {
    /// Defaults overridden by `DEPGRAPH_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(threshold) = env_var("DEPGRAPH_TRANSACTION_THRESHOLD")? {
            config.transaction_threshold = threshold;
        }
        if let Some(retries) = env_var("DEPGRAPH_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(ms) = env_var("DEPGRAPH_RETRY_BASE_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(passes) = env_var("DEPGRAPH_PARTITION_PASSES")? {
            config.partition_passes = passes;
        }
        if let Some(ms) = env_var::<u64>("DEPGRAPH_CACHE_TTL_MS")? {
            config.cache_ttl = Some(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_transaction_threshold(mut self, threshold: usize) -> Self {
        self.transaction_threshold = threshold;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.transaction_threshold < MIN_TRANSACTION_THRESHOLD {
            return Err(GraphError::InvalidThreshold(self.transaction_threshold));
        }
        if self.max_retries == 0 {
            return Err(GraphError::InvalidRequest("max_retries must be at least 1".into()));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GraphError::InvalidRequest(format!("{} has invalid value {:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(GraphConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_must_fit_an_edge() {
        let config = GraphConfig::default().with_transaction_threshold(3);
        assert_eq!(config.validate(), Err(GraphError::InvalidThreshold(3)));
        assert!(GraphConfig::default().with_transaction_threshold(4).validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = GraphConfig::default().with_retries(5, Duration::from_millis(10));
        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(4), Duration::from_millis(80));
    }
}

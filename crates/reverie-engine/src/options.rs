use reverie_types::RetryPolicy;

/// Tunables for the per-invocation engine.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Read size for the incoming frame reader.
    pub read_chunk_size: usize,
    /// Retry policy applied to side effects that do not specify one.
    /// `None` keeps the default behavior: a retryable side-effect
    /// failure propagates as a transient invocation error.
    pub default_run_retry: Option<RetryPolicy>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            read_chunk_size: 16 * 1024,
            default_run_retry: None,
        }
    }
}

impl EngineOptions {
    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes;
        self
    }

    pub fn default_run_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_run_retry = Some(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let options = EngineOptions::default()
            .read_chunk_size(512)
            .default_run_retry(RetryPolicy::fixed_delay(Duration::from_millis(5), 2));
        assert_eq!(options.read_chunk_size, 512);
        assert_eq!(options.default_run_retry.unwrap().max_attempts, Some(2));
    }
}

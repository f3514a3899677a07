//! Server configuration.

/// Configuration for the reference central store.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of changes returned by one pull.
    pub max_pull_batch: u32,
    /// Maximum number of submissions accepted in one push.
    pub max_push_batch: u32,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_pull_batch: 100,
            max_push_batch: 100,
        }
    }

    /// Sets the maximum pull batch size.
    pub fn with_max_pull_batch(mut self, size: u32) -> Self {
        self.max_pull_batch = size;
        self
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: u32) -> Self {
        self.max_push_batch = size;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_pull_batch(50)
            .with_max_push_batch(10);
        assert_eq!(config.max_pull_batch, 50);
        assert_eq!(config.max_push_batch, 10);
        assert_eq!(ServerConfig::default().max_pull_batch, 100);
    }
}

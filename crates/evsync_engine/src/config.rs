//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration shared by every engine created from one registry.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to each remote call.
    pub request_timeout: Duration,
    /// Maximum number of event pages applied by one `process()` run.
    pub max_pages_per_run: u32,
    /// Whether engines start eligible for processing when created.
    pub auto_start: bool,
}

impl EngineConfig {
    /// Creates a new engine configuration with default values.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_pages_per_run: 50,
            auto_start: true,
        }
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum number of pages per run. Zero is treated as one.
    pub fn with_max_pages_per_run(mut self, pages: u32) -> Self {
        self.max_pages_per_run = pages.max(1);
        self
    }

    /// Sets whether new engines start eligible.
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

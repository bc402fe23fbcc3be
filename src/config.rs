//! Engine configuration.

use crate::error::{Error, Result};
use std::time::Duration;

/// 64KB pages, matching the granularity JIT allocators hand out code in.
pub const DEFAULT_PAGE_SHIFT: u32 = 16;

/// Default capacity of a walk's diagnostics log.
pub const DEFAULT_DIAGNOSTICS_CAPACITY: usize = 256;

/// Default number of frames a sampler collects per walk.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

/// How long the index worker sleeps when it has nothing to drain.
pub const DEFAULT_WORKER_IDLE_WAIT: Duration = Duration::from_millis(50);

/// How often the library worker checks the loader generation unprompted.
pub const DEFAULT_LIBRARY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page shard size as a power of two
    pub page_shift: u32,
    /// Entries kept per walk in the diagnostics log
    pub diagnostics_capacity: usize,
    /// Output buffer size used by the sampler
    pub max_stack_depth: usize,
    /// Worker park timeout between drains
    pub worker_idle_wait: Duration,
    /// Library worker park timeout between generation checks
    pub library_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_shift: DEFAULT_PAGE_SHIFT,
            diagnostics_capacity: DEFAULT_DIAGNOSTICS_CAPACITY,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            worker_idle_wait: DEFAULT_WORKER_IDLE_WAIT,
            library_poll_interval: DEFAULT_LIBRARY_POLL_INTERVAL,
        }
    }
}

impl EngineConfig {
    pub fn with_page_shift(mut self, page_shift: u32) -> Self {
        self.page_shift = page_shift;
        self
    }

    pub fn with_diagnostics_capacity(mut self, capacity: usize) -> Self {
        self.diagnostics_capacity = capacity;
        self
    }

    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }

    pub fn with_library_poll_interval(mut self, interval: Duration) -> Self {
        self.library_poll_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        // Pages smaller than 4KB only multiply shards; pages above 4GB make
        // a single shard cover most of a JIT heap.
        if !(12..=32).contains(&self.page_shift) {
            return Err(Error::InvalidConfig(format!(
                "page shift must be between 12 and 32, got {}",
                self.page_shift
            )));
        }

        if self.diagnostics_capacity == 0 {
            return Err(Error::InvalidConfig(
                "diagnostics capacity must be at least 1".to_string(),
            ));
        }

        if self.max_stack_depth == 0 || self.max_stack_depth > 1024 {
            return Err(Error::InvalidConfig(format!(
                "stack depth must be between 1 and 1024, got {}",
                self.max_stack_depth
            )));
        }

        if self.library_poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "library poll interval must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

//! Retry policy for spawning binaries

use std::io;
use std::time::Duration;

/// Delay before retrying a spawn that hit "text file busy"
pub const DEFAULT_SPAWN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Which spawn failures are retried, how often and after what delay
///
/// Only "text file busy" is retryable; every other spawn error fails
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnRetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for SpawnRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: DEFAULT_SPAWN_RETRY_DELAY,
        }
    }
}

impl SpawnRetryPolicy {
    /// Policy with the given fixed delay and a single retry
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Check if a spawn error is retryable
    pub fn is_retryable_error(&self, error: &io::Error) -> bool {
        is_text_file_busy(error)
    }

    /// Wait time before the given retry attempt (1-based)
    pub fn calculate_wait_time(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

#[cfg(unix)]
fn is_text_file_busy(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::errno::Errno::ETXTBSY as i32)
}

#[cfg(not(unix))]
fn is_text_file_busy(_error: &io::Error) -> bool {
    false
}

//! Walk progress and its rate limiting.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Snapshot of a walk in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkProgress {
    /// Entries visited so far, files and directories.
    pub visited: usize,
    /// Files included so far.
    pub files: usize,
    /// Previews produced so far.
    pub previews: usize,
}

/// Lets a notification through at most once per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    /// The first notification is allowed one interval after creation.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    /// `true` when a notification may go out now; records it as sent.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

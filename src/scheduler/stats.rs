//! Per-task execution statistics

use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept in the recent-execution rings
const RING_CAPACITY: usize = 32;

/// Success/error counters plus bounded rings of recent outcomes
#[derive(Debug, Clone, Default)]
pub struct TaskStatistics {
    successes: u64,
    errors: u64,
    recent_durations: VecDeque<Duration>,
    recent_errors: VecDeque<String>,
}

impl TaskStatistics {
    pub fn record_success(&mut self, took: Duration) {
        self.successes += 1;
        if self.recent_durations.len() == RING_CAPACITY {
            self.recent_durations.pop_front();
        }
        self.recent_durations.push_back(took);
    }

    pub fn record_error(&mut self, message: &str) {
        self.errors += 1;
        if self.recent_errors.len() == RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(message.to_string());
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn recent_durations(&self) -> impl Iterator<Item = Duration> + '_ {
        self.recent_durations.iter().copied()
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &str> {
        self.recent_errors.iter().map(String::as_str)
    }
}

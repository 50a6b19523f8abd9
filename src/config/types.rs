//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::EventType;
use crate::output::OutputFormat;
use crate::watcher::{DEFAULT_MAX_REPLAY_LINES, DEFAULT_POLL_INTERVAL};

/// Settings read from a `vrclog` TOML file.
///
/// Command-line flags override these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VrclogConfig {
    /// Log directory; auto-detected when unset.
    pub log_dir: Option<PathBuf>,
    /// Rotation poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Output format.
    pub format: OutputFormat,
    /// Attach raw log lines to events.
    pub include_raw_line: bool,
    /// Ceiling for `--replay-last`. 0 disables the check.
    pub max_replay_lines: usize,
    /// Event types to include.
    pub include_types: Vec<EventType>,
    /// Event types to exclude.
    pub exclude_types: Vec<EventType>,
}

impl Default for VrclogConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            format: OutputFormat::Jsonl,
            include_raw_line: false,
            max_replay_lines: DEFAULT_MAX_REPLAY_LINES,
            include_types: Vec::new(),
            exclude_types: Vec::new(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(2000)
}

impl VrclogConfig {
    /// The poll interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The replay ceiling, `None` when disabled.
    #[must_use]
    pub fn max_replay_lines(&self) -> Option<usize> {
        (self.max_replay_lines > 0).then_some(self.max_replay_lines)
    }
}

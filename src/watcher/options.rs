//! Watch configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::Dispatch;

use crate::event::EventType;
use crate::filter::TypeFilter;

/// Default ceiling for [`ReplayDirective::LastN`].
pub const DEFAULT_MAX_REPLAY_LINES: usize = 10_000;

/// Default rotation poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Which historical lines to process before live tailing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayDirective {
    /// Tail only; start at the end of the current file.
    #[default]
    None,
    /// Read the current file from its first line.
    FromStart,
    /// Read the last `n` lines of the current file, then tail from its end.
    LastN(usize),
    /// Read the current file from its first line, dropping events before
    /// the given time.
    SinceTime(DateTime<Local>),
}

impl ReplayDirective {
    /// Lower time bound for delivered events, if any.
    #[must_use]
    pub fn since(&self) -> Option<DateTime<Local>> {
        match self {
            Self::SinceTime(t) => Some(*t),
            _ => None,
        }
    }

    /// Whether tailing starts at the beginning of the file.
    #[must_use]
    pub fn reads_from_start(&self) -> bool {
        matches!(self, Self::FromStart | Self::SinceTime(_))
    }
}

/// Errors from [`WatchConfig::validate`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// `LastN` asks for more lines than allowed.
    #[error("replay of {requested} lines exceeds the limit of {max}")]
    ReplayLimitExceeded { requested: usize, max: usize },

    /// The rotation poll interval is zero.
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
}

/// Configuration for a [`WatchEngine`](super::WatchEngine).
///
/// Validated once when the engine is constructed.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Log directory; `None` means auto-detect.
    pub log_dir: Option<PathBuf>,
    /// How often to look for a newer log file.
    pub poll_interval: Duration,
    /// Attach the source line to each event.
    pub include_raw_line: bool,
    /// Historical lines to process before tailing.
    pub replay: ReplayDirective,
    /// Ceiling for `LastN`; `None` disables the check.
    pub max_replay_lines: Option<usize>,
    /// Event types to deliver; empty means all.
    pub include_types: Vec<EventType>,
    /// Event types never delivered. Wins over `include_types`.
    pub exclude_types: Vec<EventType>,
    /// End the replay or the run at the first malformed line.
    pub stop_on_parse_error: bool,
    /// Where the engine's own diagnostics go. `None` discards them.
    pub diagnostics: Option<Dispatch>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            include_raw_line: false,
            replay: ReplayDirective::None,
            max_replay_lines: Some(DEFAULT_MAX_REPLAY_LINES),
            include_types: Vec::new(),
            exclude_types: Vec::new(),
            stop_on_parse_error: false,
            diagnostics: None,
        }
    }
}

impl WatchConfig {
    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the poll interval is zero or a `LastN` replay
    /// exceeds `max_replay_lines`.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.poll_interval.is_zero() {
            return Err(OptionsError::ZeroPollInterval);
        }
        if let (ReplayDirective::LastN(requested), Some(max)) =
            (self.replay, self.max_replay_lines)
        {
            if requested > max {
                return Err(OptionsError::ReplayLimitExceeded { requested, max });
            }
        }
        Ok(())
    }

    /// Compile the include/exclude lists.
    #[must_use]
    pub fn type_filter(&self) -> TypeFilter {
        TypeFilter::new(&self.include_types, &self.exclude_types)
    }
}

//! Watcher error types.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::discovery::LogFinderError;
use super::options::OptionsError;
use crate::parser::ParseError;

/// Capacity of bounded error streams.
pub const ERROR_BUFFER: usize = 16;

/// Operation that failed inside a running watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchOp {
    /// Resolving the latest log file at startup.
    FindLatest,
    /// Reading historical lines before tailing.
    Replay,
    /// Reading or reopening the tailed file.
    Tail,
    /// Polling the directory for a newer log file.
    Rotation,
}

impl WatchOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FindLatest => "find latest",
            Self::Replay => "replay",
            Self::Tail => "tail",
            Self::Rotation => "rotation",
        }
    }
}

impl fmt::Display for WatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a [`WatchError::Operation`].
#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    LogFinder(#[from] LogFinderError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors produced by the watch engine.
///
/// Lifecycle errors are returned from `new` and `start`; everything else is
/// delivered on the error channel of a running watch.
#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    /// The configuration was rejected.
    #[error("invalid options: {0}")]
    Options(#[from] OptionsError),

    /// The log directory or log file could not be found.
    #[error(transparent)]
    LogFinder(#[from] LogFinderError),

    /// The engine was already stopped.
    #[error("watcher closed")]
    Closed,

    /// `start` was called on an engine that is already running.
    #[error("already watching")]
    AlreadyWatching,

    /// A malformed log line.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// An operation of the running watch failed.
    #[error("{op}{}: {source}", display_path(.path.as_deref()))]
    Operation {
        op: WatchOp,
        path: Option<PathBuf>,
        #[source]
        source: OperationError,
    },
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| format!(" {}", p.display())).unwrap_or_default()
}

impl WatchError {
    pub(crate) fn operation(
        op: WatchOp,
        path: Option<&Path>,
        source: impl Into<OperationError>,
    ) -> Self {
        Self::Operation {
            op,
            path: path.map(Path::to_path_buf),
            source: source.into(),
        }
    }

    /// The failing operation, for [`WatchError::Operation`].
    #[must_use]
    pub fn op(&self) -> Option<WatchOp> {
        match self {
            Self::Operation { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// Whether this is a missing log directory.
    #[must_use]
    pub fn is_log_dir_not_found(&self) -> bool {
        matches!(
            self,
            Self::LogFinder(LogFinderError::LogDirNotFound(_))
                | Self::Operation {
                    source: OperationError::LogFinder(LogFinderError::LogDirNotFound(_)),
                    ..
                }
        )
    }

    /// Whether this is an empty log directory.
    #[must_use]
    pub fn is_no_log_files(&self) -> bool {
        matches!(
            self,
            Self::LogFinder(LogFinderError::NoLogFiles(_))
                | Self::Operation {
                    source: OperationError::LogFinder(LogFinderError::NoLogFiles(_)),
                    ..
                }
        )
    }
}

/// Sending half of a bounded error stream.
///
/// Reporting never waits: when the buffer is full the newest error is
/// dropped.
#[derive(Debug)]
pub(crate) struct ErrorSink<E> {
    tx: mpsc::Sender<E>,
}

impl<E: fmt::Display> ErrorSink<E> {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<E>) {
        let (tx, rx) = mpsc::channel(ERROR_BUFFER);
        (Self { tx }, rx)
    }

    /// Queue an error. Returns `false` once the receiver is gone.
    pub(crate) fn report(&self, err: E) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(TrySendError::Full(err)) => {
                tracing::debug!(error = %err, "Error buffer full, dropping error");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

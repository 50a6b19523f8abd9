//! Batch parsing of finished log files.
//!
//! Unlike the watcher, these iterators read files once from start to end.
//! Files are opened lazily on the first call to `next`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventType};
use crate::filter::TypeFilter;
use crate::parser::ParseError;
use crate::pipeline::{Admission, EventPipeline};
use crate::watcher::{self, LogFinderError};

/// Filters and error policy for batch parsing.
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Event types to yield; empty means all.
    pub include_types: Vec<EventType>,
    /// Event types never yielded. Wins over `include_types`.
    pub exclude_types: Vec<EventType>,
    /// Skip events before this time.
    pub since: Option<DateTime<Local>>,
    /// End iteration at the first event at or after this time.
    pub until: Option<DateTime<Local>>,
    /// Attach the source line to each event.
    pub include_raw_line: bool,
    /// Yield the first error and stop, instead of skipping malformed lines
    /// and unreadable files.
    pub stop_on_error: bool,
    /// Ends iteration with [`ParseFileError::Cancelled`] once cancelled.
    pub cancel: Option<CancellationToken>,
}

impl ParseOptions {
    fn pipeline(&self) -> EventPipeline {
        EventPipeline::new()
            .filter(TypeFilter::new(&self.include_types, &self.exclude_types))
            .since(self.since)
            .until(self.until)
            .include_raw_line(self.include_raw_line)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// Errors yielded by batch parsing.
#[derive(thiserror::Error, Debug)]
pub enum ParseFileError {
    /// A file could not be opened or read.
    #[error("I/O error reading {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    /// A malformed line, only yielded with `stop_on_error`.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The log directory could not be found or listed.
    #[error(transparent)]
    LogFinder(#[from] LogFinderError),

    /// Iteration was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Iterator over the events of one file. See [`parse_file`].
#[derive(Debug)]
pub struct FileEvents {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    pipeline: EventPipeline,
    options: ParseOptions,
    done: bool,
}

/// Parse one log file.
///
/// Malformed lines are skipped unless `stop_on_error` is set. An open or read
/// error is yielded once and ends the iteration.
#[must_use]
pub fn parse_file(path: impl AsRef<Path>, options: &ParseOptions) -> FileEvents {
    FileEvents {
        path: path.as_ref().to_path_buf(),
        reader: None,
        pipeline: options.pipeline(),
        options: options.clone(),
        done: false,
    }
}

/// Parse one log file into a vector.
///
/// # Errors
///
/// Returns the first error the iterator yields.
pub fn parse_file_all(
    path: impl AsRef<Path>,
    options: &ParseOptions,
) -> Result<Vec<Event>, ParseFileError> {
    parse_file(path, options).collect()
}

impl FileEvents {
    fn io_error(&mut self, source: io::Error) -> Option<Result<Event, ParseFileError>> {
        self.done = true;
        Some(Err(ParseFileError::Io {
            path: self.path.clone(),
            source,
        }))
    }
}

impl Iterator for FileEvents {
    type Item = Result<Event, ParseFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.reader.is_none() {
            match File::open(&self.path) {
                Ok(file) => self.reader = Some(BufReader::new(file)),
                Err(e) => return self.io_error(e),
            }
        }

        let mut buf = Vec::new();
        loop {
            if self.options.is_cancelled() {
                self.done = true;
                return Some(Err(ParseFileError::Cancelled));
            }

            buf.clear();
            let reader = self.reader.as_mut()?;
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => return self.io_error(e),
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            match self.pipeline.admit(line) {
                Ok(Admission::Deliver(event)) => return Some(Ok(event)),
                Ok(Admission::Skip) => {}
                Ok(Admission::PastWindow) => {
                    self.done = true;
                    return None;
                }
                Err(e) if self.options.stop_on_error => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Err(e) => {
                    tracing::debug!(path = %self.path.display(), error = %e, "Skipping malformed line");
                }
            }
        }
    }
}

/// Iterator over the events of several files. See [`parse_dir`].
#[derive(Debug)]
pub struct DirEvents {
    files: VecDeque<PathBuf>,
    current: Option<FileEvents>,
    options: ParseOptions,
    /// Error to yield before anything else.
    pending: Option<ParseFileError>,
    done: bool,
}

/// Parse every log file in a directory, oldest first by modification time.
///
/// `dir` of `None` auto-detects the log directory. A file that fails to open
/// or read is skipped unless `stop_on_error` is set.
#[must_use]
pub fn parse_dir(dir: Option<&Path>, options: &ParseOptions) -> DirEvents {
    let files = watcher::find_log_dir(dir)
        .and_then(|dir| {
            let files = watcher::list_log_files(&dir)?;
            if files.is_empty() {
                return Err(LogFinderError::NoLogFiles(dir));
            }
            Ok(files)
        });

    match files {
        Ok(files) => parse_paths(files, options),
        Err(e) => DirEvents {
            files: VecDeque::new(),
            current: None,
            options: options.clone(),
            pending: Some(e.into()),
            done: false,
        },
    }
}

/// Parse the given files in order.
#[must_use]
pub fn parse_paths(paths: impl IntoIterator<Item = PathBuf>, options: &ParseOptions) -> DirEvents {
    DirEvents {
        files: paths.into_iter().collect(),
        current: None,
        options: options.clone(),
        pending: None,
        done: false,
    }
}

impl Iterator for DirEvents {
    type Item = Result<Event, ParseFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(err) = self.pending.take() {
            self.done = true;
            return Some(Err(err));
        }

        loop {
            if self.current.is_none() {
                if self.options.is_cancelled() {
                    self.done = true;
                    return Some(Err(ParseFileError::Cancelled));
                }
                let path = self.files.pop_front()?;
                tracing::debug!(path = %path.display(), "Parsing log file");
                self.current = Some(parse_file(path, &self.options));
            }

            match self.current.as_mut()?.next() {
                Some(Ok(event)) => return Some(Ok(event)),
                None => self.current = None,
                Some(Err(e)) if self.options.stop_on_error || matches!(e, ParseFileError::Cancelled) => {
                    self.done = true;
                    return Some(Err(e));
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Skipping unreadable log file");
                    self.current = None;
                }
            }
        }
    }
}

//! Follow-mode line reader for a single log file.
//!
//! A [`LineSource`] owns one background task that reads lines appended to a
//! file and survives truncation or replacement of the file at the same path.

use std::fs::Metadata;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use super::error::ErrorSink;

/// How often the file is checked when no filesystem notification arrives.
const FALLBACK_POLL: Duration = Duration::from_millis(250);

/// Where a new [`LineSource`] starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// First byte of the file.
    Beginning,
    /// Current end of the file; only lines appended later are read.
    End,
}

/// One item from a [`LineSource`].
#[derive(Debug)]
pub enum TailEvent {
    /// A complete line without its line terminator.
    Line(String),
    /// A read or reopen failure. The source keeps running.
    Error(io::Error),
    /// The read loop has exited.
    Closed,
}

/// Device and inode of an open file.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
impl FileIdentity {
    fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Creation time, where inodes are unavailable.
#[cfg(not(unix))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity(Option<std::time::SystemTime>);

#[cfg(not(unix))]
impl FileIdentity {
    fn of(metadata: &Metadata) -> Self {
        Self(metadata.created().ok())
    }
}

/// Read position in the followed file.
#[derive(Debug)]
struct TailCursor {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    identity: FileIdentity,
    /// Incremented whenever the read position is reset.
    generation: u64,
    /// Bytes of an unterminated line, and the generation they were read in.
    pending: Vec<u8>,
    pending_generation: u64,
}

impl TailCursor {
    async fn open(path: &Path, start: StartAt) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        let identity = FileIdentity::of(&file.metadata().await?);
        let offset = match start {
            StartAt::Beginning => 0,
            StartAt::End => file.seek(SeekFrom::End(0)).await?,
        };

        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            offset,
            identity,
            generation: 0,
            pending: Vec::new(),
            pending_generation: 0,
        })
    }

    /// Next complete line, or `None` when no complete line is available yet.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        let read = self.reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        self.offset += read as u64;

        if self.pending_generation != self.generation {
            self.pending.clear();
            self.pending_generation = self.generation;
        }
        self.pending.extend_from_slice(&buf);
        if self.pending.last() != Some(&b'\n') {
            return Ok(None);
        }

        let mut line = std::mem::take(&mut self.pending);
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Reset the position if the file was truncated or replaced.
    ///
    /// A missing path is not an error; the file may be recreated.
    async fn check_rotation(&mut self) -> io::Result<()> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        if FileIdentity::of(&metadata) != self.identity {
            // Lines written to the old file before it was moved come first.
            if matches!(self.reader.fill_buf().await, Ok(rest) if !rest.is_empty()) {
                return Ok(());
            }
            tracing::info!(path = %self.path.display(), "Log file replaced, reopening");
            let file = File::open(&self.path).await?;
            self.identity = FileIdentity::of(&file.metadata().await?);
            self.reader = BufReader::new(file);
            self.reset();
        } else if metadata.len() < self.offset {
            tracing::warn!(
                path = %self.path.display(),
                old_offset = self.offset,
                new_len = metadata.len(),
                "File truncated, resetting offset to 0"
            );
            self.reader.seek(SeekFrom::Start(0)).await?;
            self.reset();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.generation += 1;
    }
}

/// Background reader of lines appended to one file.
///
/// Lines arrive through a single-slot channel, so a slow reader stalls the
/// file read. Errors go through a separate bounded buffer that drops new
/// errors when full.
#[derive(Debug)]
pub struct LineSource {
    path: PathBuf,
    lines: mpsc::Receiver<String>,
    errors: mpsc::Receiver<io::Error>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LineSource {
    /// Open `path` and start following it.
    ///
    /// The read loop ends when `parent` is cancelled or [`stop`](Self::stop)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub async fn open(
        path: &Path,
        start: StartAt,
        parent: &CancellationToken,
    ) -> io::Result<Self> {
        let cursor = TailCursor::open(path, start).await?;
        tracing::debug!(path = %path.display(), offset = cursor.offset, "Tailing log file");

        let cancel = parent.child_token();
        let (line_tx, lines) = mpsc::channel(1);
        let (error_sink, errors) = ErrorSink::channel();
        let task = tokio::spawn(
            follow(cursor, line_tx, error_sink, cancel.clone()).with_current_subscriber(),
        );

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            errors,
            cancel,
            task: Some(task),
        })
    }

    /// Path of the followed file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next line or error.
    ///
    /// Pending errors are returned before lines. Cancel safe.
    pub async fn recv(&mut self) -> TailEvent {
        tokio::select! {
            biased;
            Some(err) = self.errors.recv() => TailEvent::Error(err),
            line = self.lines.recv() => match line {
                Some(line) => TailEvent::Line(line),
                None => TailEvent::Closed,
            },
        }
    }

    /// Stop the read loop and wait for it to exit.
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(path = %self.path.display(), error = %e, "Tail task failed");
            }
            self.lines.close();
            self.errors.close();
        }
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow(
    mut cursor: TailCursor,
    lines: mpsc::Sender<String>,
    errors: ErrorSink<io::Error>,
    cancel: CancellationToken,
) {
    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let _watcher = watch_parent(&cursor.path, wake_tx);

    let mut poll = tokio::time::interval(FALLBACK_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        loop {
            match cursor.next_line().await {
                Ok(Some(line)) => {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        sent = lines.send(line) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    if !errors.report(e) {
                        return;
                    }
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            Some(()) = wake_rx.recv() => {}
            _ = poll.tick() => {}
        }

        if let Err(e) = cursor.check_rotation().await {
            if !errors.report(e) {
                return;
            }
        }
    }
}

/// Watch the file's directory so appends and recreation wake the read loop.
///
/// Returns `None` if no watcher could be set up; polling still runs.
fn watch_parent(path: &Path, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .map_err(|e| tracing::debug!(error = %e, "File notifications unavailable, polling only"))
    .ok()?;

    let dir = path.parent().unwrap_or(path);
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|e| tracing::debug!(dir = %dir.display(), error = %e, "Failed to watch directory"))
        .ok()?;

    Some(watcher)
}

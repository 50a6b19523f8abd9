//! Watch engine: replay, live tailing and rotation in one background task.
//!
//! ```text
//! Created --start()--> Watching --stop()--> Closed
//!    \_____________________stop()________________/^
//! ```
//!
//! A running watch delivers events on a single-slot channel, so a slow
//! consumer holds back reading, rotation polling and error reporting. This is
//! not a rendezvous: with the line channel inside [`LineSource`] also holding
//! one slot, up to two lines can be read ahead of a stalled consumer. Errors
//! go to a separate bounded channel and are dropped when it is full.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use super::discovery;
use super::error::{ErrorSink, WatchError, WatchOp};
use super::options::{ReplayDirective, WatchConfig};
use super::replay;
use super::rotation::{LatestFileResolver, LogDirResolver, RotationMonitor};
use super::tailer::{LineSource, StartAt, TailEvent};
use crate::event::Event;
use crate::pipeline::{Admission, EventPipeline, LineParser};

/// Observable lifecycle state of a [`WatchEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not started.
    Created,
    /// Background task running.
    Watching,
    /// Stopped. Terminal.
    Closed,
}

#[derive(Debug)]
struct RunHandle {
    cancel: CancellationToken,
    /// Cancelled once the background task has exited.
    done: CancellationToken,
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Watching(RunHandle),
    /// Holds the completion signal of the run, if there was one.
    Closed(Option<CancellationToken>),
}

/// Receivers returned by [`WatchEngine::start`].
pub type WatchChannels = (mpsc::Receiver<Event>, mpsc::Receiver<WatchError>);

/// Tails the latest VRChat log file in a directory and emits parsed events.
///
/// # Examples
///
/// ```no_run
/// use tokio_util::sync::CancellationToken;
/// use vrclog::watcher::{ReplayDirective, WatchConfig, WatchEngine};
///
/// # async fn run() -> Result<(), vrclog::watcher::WatchError> {
/// let engine = WatchEngine::new(WatchConfig {
///     replay: ReplayDirective::LastN(100),
///     ..WatchConfig::default()
/// })?;
/// let token = CancellationToken::new();
/// let (mut events, _errors) = engine.start(&token)?;
/// while let Some(event) = events.recv().await {
///     println!("{event:?}");
/// }
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct WatchEngine {
    dir: PathBuf,
    replay: ReplayDirective,
    poll_interval: Duration,
    stop_on_parse_error: bool,
    pipeline: EventPipeline,
    resolver: Arc<dyn LatestFileResolver>,
    dispatch: Dispatch,
    state: Mutex<Lifecycle>,
}

impl std::fmt::Debug for WatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEngine")
            .field("dir", &self.dir)
            .field("replay", &self.replay)
            .field("poll_interval", &self.poll_interval)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WatchEngine {
    /// Validate `config` and resolve the log directory.
    ///
    /// No task is started and no file is opened.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Options` for an invalid configuration and
    /// `WatchError::LogFinder` if no log directory is found.
    pub fn new(config: WatchConfig) -> Result<Self, WatchError> {
        config.validate()?;
        let dir = discovery::find_log_dir(config.log_dir.as_deref())?;

        let pipeline = EventPipeline::new()
            .filter(config.type_filter())
            .since(config.replay.since())
            .include_raw_line(config.include_raw_line);

        Ok(Self {
            dir,
            replay: config.replay,
            poll_interval: config.poll_interval,
            stop_on_parse_error: config.stop_on_parse_error,
            pipeline,
            resolver: Arc::new(LogDirResolver),
            dispatch: config.diagnostics.unwrap_or_else(Dispatch::none),
            state: Mutex::new(Lifecycle::Created),
        })
    }

    /// Construct and start in one call.
    ///
    /// The watch runs until `token` is cancelled, [`stop`](Self::stop) is
    /// called, or the engine is dropped.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn watch(
        config: WatchConfig,
        token: &CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<Event>, mpsc::Receiver<WatchError>), WatchError> {
        let engine = Self::new(config)?;
        let (events, errors) = engine.start(token)?;
        Ok((engine, events, errors))
    }

    /// Replace how the latest log file is chosen.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn LatestFileResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the line parser.
    #[must_use]
    pub fn with_parser(mut self, parser: LineParser) -> Self {
        self.pipeline = std::mem::take(&mut self.pipeline).parser(parser);
        self
    }

    /// The resolved log directory.
    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        match &*self.lock_state() {
            Lifecycle::Created => EngineState::Created,
            Lifecycle::Watching(_) => EngineState::Watching,
            Lifecycle::Closed(_) => EngineState::Closed,
        }
    }

    /// Start the background task.
    ///
    /// Returns the event and error receivers. Both close when the task exits,
    /// which happens after `token` is cancelled, [`stop`](Self::stop) is
    /// called, a fatal error is reported, or the event receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::AlreadyWatching` if the engine is running and
    /// `WatchError::Closed` if it was stopped. Nothing is started in either
    /// case.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(&self, token: &CancellationToken) -> Result<WatchChannels, WatchError> {
        let mut state = self.lock_state();
        match &*state {
            Lifecycle::Created => {}
            Lifecycle::Watching(_) => return Err(WatchError::AlreadyWatching),
            Lifecycle::Closed(_) => return Err(WatchError::Closed),
        }

        let cancel = token.child_token();
        let done = CancellationToken::new();
        let (events, event_rx) = mpsc::channel(1);
        let (errors, error_rx) = ErrorSink::channel();

        let run = Run {
            dir: self.dir.clone(),
            replay: self.replay,
            poll_interval: self.poll_interval,
            stop_on_parse_error: self.stop_on_parse_error,
            pipeline: self.pipeline.clone(),
            resolver: Arc::clone(&self.resolver),
            events,
            errors,
            cancel: cancel.clone(),
        };
        let completion = done.clone().drop_guard();
        tokio::spawn(
            async move {
                // The run owns both senders, so the channels are closed
                // before the completion signal fires.
                let _completion = completion;
                run.run().await;
            }
            .with_subscriber(self.dispatch.clone()),
        );

        *state = Lifecycle::Watching(RunHandle { cancel, done });
        Ok((event_rx, error_rx))
    }

    /// Stop the watch and wait for the background task to exit.
    ///
    /// Stopping an engine that was never started closes it. Repeated and
    /// concurrent calls are fine; each returns once the task is gone.
    pub async fn stop(&self) {
        let done = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut *state, Lifecycle::Closed(None)) {
                Lifecycle::Created => None,
                Lifecycle::Watching(handle) => {
                    handle.cancel.cancel();
                    *state = Lifecycle::Closed(Some(handle.done.clone()));
                    Some(handle.done)
                }
                Lifecycle::Closed(done) => {
                    *state = Lifecycle::Closed(done.clone());
                    done
                }
            }
        };

        if let Some(done) = done {
            done.cancelled().await;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WatchEngine {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Watching(handle) = state {
            handle.cancel.cancel();
        }
    }
}

/// What to do after handling one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// A malformed line with `stop_on_parse_error` set.
    ParseFailure,
    /// Cancelled or the consumer went away.
    Shutdown,
}

/// State of one background run.
struct Run {
    dir: PathBuf,
    replay: ReplayDirective,
    poll_interval: Duration,
    stop_on_parse_error: bool,
    pipeline: EventPipeline,
    resolver: Arc<dyn LatestFileResolver>,
    events: mpsc::Sender<Event>,
    errors: ErrorSink<WatchError>,
    cancel: CancellationToken,
}

impl Run {
    async fn run(self) {
        tracing::debug!(dir = %self.dir.display(), replay = ?self.replay, "Watch started");

        let latest = match self.resolver.latest(&self.dir) {
            Ok(path) => path,
            Err(e) => {
                self.report(WatchError::operation(WatchOp::FindLatest, Some(&self.dir), e));
                return;
            }
        };

        if let ReplayDirective::LastN(n) = self.replay {
            if n > 0 && self.replay_last(&latest, n).await == Flow::Shutdown {
                return;
            }
        }

        let start = if self.replay.reads_from_start() {
            StartAt::Beginning
        } else {
            StartAt::End
        };
        let source = match LineSource::open(&latest, start, &self.cancel).await {
            Ok(source) => source,
            Err(e) => {
                self.report(WatchError::operation(WatchOp::Tail, Some(&latest), e));
                return;
            }
        };

        self.tail(source, latest).await;
        tracing::debug!(dir = %self.dir.display(), "Watch stopped");
    }

    async fn replay_last(&self, path: &Path, n: usize) -> Flow {
        let owned = path.to_path_buf();
        let read = tokio::task::spawn_blocking(move || replay::read_last_lines(&owned, n));
        let lines = match join_blocking(read, &self.cancel).await {
            None => return Flow::Shutdown,
            Some(joined) => match joined {
                Ok(Ok(lines)) => lines,
                Ok(Err(e)) => {
                    self.report(WatchError::operation(WatchOp::Replay, Some(path), e));
                    return Flow::Continue;
                }
                Err(e) => {
                    self.report(WatchError::operation(WatchOp::Replay, Some(path), std::io::Error::other(e)));
                    return Flow::Continue;
                }
            },
        };
        tracing::debug!(path = %path.display(), lines = lines.len(), "Replaying last lines");

        for line in &lines {
            if self.cancel.is_cancelled() {
                return Flow::Shutdown;
            }
            match self.process(line).await {
                Flow::Continue => {}
                Flow::ParseFailure => return Flow::Continue,
                Flow::Shutdown => return Flow::Shutdown,
            }
        }
        Flow::Continue
    }

    async fn tail(&self, mut source: LineSource, current: PathBuf) {
        let mut monitor =
            RotationMonitor::new(&self.dir, self.resolver.as_ref(), current, self.poll_interval);

        loop {
            let flow = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Flow::Shutdown,
                event = source.recv() => match event {
                    TailEvent::Line(line) => self.process(&line).await,
                    TailEvent::Error(e) => {
                        self.report(WatchError::operation(WatchOp::Tail, Some(source.path()), e));
                        Flow::Continue
                    }
                    TailEvent::Closed => Flow::Shutdown,
                },
                () = monitor.tick() => self.rotate(&mut monitor, &mut source).await,
            };
            if flow != Flow::Continue {
                break;
            }
        }

        source.stop().await;
    }

    /// Switch to a newer log file if there is one.
    ///
    /// The new file is always read from its first line. If it cannot be
    /// opened the current file stays active until the next poll.
    async fn rotate(&self, monitor: &mut RotationMonitor<'_>, source: &mut LineSource) -> Flow {
        let next = match monitor.check() {
            Ok(Some(next)) => next,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                self.report(WatchError::operation(WatchOp::Rotation, Some(&self.dir), e));
                return Flow::Continue;
            }
        };

        let replacement = match LineSource::open(&next, StartAt::Beginning, &self.cancel).await {
            Ok(replacement) => replacement,
            Err(e) => {
                self.report(WatchError::operation(WatchOp::Tail, Some(&next), e));
                return Flow::Continue;
            }
        };
        tracing::info!(
            from = %monitor.current().display(),
            to = %next.display(),
            "Log file rotated"
        );

        let mut old = std::mem::replace(source, replacement);
        monitor.commit(next);
        old.stop().await;

        // Lines the old source had already read go out before any line of
        // the new file.
        loop {
            match old.recv().await {
                TailEvent::Line(line) => match self.process(&line).await {
                    Flow::Continue => {}
                    flow => return flow,
                },
                TailEvent::Error(e) => {
                    self.report(WatchError::operation(WatchOp::Tail, Some(old.path()), e));
                }
                TailEvent::Closed => return Flow::Continue,
            }
        }
    }

    async fn process(&self, line: &str) -> Flow {
        match self.pipeline.admit(line) {
            Ok(Admission::Deliver(event)) => {
                match send_with_cancellation(&self.events, event, &self.cancel).await {
                    Ok(()) => Flow::Continue,
                    Err(e) => {
                        tracing::debug!(reason = %e, "Event delivery stopped");
                        Flow::Shutdown
                    }
                }
            }
            Ok(Admission::Skip | Admission::PastWindow) => Flow::Continue,
            Err(e) => {
                self.report(e.into());
                if self.stop_on_parse_error {
                    Flow::ParseFailure
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn report(&self, err: WatchError) {
        tracing::debug!(error = %err, "Watch error");
        self.errors.report(err);
    }
}

/// Wait for a blocking task, or for cancellation.
///
/// Blocking work cannot be interrupted, so on cancellation the task is still
/// awaited before returning `None`.
async fn join_blocking<T>(
    mut task: JoinHandle<T>,
    cancel: &CancellationToken,
) -> Option<Result<T, JoinError>> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Blocking task failed after cancellation");
            }
            None
        }
        joined = &mut task => Some(joined),
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
enum SendError {
    #[error("cancelled")]
    Cancelled,
    #[error("receiver dropped")]
    ChannelClosed,
}

/// Send on a bounded channel, giving up as soon as `cancel` fires.
async fn send_with_cancellation<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    cancel: &CancellationToken,
) -> Result<(), SendError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SendError::Cancelled),
        sent = tx.send(item) => sent.map_err(|_| SendError::ChannelClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("output_log_a.txt"), "").unwrap();
        dir
    }

    fn config(dir: &TempDir) -> WatchConfig {
        WatchConfig {
            log_dir: Some(dir.path().to_path_buf()),
            poll_interval: Duration::from_millis(100),
            ..WatchConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = log_dir();
        let result = WatchEngine::new(WatchConfig {
            poll_interval: Duration::ZERO,
            ..config(&dir)
        });
        assert!(matches!(result, Err(WatchError::Options(_))));
    }

    #[test]
    fn test_new_requires_log_dir() {
        let dir = TempDir::new().unwrap();
        let result = WatchEngine::new(config(&dir));
        assert!(matches!(result, Err(ref e) if e.is_log_dir_not_found()));
    }

    #[test]
    fn test_new_starts_in_created_state() {
        let dir = log_dir();
        let engine = WatchEngine::new(config(&dir)).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(
            engine.log_dir(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = log_dir();
        let engine = WatchEngine::new(config(&dir)).unwrap();
        let token = CancellationToken::new();

        let _channels = engine.start(&token).unwrap();
        assert_eq!(engine.state(), EngineState::Watching);
        assert!(matches!(engine.start(&token), Err(WatchError::AlreadyWatching)));
        assert_eq!(engine.state(), EngineState::Watching);

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn test_start_after_stop_fails() {
        let dir = log_dir();
        let engine = WatchEngine::new(config(&dir)).unwrap();
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Closed);

        let token = CancellationToken::new();
        assert!(matches!(engine.start(&token), Err(WatchError::Closed)));
    }

    #[tokio::test]
    async fn test_stop_closes_channels() {
        let dir = log_dir();
        let engine = WatchEngine::new(config(&dir)).unwrap();
        let token = CancellationToken::new();
        let (mut events, mut errors) = engine.start(&token).unwrap();

        engine.stop().await;
        assert!(events.recv().await.is_none());
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_join_blocking_waits_for_task_on_cancel() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let task = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.store(true, Ordering::SeqCst);
        });

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(join_blocking(task, &cancel).await.is_none());
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_join_blocking_returns_result() {
        let task = tokio::task::spawn_blocking(|| 7);
        let cancel = CancellationToken::new();
        assert_eq!(join_blocking(task, &cancel).await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_stop_during_replay_waits_for_read() {
        let dir = log_dir();
        let path = dir.path().join("output_log_a.txt");
        let content: String = (0..20_000)
            .map(|i| format!("2024.01.15 12:00:00 Log        -  [Behaviour] OnPlayerJoined U{i}\n"))
            .collect();
        std::fs::write(&path, content).unwrap();

        let engine = WatchEngine::new(WatchConfig {
            replay: ReplayDirective::LastN(10_000),
            ..config(&dir)
        })
        .unwrap();
        let token = CancellationToken::new();
        let (mut events, _errors) = engine.start(&token).unwrap();

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Closed);
        // The run task has exited, so the event sender is gone.
        while events.recv().await.is_some() {}
    }

    #[tokio::test]
    async fn test_send_with_cancellation_aborts_blocked_send() {
        let (tx, _rx) = mpsc::channel(1);
        tx.send(1).await.unwrap();

        let cancel = CancellationToken::new();
        let pending = send_with_cancellation(&tx, 2, &cancel);
        cancel.cancel();
        assert_eq!(pending.await, Err(SendError::Cancelled));
    }

    #[tokio::test]
    async fn test_send_with_cancellation_closed_receiver() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);
        let cancel = CancellationToken::new();
        assert_eq!(
            send_with_cancellation(&tx, 1, &cancel).await,
            Err(SendError::ChannelClosed)
        );
    }
}

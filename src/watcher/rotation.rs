//! Periodic detection of a newer log file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Interval, Instant, MissedTickBehavior};

use super::discovery::{self, LogFinderError};

/// Source of the current latest log file in a directory.
pub trait LatestFileResolver: Send + Sync {
    /// Path of the latest log file in `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or holds no log
    /// files.
    fn latest(&self, dir: &Path) -> Result<PathBuf, LogFinderError>;
}

/// Picks the most recently modified `output_log_*.txt` file.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDirResolver;

impl LatestFileResolver for LogDirResolver {
    fn latest(&self, dir: &Path) -> Result<PathBuf, LogFinderError> {
        discovery::find_latest_log_file(dir)
    }
}

/// Compares the latest file in a directory against the tailed one on a
/// fixed interval.
///
/// Files that were tailed before are never switched back to.
pub struct RotationMonitor<'a> {
    dir: &'a Path,
    resolver: &'a dyn LatestFileResolver,
    current: PathBuf,
    retired: HashSet<PathBuf>,
    interval: Interval,
}

impl<'a> RotationMonitor<'a> {
    /// Start monitoring; the first tick fires one `period` from now.
    #[must_use]
    pub fn new(
        dir: &'a Path,
        resolver: &'a dyn LatestFileResolver,
        current: PathBuf,
        period: Duration,
    ) -> Self {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            dir,
            resolver,
            current,
            retired: HashSet::new(),
            interval,
        }
    }

    /// File currently considered active.
    #[must_use]
    pub fn current(&self) -> &Path {
        &self.current
    }

    /// Wait for the next poll. Cancel safe.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Look up the latest file.
    ///
    /// Returns `Some(path)` if it differs from the current file and was not
    /// tailed before.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error; the current file stays active.
    pub fn check(&self) -> Result<Option<PathBuf>, LogFinderError> {
        let latest = self.resolver.latest(self.dir)?;
        if latest == self.current || self.retired.contains(&latest) {
            return Ok(None);
        }
        Ok(Some(latest))
    }

    /// Record a completed switch to `next`.
    pub fn commit(&mut self, next: PathBuf) {
        let previous = std::mem::replace(&mut self.current, next);
        self.retired.insert(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Resolver returning a scripted sequence of answers.
    struct Scripted(Mutex<Vec<Result<PathBuf, LogFinderError>>>);

    impl Scripted {
        fn new(mut answers: Vec<Result<PathBuf, LogFinderError>>) -> Self {
            answers.reverse();
            Self(Mutex::new(answers))
        }
    }

    impl LatestFileResolver for Scripted {
        fn latest(&self, dir: &Path) -> Result<PathBuf, LogFinderError> {
            self.0
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(LogFinderError::NoLogFiles(dir.to_path_buf())))
        }
    }

    #[tokio::test]
    async fn test_detects_new_file() {
        let resolver = Scripted::new(vec![Ok(PathBuf::from("/logs/a")), Ok(PathBuf::from("/logs/b"))]);
        let dir = Path::new("/logs");
        let mut monitor = RotationMonitor::new(dir, &resolver, PathBuf::from("/logs/a"), Duration::from_secs(2));

        assert_eq!(monitor.check().unwrap(), None);
        let next = monitor.check().unwrap().unwrap();
        assert_eq!(next, PathBuf::from("/logs/b"));

        monitor.commit(next);
        assert_eq!(monitor.current(), Path::new("/logs/b"));
    }

    #[tokio::test]
    async fn test_never_returns_to_retired_file() {
        let resolver = Scripted::new(vec![Ok(PathBuf::from("/logs/a"))]);
        let dir = Path::new("/logs");
        let mut monitor = RotationMonitor::new(dir, &resolver, PathBuf::from("/logs/a"), Duration::from_secs(2));
        monitor.commit(PathBuf::from("/logs/b"));

        assert_eq!(monitor.check().unwrap(), None);
    }

    #[tokio::test]
    async fn test_resolver_error_keeps_current() {
        let resolver = Scripted::new(vec![]);
        let dir = Path::new("/logs");
        let monitor = RotationMonitor::new(dir, &resolver, PathBuf::from("/logs/a"), Duration::from_secs(2));

        assert!(matches!(monitor.check(), Err(LogFinderError::NoLogFiles(_))));
        assert_eq!(monitor.current(), Path::new("/logs/a"));
    }

    #[tokio::test]
    async fn test_first_tick_after_one_period() {
        let resolver = LogDirResolver;
        let dir = Path::new("/logs");
        let period = Duration::from_millis(100);
        let start = Instant::now();
        let mut monitor = RotationMonitor::new(dir, &resolver, PathBuf::from("/logs/a"), period);

        monitor.tick().await;
        assert!(start.elapsed() >= period);
    }
}

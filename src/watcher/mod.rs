//! Live watching of VRChat log files.
//!
//! [`WatchEngine`] replays history, follows the latest `output_log_*.txt`
//! file and switches to a newer one when VRChat starts a new session.

mod discovery;
mod engine;
mod error;
mod options;
mod replay;
mod rotation;
mod tailer;

pub use discovery::{
    default_log_dirs, find_latest_log_file, find_log_dir, is_log_file_name, list_log_files,
    LogFinderError, ENV_LOG_DIR,
};
pub use engine::{EngineState, WatchChannels, WatchEngine};
pub use error::{OperationError, WatchError, WatchOp, ERROR_BUFFER};
pub use options::{
    OptionsError, ReplayDirective, WatchConfig, DEFAULT_MAX_REPLAY_LINES, DEFAULT_POLL_INTERVAL,
};
pub use replay::{read_last_lines, CHUNK_SIZE};
pub use rotation::{LatestFileResolver, LogDirResolver, RotationMonitor};
pub use tailer::{LineSource, StartAt, TailEvent};

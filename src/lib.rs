//! vrclog - tail, replay and parse VRChat log files as typed events.

pub mod batch;
pub mod config;
pub mod event;
pub mod filter;
pub mod output;
pub mod parser;
pub mod pipeline;
pub mod watcher;

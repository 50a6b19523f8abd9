//! Event output formats for the CLI.

use std::io::{self, Write};

use owo_colors::OwoColorize;
use serde::{Deserialize, Serialize};

use crate::event::{Event, EventType};

/// How events are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    /// Short human-readable lines.
    Pretty,
}

/// Errors writing an event.
#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    #[error("failed to write event: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode event: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write one event in the given format, followed by a newline.
///
/// `color` only affects [`OutputFormat::Pretty`].
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub fn write_event<W: Write>(
    writer: &mut W,
    format: OutputFormat,
    event: &Event,
    color: bool,
) -> Result<(), OutputError> {
    match format {
        OutputFormat::Jsonl => {
            serde_json::to_writer(&mut *writer, event)?;
            writeln!(writer)?;
        }
        OutputFormat::Pretty => writeln!(writer, "{}", pretty_line(event, color))?,
    }
    Ok(())
}

/// Render an event as a single pretty line, without the newline.
#[must_use]
pub fn pretty_line(event: &Event, color: bool) -> String {
    let ts = format!("[{}]", event.timestamp.format("%H:%M:%S"));
    let name = event.player_name.as_deref().unwrap_or_default();

    let (marker, text) = match event.event_type {
        EventType::PlayerJoin => ("+", format!("{name} joined")),
        EventType::PlayerLeft => ("-", format!("{name} left")),
        EventType::WorldJoin => match &event.world_name {
            Some(world) => (">", format!("Joined world: {world}")),
            None => (
                ">",
                format!(
                    "Joined instance: {}",
                    event.instance_id.as_deref().unwrap_or_default()
                ),
            ),
        },
    };

    if !color {
        return format!("{ts} {marker} {text}");
    }
    let marker = match event.event_type {
        EventType::PlayerJoin => marker.green().bold().to_string(),
        EventType::PlayerLeft => marker.red().bold().to_string(),
        EventType::WorldJoin => marker.cyan().bold().to_string(),
    };
    format!("{} {marker} {text}", ts.dimmed())
}

//! Line parser for VRChat `output_log_*.txt` files.
//!
//! Lines look like
//! `2024.01.15 23:59:59 Log        -  [Behaviour] OnPlayerJoined TestUser`.
//! Only a handful of `[Behaviour]` lines are recognized; everything else is
//! reported as "no event" rather than as an error.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use regex::Regex;

use crate::event::{Event, EventType};

const TIMESTAMP_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2})\s").expect("timestamp regex is valid")
});

static PLAYER_JOINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Behaviour\] OnPlayerJoined (.*)$").expect("player joined regex is valid")
});

static PLAYER_LEFT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Behaviour\] OnPlayerLeft (.*)$").expect("player left regex is valid")
});

static ENTERING_ROOM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Behaviour\] Entering Room: (.*)$").expect("entering room regex is valid")
});

static JOINING_INSTANCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[Behaviour\] Joining (wrld_[^:\s]+):(.*)$").expect("joining regex is valid")
});

static PLAYER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*\((usr_[^)]+)\)$").expect("player id regex is valid")
});

/// Why a recognized line could not be turned into an event.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseLineError {
    /// The line has an event marker but no leading timestamp.
    #[error("missing timestamp")]
    MissingTimestamp,

    /// The leading timestamp is not a valid local date and time.
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    /// A required field of the event is empty.
    #[error("empty {field} in {event_type} line")]
    EmptyField {
        field: &'static str,
        event_type: EventType,
    },
}

/// A malformed line together with the reason it was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("parse error: {cause} (line: {line:?})")]
pub struct ParseError {
    /// The offending line.
    pub line: String,
    /// Why it was rejected.
    #[source]
    pub cause: ParseLineError,
}

impl ParseError {
    #[must_use]
    pub fn new(line: impl Into<String>, cause: ParseLineError) -> Self {
        Self {
            line: line.into(),
            cause,
        }
    }
}

/// Parse a single log line.
///
/// Returns `Ok(Some(event))` for a recognized event, `Ok(None)` for a line
/// that matches no known pattern, and an error for a recognized line that is
/// malformed.
///
/// # Errors
///
/// Returns [`ParseLineError`] if the line carries an event marker but its
/// timestamp or required fields are missing or invalid.
///
/// # Examples
///
/// ```
/// use vrclog::event::EventType;
/// use vrclog::parser::parse_line;
///
/// let line = "2024.01.15 23:59:59 Log        -  [Behaviour] OnPlayerJoined TestUser";
/// let event = parse_line(line).unwrap().unwrap();
/// assert_eq!(event.event_type, EventType::PlayerJoin);
/// assert_eq!(event.player_name.as_deref(), Some("TestUser"));
///
/// assert!(parse_line("some random text").unwrap().is_none());
/// ```
pub fn parse_line(line: &str) -> Result<Option<Event>, ParseLineError> {
    // Cheap rejection for the overwhelming majority of lines.
    if !line.contains("[Behaviour]") {
        return Ok(None);
    }
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(caps) = PLAYER_JOINED_RE.captures(line) {
        return player_event(line, EventType::PlayerJoin, &caps[1]).map(Some);
    }
    if let Some(caps) = PLAYER_LEFT_RE.captures(line) {
        return player_event(line, EventType::PlayerLeft, &caps[1]).map(Some);
    }
    if let Some(caps) = ENTERING_ROOM_RE.captures(line) {
        let world_name = caps[1].trim();
        if world_name.is_empty() {
            return Err(ParseLineError::EmptyField {
                field: "world name",
                event_type: EventType::WorldJoin,
            });
        }
        let mut event = Event::new(EventType::WorldJoin, parse_timestamp(line)?);
        event.world_name = Some(world_name.to_string());
        return Ok(Some(event));
    }
    if let Some(caps) = JOINING_INSTANCE_RE.captures(line) {
        let instance_id = caps[2].trim();
        if instance_id.is_empty() {
            return Err(ParseLineError::EmptyField {
                field: "instance id",
                event_type: EventType::WorldJoin,
            });
        }
        let mut event = Event::new(EventType::WorldJoin, parse_timestamp(line)?);
        event.world_id = Some(caps[1].to_string());
        event.instance_id = Some(instance_id.to_string());
        return Ok(Some(event));
    }

    Ok(None)
}

fn player_event(line: &str, event_type: EventType, rest: &str) -> Result<Event, ParseLineError> {
    let rest = rest.trim();
    let (name, id) = match PLAYER_ID_RE.captures(rest) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()),
            caps.get(2).map(|m| m.as_str().to_string()),
        ),
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(ParseLineError::EmptyField {
            field: "player name",
            event_type,
        });
    }

    let mut event = Event::new(event_type, parse_timestamp(line)?);
    event.player_name = Some(name.to_string());
    event.player_id = id;
    Ok(event)
}

fn parse_timestamp(line: &str) -> Result<DateTime<Local>, ParseLineError> {
    let raw = TIMESTAMP_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or(ParseLineError::MissingTimestamp)?;

    let naive = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| ParseLineError::InvalidTimestamp(raw.to_string()))?;

    // Local times inside a DST gap do not exist.
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ParseLineError::InvalidTimestamp(raw.to_string()))
}

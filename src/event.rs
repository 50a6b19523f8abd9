//! Typed VRChat log events.
//!
//! An [`Event`] is produced from a single log line by the parser and is never
//! mutated after it leaves the pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Kind of a parsed log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The local user joined a world instance.
    WorldJoin,
    /// Another player joined the instance.
    PlayerJoin,
    /// Another player left the instance.
    PlayerLeft,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 3] = [Self::WorldJoin, Self::PlayerJoin, Self::PlayerLeft];

    /// Wire name of this event type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorldJoin => "world_join",
            Self::PlayerJoin => "player_join",
            Self::PlayerLeft => "player_left",
        }
    }

    /// Sorted list of all valid event type names.
    #[must_use]
    pub fn names() -> Vec<&'static str> {
        let mut names: Vec<_> = Self::ALL.iter().map(|t| t.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an event type name is not recognized.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown event type {:?} (valid: {})", .name, EventType::names().join(", "))]
pub struct UnknownEventType {
    /// The name as given.
    pub name: String,
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    /// Parse an event type name, ignoring case and surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| UnknownEventType {
                name: s.to_string(),
            })
    }
}

/// A parsed VRChat log event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event occurred, in the local time zone of the log.
    pub timestamp: DateTime<Local>,
    /// Display name of the player (player events).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    /// VRChat user id (`usr_…`), when the log carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// VRChat world id (`wrld_…`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_id: Option<String>,
    /// Display name of the world.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_name: Option<String>,
    /// Instance identifier, e.g. `12345~region(us)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// The source log line, only present when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_line: Option<String>,
}

impl Event {
    /// Create an event with no kind-specific fields set.
    #[must_use]
    pub fn new(event_type: EventType, timestamp: DateTime<Local>) -> Self {
        Self {
            event_type,
            timestamp,
            player_name: None,
            player_id: None,
            world_id: None,
            world_name: None,
            instance_id: None,
            raw_line: None,
        }
    }

    /// Attach the source line this event was parsed from.
    #[must_use]
    pub fn with_raw_line(mut self, line: impl Into<String>) -> Self {
        self.raw_line = Some(line.into());
        self
    }
}

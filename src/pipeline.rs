//! Line-to-event assembly shared by the watcher and batch parsing.
//!
//! The pipeline is pure: it parses a line, applies the time window and type
//! filter, and attaches the raw line when asked to. Delivery is left to the
//! caller.

use chrono::{DateTime, Local};

use crate::event::Event;
use crate::filter::TypeFilter;
use crate::parser::{self, ParseError, ParseLineError};

/// Signature of the line parser collaborator.
///
/// Must be stateless: `Ok(Some(_))` is an event, `Ok(None)` an unrecognized
/// line, `Err(_)` a malformed line.
pub type LineParser = fn(&str) -> Result<Option<Event>, ParseLineError>;

/// What the pipeline decided for one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The event passed every stage and should be delivered.
    Deliver(Event),
    /// Unrecognized line, or an event removed by a filter.
    Skip,
    /// The event is at or past the end of the time window.
    PastWindow,
}

/// Parser plus filters, configured once and applied to every line.
#[derive(Debug, Clone)]
pub struct EventPipeline {
    parser: LineParser,
    filter: TypeFilter,
    since: Option<DateTime<Local>>,
    until: Option<DateTime<Local>>,
    include_raw_line: bool,
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPipeline {
    /// Pipeline using the built-in parser and no filtering.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parser: parser::parse_line,
            filter: TypeFilter::allow_all(),
            since: None,
            until: None,
            include_raw_line: false,
        }
    }

    /// Replace the line parser.
    #[must_use]
    pub fn parser(mut self, parser: LineParser) -> Self {
        self.parser = parser;
        self
    }

    /// Set the event type filter.
    #[must_use]
    pub fn filter(mut self, filter: TypeFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Drop events strictly before this time.
    #[must_use]
    pub fn since(mut self, since: Option<DateTime<Local>>) -> Self {
        self.since = since;
        self
    }

    /// Stop at the first event at or after this time.
    #[must_use]
    pub fn until(mut self, until: Option<DateTime<Local>>) -> Self {
        self.until = until;
        self
    }

    /// Attach the source line to delivered events.
    #[must_use]
    pub fn include_raw_line(mut self, include: bool) -> Self {
        self.include_raw_line = include;
        self
    }

    /// Run one line through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] carrying the line when the parser rejects it.
    pub fn admit(&self, line: &str) -> Result<Admission, ParseError> {
        let Some(event) = (self.parser)(line).map_err(|cause| ParseError::new(line, cause))? else {
            return Ok(Admission::Skip);
        };

        if self.since.is_some_and(|since| event.timestamp < since) {
            return Ok(Admission::Skip);
        }
        if self.until.is_some_and(|until| event.timestamp >= until) {
            return Ok(Admission::PastWindow);
        }
        if !self.filter.allows(event.event_type) {
            return Ok(Admission::Skip);
        }

        if self.include_raw_line {
            Ok(Admission::Deliver(event.with_raw_line(line)))
        } else {
            Ok(Admission::Deliver(event))
        }
    }
}

//! Event type allow/deny filter.

use std::collections::HashSet;

use crate::event::EventType;

/// Compiled include/exclude filter over event types.
///
/// An empty include set allows every type. Excluded types are always
/// rejected, even when they are also included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeFilter {
    include: HashSet<EventType>,
    exclude: HashSet<EventType>,
}

impl TypeFilter {
    /// Compile a filter from include and exclude lists.
    #[must_use]
    pub fn new(include: &[EventType], exclude: &[EventType]) -> Self {
        Self {
            include: include.iter().copied().collect(),
            exclude: exclude.iter().copied().collect(),
        }
    }

    /// A filter that allows every event type.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Whether events of this type pass the filter.
    #[must_use]
    pub fn allows(&self, event_type: EventType) -> bool {
        if self.exclude.contains(&event_type) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&event_type)
    }

    /// Whether the filter lets everything through.
    #[must_use]
    pub fn is_allow_all(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

//! # bus::history
//!
//! Fixed-capacity replay buffer.  When full, the oldest event is evicted.

use std::collections::VecDeque;

use crate::events::{Event, EventKind};

/// Default number of events kept for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

#[derive(Debug)]
pub struct EventHistory {
    capacity: usize,
    events:   VecDeque<Event>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            self.events.pop_front(); // evict oldest
        }
        self.events.push_back(event);
    }

    /// Oldest → newest, optionally filtered to one kind.
    pub fn snapshot(&self, kind: Option<EventKind>) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| kind.map_or(true, |k| e.kind() == k))
            .cloned()
            .collect()
    }

    /// Most recent event of `kind`, if still in the buffer.
    pub fn latest(&self, kind: EventKind) -> Option<Event> {
        self.events.iter().rev().find(|e| e.kind() == kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Command, EventPayload};

    fn ev() -> Event {
        Event::new(EventPayload::Command(Command::QueryAutomation))
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut h = EventHistory::new(3);
        let events: Vec<Event> = (0..5).map(|_| ev()).collect();
        for e in &events {
            h.push(e.clone());
        }
        let kept = h.snapshot(None);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept, events[2..].to_vec());
    }

    #[test]
    fn test_filter_by_kind() {
        let mut h = EventHistory::new(10);
        h.push(ev());
        h.push(Event::new(EventPayload::CriticalError { source: "t".into(), message: "m".into() }));
        assert_eq!(h.snapshot(Some(EventKind::CriticalError)).len(), 1);
        assert!(h.latest(EventKind::Command).is_some());
        assert!(h.latest(EventKind::NewCandle).is_none());
    }
}

//! Bounded, compressed record of a session's events.

use daycare_spec::{EventMessage, TRANSCRIPT_DATA_LIMIT, TRANSCRIPT_EVENT_COUNT_LIMIT};
use tracing::info;

/// Ordered event record with a stream-byte budget and an event-count budget.
///
/// A stream event that continues the same stream as the last stored event is
/// merged into it. Stream bytes past the byte budget are counted and dropped,
/// and events that would need a new slot past the count budget are dropped.
#[derive(Debug, Clone)]
pub struct Transcript {
    events: Vec<EventMessage>,
    data_limit: usize,
    event_limit: usize,
    data_len: usize,
    discarded_bytes: usize,
    discarded_events: usize,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::with_limits(TRANSCRIPT_DATA_LIMIT, TRANSCRIPT_EVENT_COUNT_LIMIT)
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(data_limit: usize, event_limit: usize) -> Self {
        Self {
            events: Vec::new(),
            data_limit,
            event_limit,
            data_len: 0,
            discarded_bytes: 0,
            discarded_events: 0,
        }
    }

    pub fn record(&mut self, event: EventMessage) {
        let len = event.stream_len();
        if event.event.is_stream() && self.data_len >= self.data_limit {
            self.discarded_bytes += len;
            return;
        }

        let event = match self.events.last_mut() {
            Some(tail) if event.event.is_stream() => match tail.merge(event) {
                Ok(()) => {
                    self.data_len += len;
                    return;
                }
                Err(event) => event,
            },
            _ => event,
        };

        if self.events.len() < self.event_limit {
            self.events.push(event);
            self.data_len += len;
        } else {
            self.discarded_events += 1;
            self.discarded_bytes += len;
        }
    }

    pub fn events(&self) -> &[EventMessage] {
        &self.events
    }

    pub fn into_events(self) -> Vec<EventMessage> {
        self.events
    }

    /// Stream bytes dropped by the byte budget.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded_bytes
    }

    /// Events dropped by the count budget.
    pub fn discarded_events(&self) -> usize {
        self.discarded_events
    }

    /// Log truncation once, if anything was dropped.
    pub fn log_truncation(&self) {
        if self.discarded_bytes > 0 || self.discarded_events > 0 {
            info!(
                discarded_events = self.discarded_events,
                discarded_bytes = self.discarded_bytes,
                "transcript truncated"
            );
        }
    }
}

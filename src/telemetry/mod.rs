//! Fire-and-forget event emission
//!
//! Decision points in the pool, coordinator and routers report named events
//! through an [`EventSink`]. Sinks must never block or fail.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;

/// Subsystem an event originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Mux,
    Worker,
    Sharding,
    Taf,
    Eviction,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Mux => "mux",
            EventKind::Worker => "worker",
            EventKind::Sharding => "sharding",
            EventKind::Taf => "taf",
            EventKind::Eviction => "eviction",
        };
        f.write_str(s)
    }
}

/// Outcome attached to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub name: String,
    pub status: EventStatus,
    pub data: Vec<(String, String)>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            status: EventStatus::Ok,
            data: Vec::new(),
            at: Utc::now(),
        }
    }

    pub fn warning(mut self) -> Self {
        self.status = EventStatus::Warning;
        self
    }

    pub fn error(mut self) -> Self {
        self.status = EventStatus::Error;
        self
    }

    pub fn with(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.data.push((key.to_string(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Writes events to the `tracing` subscriber
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let data = event
            .data
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        match event.status {
            EventStatus::Ok => {
                tracing::info!(target: "dbmux::event", kind = %event.kind, name = %event.name, "{}", data)
            }
            EventStatus::Warning => {
                tracing::warn!(target: "dbmux::event", kind = %event.kind, name = %event.name, "{}", data)
            }
            EventStatus::Error => {
                tracing::error!(target: "dbmux::event", kind = %event.kind, name = %event.name, "{}", data)
            }
        }
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Keeps events in memory; used by tests and diagnostics
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }

    pub fn find(&self, name: &str) -> Option<Event> {
        self.events.lock().iter().find(|e| e.name == name).cloned()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemorySink::new();
        sink.emit(Event::new(EventKind::Eviction, "HARD_EVICTION").with("sqlhash", 42));
        sink.emit(Event::new(EventKind::Eviction, "BIND_EVICT").warning());
        sink.emit(Event::new(EventKind::Eviction, "HARD_EVICTION"));

        assert_eq!(sink.count("HARD_EVICTION"), 2);
        assert_eq!(sink.find("HARD_EVICTION").unwrap().get("sqlhash"), Some("42"));
        assert_eq!(sink.find("BIND_EVICT").unwrap().status, EventStatus::Warning);
    }
}

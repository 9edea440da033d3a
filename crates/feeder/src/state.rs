//! Process-local state shown on the status surface: broker connectivity and
//! the bounded local log.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Default capacity of the local log.
pub const DEFAULT_MAX_LOG: usize = 500;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    log: VecDeque<LogEntry>,
    max_log: usize,
    /// Entries added since the last flush to storage.
    dirty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub kind: EventKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Automation switched, dosing, nursery cycles.
    Operation,
    Connection,
    Error,
    /// Free-text note added through the local API.
    Note,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOG)
    }
}

impl SystemState {
    pub fn new(max_log: usize) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            log: VecDeque::with_capacity(max_log.min(DEFAULT_MAX_LOG)),
            max_log,
            dirty: false,
        }
    }

    pub fn shared(max_log: usize) -> SharedState {
        Arc::new(RwLock::new(Self::new(max_log)))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn max_log(&self) -> usize {
        self.max_log
    }

    /// Shrinking drops the oldest entries.
    pub fn set_max_log(&mut self, max_log: usize) {
        self.max_log = max_log;
        while self.log.len() > max_log {
            self.log.pop_front();
            self.dirty = true;
        }
    }

    pub fn reset_log(&mut self) {
        self.log.clear();
        self.dirty = true;
    }

    pub fn record_operation(&mut self, message: String) {
        self.push(EventKind::Operation, message);
    }

    pub fn record_error(&mut self, message: String) {
        self.push(EventKind::Error, message);
    }

    pub fn record_note(&mut self, message: String) {
        self.push(EventKind::Note, message);
    }

    /// Track broker connectivity; only transitions are logged.
    pub fn record_connection(&mut self, connected: bool) {
        if self.mqtt_connected == connected {
            return;
        }
        self.mqtt_connected = connected;
        let msg = if connected {
            "broker connected"
        } else {
            "broker disconnected"
        };
        self.push(EventKind::Connection, msg.to_string());
    }

    fn push(&mut self, kind: EventKind, message: String) {
        self.push_entry(LogEntry {
            time: OffsetDateTime::now_utc(),
            kind,
            message,
        });
    }

    fn push_entry(&mut self, entry: LogEntry) {
        if self.max_log == 0 {
            return;
        }
        while self.log.len() >= self.max_log {
            self.log.pop_front();
        }
        self.log.push_back(entry);
        self.dirty = true;
    }

    // -- queries ------------------------------------------------------------

    /// The most recent `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.log.iter().rev().take(limit).cloned().collect()
    }

    /// Up to `num` entries strictly older than `before`, newest first.
    pub fn older_than(&self, before: OffsetDateTime, num: usize) -> Vec<LogEntry> {
        self.log
            .iter()
            .rev()
            .filter(|e| e.time < before)
            .take(num)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    // -- persistence --------------------------------------------------------

    /// Oldest-first copy of the log if it changed since the last call.
    pub fn take_unflushed(&mut self) -> Option<Vec<LogEntry>> {
        if !std::mem::replace(&mut self.dirty, false) {
            return None;
        }
        Some(self.log.iter().cloned().collect())
    }

    /// Put the log back in the flush queue after a failed write.
    pub fn mark_unflushed(&mut self) {
        self.dirty = true;
    }

    /// Load entries saved by a previous run, oldest first.
    pub fn restore(&mut self, entries: Vec<LogEntry>) {
        self.log.clear();
        for e in entries {
            self.push_entry(e);
        }
        self.dirty = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn entry(time: OffsetDateTime, message: &str) -> LogEntry {
        LogEntry {
            time,
            kind: EventKind::Operation,
            message: message.into(),
        }
    }

    // -- Ring buffer --------------------------------------------------------

    #[test]
    fn oldest_entries_evicted_at_capacity() {
        let mut st = SystemState::new(3);
        for i in 0..5 {
            st.record_operation(format!("op {i}"));
        }
        let msgs: Vec<_> = st.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(msgs, vec!["op 4", "op 3", "op 2"]);
    }

    #[test]
    fn shrinking_capacity_truncates() {
        let mut st = SystemState::new(10);
        for i in 0..6 {
            st.record_operation(format!("op {i}"));
        }
        st.set_max_log(2);
        assert_eq!(st.len(), 2);
        assert_eq!(st.recent(1)[0].message, "op 5");
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut st = SystemState::new(0);
        st.record_error("boom".into());
        assert!(st.is_empty());
    }

    #[test]
    fn reset_clears_log() {
        let mut st = SystemState::default();
        st.record_note("hello".into());
        st.reset_log();
        assert!(st.is_empty());
    }

    #[test]
    fn connection_transitions_logged_once() {
        let mut st = SystemState::default();
        st.record_connection(true);
        st.record_connection(true);
        st.record_connection(false);
        assert_eq!(st.len(), 2);
        assert!(!st.mqtt_connected);
        assert_eq!(st.recent(1)[0].kind, EventKind::Connection);
    }

    // -- Queries ------------------------------------------------------------

    #[test]
    fn older_than_is_strict_and_newest_first() {
        let mut st = SystemState::default();
        st.restore(vec![
            entry(datetime!(2024-05-01 10:00 UTC), "a"),
            entry(datetime!(2024-05-01 11:00 UTC), "b"),
            entry(datetime!(2024-05-01 12:00 UTC), "c"),
            entry(datetime!(2024-05-01 13:00 UTC), "d"),
        ]);

        let got: Vec<_> = st
            .older_than(datetime!(2024-05-01 12:00 UTC), 20)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(got, vec!["b", "a"]);

        let got = st.older_than(datetime!(2024-05-02 00:00 UTC), 1);
        assert_eq!(got[0].message, "d");
    }

    // -- Persistence --------------------------------------------------------

    #[test]
    fn unflushed_only_after_changes() {
        let mut st = SystemState::default();
        assert!(st.take_unflushed().is_none());

        st.record_operation("dosing".into());
        let batch = st.take_unflushed().unwrap();
        assert_eq!(batch.len(), 1);
        assert!(st.take_unflushed().is_none());
    }

    #[test]
    fn restore_respects_capacity_and_is_clean() {
        let mut st = SystemState::new(2);
        st.restore(vec![
            entry(datetime!(2024-05-01 10:00 UTC), "a"),
            entry(datetime!(2024-05-01 11:00 UTC), "b"),
            entry(datetime!(2024-05-01 12:00 UTC), "c"),
        ]);
        assert_eq!(st.len(), 2);
        assert!(st.take_unflushed().is_none());
    }

    #[test]
    fn entry_wire_format() {
        let e = entry(datetime!(2024-05-01 10:00 UTC), "x");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["time"], "2024-05-01T10:00:00Z");
        assert_eq!(v["kind"], "operation");
    }
}

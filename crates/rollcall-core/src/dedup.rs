//! Per-session attendance deduplication.
//!
//! A name is marked at most once per session. Every sighting refreshes its
//! last-seen time, but that never re-arms marking; the store is only reset
//! when a new session begins.

use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct AttendanceDedup {
    marked: HashSet<String>,
    /// Names in the order they were first marked.
    order: Vec<String>,
    last_seen: HashMap<String, DateTime<Local>>,
}

impl AttendanceDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting now; true only the first time `name` is seen this session.
    pub fn mark_if_new(&mut self, name: &str) -> bool {
        self.mark_if_new_at(name, Local::now())
    }

    pub fn mark_if_new_at(&mut self, name: &str, at: DateTime<Local>) -> bool {
        self.last_seen.insert(name.to_string(), at);
        if self.marked.contains(name) {
            return false;
        }
        self.marked.insert(name.to_string());
        self.order.push(name.to_string());
        true
    }

    pub fn is_marked(&self, name: &str) -> bool {
        self.marked.contains(name)
    }

    pub fn last_seen(&self, name: &str) -> Option<DateTime<Local>> {
        self.last_seen.get(name).copied()
    }

    /// Marked names, oldest first.
    pub fn marked(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.marked.clear();
        self.order.clear();
        self.last_seen.clear();
    }
}

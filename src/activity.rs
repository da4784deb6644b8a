//! Fire-and-forget activity sink consumed by the UI layer.
//!
//! The controller only ever writes entries; nothing in the workflow reads
//! them back. Retention is bounded: once the log is full the oldest entries
//! are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_ACTIVITY_CAPACITY: usize = 50;

/// Classification of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Job,
    Rollback,
    Decrypt,
    Refresh,
    Info,
    Error,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Rollback => "rollback",
            Self::Decrypt => "decrypt",
            Self::Refresh => "refresh",
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// One entry in the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: ActivityKind,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Bounded, newest-first activity log. Cloning shares the same buffer.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<ActivityEntry>>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActivityEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an entry, dropping the oldest once the log is full.
    pub fn emit(&self, kind: ActivityKind, title: impl Into<String>, details: Option<String>) {
        let entry = ActivityEntry {
            id: Uuid::new_v4(),
            at: Utc::now(),
            kind,
            title: title.into(),
            details,
        };
        tracing::debug!(
            kind = kind.as_str(),
            title = %entry.title,
            "activity entry"
        );
        let mut entries = self.lock();
        entries.push_front(entry);
        entries.truncate(self.capacity);
    }

    /// Snapshot of the log, newest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

//! Timed tasks.
//!
//! A mutex-guarded vector scanned once per loop turn: adequate for the
//! small timer counts a single loop carries, and it keeps cross-thread
//! scheduling trivial. Cancellation is a flag checked lazily on scan.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cancels its timer; safe to call from any thread, idempotent.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub(crate) type TimerFn = Box<dyn FnMut() + Send>;

pub(crate) enum TimerKind {
    /// A user task.
    Task(TimerFn),
    /// Deadline for a pending dial, keyed into the pending-connect table.
    ConnectDeadline(usize),
}

pub(crate) struct TimerEntry {
    pub fire_at: Instant,
    /// `None` for one-shot; otherwise the repeat interval.
    pub period: Option<Duration>,
    pub cancelled: Arc<AtomicBool>,
    pub kind: TimerKind,
}

impl TimerEntry {
    pub(crate) fn handle(&self) -> TimerHandle {
        TimerHandle {
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Multi-producer timer queue, consumed by the loop thread.
pub(crate) struct TimerQueue {
    entries: Mutex<Vec<TimerEntry>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn schedule(&self, entry: TimerEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    /// Earliest non-cancelled deadline, purging cancelled entries on the
    /// way through.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| !e.is_cancelled());
        entries.iter().map(|e| e.fire_at).min()
    }

    /// Remove and return entries due at `now`, ordered by deadline.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<TimerEntry> {
        let mut entries = self.entries.lock().unwrap();
        let mut due = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if entries[i].is_cancelled() {
                entries.swap_remove(i);
            } else if entries[i].fire_at <= now {
                due.push(entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by_key(|e| e.fire_at);
        due
    }
}

use std::collections::VecDeque;
use std::time::Instant;

/// Insertion-ordered queue whose entries may carry a readiness deadline.
///
/// Entries without a deadline (or whose deadline has passed) are *ready*;
/// `peek`/`pop_ready` skip over entries that are still cooling down, so a
/// delayed entry never blocks the ones queued behind it. Delayed entries
/// become eligible in place; re-pushing is how a caller demotes a job to
/// the tail.
pub(crate) struct DelayQueue<T> {
    entries: VecDeque<Entry<T>>,
}

struct Entry<T> {
    item: T,
    delay_until: Option<Instant>,
}

impl<T> Entry<T> {
    fn is_ready(&self, now: Instant) -> bool {
        self.delay_until.is_none_or(|until| until <= now)
    }
}

impl<T> DelayQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append an entry, optionally ineligible until `delay_until`.
    pub fn push(&mut self, item: T, delay_until: Option<Instant>) {
        self.entries.push_back(Entry { item, delay_until });
    }

    /// First ready entry, in insertion order.
    pub fn peek(&self) -> Option<&T> {
        let now = Instant::now();
        self.entries
            .iter()
            .find(|e| e.is_ready(now))
            .map(|e| &e.item)
    }

    /// Remove and return the entry `peek` refers to.
    pub fn pop_ready(&mut self) -> Option<T> {
        let now = Instant::now();
        let pos = self.entries.iter().position(|e| e.is_ready(now))?;
        self.entries.remove(pos).map(|e| e.item)
    }

    /// Total entry count, delayed entries included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, ready or not. Used on shutdown, when cooling-down
    /// entries still need their owners settled.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|e| e.item).collect()
    }
}

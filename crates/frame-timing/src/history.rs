//! Bounded log of completed integration windows

use std::collections::VecDeque;

/// One completed integration window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrationRecord {
    /// Wall time covered by the window in microseconds
    pub elapsed_us: u64,
    /// Source ticks counted in the window
    pub frames: u32,
}

/// Oldest-first log of integration windows with a fixed depth
#[derive(Debug, Clone)]
pub struct IntegrationHistory {
    records: VecDeque<IntegrationRecord>,
    depth: usize,
}

impl IntegrationHistory {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(2);
        Self {
            records: VecDeque::with_capacity(depth),
            depth,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&mut self, record: IntegrationRecord) {
        if self.records.len() == self.depth {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn latest(&self) -> Option<IntegrationRecord> {
        self.records.back().copied()
    }

    pub fn pop_oldest(&mut self) -> Option<IntegrationRecord> {
        self.records.pop_front()
    }

    /// Drop everything except the most recent record
    pub fn retain_latest(&mut self) {
        while self.records.len() > 1 {
            self.records.pop_front();
        }
    }
}

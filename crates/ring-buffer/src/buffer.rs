//! Decode Ring Implementation

use serde::{Deserialize, Serialize};

use crate::RingError;

/// One ring entry
#[derive(Debug)]
struct Slot<T> {
    /// Destination buffer, present from get until inject
    payload: Option<T>,
    /// Time the source is expected to deliver this frame (us)
    expected_fill_time: u64,
}

/// Snapshot of the three ring cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RingCursors {
    pub next_to_get: u64,
    pub next_to_fill: u64,
    pub next_to_inject: u64,
}

/// Why a tick did not advance the fill cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No programmed slot after the current one
    NoNextSlot,
    /// The current slot's frame is not due yet
    TooEarly { early_us: i64 },
}

/// Result of advancing the fill cursor on a source tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// Moved to the next slot; `late_skip_us` whole frames were added to
    /// every pending expected fill time because the source ran ahead
    Advanced { late_skip_us: u64 },
    /// The current slot is re-armed for another frame
    Dropped(DropReason),
}

/// A filled slot handed over for injection
#[derive(Debug)]
pub struct Injectable<T> {
    pub index: u64,
    pub payload: T,
    pub expected_fill_time: u64,
}

/// Fixed-depth ring of decode slots
#[derive(Debug)]
pub struct DecodeRing<T> {
    /// Pre-allocated slots
    slots: Box<[Slot<T>]>,
    next_to_get: u64,
    next_to_fill: u64,
    next_to_inject: u64,
    /// Frames dropped since the last reset (for statistics)
    dropped: u64,
}

impl<T> DecodeRing<T> {
    /// Create a ring with `depth` slots
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(2);
        let slots: Vec<Slot<T>> = (0..depth)
            .map(|_| Slot {
                payload: None,
                expected_fill_time: 0,
            })
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
            next_to_get: 0,
            next_to_fill: 0,
            next_to_inject: 0,
            dropped: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn cursors(&self) -> RingCursors {
        RingCursors {
            next_to_get: self.next_to_get,
            next_to_fill: self.next_to_fill,
            next_to_inject: self.next_to_inject,
        }
    }

    /// Slots got but not yet injected
    pub fn outstanding(&self) -> u64 {
        self.next_to_get - self.next_to_inject
    }

    /// Frames dropped since the last reset
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn slot(&self, index: u64) -> &Slot<T> {
        &self.slots[(index % self.slots.len() as u64) as usize]
    }

    fn slot_mut(&mut self, index: u64) -> &mut Slot<T> {
        let depth = self.slots.len() as u64;
        &mut self.slots[(index % depth) as usize]
    }

    /// Rewind all cursors, dropping any payloads still held
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.payload = None;
            slot.expected_fill_time = 0;
        }
        self.next_to_get = 0;
        self.next_to_fill = 0;
        self.next_to_inject = 0;
        self.dropped = 0;
    }

    /// Check that another slot can be got without lapping injection
    pub fn ensure_capacity(&self) -> Result<(), RingError> {
        let outstanding = self.outstanding();
        if outstanding + 1 >= self.slots.len() as u64 {
            return Err(RingError::Full {
                outstanding,
                depth: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Program the next slot and advance the get cursor
    pub fn push(&mut self, payload: T, expected_fill_time: u64) -> Result<u64, RingError> {
        self.ensure_capacity()?;
        let index = self.next_to_get;
        let slot = self.slot_mut(index);
        slot.payload = Some(payload);
        slot.expected_fill_time = expected_fill_time;
        self.next_to_get += 1;
        Ok(index)
    }

    /// Expected fill time of the slot the source is currently filling
    pub fn current_fill_time(&self) -> Option<u64> {
        (self.next_to_fill < self.next_to_get).then(|| self.slot(self.next_to_fill).expected_fill_time)
    }

    /// Expected fill time of a slot that is scheduled but not yet filled
    pub fn expected_fill_time(&self, index: u64) -> Option<u64> {
        (index >= self.next_to_fill && index < self.next_to_get)
            .then(|| self.slot(index).expected_fill_time)
    }

    /// Advance the fill cursor for a source tick at `now`.
    ///
    /// The current slot counts as complete once `now` is at least 7/8 of a
    /// frame past its expected time. If the new current slot is already a
    /// whole frame or more overdue, the deficit is rounded up to whole
    /// frames and pushed onto every pending slot.
    pub fn advance_fill(&mut self, now: u64, frame_duration_us: u64) -> FillOutcome {
        if self.next_to_fill + 1 >= self.next_to_get {
            self.dropped += 1;
            return FillOutcome::Dropped(DropReason::NoNextSlot);
        }

        let since_due = now as i64 - self.slot(self.next_to_fill).expected_fill_time as i64;
        let complete_after = (frame_duration_us * 7 / 8) as i64;
        if since_due < complete_after {
            self.dropped += 1;
            return FillOutcome::Dropped(DropReason::TooEarly {
                early_us: complete_after - since_due,
            });
        }

        self.next_to_fill += 1;

        let late = now as i64 - self.slot(self.next_to_fill).expected_fill_time as i64;
        let frame = frame_duration_us.max(1);
        let mut late_skip_us = 0;
        if late >= frame as i64 {
            late_skip_us = ((late as u64 + frame / 8 - 1) / frame) * frame;
            for index in self.next_to_fill..self.next_to_get {
                self.slot_mut(index).expected_fill_time += late_skip_us;
            }
        }
        FillOutcome::Advanced { late_skip_us }
    }

    /// Re-time every scheduled but unfilled slot relative to `now`.
    ///
    /// `time_for_frames` maps a frame offset from the current slot to
    /// microseconds. Returns the number of slots re-timed.
    pub fn rebase_pending<F>(&mut self, now: u64, time_for_frames: F) -> u64
    where
        F: Fn(u64) -> u64,
    {
        let first = self.next_to_fill;
        for index in first..self.next_to_get {
            self.slot_mut(index).expected_fill_time = now + time_for_frames(index - first);
        }
        self.next_to_get - first
    }

    /// Hand over the oldest filled slot that has not been injected
    pub fn take_injectable(&mut self) -> Option<Injectable<T>> {
        while self.next_to_inject < self.next_to_fill {
            let index = self.next_to_inject;
            self.next_to_inject += 1;
            let slot = self.slot_mut(index);
            if let Some(payload) = slot.payload.take() {
                return Some(Injectable {
                    index,
                    payload,
                    expected_fill_time: slot.expected_fill_time,
                });
            }
        }
        None
    }

    /// Take every payload between the inject and get cursors, leaving the
    /// ring empty with all cursors at `next_to_get`
    pub fn drain_uninjected(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.outstanding() as usize);
        for index in self.next_to_inject..self.next_to_get {
            if let Some(payload) = self.slot_mut(index).payload.take() {
                drained.push(payload);
            }
        }
        self.next_to_fill = self.next_to_get;
        self.next_to_inject = self.next_to_get;
        drained
    }
}

//! Ancillary buffer pool state

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::scratch::ScratchRing;
use crate::AncillaryError;

/// Ancillary pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AncillaryConfig {
    pub min_buffers: usize,
    pub max_buffers: usize,
    pub min_buffer_size: usize,
    pub max_buffer_size: usize,
    /// Granule the hardware writes in; buffer sizes round up to it
    pub chunk_size: usize,
    /// Size of the hardware scratch ring
    pub scratch_size: usize,
    /// Fixed packet stride; header-encoded lengths are used when unset
    pub page_size: Option<usize>,
}

impl Default for AncillaryConfig {
    fn default() -> Self {
        Self {
            min_buffers: 1,
            max_buffers: 32,
            min_buffer_size: 64,
            max_buffer_size: 65536,
            chunk_size: 16,
            scratch_size: 16 * 1024,
            page_size: None,
        }
    }
}

/// Per-buffer bookkeeping
#[derive(Debug, Clone, Copy, Default)]
struct BufferState {
    queued: bool,
    done: bool,
    bytes: usize,
    fill_time: u64,
}

/// Client-visible state of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: usize,
    pub queued: bool,
    pub done: bool,
    /// Bytes captured into the buffer
    pub bytes: usize,
    /// Buffer capacity
    pub size: usize,
    /// Expected fill time of the video frame the data arrived with (us)
    pub fill_time: u64,
}

/// Result of the per-tick capture step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Capture not armed on this tick
    Idle,
    /// Capture armed but no packets arrived
    Empty,
    /// Packets copied into buffer `index`
    Filled { index: usize, bytes: usize },
    /// Packets arrived with no buffer queued; they are dropped
    NoBufferQueued { bytes: usize },
    /// Packets exceeded the buffer size and were discarded
    Discarded { bytes: usize },
}

/// Ancillary buffers, their queue, and the scratch ring they fill from
#[derive(Debug)]
pub struct AncillaryPool {
    config: AncillaryConfig,
    storage: Vec<u8>,
    buffer_size: usize,
    states: Vec<BufferState>,
    /// Queue of buffer indices in the order they were queued
    queue: Vec<usize>,
    next_queue: u64,
    next_fill: u64,
    next_dequeue: u64,
    stream_on: bool,
    capture_in_progress: bool,
    scratch: ScratchRing,
}

impl AncillaryPool {
    pub fn new(config: AncillaryConfig) -> Self {
        let scratch = ScratchRing::new(config.scratch_size, config.chunk_size);
        let queue = vec![0; config.max_buffers.max(1)];
        Self {
            config,
            storage: Vec::new(),
            buffer_size: 0,
            states: Vec::new(),
            queue,
            next_queue: 0,
            next_fill: 0,
            next_dequeue: 0,
            stream_on: false,
            capture_in_progress: false,
            scratch,
        }
    }

    pub fn config(&self) -> &AncillaryConfig {
        &self.config
    }

    pub fn buffer_count(&self) -> usize {
        self.states.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_allocated(&self) -> bool {
        !self.states.is_empty()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_on
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture_in_progress
    }

    /// Allocate `count` buffers of `size` bytes, or tear down with a zero
    /// count.
    ///
    /// Count and size are clamped to the configured limits and the size is
    /// rounded up to the chunk size. Returns the granted count and size.
    pub fn request_buffers(&mut self, count: usize, size: usize) -> Result<(usize, usize), AncillaryError> {
        if count == 0 {
            if !self.is_allocated() {
                return Err(AncillaryError::NothingAllocated);
            }
            self.stream_off();
            self.storage = Vec::new();
            self.states.clear();
            self.buffer_size = 0;
            info!("Ancillary buffers released");
            return Ok((0, 0));
        }

        if self.is_allocated() {
            return Err(AncillaryError::AlreadyAllocated {
                count: self.states.len(),
                size: self.buffer_size,
            });
        }

        let count = count.clamp(self.config.min_buffers, self.config.max_buffers);
        let chunk = self.config.chunk_size.max(1);
        let size = size
            .clamp(self.config.min_buffer_size, self.config.max_buffer_size)
            .div_ceil(chunk)
            * chunk;

        let bytes = count * size;
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(bytes)
            .map_err(|_| AncillaryError::Allocation { bytes })?;
        storage.resize(bytes, 0);

        self.storage = storage;
        self.buffer_size = size;
        self.states = vec![BufferState::default(); count];
        self.stream_on = false;
        self.capture_in_progress = false;
        self.next_queue = 0;
        self.next_fill = 0;
        self.next_dequeue = 0;

        info!("Ancillary buffers allocated: {} x {} bytes", count, size);
        Ok((count, size))
    }

    fn check_index(&self, index: usize) -> Result<(), AncillaryError> {
        if index >= self.states.len() {
            return Err(AncillaryError::IndexOutOfRange {
                index,
                count: self.states.len(),
            });
        }
        Ok(())
    }

    pub fn query_buffer(&self, index: usize) -> Result<BufferInfo, AncillaryError> {
        self.check_index(index)?;
        let state = self.states[index];
        Ok(BufferInfo {
            index,
            queued: state.queued,
            done: state.done,
            bytes: state.bytes,
            size: self.buffer_size,
            fill_time: state.fill_time,
        })
    }

    /// Captured bytes of a buffer
    pub fn buffer_data(&self, index: usize) -> Result<&[u8], AncillaryError> {
        self.check_index(index)?;
        let start = index * self.buffer_size;
        Ok(&self.storage[start..start + self.states[index].bytes])
    }

    /// Clear a buffer and append it to the capture queue
    pub fn queue_buffer(&mut self, index: usize) -> Result<(), AncillaryError> {
        self.check_index(index)?;
        let state = &mut self.states[index];
        if state.queued || state.done {
            return Err(AncillaryError::BufferBusy { index });
        }
        state.queued = true;
        state.bytes = 0;

        let start = index * self.buffer_size;
        self.storage[start..start + self.buffer_size].fill(0);

        let slot = (self.next_queue % self.queue.len() as u64) as usize;
        self.queue[slot] = index;
        self.next_queue += 1;
        Ok(())
    }

    pub fn stream_on(&mut self) -> Result<(), AncillaryError> {
        if !self.is_allocated() {
            return Err(AncillaryError::NothingAllocated);
        }
        self.stream_on = true;
        debug!("Ancillary stream on");
        Ok(())
    }

    /// Stop streaming and return every buffer to the unqueued state
    pub fn stream_off(&mut self) {
        self.stream_on = false;
        self.capture_in_progress = false;
        self.next_queue = 0;
        self.next_fill = 0;
        self.next_dequeue = 0;
        for state in self.states.iter_mut() {
            state.queued = false;
            state.done = false;
        }
        self.scratch.reset();
        debug!("Ancillary stream off");
    }

    /// Abandon a capture in progress, used when video capture halts
    pub fn abort_capture(&mut self) {
        self.capture_in_progress = false;
    }

    pub fn scratch_mut(&mut self) -> &mut ScratchRing {
        &mut self.scratch
    }

    /// Per-tick capture step.
    ///
    /// Collects the packets written since the last tick and copies them
    /// into the oldest queued buffer stamped with `fill_time`. The scratch
    /// span is cleared whatever happens to the data. Capture arms on the
    /// first tick after streaming starts.
    pub fn capture(&mut self, fill_time: u64) -> CaptureOutcome {
        let mut outcome = CaptureOutcome::Idle;

        if self.capture_in_progress {
            let span = self.scratch.walk(self.config.page_size);
            let bytes = span.len();
            outcome = CaptureOutcome::Empty;

            if bytes > 0 && self.stream_on {
                outcome = if self.next_fill == self.next_queue {
                    CaptureOutcome::NoBufferQueued { bytes }
                } else if bytes > self.buffer_size {
                    warn!(
                        "Captured ancillary data too large for buffer ({} > {} bytes), discarded",
                        bytes, self.buffer_size
                    );
                    CaptureOutcome::Discarded { bytes }
                } else {
                    let index = self.queue[(self.next_fill % self.queue.len() as u64) as usize];
                    let start = index * self.buffer_size;
                    self.scratch
                        .copy_span(span, &mut self.storage[start..start + bytes]);
                    let state = &mut self.states[index];
                    state.queued = false;
                    state.done = true;
                    state.bytes = bytes;
                    state.fill_time = fill_time;
                    self.next_fill += 1;
                    CaptureOutcome::Filled { index, bytes }
                };
            }

            if bytes > 0 {
                self.scratch.clear_span(span);
            }
        }

        self.capture_in_progress = self.stream_on;
        outcome
    }

    /// Take the oldest filled buffer, if any.
    ///
    /// Fails when the pool is torn down or streaming is off.
    pub fn take_filled(&mut self) -> Result<Option<usize>, AncillaryError> {
        if !self.is_allocated() || !self.stream_on {
            return Err(AncillaryError::StreamOff);
        }
        if self.next_dequeue >= self.next_fill {
            return Ok(None);
        }
        let index = self.queue[(self.next_dequeue % self.queue.len() as u64) as usize];
        self.next_dequeue += 1;
        if !self.states[index].done {
            warn!("Ancillary buffer {} dequeued without being marked done", index);
        }
        self.states[index].done = false;
        Ok(Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(words: u8, fill: u8) -> Vec<u8> {
        let mut bytes = vec![fill; usize::from(words) * 4 + 6];
        bytes[3] = words;
        bytes
    }

    fn streaming_pool(count: usize, size: usize) -> AncillaryPool {
        let mut pool = AncillaryPool::new(AncillaryConfig::default());
        pool.request_buffers(count, size).unwrap();
        for index in 0..pool.buffer_count() {
            pool.queue_buffer(index).unwrap();
        }
        pool.stream_on().unwrap();
        // First tick arms the capture
        assert_eq!(pool.capture(0), CaptureOutcome::Idle);
        pool
    }

    #[test]
    fn test_teardown_without_allocation_fails() {
        let mut pool = AncillaryPool::new(AncillaryConfig::default());
        assert_eq!(pool.request_buffers(0, 0), Err(AncillaryError::NothingAllocated));
    }

    #[test]
    fn test_request_clamps_and_rounds() {
        let mut pool = AncillaryPool::new(AncillaryConfig::default());
        assert_eq!(pool.request_buffers(100, 100), Ok((32, 112)));
        assert!(matches!(
            pool.request_buffers(4, 256),
            Err(AncillaryError::AlreadyAllocated { .. })
        ));
        assert_eq!(pool.request_buffers(0, 0), Ok((0, 0)));

        assert_eq!(pool.request_buffers(2, 1), Ok((2, 64)));
    }

    #[test]
    fn test_queue_rejects_busy_and_out_of_range() {
        let mut pool = AncillaryPool::new(AncillaryConfig::default());
        pool.request_buffers(2, 64).unwrap();
        pool.queue_buffer(0).unwrap();
        assert_eq!(pool.queue_buffer(0), Err(AncillaryError::BufferBusy { index: 0 }));
        assert!(matches!(
            pool.queue_buffer(2),
            Err(AncillaryError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_capture_fills_oldest_queued() {
        let mut pool = streaming_pool(2, 64);
        pool.scratch_mut().hardware_write(&packet(3, 0x42));

        let outcome = pool.capture(123_456);
        assert_eq!(outcome, CaptureOutcome::Filled { index: 0, bytes: 32 });

        let info = pool.query_buffer(0).unwrap();
        assert!(info.done && !info.queued);
        assert_eq!(info.fill_time, 123_456);
        assert_eq!(pool.buffer_data(0).unwrap()[0], 0x42);

        assert_eq!(pool.take_filled(), Ok(Some(0)));
        assert_eq!(pool.take_filled(), Ok(None));
        assert!(!pool.query_buffer(0).unwrap().done);
    }

    #[test]
    fn test_oversized_capture_discarded() {
        let mut pool = streaming_pool(2, 64);
        for _ in 0..3 {
            pool.scratch_mut().hardware_write(&packet(6, 0x7f));
        }
        let outcome = pool.capture(0);
        assert_eq!(outcome, CaptureOutcome::Discarded { bytes: 96 });
        assert!(pool.query_buffer(0).unwrap().queued);
        assert_eq!(pool.take_filled(), Ok(None));

        // Scratch span was cleared, so the next tick sees nothing
        assert_eq!(pool.capture(0), CaptureOutcome::Empty);
    }

    #[test]
    fn test_capture_without_queued_buffer() {
        let mut pool = AncillaryPool::new(AncillaryConfig::default());
        pool.request_buffers(1, 64).unwrap();
        pool.stream_on().unwrap();
        pool.capture(0);
        pool.scratch_mut().hardware_write(&packet(1, 0x01));
        assert_eq!(pool.capture(0), CaptureOutcome::NoBufferQueued { bytes: 16 });
    }

    #[test]
    fn test_dequeue_fails_after_stream_off() {
        let mut pool = streaming_pool(2, 64);
        pool.stream_off();
        assert_eq!(pool.take_filled(), Err(AncillaryError::StreamOff));
        assert!(!pool.query_buffer(0).unwrap().queued);
    }
}

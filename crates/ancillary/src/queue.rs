//! Shared ancillary queue
//!
//! Wraps the pool in a lock usable from the tick context and pairs it with
//! a done-count semaphore so clients can wait for filled buffers.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::pool::{AncillaryConfig, AncillaryPool, BufferInfo, CaptureOutcome};
use crate::AncillaryError;

/// Thread-safe ancillary pool with blocking dequeue
#[derive(Debug)]
pub struct AncillaryQueue {
    pool: Mutex<AncillaryPool>,
    /// One permit per filled buffer, plus wake-ups on stream-off and teardown
    done: Semaphore,
    /// Added to fill times reported to clients
    applied_latency_us: AtomicU64,
}

impl AncillaryQueue {
    pub fn new(config: AncillaryConfig) -> Self {
        Self {
            pool: Mutex::new(AncillaryPool::new(config)),
            done: Semaphore::new(0),
            applied_latency_us: AtomicU64::new(0),
        }
    }

    /// Latency added to reported capture times
    pub fn set_applied_latency(&self, latency_us: u64) {
        self.applied_latency_us.store(latency_us, Ordering::Relaxed);
    }

    pub fn request_buffers(&self, count: usize, size: usize) -> Result<(usize, usize), AncillaryError> {
        let granted = self.pool.lock().request_buffers(count, size)?;
        if count == 0 {
            self.done.add_permits(1);
        } else {
            self.done.forget_permits(self.done.available_permits());
        }
        Ok(granted)
    }

    /// Buffer state with the capture time shifted by the applied latency
    pub fn query_buffer(&self, index: usize) -> Result<BufferInfo, AncillaryError> {
        let mut info = self.pool.lock().query_buffer(index)?;
        info.fill_time += self.applied_latency_us.load(Ordering::Relaxed);
        Ok(info)
    }

    pub fn queue_buffer(&self, index: usize) -> Result<(), AncillaryError> {
        self.pool.lock().queue_buffer(index)
    }

    /// Copy of a buffer's captured bytes
    pub fn read_buffer(&self, index: usize) -> Result<Vec<u8>, AncillaryError> {
        self.pool.lock().buffer_data(index).map(<[u8]>::to_vec)
    }

    pub fn stream_on(&self) -> Result<(), AncillaryError> {
        self.pool.lock().stream_on()
    }

    /// Stop streaming and wake any blocked dequeue
    pub fn stream_off(&self) {
        self.pool.lock().stream_off();
        self.done.add_permits(1);
    }

    pub fn abort_capture(&self) {
        self.pool.lock().abort_capture();
    }

    pub fn is_streaming(&self) -> bool {
        self.pool.lock().is_streaming()
    }

    /// Feed packets into the scratch ring as the capture hardware would
    pub fn hardware_write(&self, packet: &[u8]) {
        self.pool.lock().scratch_mut().hardware_write(packet);
    }

    /// Tick-context capture step
    pub fn capture(&self, fill_time: u64) -> CaptureOutcome {
        let outcome = self.pool.lock().capture(fill_time);
        if let CaptureOutcome::Filled { index, bytes } = outcome {
            debug!("Ancillary buffer {} filled with {} bytes", index, bytes);
            self.done.add_permits(1);
        }
        outcome
    }

    /// Take the next filled buffer.
    ///
    /// Blocking calls wait for a fill, a stream-off, a teardown, or
    /// shutdown. Non-blocking calls return [`AncillaryError::WouldBlock`]
    /// when nothing is ready.
    pub async fn dequeue(&self, blocking: bool) -> Result<usize, AncillaryError> {
        loop {
            if blocking {
                let permit = self
                    .done
                    .acquire()
                    .await
                    .map_err(|_| AncillaryError::Shutdown)?;
                permit.forget();
            }

            if let Some(index) = self.pool.lock().take_filled()? {
                return Ok(index);
            }

            if !blocking {
                return Err(AncillaryError::WouldBlock);
            }
        }
    }

    /// Fail every current and future blocking dequeue
    pub fn shutdown(&self) {
        self.done.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn streaming_queue() -> AncillaryQueue {
        let queue = AncillaryQueue::new(AncillaryConfig::default());
        queue.request_buffers(4, 256).unwrap();
        for index in 0..4 {
            queue.queue_buffer(index).unwrap();
        }
        queue.stream_on().unwrap();
        queue.capture(0);
        queue
    }

    fn packet() -> Vec<u8> {
        let mut bytes = vec![0x5a; 18];
        bytes[3] = 3;
        bytes
    }

    #[tokio::test]
    async fn test_non_blocking_dequeue_would_block() {
        let queue = streaming_queue();
        assert_eq!(queue.dequeue(false).await, Err(AncillaryError::WouldBlock));
    }

    #[tokio::test]
    async fn test_blocking_dequeue_receives_fill() {
        let queue = Arc::new(streaming_queue());
        queue.set_applied_latency(1000);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(true).await })
        };
        tokio::task::yield_now().await;

        queue.hardware_write(&packet());
        assert!(matches!(queue.capture(50_000), CaptureOutcome::Filled { index: 0, .. }));

        let index = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(index, 0);
        assert_eq!(queue.query_buffer(0).unwrap().fill_time, 51_000);
        assert_eq!(queue.read_buffer(0).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_stream_off_wakes_blocked_dequeue() {
        let queue = Arc::new(streaming_queue());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(true).await })
        };
        tokio::task::yield_now().await;

        queue.stream_off();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(AncillaryError::StreamOff));
    }

    #[tokio::test]
    async fn test_shutdown_fails_dequeue() {
        let queue = streaming_queue();
        queue.shutdown();
        assert_eq!(queue.dequeue(true).await, Err(AncillaryError::Shutdown));
    }
}

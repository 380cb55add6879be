//! Bounded relay buffer with watermark hysteresis.
//!
//! Each relay direction owns one [`FlowBuffer`] between its reader and its
//! writer. The reader stops pulling from its source once the buffer reaches
//! the high watermark and resumes only after the writer has drained it below
//! the low watermark. The gap between the two marks keeps the reader from
//! flapping on every chunk.
//!
//! ```text
//! buffered
//!   64K -|----+            +----      pause at >= high
//!        |     \          /
//!   32K -|------\--------/--------    resume at < low
//!        |       \______/
//!     0 -+------------------------> time
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::Notify;

/// Default high watermark (bytes).
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;

/// Default low watermark (bytes).
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;

#[derive(Debug, Default)]
struct FlowState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    paused: bool,
    finished: bool,
    closed: bool,
    pauses: u64,
}

/// Single-producer, single-consumer chunk queue with backpressure.
#[derive(Debug)]
pub struct FlowBuffer {
    high: usize,
    low: usize,
    state: Mutex<FlowState>,
    data_ready: Notify,
    space_ready: Notify,
}

impl FlowBuffer {
    /// Create a buffer pausing at `high` and resuming below `low`.
    ///
    /// `low` is clamped below `high`.
    pub fn new(high: usize, low: usize) -> Self {
        let high = high.max(1);
        Self {
            high,
            low: low.min(high - 1).max(1),
            state: Mutex::new(FlowState::default()),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    pub fn high_watermark(&self) -> usize {
        self.high
    }

    pub fn low_watermark(&self) -> usize {
        self.low
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the producer may read from its source again.
    ///
    /// Returns how many bytes may be read without crossing the high
    /// watermark, or `None` once the buffer is closed.
    pub async fn reserve(&self) -> Option<usize> {
        loop {
            {
                let state = self.lock();
                if state.closed || state.finished {
                    return None;
                }
                if !state.paused {
                    return Some(self.high.saturating_sub(state.buffered).max(1));
                }
            }
            self.space_ready.notified().await;
        }
    }

    /// Append a chunk read from the source.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            if state.closed || state.finished {
                return;
            }
            state.buffered += chunk.len();
            state.chunks.push_back(chunk);
            if !state.paused && state.buffered >= self.high {
                state.paused = true;
                state.pauses += 1;
                tracing::trace!(buffered = state.buffered, "Flow buffer paused reader");
            }
        }
        self.data_ready.notify_one();
    }

    /// Take the next chunk for the sink.
    ///
    /// Returns `None` once the producer has finished and everything was
    /// drained, or immediately after [`close`](Self::close).
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len();
                    if state.paused && state.buffered < self.low {
                        state.paused = false;
                        tracing::trace!(buffered = state.buffered, "Flow buffer resumed reader");
                        self.space_ready.notify_one();
                    }
                    return Some(chunk);
                }
                if state.finished {
                    return None;
                }
            }
            self.data_ready.notified().await;
        }
    }

    /// Producer reached EOF; the sink drains what is left.
    pub fn finish(&self) {
        self.lock().finished = true;
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Abort both ends, discarding buffered data.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.chunks.clear();
            state.buffered = 0;
        }
        self.data_ready.notify_one();
        self.space_ready.notify_one();
    }

    /// Bytes currently queued.
    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }

    /// Returns `true` while the reader is held back.
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Number of times the reader was paused.
    pub fn pause_count(&self) -> u64 {
        self.lock().pauses
    }
}

impl Default for FlowBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}

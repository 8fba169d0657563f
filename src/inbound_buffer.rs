use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use bytes::Bytes;
use tracing::trace;

use crate::config::ReadBufferWaterMark;

/// A channel's queue of received payloads that were not yet delivered to the application.
///
/// Any number of producers may add concurrently (the transport's receive path, other channels in
///  the same process); only the owning channel's event loop removes.
///
/// The `full` flag has hysteresis: it is set when pending bytes reach the high water mark, and
///  it is cleared only when they drop below the low water mark.
pub struct InboundBuffer {
    queue: Mutex<VecDeque<Bytes>>,
    pending_bytes: AtomicI64,
    full: AtomicBool,
    closed: AtomicBool,
    low_water_mark: i64,
    high_water_mark: i64,
}

impl InboundBuffer {
    pub fn new(water_mark: ReadBufferWaterMark) -> anyhow::Result<InboundBuffer> {
        if water_mark.low() >= water_mark.high() {
            bail!("inbound buffer requires low water mark < high water mark, was {:?}", water_mark);
        }

        Ok(InboundBuffer {
            queue: Default::default(),
            pending_bytes: AtomicI64::new(0),
            full: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            low_water_mark: water_mark.low() as i64,
            high_water_mark: water_mark.high() as i64,
        })
    }

    /// Returns `false` if the buffer was closed, in which case the payload is discarded.
    pub fn add_message(&self, payload: Bytes) -> bool {
        let mut queue = self.queue.lock().unwrap();
        // NB: checked under the lock so no payload can slip in after close() drained the queue
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let pending = self.pending_bytes.fetch_add(payload.len() as i64, Ordering::AcqRel) + payload.len() as i64;
        if pending >= self.high_water_mark && !self.full.swap(true, Ordering::AcqRel) {
            trace!(pending, "inbound buffer is full");
        }
        queue.push_back(payload);
        true
    }

    pub fn remove(&self) -> Option<Bytes> {
        let mut queue = self.queue.lock().unwrap();
        let payload = queue.pop_front()?;

        let pending = self.pending_bytes.fetch_sub(payload.len() as i64, Ordering::AcqRel) - payload.len() as i64;
        if pending < self.low_water_mark && self.full.swap(false, Ordering::AcqRel) {
            trace!(pending, "inbound buffer is writable again");
        }
        Some(payload)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    pub fn is_not_full(&self) -> bool {
        !self.full.load(Ordering::Acquire)
    }

    pub fn pending_bytes(&self) -> i64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Drops all remaining payloads. Returns the number of payloads dropped, which is zero for
    ///  every call after the first.
    pub fn close(&self) -> usize {
        let mut queue = self.queue.lock().unwrap();
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let num_dropped = queue.len();
        queue.clear();
        self.pending_bytes.store(0, Ordering::Release);
        self.full.store(false, Ordering::Release);
        num_dropped
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

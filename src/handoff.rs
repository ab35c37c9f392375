//! Single-slot rendezvous between the frame producer and the buffer filler.
//!
//! At most one frame is ever parked here. The producer blocks while the slot
//! is full, the consumer blocks while it is empty, and shutdown releases both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    data: Vec<u8>,
    luma_offset: usize,
    chroma_offset: usize,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>) -> VideoFrame {
        VideoFrame { data, luma_offset: 0, chroma_offset: 0 }
    }

    /// A planar 4:2:0 frame whose planes start at the given byte offsets.
    pub fn planar(data: Vec<u8>, luma_offset: usize, chroma_offset: usize) -> VideoFrame {
        VideoFrame { data, luma_offset, chroma_offset }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn luma_offset(&self) -> usize {
        self.luma_offset
    }

    pub fn chroma_offset(&self) -> usize {
        self.chroma_offset
    }
}

pub struct FrameSlot {
    frame: Mutex<Option<VideoFrame>>,
    cond: Condvar,
    // only ever set while `frame` is locked, so no waiter can miss it
    shutdown: AtomicBool,
}

impl FrameSlot {
    pub fn new() -> FrameSlot {
        FrameSlot { frame: Mutex::new(None), cond: Condvar::new(), shutdown: AtomicBool::new(false) }
    }

    fn lock(&self) -> MutexGuard<'_, Option<VideoFrame>> {
        self.frame.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the previous frame has been consumed, then parks `frame`.
    /// Returns once the frame is accepted, not once it reached a kernel buffer.
    pub fn submit(&self, frame: VideoFrame) -> Result<(), Error> {
        let mut slot = self.lock();
        while slot.is_some() && !self.is_shutdown() {
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        if self.is_shutdown() {
            bail!("device is shutting down, frame dropped");
        }
        *slot = Some(frame);
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until a frame is parked, runs `f` on it with the slot locked,
    /// then frees the slot for the producer. `None` on shutdown.
    pub fn consume<R>(&self, f: impl FnOnce(&VideoFrame) -> R) -> Option<R> {
        let mut slot = self.lock();
        while slot.is_none() && !self.is_shutdown() {
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
        if self.is_shutdown() {
            return None;
        }
        let ret = slot.as_ref().map(f);
        *slot = None;
        self.cond.notify_all();
        ret
    }

    pub fn clear(&self) -> bool {
        let mut slot = self.lock();
        let dropped = slot.take().is_some();
        self.cond.notify_all();
        dropped
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    pub fn shutdown(&self) {
        let _slot = self.lock();
        self.shutdown.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        FrameSlot::new()
    }
}

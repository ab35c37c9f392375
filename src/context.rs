use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::catalog::PixelFormat;
use crate::handoff::FrameSlot;

/// Parameters in effect after the last COMMIT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Negotiated {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub max_frame_size: u32,
    pub encode_rate_hint: Option<u32>,
}

impl Display for Negotiated {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}x{}@{} max {} bytes", self.format, self.width, self.height, self.frame_rate, self.max_frame_size)?;
        if let Some(rate) = self.encode_rate_hint {
            write!(f, " target {} bps", rate)?;
        }
        return Ok(());
    }
}

/// State shared between the dispatch thread and the producer.
///
/// Everything except the handoff slot is written by the dispatch thread only;
/// the producer reads it without ordering guarantees across a commit.
pub struct DeviceContext {
    slot: FrameSlot,
    negotiated: Mutex<Option<Negotiated>>,
    bulk: bool,
    streaming: AtomicBool,
    needs_reinit: AtomicBool,
    keyframe_pending: AtomicBool,
}

impl DeviceContext {
    pub fn new(bulk: bool) -> DeviceContext {
        DeviceContext {
            slot: FrameSlot::new(),
            negotiated: Mutex::new(None),
            bulk,
            streaming: AtomicBool::new(false),
            needs_reinit: AtomicBool::new(false),
            keyframe_pending: AtomicBool::new(false),
        }
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk
    }

    pub fn publish(&self, negotiated: Negotiated) {
        *self.negotiated.lock().unwrap_or_else(PoisonError::into_inner) = Some(negotiated);
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        *self.negotiated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_streaming(&self, enabled: bool) {
        self.streaming.store(enabled, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn mark_needs_reinit(&self) {
        self.needs_reinit.store(true, Ordering::SeqCst);
    }

    pub fn take_reinit_request(&self) -> bool {
        self.needs_reinit.swap(false, Ordering::SeqCst)
    }

    pub fn request_keyframe(&self) {
        self.keyframe_pending.store(true, Ordering::SeqCst);
    }

    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_pending.swap(false, Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.slot.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.slot.is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_taken_once_test() {
        let ctx = DeviceContext::new(false);
        assert!(!ctx.take_keyframe_request());
        ctx.request_keyframe();
        assert!(ctx.take_keyframe_request());
        assert!(!ctx.take_keyframe_request());

        ctx.mark_needs_reinit();
        assert!(ctx.take_reinit_request());
        assert!(!ctx.take_reinit_request());
    }

    #[test]
    fn publish_replaces_snapshot_test() {
        let ctx = DeviceContext::new(true);
        assert!(ctx.is_bulk());
        assert_eq!(ctx.negotiated(), None);
        let negotiated = Negotiated {
            format: PixelFormat::H264,
            width: 1920,
            height: 1080,
            frame_rate: 25,
            max_frame_size: 777600,
            encode_rate_hint: Some(3000000),
        };
        ctx.publish(negotiated);
        assert_eq!(ctx.negotiated(), Some(negotiated));
        assert_eq!(format!("{}", negotiated), "H264 1920x1080@25 max 777600 bytes target 3000000 bps");
    }

    #[test]
    fn shutdown_is_visible_test() {
        let ctx = DeviceContext::new(false);
        assert!(!ctx.is_shutdown());
        ctx.request_shutdown();
        assert!(ctx.is_shutdown());
        assert!(ctx.slot().is_shutdown());
    }
}

//! Userspace side of a Linux UVC gadget function.
//!
//! Answers the host's probe/commit negotiation, manages the kernel's output
//! buffer pool and streams frames handed over by a producer thread.
//!
//! ```no_run
//! use uvc_gadget::{UvcConfig, UvcDevice, VideoFrame};
//!
//! # fn main() -> Result<(), anyhow::Error> {
//! uvc_gadget::setup_logger();
//! let device = UvcDevice::open("/dev/video0", UvcConfig::from_env())?;
//! let producer = device.producer();
//! while !producer.is_shutdown() {
//!     if let Some(negotiated) = producer.negotiated() {
//!         let frame = vec![0u8; negotiated.max_frame_size as usize];
//!         producer.submit_frame(VideoFrame::new(frame))?;
//!     }
//! #   break;
//! }
//! device.close();
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate num_derive;
#[macro_use]
extern crate structure;

pub mod catalog;
pub mod config;
pub mod context;
pub mod device;
pub mod dispatch;
pub mod event_loop;
pub mod gadget;
pub mod handoff;
pub mod logger;
pub mod negotiate;
pub mod pipeline;
pub mod usb_proto;
pub mod uvc_proto;
pub mod v4l2;

#[cfg(test)]
mod mock;

pub use crate::catalog::{Catalog, FormatInfo, FrameInfo, PixelFormat};
pub use crate::config::UvcConfig;
pub use crate::context::Negotiated;
pub use crate::device::{run_producer, FrameProducer, FrameSource, UvcDevice};
pub use crate::gadget::{GadgetIo, UvcEvent};
pub use crate::handoff::VideoFrame;
pub use crate::logger::setup_logger;

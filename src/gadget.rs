//! Boundary to the kernel UVC gadget function.
//!
//! Everything the core asks of the kernel goes through [`GadgetIo`]; the
//! production implementation is [`crate::v4l2::V4l2Gadget`].

use std::time::Duration;

use anyhow::Error;

use crate::catalog::PixelFormat;
use crate::usb_proto::UsbCtrlRequest;
use crate::uvc_proto::{UvcEventType, UvcRequestData};

#[derive(Debug, Clone, PartialEq)]
pub enum UvcEvent {
    Connect,
    Disconnect,
    Setup(UsbCtrlRequest),
    /// DATA stage payload of the last SET request, already cut to its length.
    Data(Vec<u8>),
    StreamOn,
    StreamOff,
    Unknown(u32),
}

impl UvcEvent {
    pub fn event_type(&self) -> Option<UvcEventType> {
        match self {
            UvcEvent::Connect => Some(UvcEventType::Connect),
            UvcEvent::Disconnect => Some(UvcEventType::Disconnect),
            UvcEvent::Setup(_) => Some(UvcEventType::Setup),
            UvcEvent::Data(_) => Some(UvcEventType::Data),
            UvcEvent::StreamOn => Some(UvcEventType::StreamOn),
            UvcEvent::StreamOff => Some(UvcEventType::StreamOff),
            UvcEvent::Unknown(_) => None,
        }
    }
}

/// What the bounded wait found ready on the gadget descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Readiness {
    pub event: bool,
    pub buffer: bool,
}

impl Readiness {
    pub fn is_idle(&self) -> bool {
        !self.event && !self.buffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub index: u32,
    pub length: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputFormat {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub size_image: u32,
}

pub trait GadgetIo: Send {
    /// A buffer lent by the kernel. Dropping it unmaps it.
    type Mapping: AsMut<[u8]> + Send;

    fn subscribe(&mut self, event: UvcEventType) -> Result<(), Error>;
    fn wait(&mut self, timeout: Duration) -> Result<Readiness, Error>;
    fn dequeue_event(&mut self) -> Result<UvcEvent, Error>;
    fn send_response(&mut self, resp: &UvcRequestData) -> Result<(), Error>;
    fn set_format(&mut self, fmt: &OutputFormat) -> Result<(), Error>;
    /// Returns the count the kernel actually granted.
    fn request_buffers(&mut self, count: u32) -> Result<u32, Error>;
    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, Error>;
    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Self::Mapping, Error>;
    fn queue_buffer(&mut self, index: u32, bytes_used: u32) -> Result<(), Error>;
    fn dequeue_buffer(&mut self) -> Result<u32, Error>;
    fn stream_on(&mut self) -> Result<(), Error>;
    fn stream_off(&mut self) -> Result<(), Error>;
}

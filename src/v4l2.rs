// derived from /usr/include/linux/videodev2.h and /usr/include/linux/usb/g_uvc.h
//
// Layouts below match the 64-bit kernel ABI.

// kernel structs keep every field, read or not
#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;

use anyhow::Error;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use crate::gadget::{BufferInfo, GadgetIo, OutputFormat, Readiness, UvcEvent};
use crate::usb_proto::UsbCtrlRequest;
use crate::uvc_proto::{UvcEventType, UvcRequestData, UVC_REQUEST_DATA_SIZE};

pub const V4L2_BUF_TYPE_VIDEO_OUTPUT: u32 = 2;
pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_FIELD_NONE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

impl V4l2Capability {
    pub fn card(&self) -> String {
        c_str(&self.card)
    }

    pub fn bus_info(&self) -> String {
        c_str(&self.bus_info)
    }

    pub fn driver(&self) -> String {
        c_str(&self.driver)
    }
}

fn c_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2RequestBuffers {
    count: u32,
    type_: u32,
    memory: u32,
    capabilities: u32,
    flags: u8,
    reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Timecode {
    type_: u32,
    flags: u32,
    frames: u8,
    seconds: u8,
    minutes: u8,
    hours: u8,
    userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2BufferM {
    offset: u32,
    userptr: libc::c_ulong,
    fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Buffer {
    index: u32,
    type_: u32,
    bytesused: u32,
    flags: u32,
    field: u32,
    timestamp: libc::timeval,
    timecode: V4l2Timecode,
    sequence: u32,
    memory: u32,
    m: V4l2BufferM,
    length: u32,
    reserved2: u32,
    request_fd: i32,
}

impl V4l2Buffer {
    fn output_mmap(index: u32) -> V4l2Buffer {
        // all-zero is a valid v4l2_buffer
        let mut buf: V4l2Buffer = unsafe { std::mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT;
        buf.memory = V4L2_MEMORY_MMAP;
        buf
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2PixFormat {
    width: u32,
    height: u32,
    pixelformat: u32,
    field: u32,
    bytesperline: u32,
    sizeimage: u32,
    colorspace: u32,
    priv_: u32,
    flags: u32,
    ycbcr_enc: u32,
    quantization: u32,
    xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2FormatUnion {
    pix: V4l2PixFormat,
    raw_data: [u8; 200],
    _align: [libc::c_ulong; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Format {
    type_: u32,
    fmt: V4l2FormatUnion,
}

#[repr(C)]
#[derive(Clone, Copy)]
union V4l2EventUnion {
    data: [u8; 64],
    _align: [u64; 0],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2Event {
    type_: u32,
    u: V4l2EventUnion,
    pending: u32,
    sequence: u32,
    timestamp: libc::timespec,
    id: u32,
    reserved: [u32; 8],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct V4l2EventSubscription {
    type_: u32,
    id: u32,
    flags: u32,
    reserved: [u32; 5],
}

nix::ioctl_read!(vidioc_querycap, b'V', 0, V4l2Capability);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, V4l2Format);
nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, V4l2Format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);
nix::ioctl_read!(vidioc_dqevent, b'V', 89, V4l2Event);
nix::ioctl_write_ptr!(vidioc_subscribe_event, b'V', 90, V4l2EventSubscription);
nix::ioctl_write_ptr!(uvcioc_send_response, b'U', 1, UvcRequestData);

fn sys_err(what: &str, err: Errno) -> Error {
    anyhow!("{}: {} ({})", what, err.desc(), err as i32)
}

/// One kernel buffer mapped into the process.
pub struct MmapBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is exclusively owned until dropped.
unsafe impl Send for MmapBuffer {}

impl AsMut<[u8]> for MmapBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret < 0 {
            let err = Errno::last();
            warn!("unable to unmap buffer: {} ({})", err.desc(), err as i32);
        }
    }
}

/// The UVC gadget video node, e.g. `/dev/video0` once the function is bound.
pub struct V4l2Gadget {
    file: File,
    capability: V4l2Capability,
}

impl V4l2Gadget {
    pub fn open(path: &Path) -> Result<V4l2Gadget, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| anyhow!("v4l2 open failed: {} ({})", e, e.raw_os_error().unwrap_or(0)))?;
        info!("open succeeded, file descriptor = {}", file.as_raw_fd());

        let mut capability: V4l2Capability = unsafe { std::mem::zeroed() };
        unsafe { vidioc_querycap(file.as_raw_fd(), &mut capability) }
            .map_err(|e| sys_err("unable to query device", e))?;
        info!("device is {} on bus {} (driver {})", capability.card(), capability.bus_info(), capability.driver());

        Ok(V4l2Gadget { file, capability })
    }

    pub fn capability(&self) -> &V4l2Capability {
        &self.capability
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsRawFd for V4l2Gadget {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

fn decode_event(event: &V4l2Event) -> Result<UvcEvent, Error> {
    let data = unsafe { event.u.data };
    let decoded = match num_traits::FromPrimitive::from_u32(event.type_) {
        Some(UvcEventType::Connect) => UvcEvent::Connect,
        Some(UvcEventType::Disconnect) => UvcEvent::Disconnect,
        Some(UvcEventType::StreamOn) => UvcEvent::StreamOn,
        Some(UvcEventType::StreamOff) => UvcEvent::StreamOff,
        Some(UvcEventType::Setup) => {
            let mut slice = &data[..UsbCtrlRequest::size()];
            UvcEvent::Setup(UsbCtrlRequest::deserialize(&mut slice)?)
        }
        Some(UvcEventType::Data) => {
            let length = i32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            let length = length.clamp(0, UVC_REQUEST_DATA_SIZE as i32) as usize;
            UvcEvent::Data(data[4..4 + length].to_vec())
        }
        None => UvcEvent::Unknown(event.type_),
    };
    Ok(decoded)
}

impl GadgetIo for V4l2Gadget {
    type Mapping = MmapBuffer;

    fn subscribe(&mut self, event: UvcEventType) -> Result<(), Error> {
        let sub = V4l2EventSubscription { type_: event as u32, id: 0, flags: 0, reserved: [0; 5] };
        unsafe { vidioc_subscribe_event(self.fd(), &sub) }
            .map_err(|e| sys_err(&format!("unable to subscribe to {:?}", event), e))?;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Readiness, Error> {
        // events are signalled as exceptional conditions, free buffers as writability
        let mut fds = [PollFd::new(self.fd(), PollFlags::POLLPRI | PollFlags::POLLOUT)];
        let ret = match poll(&mut fds, timeout.as_millis() as libc::c_int) {
            Ok(ret) => ret,
            Err(Errno::EINTR) => return Ok(Readiness::default()),
            Err(e) => return Err(sys_err("poll error", e)),
        };
        if ret == 0 {
            return Ok(Readiness::default());
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        Ok(Readiness {
            event: revents.contains(PollFlags::POLLPRI),
            buffer: revents.contains(PollFlags::POLLOUT),
        })
    }

    fn dequeue_event(&mut self) -> Result<UvcEvent, Error> {
        let mut event: V4l2Event = unsafe { std::mem::zeroed() };
        unsafe { vidioc_dqevent(self.fd(), &mut event) }
            .map_err(|e| sys_err("VIDIOC_DQEVENT failed", e))?;
        decode_event(&event)
    }

    fn send_response(&mut self, resp: &UvcRequestData) -> Result<(), Error> {
        unsafe { uvcioc_send_response(self.fd(), resp) }
            .map_err(|e| sys_err("UVCIOC_SEND_RESPONSE failed", e))?;
        Ok(())
    }

    fn set_format(&mut self, fmt: &OutputFormat) -> Result<(), Error> {
        info!("setting format to {} {}x{}", fmt.format, fmt.width, fmt.height);
        let mut v4l2_fmt: V4l2Format = unsafe { std::mem::zeroed() };
        v4l2_fmt.type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT;
        if let Err(e) = unsafe { vidioc_g_fmt(self.fd(), &mut v4l2_fmt) } {
            warn!("unable to get format: {} ({})", e.desc(), e as i32);
        }

        let mut pix = unsafe { v4l2_fmt.fmt.pix };
        pix.width = fmt.width;
        pix.height = fmt.height;
        pix.pixelformat = fmt.format.fourcc();
        pix.field = V4L2_FIELD_NONE;
        pix.sizeimage = fmt.size_image;
        v4l2_fmt.fmt.pix = pix;

        unsafe { vidioc_s_fmt(self.fd(), &mut v4l2_fmt) }
            .map_err(|e| sys_err("unable to set format", e))?;
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, Error> {
        let mut rb = V4l2RequestBuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            capabilities: 0,
            flags: 0,
            reserved: [0; 3],
        };
        unsafe { vidioc_reqbufs(self.fd(), &mut rb) }
            .map_err(|e| sys_err("unable to allocate buffers", e))?;
        Ok(rb.count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, Error> {
        let mut buf = V4l2Buffer::output_mmap(index);
        unsafe { vidioc_querybuf(self.fd(), &mut buf) }
            .map_err(|e| sys_err(&format!("unable to query buffer {}", index), e))?;
        let offset = unsafe { buf.m.offset };
        Ok(BufferInfo { index, length: buf.length, offset })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<MmapBuffer, Error> {
        let len = info.length as usize;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(sys_err(&format!("unable to map buffer {}", info.index), Errno::last()));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| anyhow!("unable to map buffer {}: null mapping", info.index))?;
        Ok(MmapBuffer { ptr, len })
    }

    fn queue_buffer(&mut self, index: u32, bytes_used: u32) -> Result<(), Error> {
        let mut buf = V4l2Buffer::output_mmap(index);
        buf.bytesused = bytes_used;
        unsafe { vidioc_qbuf(self.fd(), &mut buf) }
            .map_err(|e| sys_err(&format!("unable to queue buffer {}", index), e))?;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<u32, Error> {
        let mut buf = V4l2Buffer::output_mmap(0);
        unsafe { vidioc_dqbuf(self.fd(), &mut buf) }
            .map_err(|e| sys_err("unable to dequeue buffer", e))?;
        Ok(buf.index)
    }

    fn stream_on(&mut self) -> Result<(), Error> {
        let type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { vidioc_streamon(self.fd(), &type_) }
            .map_err(|e| sys_err("unable to start stream", e))?;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), Error> {
        let type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        unsafe { vidioc_streamoff(self.fd(), &type_) }
            .map_err(|e| sys_err("unable to stop stream", e))?;
        Ok(())
    }
}

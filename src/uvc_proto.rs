use std::io::Write;

use anyhow::Error;
use uuid::Uuid;

// UVC
// https://www.spinelelectronics.com/pdf/UVC%201.5%20Class%20specification.pdf
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/video.h
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/g_uvc.h

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum UvcRequestCodes {
    Undefined = 0x00,
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

/// Video streaming interface control selectors (A.9.7)
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum UvcVsControls {
    ControlUndefined = 0x00,
    ProbeControl = 0x01,
    CommitControl = 0x02,
    StillProbeControl = 0x03,
    StillCommitControl = 0x04,
    StillImageTriggerControl = 0x05,
    StreamErrorCodeControl = 0x06,
    GenerateKeyFrameControl = 0x07,
    UpdateFrameSegmentControl = 0x08,
    SyncDelayControl = 0x09,
}

/// Interface numbers the gadget function assigns to its two UVC interfaces.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum UvcInterface {
    Control = 0x00,
    Streaming = 0x01,
}

/// Request error codes (4.2.1.2), reported through the request error code control.
#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum UvcRequestErrorCode {
    NoError = 0x00,
    NotReady = 0x01,
    WrongState = 0x02,
    Power = 0x03,
    OutOfRange = 0x04,
    InvalidUnit = 0x05,
    InvalidControl = 0x06,
    InvalidRequest = 0x07,
    InvalidValueWithinRange = 0x08,
}

pub const V4L2_EVENT_PRIVATE_START: u32 = 0x0800_0000;

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq)]
#[repr(u32)]
pub enum UvcEventType {
    Connect = V4L2_EVENT_PRIVATE_START,
    Disconnect = V4L2_EVENT_PRIVATE_START + 1,
    StreamOn = V4L2_EVENT_PRIVATE_START + 2,
    StreamOff = V4L2_EVENT_PRIVATE_START + 3,
    Setup = V4L2_EVENT_PRIVATE_START + 4,
    Data = V4L2_EVENT_PRIVATE_START + 5,
}

impl UvcEventType {
    pub fn all() -> &'static [UvcEventType] {
        &[
            UvcEventType::Setup,
            UvcEventType::Data,
            UvcEventType::StreamOn,
            UvcEventType::StreamOff,
            UvcEventType::Connect,
            UvcEventType::Disconnect,
        ]
    }
}

/// GET_INFO capability bitmap: supports GET and SET.
pub const UVC_CONTROL_CAP_GET_SET: u8 = 0x03;
/// Data stage length announced in answer to SET_CUR on probe/commit.
pub const UVC_SET_CUR_ACK_LEN: i32 = 19;
pub const UVC_STREAMING_CONTROL_SIZE: usize = 34;
pub const UVC_REQUEST_DATA_SIZE: usize = 60;

#[non_exhaustive]
pub struct UvcFormatGuids;

impl UvcFormatGuids {
    pub const NV12: Uuid = Uuid::from_bytes([0x32, 0x31, 0x56, 0x4E, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);
    pub const H264: Uuid = Uuid::from_bytes([0x34, 0x36, 0x32, 0x48, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);
    pub const H265: Uuid = Uuid::from_bytes([0x35, 0x36, 0x32, 0x48, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71]);
}

/// Video probe and commit controls (4.3.1.1), UVC 1.1 layout.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UvcStreamingControl {
    pub bm_hint: u16,
    pub b_format_index: u8,
    pub b_frame_index: u8,
    pub dw_frame_interval: u32,
    pub w_key_frame_rate: u16,
    pub w_pframe_rate: u16,
    pub w_comp_quality: u16,
    pub w_comp_window_size: u16,
    pub w_delay: u16,
    pub dw_max_video_frame_size: u32,
    pub dw_max_payload_transfer_size: u32,
    pub dw_clock_frequency: u32,
    pub bm_framing_info: u8,
    pub b_prefered_version: u8,
    pub b_min_version: u8,
    pub b_max_version: u8,
}

impl UvcStreamingControl {
    pub fn size() -> usize {
        structure!("<HBBIHHHHHIIIBBBB").size()
    }

    /// Shorter payloads (UVC 1.0 hosts send 26 bytes) are zero-extended.
    pub fn deserialize(buffer: &[u8]) -> Result<UvcStreamingControl, Error> {
        let mut raw = [0u8; UVC_STREAMING_CONTROL_SIZE];
        let n = buffer.len().min(raw.len());
        raw[..n].copy_from_slice(&buffer[..n]);
        let mut slice = &raw[..];

        let format = structure!("<HBBIHHHHHIIIBBBB");
        let (bm_hint, b_format_index, b_frame_index, dw_frame_interval, w_key_frame_rate, w_pframe_rate, w_comp_quality, w_comp_window_size, w_delay,
            dw_max_video_frame_size, dw_max_payload_transfer_size, dw_clock_frequency, bm_framing_info, b_prefered_version, b_min_version, b_max_version,
        ) = format.unpack_from(&mut slice)?;
        let msg = UvcStreamingControl {
            bm_hint,
            b_format_index,
            b_frame_index,
            dw_frame_interval,
            w_key_frame_rate,
            w_pframe_rate,
            w_comp_quality,
            w_comp_window_size,
            w_delay,
            dw_max_video_frame_size,
            dw_max_payload_transfer_size,
            dw_clock_frequency,
            bm_framing_info,
            b_prefered_version,
            b_min_version,
            b_max_version,
        };
        return Ok(msg);
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<HBBIHHHHHIIIBBBB");
        format.pack_into(&mut buffer, self.bm_hint, self.b_format_index, self.b_frame_index, self.dw_frame_interval, self.w_key_frame_rate,
                         self.w_pframe_rate, self.w_comp_quality, self.w_comp_window_size, self.w_delay, self.dw_max_video_frame_size,
                         self.dw_max_payload_transfer_size, self.dw_clock_frequency, self.bm_framing_info, self.b_prefered_version,
                         self.b_min_version, self.b_max_version,
        )?;
        return Ok(());
    }

    pub fn fps(&self) -> f32 {
        if self.dw_frame_interval == 0 {
            return 0.0;
        }
        1.0f32 / (self.dw_frame_interval as f32 / 10000000.0)
    }
}

/// Response to a SETUP event (struct uvc_request_data). A negative length
/// means no response is ready and makes the kernel stall the request.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UvcRequestData {
    pub length: i32,
    pub data: [u8; UVC_REQUEST_DATA_SIZE],
}

impl UvcRequestData {
    pub fn new() -> UvcRequestData {
        UvcRequestData { length: -libc::EL2HLT, data: [0u8; UVC_REQUEST_DATA_SIZE] }
    }

    pub fn is_set(&self) -> bool {
        self.length >= 0
    }

    pub fn set(&mut self, payload: &[u8]) {
        let n = payload.len().min(UVC_REQUEST_DATA_SIZE);
        self.data[..n].copy_from_slice(&payload[..n]);
        self.length = n as i32;
    }

    pub fn set_control(&mut self, ctrl: &UvcStreamingControl) -> Result<(), Error> {
        let mut bin = Vec::with_capacity(UVC_STREAMING_CONTROL_SIZE);
        ctrl.serialize(&mut bin)?;
        self.set(&bin);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        if self.length < 0 {
            return &[];
        }
        &self.data[..(self.length as usize).min(UVC_REQUEST_DATA_SIZE)]
    }
}

impl Default for UvcRequestData {
    fn default() -> Self {
        UvcRequestData::new()
    }
}

impl std::fmt::Debug for UvcRequestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UvcRequestData {{ length: {}, data: {:02x?} }}", self.length, self.payload())
    }
}

use std::fmt::{Display, Formatter};

use uuid::Uuid;

use crate::uvc_proto::UvcFormatGuids;

pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// Frame interval in 100 ns units for a whole number of frames per second.
pub const fn interval_for_fps(fps: u32) -> u32 {
    1_000_000_000 / fps / 100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Nv12,
    Mjpeg,
    H264,
    H265,
}

impl PixelFormat {
    pub fn fourcc(&self) -> u32 {
        match self {
            PixelFormat::Nv12 => fourcc(b"NV12"),
            PixelFormat::Mjpeg => fourcc(b"MJPG"),
            PixelFormat::H264 => fourcc(b"H264"),
            PixelFormat::H265 => fourcc(b"H265"),
        }
    }

    pub fn from_fourcc(code: u32) -> Option<PixelFormat> {
        [PixelFormat::Nv12, PixelFormat::Mjpeg, PixelFormat::H264, PixelFormat::H265]
            .iter()
            .copied()
            .find(|fmt| fmt.fourcc() == code)
    }

    /// MJPEG has no format GUID, it uses its own format descriptor.
    pub fn guid(&self) -> Option<Uuid> {
        match self {
            PixelFormat::Nv12 => Some(UvcFormatGuids::NV12),
            PixelFormat::Mjpeg => None,
            PixelFormat::H264 => Some(UvcFormatGuids::H264),
            PixelFormat::H265 => Some(UvcFormatGuids::H265),
        }
    }

    pub fn is_planar(&self) -> bool {
        *self == PixelFormat::Nv12
    }

    /// Estimated upper bound of one frame: raw 4:2:0 size divided by a fixed
    /// per-codec compression ratio.
    pub fn frame_size_bytes(&self, width: u32, height: u32) -> u32 {
        let divisor: u64 = match self {
            PixelFormat::Nv12 => 1,
            PixelFormat::Mjpeg => 3,
            PixelFormat::H264 => 4,
            PixelFormat::H265 => 5,
        };
        let raw_x2 = width as u64 * height as u64 * 3;
        (raw_x2 / (2 * divisor)) as u32
    }

    /// Bitrate target for the encoder feeding this format, `None` for raw and MJPEG.
    pub fn encode_rate_hint(&self, width: u32) -> Option<u32> {
        match self {
            PixelFormat::H264 | PixelFormat::H265 => Some(match width {
                1920 => 3000 * 1000,
                1280 => 2000 * 1000,
                _ => 1000 * 1000,
            }),
            PixelFormat::Nv12 | PixelFormat::Mjpeg => None,
        }
    }
}

impl Display for PixelFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let code = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub intervals: Vec<u32>,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, intervals: &[u32]) -> FrameInfo {
        let mut intervals = intervals.to_vec();
        intervals.sort_unstable();
        FrameInfo { width, height, intervals }
    }

    /// Smallest interval not less than `requested`, or the largest one.
    pub fn nearest_interval(&self, requested: u32) -> u32 {
        self.intervals.iter()
            .copied()
            .find(|&interval| interval >= requested)
            .or_else(|| self.intervals.last().copied())
            .unwrap_or(0)
    }

    pub fn default_interval(&self) -> u32 {
        self.intervals.first().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatInfo {
    pub format: PixelFormat,
    pub frames: Vec<FrameInfo>,
}

impl FormatInfo {
    pub fn new(format: PixelFormat, frames: Vec<FrameInfo>) -> FormatInfo {
        FormatInfo { format, frames }
    }

    /// 1-based, as used by bFrameIndex.
    pub fn lookup_frame(&self, index: u8) -> Option<&FrameInfo> {
        if index == 0 {
            return None;
        }
        self.frames.get(index as usize - 1)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Immutable table of everything the function advertises. Built once and
/// shared read-only between threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    formats: Vec<FormatInfo>,
}

impl Catalog {
    /// Formats without frames can never be selected and are dropped.
    pub fn new(formats: Vec<FormatInfo>) -> Catalog {
        let formats = formats.into_iter()
            .filter(|fmt| {
                if fmt.frames.is_empty() {
                    warn!("Dropping format {} without frames", fmt.format);
                }
                !fmt.frames.is_empty()
            })
            .collect();
        Catalog { formats }
    }

    /// 1-based, as used by bFormatIndex.
    pub fn lookup_format(&self, index: u8) -> Option<&FormatInfo> {
        if index == 0 {
            return None;
        }
        self.formats.get(index as usize - 1)
    }

    pub fn lookup_frame(&self, format_index: u8, frame_index: u8) -> Option<(&FormatInfo, &FrameInfo)> {
        let format = self.lookup_format(format_index)?;
        let frame = format.lookup_frame(frame_index)?;
        Some((format, frame))
    }

    pub fn format_count(&self) -> usize {
        self.formats.len()
    }

    pub fn formats(&self) -> &[FormatInfo] {
        &self.formats
    }
}

impl Default for Catalog {
    fn default() -> Self {
        let fps25 = interval_for_fps(25);
        let fps15 = interval_for_fps(15);
        let coded_frames = || vec![
            FrameInfo::new(640, 480, &[fps25]),
            FrameInfo::new(1280, 720, &[fps25]),
            FrameInfo::new(1920, 1080, &[fps25]),
        ];
        Catalog::new(vec![
            FormatInfo::new(PixelFormat::Nv12, vec![
                FrameInfo::new(320, 240, &[fps25]),
                FrameInfo::new(640, 480, &[fps25]),
                FrameInfo::new(1280, 720, &[fps15]),
            ]),
            FormatInfo::new(PixelFormat::Mjpeg, coded_frames()),
            FormatInfo::new(PixelFormat::H264, coded_frames()),
            FormatInfo::new(PixelFormat::H265, coded_frames()),
        ])
    }
}

impl Display for Catalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, fmt) in self.formats.iter().enumerate() {
            writeln!(f, "format {} {}", i + 1, fmt.format)?;
            for (j, frame) in fmt.frames.iter().enumerate() {
                writeln!(f, "\tframe {} {}x{} intervals {:?}", j + 1, frame.width, frame.height, frame.intervals)?;
            }
        }
        return Ok(());
    }
}

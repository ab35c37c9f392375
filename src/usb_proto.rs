// derived from /usr/include/linux/usb/ch9.h

use std::fmt::{Display, Formatter};
use std::io::Write;

use anyhow::Error;

// USB
// http://sdphca.ucsd.edu/lab_equip_manuals/usb_20.pdf
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/usb/ch9.h

// 9.3 USB Device Requests
#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferDir {
    ToDev = 0x00,
    ToHost = 0x80,
}
pub const USB_DIR_MASK: u8 = 0x1 << 7;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum XferType {
    Std = 0x00,
    Class = 0x20,
    Vendor = 0x40,
    Reserved = 0x60,
}
pub const USB_XFER_TYPE_MASK: u8 = 0x03 << 5;

#[derive(Debug, Clone, Copy, FromPrimitive, PartialEq)]
#[repr(u8)]
pub enum Recip {
    Dev = 0x00,
    Iface = 0x01,
    Ep = 0x02,
    Other = 0x03,
}
pub const USB_RECIP_MASK: u8 = 0x1f;

/// SETUP packet of a control transfer (struct usb_ctrlrequest).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UsbCtrlRequest {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl UsbCtrlRequest {
    pub fn new(bm_request_type: u8, b_request: u8, w_value: u16, w_index: u16, w_length: u16) -> UsbCtrlRequest {
        UsbCtrlRequest { bm_request_type, b_request, w_value, w_index, w_length }
    }

    pub fn size() -> usize {
        structure!("<BBHHH").size()
    }

    pub fn deserialize(mut buffer: &mut &[u8]) -> Result<UsbCtrlRequest, Error> {
        let format = structure!("<BBHHH");
        let (bm_request_type, b_request, w_value, w_index, w_length) = format.unpack_from(&mut buffer)?;
        Ok(UsbCtrlRequest { bm_request_type, b_request, w_value, w_index, w_length })
    }

    pub fn serialize(&self, mut buffer: impl Write) -> Result<(), Error> {
        let format = structure!("<BBHHH");
        format.pack_into(&mut buffer, self.bm_request_type, self.b_request, self.w_value, self.w_index, self.w_length)?;
        return Ok(());
    }

    pub fn dir(&self) -> XferDir {
        if self.bm_request_type & USB_DIR_MASK != 0 { XferDir::ToHost } else { XferDir::ToDev }
    }

    pub fn xfer_type(&self) -> XferType {
        match self.bm_request_type & USB_XFER_TYPE_MASK {
            0x00 => XferType::Std,
            0x20 => XferType::Class,
            0x40 => XferType::Vendor,
            _ => XferType::Reserved,
        }
    }

    /// `None` for the reserved recipients 4..=31.
    pub fn recip(&self) -> Option<Recip> {
        num_traits::FromPrimitive::from_u8(self.bm_request_type & USB_RECIP_MASK)
    }

    /// Control selector, carried in the high byte of wValue for class requests.
    pub fn selector(&self) -> u8 {
        (self.w_value >> 8) as u8
    }

    /// Target interface number, carried in the low byte of wIndex.
    pub fn interface(&self) -> u8 {
        (self.w_index & 0xff) as u8
    }
}

impl Display for UsbCtrlRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "bRequestType {:02x} bRequest {:02x} wValue {:04x} wIndex {:04x} wLength {:04x}",
               self.bm_request_type, self.b_request, self.w_value, self.w_index, self.w_length)
    }
}

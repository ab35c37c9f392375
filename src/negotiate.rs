use std::sync::Arc;

use anyhow::Error;

use crate::catalog::Catalog;
use crate::context::Negotiated;
use crate::uvc_proto::{UvcRequestCodes, UvcRequestData, UvcStreamingControl, UvcVsControls, UVC_CONTROL_CAP_GET_SET, UVC_SET_CUR_ACK_LEN,
                       UVC_STREAMING_CONTROL_SIZE};

/// Which streaming control record a SET_CUR/DATA pair writes to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlTarget {
    Probe,
    Commit,
}

impl ControlTarget {
    pub fn from_selector(cs: u8) -> Option<ControlTarget> {
        match num_traits::FromPrimitive::from_u8(cs) {
            Some(UvcVsControls::ProbeControl) => Some(ControlTarget::Probe),
            Some(UvcVsControls::CommitControl) => Some(ControlTarget::Commit),
            _ => None,
        }
    }
}

/// Fills `ctrl` with catalog entry `(iformat, iframe)`, 0-based. Negative
/// indices count from the end, so `(-1, -1)` is the last frame of the last
/// format. Out of range leaves `ctrl` untouched.
pub fn fill_default(catalog: &Catalog, ctrl: &mut UvcStreamingControl, iframe: i32, iformat: i32, max_payload_transfer_size: u32) {
    let nformats = catalog.format_count() as i32;
    let iformat = if iformat < 0 { nformats + iformat } else { iformat };
    if iformat < 0 || iformat >= nformats {
        return;
    }
    let format = &catalog.formats()[iformat as usize];

    let nframes = format.frame_count() as i32;
    let iframe = if iframe < 0 { nframes + iframe } else { iframe };
    if iframe < 0 || iframe >= nframes {
        return;
    }
    let frame = &format.frames[iframe as usize];

    *ctrl = UvcStreamingControl {
        bm_hint: 1,
        b_format_index: (iformat + 1) as u8,
        b_frame_index: (iframe + 1) as u8,
        dw_frame_interval: frame.default_interval(),
        dw_max_video_frame_size: format.format.frame_size_bytes(frame.width, frame.height),
        dw_max_payload_transfer_size: max_payload_transfer_size,
        bm_framing_info: 3,
        b_prefered_version: 1,
        b_max_version: 1,
        ..Default::default()
    };
}

/// Owns the probe and commit records and answers streaming interface requests.
pub struct Negotiator {
    catalog: Arc<Catalog>,
    max_payload_transfer_size: u32,
    probe: UvcStreamingControl,
    commit: UvcStreamingControl,
}

impl Negotiator {
    pub fn new(catalog: Arc<Catalog>, max_payload_transfer_size: u32) -> Negotiator {
        let mut negotiator = Negotiator {
            catalog,
            max_payload_transfer_size,
            probe: UvcStreamingControl::default(),
            commit: UvcStreamingControl::default(),
        };
        negotiator.probe = negotiator.default_control(0, 0);
        negotiator.commit = negotiator.default_control(0, 0);
        negotiator
    }

    pub fn probe(&self) -> &UvcStreamingControl {
        &self.probe
    }

    pub fn commit(&self) -> &UvcStreamingControl {
        &self.commit
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn current(&self, target: ControlTarget) -> &UvcStreamingControl {
        match target {
            ControlTarget::Probe => &self.probe,
            ControlTarget::Commit => &self.commit,
        }
    }

    pub fn default_control(&self, iframe: i32, iformat: i32) -> UvcStreamingControl {
        let mut ctrl = UvcStreamingControl::default();
        fill_default(&self.catalog, &mut ctrl, iframe, iformat, self.max_payload_transfer_size);
        ctrl
    }

    /// Applies a host DATA stage to `target`. Indices are clamped into the
    /// catalog, the interval snaps to the nearest supported one not below the
    /// request. Returns the new parameters when `target` is the commit record.
    pub fn apply_data(&mut self, target: ControlTarget, raw: &UvcStreamingControl) -> Option<Negotiated> {
        if self.catalog.format_count() == 0 {
            warn!("empty catalog, ignoring {:?} data", target);
            return None;
        }
        let iformat = (raw.b_format_index as usize).clamp(1, self.catalog.format_count());
        let format = &self.catalog.formats()[iformat - 1];
        let iframe = (raw.b_frame_index as usize).clamp(1, format.frame_count());
        let frame = &format.frames[iframe - 1];
        let interval = frame.nearest_interval(raw.dw_frame_interval);

        if iformat != raw.b_format_index as usize || iframe != raw.b_frame_index as usize {
            warn!("clamped format {} frame {} to {} {}", raw.b_format_index, raw.b_frame_index, iformat, iframe);
        }

        let mut updated = *self.current(target);
        updated.b_format_index = iformat as u8;
        updated.b_frame_index = iframe as u8;
        updated.dw_frame_interval = interval;
        updated.dw_max_video_frame_size = format.format.frame_size_bytes(frame.width, frame.height);

        match target {
            ControlTarget::Probe => {
                self.probe = updated;
                None
            }
            ControlTarget::Commit => {
                self.commit = updated;
                Some(Negotiated {
                    format: format.format,
                    width: frame.width,
                    height: frame.height,
                    frame_rate: if interval == 0 { 0 } else { 10_000_000 / interval },
                    max_frame_size: updated.dw_max_video_frame_size,
                    encode_rate_hint: format.format.encode_rate_hint(frame.width),
                })
            }
        }
    }

    /// Answers a class request on the streaming interface. A SET_CUR on probe
    /// or commit returns the record the following DATA stage must update.
    pub fn handle_request(&mut self, req: u8, cs: u8, resp: &mut UvcRequestData) -> Result<Option<ControlTarget>, Error> {
        debug!("streaming request (req {:02x} cs {:02x})", req, cs);
        let target = match ControlTarget::from_selector(cs) {
            Some(target) => target,
            None => return Ok(None),
        };

        match num_traits::FromPrimitive::from_u8(req) {
            Some(UvcRequestCodes::SetCur) => {
                resp.length = UVC_SET_CUR_ACK_LEN;
                return Ok(Some(target));
            }
            Some(UvcRequestCodes::GetCur) => resp.set_control(self.current(target))?,
            Some(UvcRequestCodes::GetMin) | Some(UvcRequestCodes::GetDef) => resp.set_control(&self.default_control(0, 0))?,
            Some(UvcRequestCodes::GetMax) => resp.set_control(&self.default_control(-1, -1))?,
            Some(UvcRequestCodes::GetRes) => resp.set_control(&UvcStreamingControl::default())?,
            Some(UvcRequestCodes::GetLen) => resp.set(&(UVC_STREAMING_CONTROL_SIZE as u16).to_le_bytes()),
            Some(UvcRequestCodes::GetInfo) => resp.set(&[UVC_CONTROL_CAP_GET_SET]),
            _ => warn!("unsupported streaming request {:02x} on {:?}", req, target),
        }
        Ok(None)
    }
}

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Error;

use crate::context::{DeviceContext, Negotiated};
use crate::gadget::{GadgetIo, OutputFormat};
use crate::handoff::VideoFrame;

/// Copies one frame into a kernel buffer, returns the bytes-used to report.
///
/// Planar 4:2:0 frames are copied plane by plane (luma to 0, chroma right
/// after it) and always report the negotiated frame size. Everything else is a
/// single copy truncated to the negotiated maximum.
pub fn copy_frame(frame: &VideoFrame, dst: &mut [u8], negotiated: Option<&Negotiated>) -> u32 {
    match negotiated {
        Some(neg) if neg.format.is_planar() => {
            let luma = neg.width as usize * neg.height as usize;
            let chroma = luma / 2;
            let copied = copy_plane(dst, 0, frame.data(), frame.luma_offset(), luma)
                + copy_plane(dst, luma, frame.data(), frame.chroma_offset(), chroma);
            if copied < luma + chroma {
                warn!("short planar frame: copied {} of {} bytes", copied, luma + chroma);
            }
            neg.max_frame_size
        }
        _ => {
            let max = negotiated.map(|neg| neg.max_frame_size as usize).unwrap_or(dst.len());
            let ncopy = frame.len().min(max).min(dst.len());
            if ncopy < frame.len() {
                debug!("frame truncated from {} to {} bytes", frame.len(), ncopy);
            }
            dst[..ncopy].copy_from_slice(&frame.data()[..ncopy]);
            ncopy as u32
        }
    }
}

fn copy_plane(dst: &mut [u8], dst_offset: usize, src: &[u8], src_offset: usize, len: usize) -> usize {
    let n = len
        .min(src.len().saturating_sub(src_offset))
        .min(dst.len().saturating_sub(dst_offset));
    if n > 0 {
        dst[dst_offset..dst_offset + n].copy_from_slice(&src[src_offset..src_offset + n]);
    }
    n
}

/// Kernel buffer pool plus the dequeue, fill, requeue cycle.
pub struct Pipeline<D: GadgetIo> {
    io: D,
    ctx: Arc<DeviceContext>,
    buffers: Vec<D::Mapping>,
    buffer_size: u32,
    idle_backoff: Duration,
}

impl<D: GadgetIo> Pipeline<D> {
    pub fn new(io: D, ctx: Arc<DeviceContext>, idle_backoff: Duration) -> Pipeline<D> {
        Pipeline { io, ctx, buffers: vec![], buffer_size: 0, idle_backoff }
    }

    pub fn io(&mut self) -> &mut D {
        &mut self.io
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Drops the current pool and maps `count` fresh buffers; 0 only releases.
    /// On failure the buffers mapped so far stay in the pool. Refused while
    /// streaming, the pool is left untouched then.
    pub fn request_buffers(&mut self, count: u32) -> Result<(), Error> {
        if self.ctx.is_streaming() {
            bail!("unable to allocate {} buffers: stream is running", count);
        }
        self.buffers.clear();
        self.buffer_size = 0;

        let granted = self.io.request_buffers(count)?;
        info!("{} buffers allocated.", granted);

        for index in 0..granted {
            let info = self.io.query_buffer(index)?;
            debug!("length: {} offset: {}", info.length, info.offset);
            let mapping = self.io.map_buffer(&info)?;
            debug!("buffer {} mapped.", index);
            self.buffers.push(mapping);
            self.buffer_size = info.length;
        }
        Ok(())
    }

    /// Waits for the producer's next frame and copies it into buffer `index`.
    /// `None` when shutdown interrupted the wait or the buffer is unknown.
    fn fill_buffer(&mut self, index: u32) -> Option<u32> {
        let negotiated = self.ctx.negotiated();
        let mapping = match self.buffers.get_mut(index as usize) {
            Some(mapping) => mapping,
            None => {
                warn!("buffer {} is not mapped", index);
                return None;
            }
        };
        self.ctx.slot().consume(|frame| copy_frame(frame, mapping.as_mut(), negotiated.as_ref()))
    }

    /// On enable every pooled buffer is filled and queued before stream-on.
    pub fn set_streaming(&mut self, enable: bool) -> Result<(), Error> {
        if !enable {
            info!("stopping video stream.");
            self.ctx.set_streaming(false);
            // a frame parked for the old stream must not open the next one
            if self.ctx.slot().clear() {
                debug!("dropped pending frame");
            }
            return self.io.stream_off();
        }

        info!("starting video stream.");
        self.ctx.mark_needs_reinit();
        self.ctx.set_streaming(true);
        for index in 0..self.buffers.len() as u32 {
            let bytes_used = match self.fill_buffer(index) {
                Some(bytes_used) => bytes_used,
                None => bail!("stream start interrupted before buffer {} was filled", index),
            };
            debug!("queueing buffer {}.", index);
            if let Err(e) = self.io.queue_buffer(index, bytes_used) {
                error!("{:#}", e);
                break;
            }
        }
        self.io.stream_on()
    }

    /// One dequeue, fill, requeue cycle. `Ok(false)` when there was nothing to do.
    pub fn process_one(&mut self) -> Result<bool, Error> {
        if !self.ctx.is_streaming() {
            thread::sleep(self.idle_backoff);
            return Ok(false);
        }

        let index = self.io.dequeue_buffer()?;
        let bytes_used = match self.fill_buffer(index) {
            Some(bytes_used) => bytes_used,
            None => return Ok(false),
        };
        self.io.queue_buffer(index, bytes_used)?;
        Ok(true)
    }

    /// Points the kernel output queue at the committed format.
    pub fn apply_format(&mut self, negotiated: &Negotiated) {
        let fmt = OutputFormat {
            format: negotiated.format,
            width: negotiated.width,
            height: negotiated.height,
            size_image: negotiated.format.frame_size_bytes(negotiated.width, negotiated.height),
        };
        if let Err(e) = self.io.set_format(&fmt) {
            error!("{:#}", e);
        }
    }

    #[cfg(test)]
    pub(crate) fn mapping(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(index).map(|mapping| mapping.as_mut())
    }
}

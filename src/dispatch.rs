use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use crate::config::UvcConfig;
use crate::context::DeviceContext;
use crate::gadget::{GadgetIo, Readiness, UvcEvent};
use crate::negotiate::{ControlTarget, Negotiator};
use crate::pipeline::Pipeline;
use crate::usb_proto::{Recip, UsbCtrlRequest, XferType};
use crate::uvc_proto::{UvcEventType, UvcInterface, UvcRequestData, UvcRequestErrorCode, UvcStreamingControl};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlState {
    Idle,
    /// A SET_CUR was answered, its DATA stage goes to this record.
    AwaitingData(ControlTarget),
}

/// Turns gadget events into negotiation steps and stream transitions.
/// Owned and driven by the dispatch thread only.
pub struct Dispatcher<D: GadgetIo> {
    pipeline: Pipeline<D>,
    negotiator: Negotiator,
    state: ControlState,
    ctx: Arc<DeviceContext>,
    buffer_count: u32,
}

impl<D: GadgetIo> Dispatcher<D> {
    pub fn new(io: D, ctx: Arc<DeviceContext>, config: &UvcConfig) -> Dispatcher<D> {
        Dispatcher {
            pipeline: Pipeline::new(io, ctx.clone(), config.idle_backoff),
            negotiator: Negotiator::new(config.catalog.clone(), config.max_payload_transfer_size()),
            state: ControlState::Idle,
            ctx,
            buffer_count: config.buffer_count,
        }
    }

    /// Subscribes to every gadget event the dispatcher understands.
    pub fn init(&mut self) -> Result<(), Error> {
        for event in UvcEventType::all() {
            self.pipeline.io().subscribe(*event)?;
        }
        debug!("initial probe {:?}", self.negotiator.probe());
        Ok(())
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn pipeline(&mut self) -> &mut Pipeline<D> {
        &mut self.pipeline
    }

    pub fn wait(&mut self, timeout: Duration) -> Result<Readiness, Error> {
        self.pipeline.io().wait(timeout)
    }

    pub fn process_event(&mut self) -> Result<(), Error> {
        let event = self.pipeline.io().dequeue_event()?;
        self.handle_event(event)
    }

    pub fn process_buffers(&mut self) -> Result<bool, Error> {
        self.pipeline.process_one()
    }

    pub fn handle_event(&mut self, event: UvcEvent) -> Result<(), Error> {
        match event {
            UvcEvent::Connect | UvcEvent::Disconnect => Ok(()),
            UvcEvent::Setup(req) => self.handle_setup(&req),
            UvcEvent::Data(data) => self.handle_data(&data),
            UvcEvent::StreamOn => {
                if self.ctx.is_streaming() {
                    info!("stream already running, restarting");
                    self.stop_stream()?;
                }
                self.pipeline.request_buffers(self.buffer_count)?;
                // raised before the pre-queue so the first buffer is a sync frame
                self.ctx.request_keyframe();
                self.pipeline.set_streaming(true)
            }
            UvcEvent::StreamOff => self.stop_stream(),
            UvcEvent::Unknown(kind) => {
                debug!("ignoring event {:#x}", kind);
                Ok(())
            }
        }
    }

    fn handle_setup(&mut self, req: &UsbCtrlRequest) -> Result<(), Error> {
        self.state = ControlState::Idle;
        debug!("{}", req);

        let mut resp = UvcRequestData::new();
        match req.xfer_type() {
            XferType::Std => resp.set(&[0x00]),
            XferType::Class => {
                if let Err(e) = self.handle_class(req, &mut resp) {
                    error!("{:#}", e);
                }
            }
            other => debug!("ignoring {:?} request", other),
        }
        self.pipeline.io().send_response(&resp)
    }

    fn handle_class(&mut self, req: &UsbCtrlRequest, resp: &mut UvcRequestData) -> Result<(), Error> {
        if req.recip() != Some(Recip::Iface) {
            return Ok(());
        }
        match num_traits::FromPrimitive::from_u8(req.interface()) {
            Some(UvcInterface::Control) => {
                debug!("control request (req {:02x} cs {:02x})", req.b_request, req.selector());
                // no unit implements a control, every probe gets an error code
                if !resp.is_set() {
                    resp.set(&[UvcRequestErrorCode::InvalidUnit as u8]);
                }
            }
            Some(UvcInterface::Streaming) => {
                if let Some(target) = self.negotiator.handle_request(req.b_request, req.selector(), resp)? {
                    self.state = ControlState::AwaitingData(target);
                }
            }
            None => debug!("request for unknown interface {}", req.interface()),
        }
        Ok(())
    }

    fn handle_data(&mut self, data: &[u8]) -> Result<(), Error> {
        let target = match self.state {
            ControlState::AwaitingData(target) => target,
            ControlState::Idle => {
                warn!("setting unknown control, length = {}", data.len());
                return Ok(());
            }
        };
        self.state = ControlState::Idle;
        info!("setting {:?} control, length = {}", target, data.len());

        let raw = UvcStreamingControl::deserialize(data)?;
        let negotiated = match self.negotiator.apply_data(target, &raw) {
            Some(negotiated) => negotiated,
            None => return Ok(()),
        };

        info!("committed {}", negotiated);
        self.ctx.publish(negotiated);
        self.pipeline.apply_format(&negotiated);

        if self.ctx.is_bulk() {
            self.restart_bulk_stream()?;
        }
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), Error> {
        self.pipeline.set_streaming(false)?;
        self.pipeline.request_buffers(0)
    }

    /// Bulk endpoints never see STREAMON, the commit starts the stream.
    fn restart_bulk_stream(&mut self) -> Result<(), Error> {
        if self.ctx.is_streaming() {
            self.stop_stream()?;
        }
        if self.pipeline.buffer_count() == 0 {
            self.pipeline.request_buffers(self.buffer_count)?;
        }
        self.pipeline.set_streaming(true)
    }

    /// Stops an active stream and releases the pool; errors are logged.
    pub fn teardown(&mut self) {
        if self.ctx.is_streaming() {
            if let Err(e) = self.pipeline.set_streaming(false) {
                error!("{:#}", e);
            }
        }
        if self.pipeline.buffer_count() > 0 {
            if let Err(e) = self.pipeline.request_buffers(0) {
                error!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use crate::catalog::PixelFormat;
    use crate::handoff::VideoFrame;
    use crate::logger::setup_logger;
    use crate::mock::{Call, MockGadget};
    use crate::uvc_proto::{UvcRequestCodes, UvcVsControls};

    use super::*;

    const CLASS_IFACE_OUT: u8 = 0x21;
    const CLASS_IFACE_IN: u8 = 0xa1;

    fn setup(config: UvcConfig) -> (Dispatcher<MockGadget>, MockGadget, Arc<DeviceContext>) {
        setup_logger();
        let gadget = MockGadget::new(1 << 20);
        let ctx = Arc::new(DeviceContext::new(config.bulk));
        let dispatcher = Dispatcher::new(gadget.clone(), ctx.clone(), &config.with_idle_backoff(Duration::from_millis(1)));
        (dispatcher, gadget, ctx)
    }

    fn streaming_request(request_type: u8, req: UvcRequestCodes, cs: UvcVsControls) -> UvcEvent {
        let w_length = if request_type == CLASS_IFACE_OUT { 26 } else { 34 };
        UvcEvent::Setup(UsbCtrlRequest::new(request_type, req as u8, (cs as u16) << 8, UvcInterface::Streaming as u16, w_length))
    }

    fn control_data(format_index: u8, frame_index: u8, interval: u32) -> UvcEvent {
        let ctrl = UvcStreamingControl {
            bm_hint: 1,
            b_format_index: format_index,
            b_frame_index: frame_index,
            dw_frame_interval: interval,
            ..Default::default()
        };
        let mut bin = vec![];
        ctrl.serialize(&mut bin).unwrap();
        UvcEvent::Data(bin)
    }

    fn set_control(dispatcher: &mut Dispatcher<MockGadget>, cs: UvcVsControls, data: UvcEvent) {
        dispatcher.handle_event(streaming_request(CLASS_IFACE_OUT, UvcRequestCodes::SetCur, cs)).unwrap();
        assert!(matches!(dispatcher.state(), ControlState::AwaitingData(_)));
        dispatcher.handle_event(data).unwrap();
        assert_eq!(dispatcher.state(), ControlState::Idle);
    }

    fn feed(ctx: &Arc<DeviceContext>, count: usize) -> thread::JoinHandle<()> {
        let ctx = ctx.clone();
        thread::spawn(move || {
            for i in 0..count {
                ctx.slot().submit(VideoFrame::new(vec![i as u8; 1000])).unwrap();
            }
        })
    }

    // waits for the new pool, stopping the old stream drops a parked frame
    fn feed_after_realloc(ctx: &Arc<DeviceContext>, gadget: &MockGadget, count: usize) -> thread::JoinHandle<()> {
        let ctx = ctx.clone();
        let gadget = gadget.clone();
        thread::spawn(move || {
            while !gadget.calls().iter().any(|call| matches!(call, Call::RequestBuffers(n) if *n > 0)) {
                thread::sleep(Duration::from_millis(1));
            }
            for i in 0..count {
                ctx.slot().submit(VideoFrame::new(vec![i as u8; 1000])).unwrap();
            }
        })
    }

    #[test]
    fn init_subscribes_all_events_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        dispatcher.init().unwrap();
        let subscribed: Vec<_> = gadget.calls().into_iter()
            .filter_map(|call| match call {
                Call::Subscribe(event) => Some(event),
                _ => None,
            })
            .collect();
        assert_eq!(subscribed, UvcEventType::all().to_vec());
    }

    #[test]
    fn probe_mjpeg_720p_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        set_control(&mut dispatcher, UvcVsControls::ProbeControl, control_data(2, 2, 400000));

        let probe = dispatcher.negotiator().probe();
        assert_eq!(probe.b_format_index, 2);
        assert_eq!(probe.b_frame_index, 2);
        assert_eq!(probe.dw_frame_interval, 400000);
        assert_eq!(probe.dw_max_video_frame_size, 460800);
        assert_eq!(ctx.negotiated(), None);
        assert_eq!(gadget.responses(), vec![(19, vec![0u8; 19])]);
    }

    #[test]
    fn commit_then_streamon_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        set_control(&mut dispatcher, UvcVsControls::CommitControl, control_data(2, 2, 400000));

        let negotiated = ctx.negotiated().unwrap();
        assert_eq!(negotiated.format, PixelFormat::Mjpeg);
        assert_eq!((negotiated.width, negotiated.height), (1280, 720));
        assert_eq!(negotiated.frame_rate, 25);
        assert!(gadget.calls().iter().any(|call| matches!(call, Call::SetFormat(fmt) if fmt.size_image == 460800)));

        gadget.clear_calls();
        let producer = feed(&ctx, 3);
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();

        let calls = gadget.calls();
        assert_eq!(calls.iter().filter(|call| matches!(call, Call::RequestBuffers(3))).count(), 1);
        let stream_on = calls.iter().position(|call| *call == Call::StreamOn).unwrap();
        let queued: Vec<_> = calls[..stream_on].iter().filter(|call| matches!(call, Call::QueueBuffer(..))).collect();
        assert_eq!(queued, vec![&Call::QueueBuffer(0, 1000), &Call::QueueBuffer(1, 1000), &Call::QueueBuffer(2, 1000)]);
        assert!(ctx.is_streaming());
        assert!(ctx.take_keyframe_request());
        assert!(ctx.take_reinit_request());
    }

    #[test]
    fn streamoff_releases_pool_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        let producer = feed(&ctx, 3);
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();
        gadget.clear_calls();

        dispatcher.handle_event(UvcEvent::StreamOff).unwrap();
        assert_eq!(gadget.calls(), vec![Call::StreamOff, Call::RequestBuffers(0)]);
        assert!(!ctx.is_streaming());
        assert_eq!(dispatcher.pipeline().buffer_count(), 0);
    }

    #[test]
    fn data_without_set_cur_is_discarded_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        let before = *dispatcher.negotiator().probe();
        dispatcher.handle_event(control_data(3, 3, 400000)).unwrap();
        assert_eq!(*dispatcher.negotiator().probe(), before);
        assert_eq!(ctx.negotiated(), None);
        assert!(gadget.calls().is_empty());
    }

    #[test]
    fn get_request_stays_idle_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        dispatcher.handle_event(streaming_request(CLASS_IFACE_IN, UvcRequestCodes::GetMax, UvcVsControls::ProbeControl)).unwrap();
        assert_eq!(dispatcher.state(), ControlState::Idle);

        let responses = gadget.responses();
        assert_eq!(responses.len(), 1);
        let ctrl = UvcStreamingControl::deserialize(&responses[0].1).unwrap();
        assert_eq!(ctrl.b_format_index, 4);
        assert_eq!(ctrl.b_frame_index, 3);
        assert_eq!(ctrl.dw_max_video_frame_size, 622080);
    }

    #[test]
    fn setup_resets_pending_target_test() {
        let (mut dispatcher, _, _) = setup(UvcConfig::default());
        dispatcher.handle_event(streaming_request(CLASS_IFACE_OUT, UvcRequestCodes::SetCur, UvcVsControls::CommitControl)).unwrap();
        assert_eq!(dispatcher.state(), ControlState::AwaitingData(ControlTarget::Commit));
        dispatcher.handle_event(streaming_request(CLASS_IFACE_IN, UvcRequestCodes::GetCur, UvcVsControls::ProbeControl)).unwrap();
        assert_eq!(dispatcher.state(), ControlState::Idle);
    }

    #[test]
    fn standard_request_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        dispatcher.handle_event(UvcEvent::Setup(UsbCtrlRequest::new(0x80, 0x06, 0x0100, 0, 18))).unwrap();
        assert_eq!(gadget.responses(), vec![(1, vec![0x00])]);
    }

    #[test]
    fn control_interface_stub_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        let req = UsbCtrlRequest::new(CLASS_IFACE_IN, UvcRequestCodes::GetInfo as u8, 0x0200, UvcInterface::Control as u16, 1);
        dispatcher.handle_event(UvcEvent::Setup(req)).unwrap();
        assert_eq!(gadget.responses(), vec![(1, vec![0x05])]);
    }

    #[test]
    fn non_interface_recipient_is_stalled_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        // class request addressed to an endpoint
        let req = UsbCtrlRequest::new(0xa2, UvcRequestCodes::GetCur as u8, 0x0100, 0x0081, 34);
        dispatcher.handle_event(UvcEvent::Setup(req)).unwrap();
        let responses = gadget.responses();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].0 < 0);
    }

    #[test]
    fn connect_is_ignored_test() {
        let (mut dispatcher, gadget, _) = setup(UvcConfig::default());
        dispatcher.handle_event(UvcEvent::Connect).unwrap();
        dispatcher.handle_event(UvcEvent::Disconnect).unwrap();
        dispatcher.handle_event(UvcEvent::Unknown(0x1234)).unwrap();
        assert_eq!(dispatcher.state(), ControlState::Idle);
        assert!(gadget.calls().is_empty());
    }

    #[test]
    fn bulk_commit_starts_stream_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default().with_bulk(true));
        assert_eq!(dispatcher.negotiator().probe().dw_max_payload_transfer_size, 16384);

        let producer = feed(&ctx, 3);
        set_control(&mut dispatcher, UvcVsControls::CommitControl, control_data(3, 1, 400000));
        producer.join().unwrap();

        let calls = gadget.calls();
        assert!(calls.contains(&Call::RequestBuffers(3)));
        assert_eq!(calls.iter().filter(|call| matches!(call, Call::QueueBuffer(..))).count(), 3);
        assert_eq!(calls.last(), Some(&Call::StreamOn));
        assert!(ctx.is_streaming());

        // a second commit restarts the stream on a fresh pool
        gadget.clear_calls();
        let producer = feed_after_realloc(&ctx, &gadget, 3);
        set_control(&mut dispatcher, UvcVsControls::CommitControl, control_data(3, 2, 400000));
        producer.join().unwrap();
        let calls = gadget.calls();
        let stop = calls.iter().position(|call| *call == Call::StreamOff).unwrap();
        let release = calls.iter().position(|call| *call == Call::RequestBuffers(0)).unwrap();
        let start = calls.iter().position(|call| *call == Call::StreamOn).unwrap();
        assert!(stop < release && release < start);
    }

    #[test]
    fn duplicate_streamon_restarts_stream_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        let producer = feed(&ctx, 3);
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();
        gadget.clear_calls();

        let producer = feed_after_realloc(&ctx, &gadget, 3);
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();

        let calls = gadget.calls();
        assert_eq!(&calls[..3], &[Call::StreamOff, Call::RequestBuffers(0), Call::RequestBuffers(3)]);
        assert_eq!(calls.iter().filter(|call| matches!(call, Call::QueueBuffer(..))).count(), 3);
        assert_eq!(calls.last(), Some(&Call::StreamOn));
        assert!(ctx.is_streaming());
        assert_eq!(dispatcher.pipeline().buffer_count(), 3);
    }

    #[test]
    fn first_prequeued_frame_is_keyframe_test() {
        let (mut dispatcher, _, ctx) = setup(UvcConfig::default());
        let producer = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                while !ctx.is_streaming() {
                    thread::sleep(Duration::from_millis(1));
                }
                for _ in 0..3 {
                    let keyframe = ctx.take_keyframe_request();
                    ctx.slot().submit(VideoFrame::new(vec![keyframe as u8; 16])).unwrap();
                }
            })
        };
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();

        assert_eq!(&dispatcher.pipeline().mapping(0).unwrap()[..16], &[1u8; 16][..]);
        assert_eq!(&dispatcher.pipeline().mapping(1).unwrap()[..16], &[0u8; 16][..]);
        assert!(!ctx.take_keyframe_request());
    }

    #[test]
    fn teardown_stops_stream_test() {
        let (mut dispatcher, gadget, ctx) = setup(UvcConfig::default());
        let producer = feed(&ctx, 3);
        dispatcher.handle_event(UvcEvent::StreamOn).unwrap();
        producer.join().unwrap();
        gadget.clear_calls();

        dispatcher.teardown();
        assert_eq!(gadget.calls(), vec![Call::StreamOff, Call::RequestBuffers(0)]);
        dispatcher.teardown();
        assert_eq!(gadget.calls().len(), 2);
    }
}

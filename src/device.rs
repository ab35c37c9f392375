//! Device lifecycle: owns the dispatch thread, optionally the producer thread,
//! and hands producers a [`FrameProducer`] to feed frames through.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Error};

use crate::config::UvcConfig;
use crate::context::{DeviceContext, Negotiated};
use crate::dispatch::Dispatcher;
use crate::event_loop;
use crate::gadget::GadgetIo;
use crate::handoff::VideoFrame;
use crate::v4l2::V4l2Gadget;

/// Producer side of a running device. Cheap to clone, safe to move to the
/// encoder thread.
#[derive(Clone)]
pub struct FrameProducer {
    ctx: Arc<DeviceContext>,
}

impl FrameProducer {
    /// Blocks until the previous frame was taken, then hands `frame` over.
    /// Fails once the device is shutting down.
    pub fn submit_frame(&self, frame: VideoFrame) -> Result<(), Error> {
        self.ctx.slot().submit(frame)
    }

    pub fn negotiated(&self) -> Option<Negotiated> {
        self.ctx.negotiated()
    }

    pub fn is_streaming(&self) -> bool {
        self.ctx.is_streaming()
    }

    pub fn take_keyframe_request(&self) -> bool {
        self.ctx.take_keyframe_request()
    }

    pub fn take_reinit_request(&self) -> bool {
        self.ctx.take_reinit_request()
    }

    pub fn is_shutdown(&self) -> bool {
        self.ctx.is_shutdown()
    }
}

/// Where the producer loop gets its frames, typically an encoder.
pub trait FrameSource: Send {
    /// Called when a stream starts, with the parameters to encode for.
    fn reinit(&mut self, negotiated: &Negotiated) -> Result<(), Error>;

    /// Produces the next frame; `keyframe` asks for a sync frame.
    fn next_frame(&mut self, keyframe: bool) -> Result<VideoFrame, Error>;
}

/// Feeds `source` into the device until shutdown.
pub fn run_producer<S: FrameSource + ?Sized>(producer: &FrameProducer, source: &mut S, idle_backoff: Duration) {
    while !producer.is_shutdown() {
        if !producer.is_streaming() {
            thread::sleep(idle_backoff);
            continue;
        }

        if producer.take_reinit_request() {
            match producer.negotiated() {
                Some(negotiated) => {
                    info!("reinitialising source for {}", negotiated);
                    if let Err(e) = source.reinit(&negotiated) {
                        error!("{:#}", e);
                        // retry on the next pass
                        producer.ctx.mark_needs_reinit();
                        thread::sleep(idle_backoff);
                        continue;
                    }
                }
                None => debug!("streaming without a commit, keeping source settings"),
            }
        }

        let keyframe = producer.take_keyframe_request();
        let frame = match source.next_frame(keyframe) {
            Ok(frame) => frame,
            Err(e) => {
                error!("{:#}", e);
                if keyframe {
                    producer.ctx.request_keyframe();
                }
                thread::sleep(idle_backoff);
                continue;
            }
        };
        if let Err(e) = producer.submit_frame(frame) {
            debug!("{:#}", e);
        }
    }
    debug!("producer stopped");
}

/// A running UVC gadget. Dropping it shuts both threads down.
pub struct UvcDevice {
    ctx: Arc<DeviceContext>,
    idle_backoff: Duration,
    dispatch_thread: Option<JoinHandle<()>>,
    producer_thread: Option<JoinHandle<()>>,
}

impl UvcDevice {
    /// Opens the gadget video node and starts the dispatch thread.
    pub fn open(path: impl AsRef<Path>, config: UvcConfig) -> Result<UvcDevice, Error> {
        let path = path.as_ref();
        let gadget = V4l2Gadget::open(path).with_context(|| format!("unable to open {}", path.display()))?;
        UvcDevice::start(gadget, config)
    }

    pub fn start<D: GadgetIo + 'static>(io: D, config: UvcConfig) -> Result<UvcDevice, Error> {
        let ctx = Arc::new(DeviceContext::new(config.bulk));
        let mut dispatcher = Dispatcher::new(io, ctx.clone(), &config);
        dispatcher.init()?;
        debug!("catalog:\n{}", config.catalog);

        let timeout = config.event_timeout;
        let dispatch_thread = {
            let ctx = ctx.clone();
            thread::Builder::new()
                .name("uvc-dispatch".into())
                .spawn(move || {
                    event_loop::run(&mut dispatcher, &ctx, timeout);
                    dispatcher.teardown();
                })?
        };

        Ok(UvcDevice { ctx, idle_backoff: config.idle_backoff, dispatch_thread: Some(dispatch_thread), producer_thread: None })
    }

    pub fn producer(&self) -> FrameProducer {
        FrameProducer { ctx: self.ctx.clone() }
    }

    /// Runs `source` on a device-owned thread that `close` joins.
    pub fn spawn_producer<S: FrameSource + 'static>(&mut self, mut source: S) -> Result<(), Error> {
        if self.producer_thread.is_some() {
            bail!("a producer is already running");
        }
        let producer = self.producer();
        let idle_backoff = self.idle_backoff;
        let handle = thread::Builder::new()
            .name("uvc-producer".into())
            .spawn(move || run_producer(&producer, &mut source, idle_backoff))?;
        self.producer_thread = Some(handle);
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.ctx.is_streaming()
    }

    /// Signals shutdown, joins both threads and releases the gadget.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.ctx.request_shutdown();
        for handle in [self.dispatch_thread.take(), self.producer_thread.take()].into_iter().flatten() {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!("{} thread panicked", name);
            }
        }
    }
}

impl Drop for UvcDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

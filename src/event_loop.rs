use std::sync::Arc;
use std::time::Duration;

use crate::context::DeviceContext;
use crate::dispatch::Dispatcher;
use crate::gadget::GadgetIo;

/// Body of the dispatch thread.
///
/// Waits at most `timeout` for the gadget, then handles a pending event before
/// a ready buffer. Handler failures are logged and the loop carries on; only a
/// failing wait or a shutdown request ends it.
pub fn run<D: GadgetIo>(dispatcher: &mut Dispatcher<D>, ctx: &Arc<DeviceContext>, timeout: Duration) {
    info!("dispatch loop started");
    while !ctx.is_shutdown() {
        let readiness = match dispatcher.wait(timeout) {
            Ok(readiness) => readiness,
            Err(e) => {
                error!("{:#}", e);
                break;
            }
        };
        if readiness.is_idle() {
            continue;
        }

        if readiness.event {
            if let Err(e) = dispatcher.process_event() {
                error!("{:#}", e);
            }
        }
        if readiness.buffer && !ctx.is_shutdown() {
            if let Err(e) = dispatcher.process_buffers() {
                error!("{:#}", e);
            }
        }
    }
    info!("dispatch loop stopped");
}

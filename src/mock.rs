//! Recording stand-in for the kernel gadget, used by the unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::Error;

use crate::gadget::{BufferInfo, GadgetIo, OutputFormat, Readiness, UvcEvent};
use crate::uvc_proto::{UvcEventType, UvcRequestData};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Subscribe(UvcEventType),
    /// Response length and payload.
    Response(i32, Vec<u8>),
    SetFormat(OutputFormat),
    RequestBuffers(u32),
    QueryBuffer(u32),
    MapBuffer(u32),
    QueueBuffer(u32, u32),
    DequeueBuffer(u32),
    StreamOn,
    StreamOff,
}

#[derive(Default)]
pub struct MockState {
    pub events: VecDeque<UvcEvent>,
    pub queued: VecDeque<u32>,
    pub calls: Vec<Call>,
    pub buffer_len: u32,
    pub fail_map_at: Option<u32>,
    pub fail_dequeue: bool,
    pub fail_wait: bool,
    pub streaming: bool,
}

#[derive(Clone)]
pub struct MockGadget {
    state: Arc<Mutex<MockState>>,
}

impl MockGadget {
    pub fn new(buffer_len: u32) -> MockGadget {
        MockGadget { state: Arc::new(Mutex::new(MockState { buffer_len, ..Default::default() })) }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_event(&self, event: UvcEvent) {
        self.state().events.push_back(event);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn responses(&self) -> Vec<(i32, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Response(length, data) => Some((length, data)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.state().calls.push(call);
    }
}

impl GadgetIo for MockGadget {
    type Mapping = Vec<u8>;

    fn subscribe(&mut self, event: UvcEventType) -> Result<(), Error> {
        self.record(Call::Subscribe(event));
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<Readiness, Error> {
        let readiness = {
            let state = self.state();
            if state.fail_wait {
                bail!("wait failed");
            }
            Readiness { event: !state.events.is_empty(), buffer: state.streaming && !state.queued.is_empty() }
        };
        if readiness.is_idle() {
            thread::sleep(timeout);
        }
        Ok(readiness)
    }

    fn dequeue_event(&mut self) -> Result<UvcEvent, Error> {
        match self.state().events.pop_front() {
            Some(event) => Ok(event),
            None => bail!("unable to dequeue event: no event pending"),
        }
    }

    fn send_response(&mut self, resp: &UvcRequestData) -> Result<(), Error> {
        self.record(Call::Response(resp.length, resp.payload().to_vec()));
        Ok(())
    }

    fn set_format(&mut self, fmt: &OutputFormat) -> Result<(), Error> {
        self.record(Call::SetFormat(*fmt));
        Ok(())
    }

    fn request_buffers(&mut self, count: u32) -> Result<u32, Error> {
        let mut state = self.state();
        state.calls.push(Call::RequestBuffers(count));
        state.queued.clear();
        Ok(count)
    }

    fn query_buffer(&mut self, index: u32) -> Result<BufferInfo, Error> {
        let mut state = self.state();
        state.calls.push(Call::QueryBuffer(index));
        Ok(BufferInfo { index, length: state.buffer_len, offset: index * state.buffer_len })
    }

    fn map_buffer(&mut self, info: &BufferInfo) -> Result<Vec<u8>, Error> {
        let mut state = self.state();
        state.calls.push(Call::MapBuffer(info.index));
        if state.fail_map_at == Some(info.index) {
            bail!("unable to map buffer {}", info.index);
        }
        Ok(vec![0u8; info.length as usize])
    }

    fn queue_buffer(&mut self, index: u32, bytes_used: u32) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::QueueBuffer(index, bytes_used));
        state.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> Result<u32, Error> {
        let mut state = self.state();
        if state.fail_dequeue {
            bail!("unable to dequeue buffer: EAGAIN");
        }
        match state.queued.pop_front() {
            Some(index) => {
                state.calls.push(Call::DequeueBuffer(index));
                Ok(index)
            }
            None => bail!("unable to dequeue buffer: queue empty"),
        }
    }

    fn stream_on(&mut self) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::StreamOn);
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> Result<(), Error> {
        let mut state = self.state();
        state.calls.push(Call::StreamOff);
        state.streaming = false;
        state.queued.clear();
        Ok(())
    }
}

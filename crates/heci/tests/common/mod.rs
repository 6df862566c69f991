//! Scripted in-memory gateway and demultiplexer for session tests.
//!
//! Every native call is recorded. Operations stay pending until the test
//! completes them through [`Mock`], which returns the [`Signal`] to feed to
//! `Session::on_signal`. In-flight operations are counted per channel.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use heci::{
    ClientGuid, Completion, CompletionDemux, ConnectError, ConnectOptions, Demand, DeviceHandle,
    DeviceIo, OsError, Session, SessionEvents, Signal, StartStatus, WaitEvent, WriteMode,
};

pub const DEVICE: &str = "/dev/mei-test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Control,
    Read,
    Write,
}

impl Channel {
    fn from_metadata(metadata: &str) -> Option<Self> {
        if metadata.contains("[control]") {
            Some(Channel::Control)
        } else if metadata.contains("[read]") {
            Some(Channel::Read)
        } else if metadata.contains("[write]") {
            Some(Channel::Write)
        } else {
            None
        }
    }
}

/// A native call made by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(String),
    CreateEvent(WaitEvent),
    Register(WaitEvent, &'static str),
    Deregister(WaitEvent),
    StartRead { len: usize },
    StartWrite { data: Vec<u8> },
    StartControl { code: u32, input: Vec<u8>, capacity: usize },
    Completion(WaitEvent),
    CloseEvent(WaitEvent),
    CloseDevice(DeviceHandle),
}

struct Op {
    channel: Channel,
    buffer: Vec<u8>,
    result: Option<Result<u32, OsError>>,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    next_id: usize,
    events: HashMap<Channel, WaitEvent>,
    ops: HashMap<WaitEvent, Op>,
    in_flight: HashMap<Channel, usize>,
    max_in_flight: HashMap<Channel, usize>,
    fail_next: HashMap<Channel, OsError>,
    open_error: Option<OsError>,
    create_event_error: Option<OsError>,
    register_error: Option<OsError>,
}

impl State {
    fn start(&mut self, channel: Channel, event: WaitEvent, buffer: Vec<u8>) -> StartStatus {
        if let Some(error) = self.fail_next.remove(&channel) {
            return StartStatus::Failed(error);
        }
        assert!(
            !self.ops.contains_key(&event),
            "{:?} started while its wait-event was busy",
            channel
        );
        self.ops.insert(
            event,
            Op {
                channel,
                buffer,
                result: None,
            },
        );

        let count = self.in_flight.entry(channel).or_insert(0);
        *count += 1;
        let count = *count;
        let max = self.max_in_flight.entry(channel).or_insert(0);
        *max = (*max).max(count);
        StartStatus::Pending
    }

    fn retire(&mut self, event: WaitEvent) -> Option<Op> {
        let op = self.ops.remove(&event)?;
        if let Some(count) = self.in_flight.get_mut(&op.channel) {
            *count -= 1;
        }
        Some(op)
    }

    fn event(&self, channel: Channel) -> WaitEvent {
        *self
            .events
            .get(&channel)
            .unwrap_or_else(|| panic!("no {:?} wait-event registered", channel))
    }
}

/// Test-side handle on the shared mock state.
#[derive(Clone, Default)]
pub struct Mock(Rc<RefCell<State>>);

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn io(&self) -> MockIo {
        MockIo(Rc::clone(&self.0))
    }

    pub fn demux(&self) -> MockDemux {
        MockDemux(Rc::clone(&self.0))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.0.borrow().calls.iter().filter(|c| matches(c)).count()
    }

    /// Payloads handed to `start_write`, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::StartWrite { data } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Control codes handed to `start_control`, in order.
    pub fn control_codes(&self) -> Vec<u32> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::StartControl { code, .. } => Some(*code),
                _ => None,
            })
            .collect()
    }

    pub fn event(&self, channel: Channel) -> WaitEvent {
        self.0.borrow().event(channel)
    }

    pub fn has_event(&self, channel: Channel) -> bool {
        self.0.borrow().events.contains_key(&channel)
    }

    pub fn is_pending(&self, channel: Channel) -> bool {
        self.in_flight(channel) > 0
    }

    pub fn in_flight(&self, channel: Channel) -> usize {
        self.0.borrow().in_flight.get(&channel).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self, channel: Channel) -> usize {
        self.0
            .borrow()
            .max_in_flight
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_next_start(&self, channel: Channel, error: OsError) {
        self.0.borrow_mut().fail_next.insert(channel, error);
    }

    pub fn fail_open(&self, error: OsError) {
        self.0.borrow_mut().open_error = Some(error);
    }

    pub fn fail_create_event(&self, error: OsError) {
        self.0.borrow_mut().create_event_error = Some(error);
    }

    pub fn fail_register(&self, error: OsError) {
        self.0.borrow_mut().register_error = Some(error);
    }

    /// Finishes the pending operation on `channel` with `data` as its payload.
    ///
    /// Reads and control requests receive `data` (truncated to their buffer);
    /// writes report their full length as transferred.
    pub fn complete(&self, channel: Channel, data: &[u8]) -> Signal {
        let mut state = self.0.borrow_mut();
        let event = state.event(channel);
        let op = state
            .ops
            .get_mut(&event)
            .unwrap_or_else(|| panic!("no {:?} operation pending", channel));
        let transferred = match channel {
            Channel::Write => op.buffer.len(),
            Channel::Read | Channel::Control => {
                let n = data.len().min(op.buffer.len());
                op.buffer[..n].copy_from_slice(&data[..n]);
                n
            }
        };
        op.result = Some(Ok(transferred as u32));
        Signal::ready(event)
    }

    pub fn complete_control(&self, response: &[u8]) -> Signal {
        self.complete(Channel::Control, response)
    }

    pub fn complete_read(&self, data: &[u8]) -> Signal {
        self.complete(Channel::Read, data)
    }

    pub fn complete_write(&self) -> Signal {
        self.complete(Channel::Write, &[])
    }

    /// Finishes a write having transferred only `n` bytes.
    pub fn complete_write_short(&self, n: u32) -> Signal {
        let mut state = self.0.borrow_mut();
        let event = state.event(Channel::Write);
        let op = state.ops.get_mut(&event).expect("no write pending");
        op.result = Some(Ok(n));
        Signal::ready(event)
    }

    /// Finishes the pending operation with an unretrievable result.
    pub fn complete_with_error(&self, channel: Channel, error: OsError) -> Signal {
        let mut state = self.0.borrow_mut();
        let event = state.event(channel);
        let op = state.ops.get_mut(&event).expect("no operation pending");
        op.result = Some(Err(error));
        Signal::ready(event)
    }

    /// Drops the pending operation and reports an abnormal wait status.
    pub fn abandon(&self, channel: Channel) -> Signal {
        let mut state = self.0.borrow_mut();
        let event = state.event(channel);
        state.retire(event);
        Signal::failed(event, "wait abandoned")
    }
}

pub struct MockIo(Rc<RefCell<State>>);

impl DeviceIo for MockIo {
    fn open_device(&mut self, path: &str) -> Result<DeviceHandle, OsError> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::Open(path.to_string()));
        if let Some(error) = state.open_error {
            return Err(error);
        }
        state.next_id += 1;
        Ok(DeviceHandle(1000 + state.next_id))
    }

    fn create_event(&mut self) -> Result<WaitEvent, OsError> {
        let mut state = self.0.borrow_mut();
        if let Some(error) = state.create_event_error {
            return Err(error);
        }
        state.next_id += 1;
        let event = WaitEvent(state.next_id);
        state.calls.push(Call::CreateEvent(event));
        Ok(event)
    }

    fn start_read(&mut self, _device: DeviceHandle, event: WaitEvent, buffer: Vec<u8>) -> StartStatus {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::StartRead { len: buffer.len() });
        state.start(Channel::Read, event, buffer)
    }

    fn start_write(&mut self, _device: DeviceHandle, event: WaitEvent, data: Vec<u8>) -> StartStatus {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::StartWrite { data: data.clone() });
        state.start(Channel::Write, event, data)
    }

    fn start_control(
        &mut self,
        _device: DeviceHandle,
        event: WaitEvent,
        code: u32,
        input: Vec<u8>,
        output: Vec<u8>,
    ) -> StartStatus {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::StartControl {
            code,
            input,
            capacity: output.len(),
        });
        state.start(Channel::Control, event, output)
    }

    fn completion(&mut self, _device: DeviceHandle, event: WaitEvent) -> Completion {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::Completion(event));
        match state.ops.get(&event).map(|op| op.result.is_some()) {
            Some(true) => {
                let op = state.retire(event).expect("operation vanished");
                Completion {
                    buffer: op.buffer,
                    result: op.result.expect("result checked above"),
                }
            }
            _ => Completion::failed(Vec::new(), OsError(996)),
        }
    }

    fn close_event(&mut self, event: WaitEvent) {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::CloseEvent(event));
        state.retire(event);
    }

    fn close_device(&mut self, device: DeviceHandle) {
        self.0.borrow_mut().calls.push(Call::CloseDevice(device));
    }
}

pub struct MockDemux(Rc<RefCell<State>>);

impl CompletionDemux for MockDemux {
    fn register(&mut self, event: WaitEvent, metadata: &'static str) -> Result<(), OsError> {
        let mut state = self.0.borrow_mut();
        state.calls.push(Call::Register(event, metadata));
        if let Some(error) = state.register_error {
            return Err(error);
        }
        if let Some(channel) = Channel::from_metadata(metadata) {
            state.events.insert(channel, event);
        }
        Ok(())
    }

    fn deregister(&mut self, event: WaitEvent) {
        self.0.borrow_mut().calls.push(Call::Deregister(event));
    }
}

/// A notification observed by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Connected(u32),
    Error(ConnectError),
    Data(Vec<u8>),
    End,
}

/// [`SessionEvents`] sink that records every notification.
pub struct Recorder {
    pub notes: Vec<Note>,
    pub demand: Demand,
    pub panic_on_data: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            notes: Vec::new(),
            demand: Demand::More,
            panic_on_data: false,
        }
    }

    pub fn data(&self) -> Vec<Vec<u8>> {
        self.notes
            .iter()
            .filter_map(|n| match n {
                Note::Data(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn ends(&self) -> usize {
        self.notes.iter().filter(|n| **n == Note::End).count()
    }
}

impl SessionEvents for Recorder {
    fn on_connected(&mut self, max_message_size: u32) {
        self.notes.push(Note::Connected(max_message_size));
    }

    fn on_error(&mut self, error: &ConnectError) {
        self.notes.push(Note::Error(error.clone()));
    }

    fn on_data(&mut self, data: &[u8]) -> Demand {
        self.notes.push(Note::Data(data.to_vec()));
        if self.panic_on_data {
            panic!("consumer exploded");
        }
        self.demand
    }

    fn on_end(&mut self) {
        self.notes.push(Note::End);
    }
}

pub type TestSession = Session<MockIo, MockDemux, Recorder>;

/// A fresh, disconnected session over a new mock.
pub fn session() -> (TestSession, Mock) {
    let mock = Mock::new();
    let session = Session::new(mock.io(), mock.demux(), DEVICE, Recorder::new());
    (session, mock)
}

/// A session connected to AMT with the given write mode and maximum message size.
pub fn connected(write_mode: WriteMode, max_message_size: u32) -> (TestSession, Mock) {
    let (mut session, mock) = session();
    session
        .connect(
            ClientGuid::AMT,
            ConnectOptions::default().with_write_mode(write_mode),
        )
        .unwrap();
    let signal = mock.complete_control(&max_message_size.to_ne_bytes());
    session.on_signal(signal);
    assert!(session.is_connected());
    (session, mock)
}

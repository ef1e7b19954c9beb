use crate::endpoint::{EndpointTable, PipeClass};
use crate::error::Error;
use crate::fifo::FifoPorts;
use crate::fmt::{debug, error, trace};
use crate::handoff::Handoff;
use crate::hw::{intsts0, Fifo, Hardware, Pid, PipeEvent, CONTROL_PIPE, NUM_PIPES};
use crate::setup::SetupPacket;
use crate::transfer::Geometry;
use crate::Config;

/// Size of the engine-owned control transfer buffer.
///
/// IN responses built by the class layer and OUT data stages are staged here, so neither may
/// exceed this size.
pub const CONTROL_BUF_SIZE: usize = 256;

const ALL_PIPES: u16 = (1 << NUM_PIPES) - 1;
const PIPE_EVENTS: [PipeEvent; 3] = [PipeEvent::Ready, PipeEvent::NotReady, PipeEvent::Empty];

mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const DEVICE_QUALIFIER: u8 = 6;
    pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
}

/// The descriptor byte tables served by the standard request handler.
///
/// The engine serves these as-is; it never builds or patches descriptors.
#[derive(Copy, Clone, Debug)]
pub struct Descriptors<'d> {
    pub device: &'d [u8],
    pub configuration: &'d [u8],
    pub qualifier: Option<&'d [u8]>,
    pub other_speed_configuration: Option<&'d [u8]>,
    /// String descriptor 0: the supported language ID.
    pub language: &'d [u8],
    /// String descriptors 1 and up.
    pub strings: &'d [&'d [u8]],
}

impl<'d> Descriptors<'d> {
    fn check(name: &str, desc: &[u8], ty: u8, min_len: usize) -> Result<(), Error> {
        // Configuration descriptors are followed by their interface and endpoint descriptors,
        // so only their header length is checked.
        let compound = matches!(
            ty,
            descriptor_type::CONFIGURATION | descriptor_type::OTHER_SPEED_CONFIGURATION
        );
        let len_ok = desc.len() >= min_len
            && desc[0] as usize >= min_len
            && (desc[0] as usize == desc.len() || (compound && (desc[0] as usize) < desc.len()));
        if !len_ok {
            error!("{} descriptor: bad length {}", name, desc.len());
            return Err(Error::InvalidConfig);
        }
        if desc[1] != ty {
            error!("{} descriptor: bad type {}", name, desc[1]);
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        Self::check("device", self.device, descriptor_type::DEVICE, 18)?;
        Self::check(
            "configuration",
            self.configuration,
            descriptor_type::CONFIGURATION,
            9,
        )?;
        // The configuration descriptor is served with everything that follows it.
        let total = u16::from_le_bytes([self.configuration[2], self.configuration[3]]) as usize;
        if total != self.configuration.len() {
            error!(
                "configuration descriptor: total length {} but {} bytes supplied",
                total,
                self.configuration.len()
            );
            return Err(Error::InvalidConfig);
        }
        if let Some(qualifier) = self.qualifier {
            Self::check(
                "qualifier",
                qualifier,
                descriptor_type::DEVICE_QUALIFIER,
                10,
            )?;
        }
        if let Some(other) = self.other_speed_configuration {
            Self::check(
                "other speed",
                other,
                descriptor_type::OTHER_SPEED_CONFIGURATION,
                9,
            )?;
        }
        Self::check("language", self.language, descriptor_type::STRING, 4)?;
        for string in self.strings {
            Self::check("string", string, descriptor_type::STRING, 2)?;
        }
        Ok(())
    }

    /// The language ID from string descriptor 0.
    pub(crate) fn language_id(&self) -> u16 {
        u16::from_le_bytes([self.language[2], self.language[3]])
    }

    pub(crate) fn lookup(&self, ty: u8, index: u8, language: u16) -> Option<&'d [u8]> {
        match ty {
            descriptor_type::DEVICE => Some(self.device),
            descriptor_type::CONFIGURATION => Some(self.configuration),
            descriptor_type::STRING if index == 0 => Some(self.language),
            descriptor_type::STRING if language == self.language_id() => {
                self.strings.get(index as usize - 1).copied()
            }
            descriptor_type::STRING => None,
            descriptor_type::DEVICE_QUALIFIER => self.qualifier,
            descriptor_type::OTHER_SPEED_CONFIGURATION => self.other_speed_configuration,
            _ => None,
        }
    }

    pub(crate) fn is_standard_type(ty: u8) -> bool {
        matches!(
            ty,
            descriptor_type::DEVICE
                | descriptor_type::CONFIGURATION
                | descriptor_type::STRING
                | descriptor_type::DEVICE_QUALIFIER
                | descriptor_type::OTHER_SPEED_CONFIGURATION
        )
    }
}

/// How the class layer resolves a SETUP packet the engine did not handle itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClassResponse {
    /// Send the first `n` bytes of the buffer passed to [`ClassHandler::on_setup`].
    In(usize),
    /// Send a static table.
    Static(&'static [u8]),
    /// Receive a data stage of `n` bytes; it is delivered to
    /// [`ClassHandler::on_control_out_done`].  Must match the request's length.
    Out(usize),
    /// No data stage.
    Ack,
    /// The class layer will finish the request later through [`Channel::control_in`],
    /// [`Channel::control_out`], [`Channel::control_ack`] or [`Channel::stall`].
    Defer,
    /// Not recognized; the control pipe is stalled.
    Unknown,
}

/// Events delivered to the class layer, one method per event.
///
/// All methods run in interrupt context, with the channel locked.
pub trait ClassHandler {
    fn on_setup(&mut self, _setup: &SetupPacket, _buf: &mut [u8]) -> ClassResponse {
        ClassResponse::Unknown
    }

    /// The device was configured by the host (`true`), or VBUS was lost (`false`).
    fn on_cable_change(&mut self, _connected: bool) {}

    fn on_error(&mut self, _error: Error) {}

    fn on_control_out_done(&mut self, _result: Result<&[u8], Error>) {}

    fn on_bulk_out_done(&mut self, _result: Result<usize, Error>) {}

    fn on_bulk_in_done(&mut self, _result: Result<(), Error>) {}

    fn on_interrupt_in_done(&mut self, _result: Result<(), Error>) {}
}

impl ClassHandler for () {}

/// Device-level state, as reported by [`Channel::device_state`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceState {
    Disconnected = 0,
    Ready = 1,
    ControlSetup = 2,
    ControlIn = 3,
    ControlOut = 4,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum PipeState {
    Idle,
    Waiting,
    Done,
    /// Latched until CLEAR_FEATURE(ENDPOINT_HALT) or reset.
    Stall,
    /// Latched until reset.
    NoResponse,
}

/// Where a transfer's data lives.
pub(crate) enum TransferBuf<'d> {
    /// OUT data is read and dropped.
    Discard,
    /// The engine's control buffer.
    Control,
    Static(&'d [u8]),
    /// A caller-owned IN buffer.  Only valid while the caller's transfer operation exists.
    Write { ptr: *const u8, len: usize },
    /// A caller-owned OUT buffer.  Only valid while the caller's transfer operation exists.
    Read { ptr: *mut u8, len: usize },
}

// Safety: caller-owned buffers are only registered by transfer operations, which unregister
// them under the channel lock before the buffer borrow ends.
unsafe impl<'d> Send for TransferBuf<'d> {}

impl<'d> TransferBuf<'d> {
    pub(crate) fn write(data: &[u8]) -> Self {
        TransferBuf::Write {
            ptr: data.as_ptr(),
            len: data.len(),
        }
    }

    pub(crate) fn read(buf: &mut [u8]) -> Self {
        TransferBuf::Read {
            ptr: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    // Safety: a caller-owned buffer must still be registered by its transfer operation.
    pub(crate) unsafe fn source<'a>(&'a self, control: &'a [u8]) -> &'a [u8] {
        match *self {
            TransferBuf::Control => control,
            TransferBuf::Static(data) => data,
            TransferBuf::Write { ptr, len } => core::slice::from_raw_parts(ptr, len),
            TransferBuf::Discard | TransferBuf::Read { .. } => &[],
        }
    }

    // Safety: a caller-owned buffer must still be registered by its transfer operation.
    pub(crate) unsafe fn sink<'a>(&'a mut self, control: &'a mut [u8]) -> Option<&'a mut [u8]> {
        match *self {
            TransferBuf::Control => Some(control),
            TransferBuf::Read { ptr, len } => Some(core::slice::from_raw_parts_mut(ptr, len)),
            TransferBuf::Discard | TransferBuf::Static(_) | TransferBuf::Write { .. } => None,
        }
    }
}

pub(crate) struct Transfer<'d> {
    pub(crate) buf: TransferBuf<'d>,
    pub(crate) len: usize,
    /// Bytes moved so far; never decreases.
    pub(crate) offset: usize,
    /// A zero-length packet still has to follow the data.
    pub(crate) zlp_pending: bool,
}

impl<'d> Transfer<'d> {
    pub(crate) fn new(buf: TransferBuf<'d>, len: usize, zlp_pending: bool) -> Self {
        Self {
            buf,
            len,
            offset: 0,
            zlp_pending,
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.len - self.offset
    }
}

pub(crate) struct PipeSlot<'d> {
    pub(crate) state: PipeState,
    pub(crate) transfer: Option<Transfer<'d>>,
    /// Consecutive not-ready events without progress.
    pub(crate) retries: u8,
}

impl<'d> PipeSlot<'d> {
    const fn new() -> Self {
        Self {
            state: PipeState::Idle,
            transfer: None,
            retries: 0,
        }
    }
}

/// Everything in a [`Channel`] apart from the class handler.
///
/// Keeping the class handler in a separate field lets the engine hold a mutable borrow of its
/// own state while calling back into the class layer.
pub(crate) struct Hal<'d, H: Hardware> {
    pub(crate) hw: H,
    pub(crate) config: Config,
    pub(crate) descriptors: Descriptors<'d>,
    pub(crate) endpoints: EndpointTable,
    pub(crate) handoff: &'d Handoff,
    pub(crate) ports: FifoPorts,
    pub(crate) pipes: [PipeSlot<'d>; NUM_PIPES],
    pub(crate) state: DeviceState,
    pub(crate) setup: SetupPacket,
    /// Current configuration value; 0 when unconfigured.
    pub(crate) configuration: u8,
    /// The pull-up is on.
    pub(crate) attached: bool,
    /// `on_cable_change(true)` has been delivered.
    pub(crate) connected: bool,
    pub(crate) control_buf: [u8; CONTROL_BUF_SIZE],
}

/// The per-controller engine context.
///
/// A channel owns the hardware, the class handler and all protocol state.  It is normally
/// placed in a critical-section mutex and driven through a [`Driver`](crate::Driver).
pub struct Channel<'d, H: Hardware, C: ClassHandler> {
    pub(crate) hal: Hal<'d, H>,
    pub(crate) class: C,
}

impl<'d, H: Hardware, C: ClassHandler> Channel<'d, H, C> {
    /// Validate the configuration and build a channel.  The hardware is not touched until
    /// [`Channel::init`].
    pub fn new(
        hw: H,
        class: C,
        config: Config,
        descriptors: Descriptors<'d>,
        endpoints: &[u16],
        handoff: &'d Handoff,
    ) -> Result<Self, Error> {
        config.validate()?;
        descriptors.validate()?;
        let endpoints = EndpointTable::parse(endpoints)?;

        Ok(Self {
            hal: Hal {
                hw,
                config,
                descriptors,
                endpoints,
                handoff,
                ports: FifoPorts::new(),
                pipes: core::array::from_fn(|_| PipeSlot::new()),
                state: DeviceState::Disconnected,
                setup: SetupPacket::default(),
                configuration: 0,
                attached: false,
                connected: false,
                control_buf: [0; CONTROL_BUF_SIZE],
            },
            class,
        })
    }

    /// Bring up the controller.  May be called again to recover from
    /// [`Error::FifoStuck`].
    pub fn init(&mut self) {
        let Self { hal, class } = self;
        hal.init(class);
    }

    pub fn class(&self) -> &C {
        &self.class
    }

    pub fn class_mut(&mut self) -> &mut C {
        &mut self.class
    }

    pub fn handoff(&self) -> &'d Handoff {
        self.hal.handoff
    }

    #[cfg(test)]
    pub(crate) fn hw_mut(&mut self) -> &mut H {
        &mut self.hal.hw
    }

    /// The current [`DeviceState`] as a byte.
    pub fn device_state(&self) -> u8 {
        self.hal.state as u8
    }

    /// The current configuration value, 0 if unconfigured.
    pub fn configuration(&self) -> u8 {
        self.hal.configuration
    }

    pub fn is_endpoint_stalled(&self, pipe: usize) -> bool {
        self.hal.is_endpoint_stalled(pipe)
    }

    /// Halt the pipe serving `class`.  Stalling [`PipeClass::Control`] rejects the current
    /// control request.
    pub fn stall(&mut self, class: PipeClass) -> Result<(), Error> {
        let Self { hal, class: handler } = self;
        hal.stall(class, handler)
    }

    /// Drop all transfers and pipe bookkeeping without notifying the class layer.  Task-context
    /// waiters see [`Error::Aborted`].
    pub fn reset(&mut self) {
        self.hal.reset();
    }

    /// Like [`Channel::reset`], but task-context waiters see [`Error::NotConnected`].
    pub fn cancel(&mut self) {
        self.hal.cancel();
    }

    /// Reprogram the data pipes from a new endpoint table, which becomes the table used by
    /// SET_CONFIGURATION.
    pub fn reset_endpoints(&mut self, words: &[u16]) -> Result<(), Error> {
        let table = EndpointTable::parse(words)?;
        self.hal.reset_endpoints(&table);
        self.hal.endpoints = table;
        Ok(())
    }
}

impl<'d, H: Hardware> Hal<'d, H> {
    fn init<C: ClassHandler>(&mut self, class: &mut C) {
        debug!("initializing controller");
        self.hw.enable_controller();
        self.hw.set_pullup(false);
        self.hw
            .set_control_max_packet_size(self.config.control_max_packet_size);
        self.state = DeviceState::Disconnected;
        self.configuration = 0;
        self.attached = false;
        self.connected = false;
        self.reset();

        if !self.config.vbus_detection || self.vbus_debounced() == Some(true) {
            self.attach(class);
        }
    }

    pub(crate) fn geometry(&self, pipe: usize) -> Option<Geometry> {
        if pipe == CONTROL_PIPE {
            let mps = self.config.control_max_packet_size as usize;
            return Some(Geometry {
                pipe,
                fifo: Fifo::C,
                buffer_size: mps,
                max_packet_size: mps,
            });
        }
        let config = self.endpoints.get(pipe)?;
        Some(Geometry {
            pipe,
            fifo: config.fifo,
            buffer_size: config.access_size() as usize,
            max_packet_size: config.max_packet_size as usize,
        })
    }

    pub(crate) fn pipe_of(&self, class: PipeClass) -> Option<usize> {
        self.endpoints.pipe_for_class(class)
    }

    pub(crate) fn class_of(&self, pipe: usize) -> Option<PipeClass> {
        [PipeClass::BulkOut, PipeClass::BulkIn, PipeClass::InterruptIn]
            .into_iter()
            .find(|&class| self.pipe_of(class) == Some(pipe))
    }

    /// Change a pipe's PID.  Leaving STALL for BUF goes through NAK.
    pub(crate) fn set_pid(&mut self, pipe: usize, pid: Pid) {
        let current = self.hw.pid(pipe);
        if current == pid {
            return;
        }
        if current == Pid::Stall && pid == Pid::Buf {
            self.hw.write_pid(pipe, Pid::Nak);
        }
        self.hw.write_pid(pipe, pid);
    }

    pub(crate) fn disable_pipe_events(&mut self, pipe: usize) {
        for event in PIPE_EVENTS {
            self.hw.set_pipe_event_enabled(event, pipe, false);
        }
    }

    /// Finish the pipe's transfer and deliver the result to the class layer and any waiting
    /// task.  Errors other than a halt are expected to be reported through `on_error` by the
    /// caller.
    pub(crate) fn complete<C: ClassHandler>(
        &mut self,
        pipe: usize,
        result: Result<usize, Error>,
        class: &mut C,
    ) {
        let slot = &mut self.pipes[pipe];
        slot.transfer = None;
        slot.retries = 0;
        slot.state = match result {
            Ok(_) => PipeState::Done,
            Err(Error::Stalled) => PipeState::Stall,
            Err(Error::NoResponse) => PipeState::NoResponse,
            Err(_) => PipeState::Idle,
        };
        self.disable_pipe_events(pipe);
        trace!("pipe {}: transfer complete: {:?}", pipe, result);

        let Some(kind) = self.class_of(pipe) else {
            return;
        };
        match kind {
            PipeClass::BulkOut => class.on_bulk_out_done(result),
            PipeClass::BulkIn => class.on_bulk_in_done(result.map(|_| ())),
            PipeClass::InterruptIn => class.on_interrupt_in_done(result.map(|_| ())),
            PipeClass::Control => {}
        }
        if let Some(slot) = self.handoff.slot(kind) {
            slot.finish(result);
        }
    }

    /// Drop every data transfer's bookkeeping, resolving waiting tasks with `err`.
    fn drop_transfers(&mut self, err: Error) {
        for slot in self.handoff.slots() {
            slot.finish(Err(err));
        }
        for pipe in 0..NUM_PIPES {
            let slot = &mut self.pipes[pipe];
            slot.transfer = None;
            slot.state = PipeState::Idle;
            slot.retries = 0;
            self.disable_pipe_events(pipe);
        }
    }

    pub(crate) fn reset(&mut self) {
        debug!("resetting pipe state");
        self.drop_transfers(Error::Aborted);
        for pipe in 1..NUM_PIPES {
            if self.hw.pid(pipe) != Pid::Nak {
                self.hw.write_pid(pipe, Pid::Nak);
            }
        }
        for event in PIPE_EVENTS {
            self.hw.clear_pipe_events(event, ALL_PIPES);
        }
        self.hw.set_interrupt_enable(intsts0::DEFAULT_ENABLE);
        self.ports.release_all();
        if self.state != DeviceState::Disconnected {
            self.state = DeviceState::Ready;
        }
    }

    pub(crate) fn cancel(&mut self) {
        debug!("cancelling transfers");
        for slot in self.handoff.slots() {
            slot.finish(Err(Error::NotConnected));
        }
        self.reset();
    }

    /// Program the data pipes from `table`.  Transfers in flight are resolved against the
    /// table still in `self.endpoints`, so callers swap it in afterwards.
    pub(crate) fn reset_endpoints(&mut self, table: &EndpointTable) {
        for pipe in 1..NUM_PIPES {
            if let Some(kind) = self.class_of(pipe) {
                if let Some(slot) = self.handoff.slot(kind) {
                    slot.finish(Err(Error::Aborted));
                }
            }
            let slot = &mut self.pipes[pipe];
            slot.transfer = None;
            slot.state = PipeState::Idle;
            slot.retries = 0;
            self.disable_pipe_events(pipe);

            self.set_pid(pipe, Pid::Nak);
            match table.get(pipe) {
                Some(config) => {
                    trace!("pipe {}: configuring {:?}", pipe, config.address());
                    self.hw.configure_pipe(config);
                    self.hw.clear_toggle(pipe);
                    self.hw.clear_pipe_buffer(pipe);
                }
                None => self.hw.unconfigure_pipe(pipe),
            }
        }
        self.ports.release_all();
    }

    /// Apply SET_CONFIGURATION.
    pub(crate) fn set_configuration(&mut self, value: u8) {
        debug!("set configuration {}", value);
        if value == 0 {
            self.reset_endpoints(&EndpointTable::default());
        } else {
            let table = self.endpoints;
            self.reset_endpoints(&table);
        }
        self.configuration = value;
    }

    pub(crate) fn is_endpoint_stalled(&self, pipe: usize) -> bool {
        pipe < NUM_PIPES && self.hw.pid(pipe) == Pid::Stall
    }

    pub(crate) fn stall<C: ClassHandler>(
        &mut self,
        kind: PipeClass,
        class: &mut C,
    ) -> Result<(), Error> {
        let pipe = self.pipe_of(kind).ok_or(Error::InvalidConfig)?;
        if pipe == CONTROL_PIPE {
            self.stall_control();
        } else {
            self.halt(pipe, class);
        }
        Ok(())
    }

    /// Stall a data pipe, failing any transfer in flight.
    pub(crate) fn halt<C: ClassHandler>(&mut self, pipe: usize, class: &mut C) {
        debug!("pipe {}: halt", pipe);
        self.set_pid(pipe, Pid::Stall);
        if self.pipes[pipe].transfer.is_some() {
            self.complete(pipe, Err(Error::Stalled), class);
        } else {
            self.pipes[pipe].state = PipeState::Stall;
        }
    }

    /// Clear a halt: STALL -> NAK -> BUF, with the data toggle reset to DATA0.
    pub(crate) fn clear_halt(&mut self, pipe: usize) {
        debug!("pipe {}: clear halt", pipe);
        self.set_pid(pipe, Pid::Nak);
        self.hw.clear_toggle(pipe);
        self.set_pid(pipe, Pid::Buf);
        if self.pipes[pipe].state == PipeState::Stall {
            self.pipes[pipe].state = PipeState::Idle;
        }
    }
}

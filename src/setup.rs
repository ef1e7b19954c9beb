//! SETUP packet decoding and the standard request handler.

use crate::error::Error;
use crate::fmt::{debug, trace, warn};
use crate::hw::{Hardware, CONTROL_PIPE};
use crate::state::{
    ClassHandler, ClassResponse, DeviceState, Descriptors, Hal, TransferBuf, CONTROL_BUF_SIZE,
};
use embassy_usb_driver::{Direction, EndpointAddress};

/// Standard request codes.
mod request {
    pub const GET_STATUS: u8 = 0;
    pub const CLEAR_FEATURE: u8 = 1;
    pub const SET_FEATURE: u8 = 3;
    pub const SET_ADDRESS: u8 = 5;
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const GET_CONFIGURATION: u8 = 8;
    pub const SET_CONFIGURATION: u8 = 9;
    pub const GET_INTERFACE: u8 = 10;
    pub const SET_INTERFACE: u8 = 11;
}

const FEATURE_ENDPOINT_HALT: u16 = 0;

/// bmRequestType type field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// bmRequestType recipient field.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

/// A decoded SETUP packet.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Decode the packet as it appears on the wire.
    pub fn parse(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Decode the four setup registers (USBREQ, USBVAL, USBINDX, USBLENG).
    pub(crate) fn from_words(words: [u16; 4]) -> Self {
        Self {
            request_type: words[0] as u8,
            request: (words[0] >> 8) as u8,
            value: words[1],
            index: words[2],
            length: words[3],
        }
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x3 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }
}

/// How a SETUP packet is finished.
enum Reply<'d> {
    /// Send a descriptor table.
    Table(&'d [u8]),
    /// Send the first `n` bytes of the control buffer.
    Buffer(usize),
    Receive(usize),
    Ack,
    Defer,
    Stall,
}

impl<'d> From<ClassResponse> for Reply<'d> {
    fn from(response: ClassResponse) -> Self {
        match response {
            ClassResponse::In(n) => Reply::Buffer(n),
            ClassResponse::Static(data) => Reply::Table(data),
            ClassResponse::Out(n) => Reply::Receive(n),
            ClassResponse::Ack => Reply::Ack,
            ClassResponse::Defer => Reply::Defer,
            ClassResponse::Unknown => Reply::Stall,
        }
    }
}

impl<'d, H: Hardware> Hal<'d, H> {
    /// Decode the latched SETUP packet and answer it.
    pub(crate) fn handle_setup<C: ClassHandler>(&mut self, class: &mut C) {
        let setup = SetupPacket::from_words(self.hw.setup_packet());
        trace!("setup: {:?}", setup);

        if self.pipes[CONTROL_PIPE].transfer.take().is_some() {
            debug!("control transfer interrupted by a new SETUP");
        }
        self.disable_pipe_events(CONTROL_PIPE);
        self.setup = setup;
        self.state = DeviceState::ControlSetup;

        let reply = match setup.kind() {
            RequestType::Standard => self.standard_request(&setup, class),
            _ => None,
        };
        let reply = match reply {
            Some(reply) => reply,
            None => class.on_setup(&setup, &mut self.control_buf).into(),
        };
        self.finish_setup(&setup, reply, class);
    }

    fn finish_setup<C: ClassHandler>(
        &mut self,
        setup: &SetupPacket,
        reply: Reply<'d>,
        class: &mut C,
    ) {
        let result = match reply {
            Reply::Table(data) => self.control_in(TransferBuf::Static(data), data.len(), class),
            Reply::Buffer(n) => {
                self.control_in(TransferBuf::Control, n.min(CONTROL_BUF_SIZE), class)
            }
            Reply::Receive(n) if n != setup.length as usize => {
                warn!(
                    "setup: class expects {} bytes, host sends {}",
                    n,
                    setup.length
                );
                self.stall_control();
                Err(Error::State)
            }
            Reply::Receive(0) | Reply::Ack => self.control_ack(),
            Reply::Receive(n) => self.control_out(n),
            Reply::Defer => Ok(()),
            Reply::Stall => {
                debug!(
                    "setup: unsupported request {:#x}/{:#x}",
                    setup.request_type,
                    setup.request
                );
                self.stall_control();
                Ok(())
            }
        };
        if let Err(err) = result {
            class.on_error(err);
        }
    }

    fn standard_request<C: ClassHandler>(
        &mut self,
        setup: &SetupPacket,
        class: &mut C,
    ) -> Option<Reply<'d>> {
        let reply = match (setup.request, setup.recipient()) {
            (request::GET_STATUS, Recipient::Device | Recipient::Interface) => {
                self.reply_bytes(&[0, 0])
            }
            (request::GET_STATUS, Recipient::Endpoint) => match self.endpoint_pipe(setup) {
                Some(pipe) => {
                    let halted = self.is_endpoint_stalled(pipe) as u16;
                    self.reply_bytes(&halted.to_le_bytes())
                }
                None => Reply::Stall,
            },
            (request::CLEAR_FEATURE, Recipient::Endpoint)
                if setup.value == FEATURE_ENDPOINT_HALT =>
            {
                match self.endpoint_pipe(setup) {
                    Some(CONTROL_PIPE) => Reply::Ack,
                    Some(pipe) if self.config.auto_clear_stall => {
                        self.clear_halt(pipe);
                        Reply::Ack
                    }
                    Some(pipe) => {
                        debug!("pipe {}: halt kept, auto clear disabled", pipe);
                        Reply::Ack
                    }
                    None => Reply::Stall,
                }
            }
            (request::SET_FEATURE, Recipient::Endpoint) if setup.value == FEATURE_ENDPOINT_HALT => {
                match self.endpoint_pipe(setup) {
                    Some(CONTROL_PIPE) => Reply::Ack,
                    Some(pipe) => {
                        self.halt(pipe, class);
                        Reply::Ack
                    }
                    None => Reply::Stall,
                }
            }
            (request::SET_ADDRESS, Recipient::Device) => {
                debug!("address {}", setup.value);
                Reply::Ack
            }
            (request::GET_DESCRIPTOR, Recipient::Device) => {
                let [index, ty] = setup.value.to_le_bytes();
                if !Descriptors::is_standard_type(ty) {
                    return None;
                }
                match self.descriptors.lookup(ty, index, setup.index) {
                    Some(data) => Reply::Table(data),
                    None => {
                        debug!("no descriptor {}/{}", ty, index);
                        Reply::Stall
                    }
                }
            }
            (request::GET_CONFIGURATION, Recipient::Device) => {
                let configuration = self.configuration;
                self.reply_bytes(&[configuration])
            }
            (request::SET_CONFIGURATION, Recipient::Device) => {
                let value = setup.value as u8;
                if value != 0 && value != self.configuration_value() {
                    warn!("unknown configuration {}", value);
                    return Some(Reply::Stall);
                }
                self.set_configuration(value);
                if value != 0 && !self.connected {
                    self.connected = true;
                    class.on_cable_change(true);
                }
                Reply::Ack
            }
            (request::GET_INTERFACE, Recipient::Interface) => self.reply_bytes(&[0]),
            (request::SET_INTERFACE, Recipient::Interface) => Reply::Ack,
            _ => return None,
        };
        Some(reply)
    }

    fn reply_bytes(&mut self, data: &[u8]) -> Reply<'d> {
        self.control_buf[..data.len()].copy_from_slice(data);
        Reply::Buffer(data.len())
    }

    fn endpoint_pipe(&self, setup: &SetupPacket) -> Option<usize> {
        self.endpoints
            .pipe_for_address(EndpointAddress::from(setup.index as u8))
    }

    /// bConfigurationValue of the configuration descriptor.
    fn configuration_value(&self) -> u8 {
        self.descriptors.configuration[5]
    }
}

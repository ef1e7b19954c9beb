#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod bus;
mod control_pipe;
mod dispatch;
mod driver;
pub mod endpoint;
mod error;
mod fifo;
mod handoff;
pub mod hw;
mod interrupt;
pub mod regs;
mod setup;
#[cfg(test)]
pub(crate) mod sim;
mod state;
mod transfer;

pub use crate::driver::{Driver, SharedChannel};
pub use crate::endpoint::{EndpointTable, PipeClass, PipeConfig};
pub use crate::error::Error;
pub use crate::handoff::{Completion, Handoff};
pub use crate::hw::Hardware;
pub use crate::setup::{Recipient, RequestType, SetupPacket};
pub use crate::state::{
    Channel, ClassHandler, ClassResponse, Descriptors, DeviceState, CONTROL_BUF_SIZE,
};

use crate::fmt::error;

/// Engine configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Max packet size of the control pipe: 8, 16, 32 or 64.
    pub control_max_packet_size: u16,
    /// Wait for VBUS before connecting, and disconnect when it drops.  When disabled the
    /// pull-up is enabled at init.
    pub vbus_detection: bool,
    /// CLEAR_FEATURE(ENDPOINT_HALT) from the host clears the halt.  When disabled the request is
    /// acknowledged but the pipe stays stalled until the application clears it.
    pub auto_clear_stall: bool,
    /// Do not terminate bulk IN transfers that end on a packet boundary with a zero-length
    /// packet.
    ///
    /// With this off, such a transfer takes one more access than it has buffers of data: a
    /// 512-byte transfer on a 512-byte pipe is one full access followed by a zero-length
    /// short one.
    pub bulk_in_no_short_packet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_max_packet_size: 64,
            vbus_detection: true,
            auto_clear_stall: true,
            bulk_in_no_short_packet: false,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !matches!(self.control_max_packet_size, 8 | 16 | 32 | 64) {
            error!(
                "invalid control max packet size {}",
                self.control_max_packet_size
            );
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

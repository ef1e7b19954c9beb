//! The hardware interface the protocol engine is written against.
//!
//! Everything above this module is pure protocol logic.  The controller primitives it needs
//! (pipe select, PID changes, FIFO data access, interrupt status) are expressed by the
//! [`Hardware`] trait, which is implemented once for the memory-mapped register block in
//! [`crate::regs`] and once by the simulated register file used in tests.

use crate::endpoint::PipeConfig;

/// Number of pipes, including the default control pipe.
pub const NUM_PIPES: usize = 10;

/// Pipe 0 is reserved for control transfers.
pub const CONTROL_PIPE: usize = 0;

/// One of the three CPU-accessible FIFO ports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fifo {
    C,
    D0,
    D1,
}

impl Fifo {
    pub const ALL: [Fifo; 3] = [Fifo::C, Fifo::D0, Fifo::D1];

    pub const fn index(self) -> usize {
        match self {
            Fifo::C => 0,
            Fifo::D0 => 1,
            Fifo::D1 => 2,
        }
    }

    pub(crate) const fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            0 => Some(Fifo::C),
            1 => Some(Fifo::D0),
            2 => Some(Fifo::D1),
            _ => None,
        }
    }
}

/// Direction of a FIFO port access.
///
/// Only the C port cares: it serves both directions of the control pipe and has to be told
/// which buffer to expose.  The D ports follow the direction the pipe was configured with.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FifoDirection {
    Read,
    Write,
}

/// Pipe response state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pid {
    /// Accepting tokens.
    Buf,
    /// NAKing tokens.
    Nak,
    /// Answering with STALL.
    Stall,
}

/// Width of a single FIFO data register access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessWidth {
    Byte,
    Half,
    Word,
}

impl AccessWidth {
    pub const fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::Half => 2,
            AccessWidth::Word => 4,
        }
    }
}

/// The three per-pipe event classes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeEvent {
    /// Buffer ready: data available (OUT) or space available (IN).
    Ready,
    /// Buffer not ready: the last token was NAKed or stalled.
    NotReady,
    /// Buffer empty: an IN buffer has been completely transmitted.
    Empty,
}

/// Per-pipe event bitmasks, one bit per pipe.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PipeEvents {
    pub ready: u16,
    pub not_ready: u16,
    pub empty: u16,
}

impl PipeEvents {
    pub const fn is_empty(&self) -> bool {
        self.ready == 0 && self.not_ready == 0 && self.empty == 0
    }
}

/// Bits of the device interrupt status/enable registers.
pub mod intsts0 {
    pub const VBINT: u16 = 1 << 15;
    pub const RESM: u16 = 1 << 14;
    pub const SOFR: u16 = 1 << 13;
    pub const DVST: u16 = 1 << 12;
    pub const CTRT: u16 = 1 << 11;
    pub const BEMP: u16 = 1 << 10;
    pub const NRDY: u16 = 1 << 9;
    pub const BRDY: u16 = 1 << 8;
    pub const VBSTS: u16 = 1 << 7;
    pub const DVSQ_MASK: u16 = 0x7 << 4;
    pub const DVSQ_SHIFT: u16 = 4;
    pub const VALID: u16 = 1 << 3;
    pub const CTSQ_MASK: u16 = 0x7;

    /// Interrupt sources enabled after init and after every reset.
    pub const DEFAULT_ENABLE: u16 = VBINT | RESM | DVST | CTRT | BEMP | NRDY | BRDY;
    /// Status bits that are cleared by writing zero to them.
    pub const CLEARABLE: u16 = VBINT | RESM | SOFR | DVST | CTRT | VALID;
}

/// Device state as reported by the controller (DVSQ).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    Powered,
    Default,
    Address,
    Configured,
    Suspended,
}

/// Control transfer stage as reported by the controller (CTSQ).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlStage {
    Setup,
    ReadData,
    ReadStatus,
    WriteData,
    WriteStatus,
    NoDataStatus,
    SequenceError,
}

/// A snapshot of the device interrupt status register.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status(pub u16);

impl Status {
    pub const fn has(self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    pub const fn vbus(self) -> bool {
        self.has(intsts0::VBSTS)
    }

    pub const fn bus_state(self) -> BusState {
        match (self.0 & intsts0::DVSQ_MASK) >> intsts0::DVSQ_SHIFT {
            0 => BusState::Powered,
            1 => BusState::Default,
            2 => BusState::Address,
            3 => BusState::Configured,
            _ => BusState::Suspended,
        }
    }

    pub const fn control_stage(self) -> ControlStage {
        match self.0 & intsts0::CTSQ_MASK {
            0 => ControlStage::Setup,
            1 => ControlStage::ReadData,
            2 => ControlStage::ReadStatus,
            3 => ControlStage::WriteData,
            4 => ControlStage::WriteStatus,
            5 => ControlStage::NoDataStatus,
            _ => ControlStage::SequenceError,
        }
    }
}

/// Primitive operations of the USB function controller.
///
/// Implementations only translate each call into register accesses.  They never loop or
/// wait, apart from [`Hardware::delay_us`]; all polling and retry policy lives in the engine.
pub trait Hardware {
    /// Enable the controller in function mode with the pull-up disabled.
    fn enable_controller(&mut self);
    /// Connect or disconnect the D+ pull-up.
    fn set_pullup(&mut self, enabled: bool);

    /// Read the device interrupt status register.
    fn status(&mut self) -> Status;
    /// Acknowledge the given status bits.
    fn clear_status(&mut self, bits: u16);
    /// Set the device interrupt enable register.
    fn set_interrupt_enable(&mut self, bits: u16);
    fn interrupt_enable(&self) -> u16;

    /// Read the per-pipe event status, masked by the per-pipe enables.
    fn pipe_events(&mut self) -> PipeEvents;
    /// Acknowledge the given pipes' events of one class.
    fn clear_pipe_events(&mut self, event: PipeEvent, mask: u16);
    fn set_pipe_event_enabled(&mut self, event: PipeEvent, pipe: usize, enabled: bool);
    fn pipe_event_enabled(&self, event: PipeEvent, pipe: usize) -> bool;

    /// The 8-byte SETUP packet latched by the controller, as four little-endian halfwords.
    fn setup_packet(&mut self) -> [u16; 4];
    /// Set the control-transfer-complete flag so the status stage can finish.
    fn set_control_complete(&mut self);
    fn set_control_max_packet_size(&mut self, max_packet_size: u16);

    fn pid(&self, pipe: usize) -> Pid;
    /// Write the PID field directly.  Callers are responsible for legal sequencing.
    fn write_pid(&mut self, pipe: usize, pid: Pid);
    /// True while the pipe's IN buffer still holds untransmitted data.
    fn in_buffer_busy(&self, pipe: usize) -> bool;
    /// Reset the pipe's data toggle to DATA0.
    fn clear_toggle(&mut self, pipe: usize);
    /// Discard the contents of the pipe's buffer(s).
    fn clear_pipe_buffer(&mut self, pipe: usize);
    /// Program the pipe configuration registers.  The pipe must be NAKed.
    fn configure_pipe(&mut self, config: &PipeConfig);
    /// Return the pipe configuration registers to their reset values.
    fn unconfigure_pipe(&mut self, pipe: usize);

    /// Ask the FIFO port to switch to `pipe`.
    fn select_fifo_pipe(&mut self, fifo: Fifo, pipe: usize, direction: FifoDirection);
    /// The pipe currently selected on the port, as read back from the hardware.
    fn fifo_pipe(&self, fifo: Fifo) -> usize;
    /// True when the port's buffer may be accessed by the CPU.
    fn fifo_ready(&self, fifo: Fifo) -> bool;
    /// Number of received bytes waiting in the selected buffer.
    fn fifo_data_len(&self, fifo: Fifo) -> usize;
    fn fifo_read(&mut self, fifo: Fifo, width: AccessWidth) -> u32;
    fn fifo_write(&mut self, fifo: Fifo, width: AccessWidth, value: u32);
    /// Mark a partially filled IN buffer as ready to transmit.
    fn fifo_commit(&mut self, fifo: Fifo);
    /// Discard the selected buffer.
    fn fifo_clear(&mut self, fifo: Fifo);

    fn delay_us(&mut self, us: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_decodes_device_and_control_state() {
        let status = Status(intsts0::VBSTS | (3 << intsts0::DVSQ_SHIFT) | intsts0::VALID | 1);
        assert!(status.vbus());
        assert_eq!(status.bus_state(), BusState::Configured);
        assert_eq!(status.control_stage(), ControlStage::ReadData);
        assert!(status.has(intsts0::VALID));

        let status = Status(5 << intsts0::DVSQ_SHIFT | 6);
        assert!(!status.vbus());
        assert_eq!(status.bus_state(), BusState::Suspended);
        assert_eq!(status.control_stage(), ControlStage::SequenceError);
    }

    #[test]
    fn fifo_port_bits() {
        assert_eq!(Fifo::from_bits(0), Some(Fifo::C));
        assert_eq!(Fifo::from_bits(2), Some(Fifo::D1));
        assert_eq!(Fifo::from_bits(3), None);
        assert_eq!(Fifo::D0.index(), 1);
    }
}

//! Pipe configuration records.
//!
//! The class layer describes its endpoints with a table of fixed-stride records whose words
//! are images of the controller's pipe configuration registers.  The table is parsed and
//! validated once at init, then replayed into the hardware on SET_CONFIGURATION and
//! [`Channel::reset_endpoints`](crate::Channel::reset_endpoints).

use crate::error::Error;
use crate::fmt::error;
use crate::hw::{Fifo, CONTROL_PIPE, NUM_PIPES};
use embassy_usb_driver::{Direction, EndpointAddress, EndpointType};

/// Words per pipe record.
pub const RECORD_WORDS: usize = 5;
/// Marks the end of a table.
pub const TABLE_END: u16 = 0xffff;

/// Size of one pipe buffer memory block.
pub const BLOCK_SIZE: usize = 64;
/// Pipe buffer memory, in blocks.
///
/// Blocks 0-3 hold the control pipe buffer and blocks 4-7 the fixed interrupt pipe buffers,
/// so bulk and isochronous buffers start at block 8.
pub const BUFFER_BLOCKS: usize = 128;
const FIRST_SHARED_BLOCK: usize = 8;
const INTERRUPT_PIPE_BLOCK: usize = 4;

// PIPECFG image
pub mod cfg {
    pub const TYPE_SHIFT: u16 = 14;
    pub const TYPE_MASK: u16 = 0x3 << TYPE_SHIFT;
    pub const TYPE_BULK: u16 = 1 << TYPE_SHIFT;
    pub const TYPE_INTERRUPT: u16 = 2 << TYPE_SHIFT;
    pub const TYPE_ISOCHRONOUS: u16 = 3 << TYPE_SHIFT;
    pub const BFRE: u16 = 1 << 10;
    pub const DBLB: u16 = 1 << 9;
    pub const CNTMD: u16 = 1 << 8;
    pub const SHTNAK: u16 = 1 << 7;
    pub const DIR_IN: u16 = 1 << 4;
    pub const EPNUM_MASK: u16 = 0xf;
}

// PIPEBUF image
pub mod buf {
    pub const BUFSIZE_SHIFT: u16 = 10;
    pub const BUFSIZE_MASK: u16 = 0x1f << BUFSIZE_SHIFT;
    pub const BUFNMB_MASK: u16 = 0xff;
}

// PIPEPERI image
pub mod peri {
    pub const IFIS: u16 = 1 << 12;
    pub const IITV_MASK: u16 = 0x7;
}

const SELECT_PIPE_MASK: u16 = 0xf;
const SELECT_FIFO_SHIFT: u16 = 8;
const SELECT_FIFO_MASK: u16 = 0x3 << SELECT_FIFO_SHIFT;
const MAXP_MASK: u16 = 0x7ff;

/// The transfer classes the class layer uses, each served by one pipe.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PipeClass {
    Control,
    BulkIn,
    BulkOut,
    InterruptIn,
}

impl PipeClass {
    const fn matches(self) -> (EndpointType, Direction) {
        match self {
            PipeClass::Control => (EndpointType::Control, Direction::In),
            PipeClass::BulkIn => (EndpointType::Bulk, Direction::In),
            PipeClass::BulkOut => (EndpointType::Bulk, Direction::Out),
            PipeClass::InterruptIn => (EndpointType::Interrupt, Direction::In),
        }
    }
}

/// A decoded and validated pipe configuration record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PipeConfig {
    pub pipe: usize,
    pub fifo: Fifo,
    pub ep_type: EndpointType,
    pub direction: Direction,
    pub endpoint: u8,
    pub double_buffered: bool,
    pub continuous: bool,
    pub brdy_on_read_end: bool,
    pub nak_on_short: bool,
    /// Bytes per buffer bank.
    pub buffer_size: u16,
    /// First buffer memory block.
    pub buffer_block: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub flush_isochronous: bool,
}

impl PipeConfig {
    /// Decode one table record.
    pub fn from_record(record: &[u16]) -> Result<Self, Error> {
        let [select, pipecfg, pipebuf, pipemaxp, pipeperi] = match record {
            &[a, b, c, d, e] => [a, b, c, d, e],
            _ => return Err(Error::InvalidConfig),
        };

        let pipe = (select & SELECT_PIPE_MASK) as usize;
        let fifo = Fifo::from_bits((select & SELECT_FIFO_MASK) >> SELECT_FIFO_SHIFT)
            .ok_or(Error::InvalidConfig)?;
        let ep_type = match pipecfg & cfg::TYPE_MASK {
            cfg::TYPE_BULK => EndpointType::Bulk,
            cfg::TYPE_INTERRUPT => EndpointType::Interrupt,
            cfg::TYPE_ISOCHRONOUS => EndpointType::Isochronous,
            _ => {
                error!("pipe {}: missing transfer type", pipe);
                return Err(Error::InvalidConfig);
            }
        };
        let direction = if pipecfg & cfg::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        };

        let (buffer_size, buffer_block) = if is_interrupt_pipe(pipe) {
            // Interrupt pipes have a fixed single buffer; the record's buffer word is ignored.
            (
                BLOCK_SIZE as u16,
                (INTERRUPT_PIPE_BLOCK + pipe - FIRST_INTERRUPT_PIPE) as u8,
            )
        } else {
            let blocks = ((pipebuf & buf::BUFSIZE_MASK) >> buf::BUFSIZE_SHIFT) + 1;
            (
                blocks * BLOCK_SIZE as u16,
                (pipebuf & buf::BUFNMB_MASK) as u8,
            )
        };

        let config = Self {
            pipe,
            fifo,
            ep_type,
            direction,
            endpoint: (pipecfg & cfg::EPNUM_MASK) as u8,
            double_buffered: pipecfg & cfg::DBLB != 0,
            continuous: pipecfg & cfg::CNTMD != 0,
            brdy_on_read_end: pipecfg & cfg::BFRE != 0,
            nak_on_short: pipecfg & cfg::SHTNAK != 0,
            buffer_size,
            buffer_block,
            max_packet_size: pipemaxp & MAXP_MASK,
            interval: (pipeperi & peri::IITV_MASK) as u8,
            flush_isochronous: pipeperi & peri::IFIS != 0,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        let pipe = self.pipe;
        if pipe == CONTROL_PIPE || pipe >= NUM_PIPES {
            error!("pipe {} cannot be configured from the endpoint table", pipe);
            return Err(Error::InvalidConfig);
        }
        if self.endpoint == 0 {
            error!("pipe {}: endpoint 0 is reserved for control transfers", pipe);
            return Err(Error::InvalidConfig);
        }
        let type_ok = match self.ep_type {
            EndpointType::Isochronous => pipe <= 2,
            EndpointType::Bulk => pipe <= 5,
            EndpointType::Interrupt => is_interrupt_pipe(pipe),
            EndpointType::Control => false,
        };
        if !type_ok {
            error!("pipe {} does not support {:?} transfers", pipe, self.ep_type);
            return Err(Error::InvalidConfig);
        }
        if is_interrupt_pipe(pipe) && self.double_buffered {
            error!("pipe {}: interrupt pipes cannot be double buffered", pipe);
            return Err(Error::InvalidConfig);
        }

        let mps = self.max_packet_size;
        let mps_ok = match self.ep_type {
            EndpointType::Bulk => matches!(mps, 8 | 16 | 32 | 64 | 512),
            EndpointType::Interrupt => (1..=64).contains(&mps),
            EndpointType::Isochronous => (1..=1024).contains(&mps),
            EndpointType::Control => false,
        };
        if !mps_ok || self.buffer_size < mps {
            error!(
                "pipe {}: invalid max packet size {} for a {} byte buffer",
                pipe,
                mps,
                self.buffer_size
            );
            return Err(Error::InvalidConfig);
        }
        // In continuous mode whole buffers are moved at a time, and a full buffer must never
        // end in the middle of a packet.
        if self.ep_type == EndpointType::Bulk && self.buffer_size % mps != 0 {
            error!(
                "pipe {}: buffer size {} is not a multiple of the max packet size {}",
                pipe,
                self.buffer_size,
                mps
            );
            return Err(Error::InvalidConfig);
        }

        if !is_interrupt_pipe(pipe) {
            let (start, end) = self.block_range();
            if start < FIRST_SHARED_BLOCK || end > BUFFER_BLOCKS {
                error!(
                    "pipe {}: buffer blocks {}..{} out of range",
                    pipe,
                    start,
                    end
                );
                return Err(Error::InvalidConfig);
            }
        }
        Ok(())
    }

    /// Buffer memory blocks `[start, end)` used by the pipe, counting both banks.
    pub fn block_range(&self) -> (usize, usize) {
        let banks = if self.double_buffered { 2 } else { 1 };
        let start = self.buffer_block as usize;
        let blocks = self.buffer_size as usize / BLOCK_SIZE;
        (start, start + blocks * banks)
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from_parts(self.endpoint as usize, self.direction)
    }

    pub fn is_in(&self) -> bool {
        self.direction == Direction::In
    }

    /// PIPECFG register image.
    pub fn cfg_bits(&self) -> u16 {
        let ty = match self.ep_type {
            EndpointType::Bulk => cfg::TYPE_BULK,
            EndpointType::Interrupt => cfg::TYPE_INTERRUPT,
            EndpointType::Isochronous => cfg::TYPE_ISOCHRONOUS,
            EndpointType::Control => 0,
        };
        let mut bits = ty | (self.endpoint as u16 & cfg::EPNUM_MASK);
        if self.brdy_on_read_end {
            bits |= cfg::BFRE;
        }
        if self.double_buffered {
            bits |= cfg::DBLB;
        }
        if self.continuous {
            bits |= cfg::CNTMD;
        }
        if self.nak_on_short {
            bits |= cfg::SHTNAK;
        }
        if self.is_in() {
            bits |= cfg::DIR_IN;
        }
        bits
    }

    /// Bytes moved through the FIFO per buffer.  A pipe outside continuous mode holds one
    /// packet per buffer whatever its size.
    pub fn access_size(&self) -> u16 {
        if self.continuous {
            self.buffer_size
        } else {
            self.max_packet_size
        }
    }

    /// PIPEBUF register image.
    pub fn buf_bits(&self) -> u16 {
        let size = (self.buffer_size / BLOCK_SIZE as u16).saturating_sub(1);
        (size << buf::BUFSIZE_SHIFT) | self.buffer_block as u16
    }

    /// PIPEPERI register image.
    pub fn peri_bits(&self) -> u16 {
        let mut bits = self.interval as u16 & peri::IITV_MASK;
        if self.flush_isochronous {
            bits |= peri::IFIS;
        }
        bits
    }
}

const FIRST_INTERRUPT_PIPE: usize = 6;

fn is_interrupt_pipe(pipe: usize) -> bool {
    (FIRST_INTERRUPT_PIPE..NUM_PIPES).contains(&pipe)
}

/// A validated set of pipe configurations, indexed by pipe number.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct EndpointTable {
    pipes: [Option<PipeConfig>; NUM_PIPES],
}

impl EndpointTable {
    /// Parse a table of [`RECORD_WORDS`]-word records ending with [`TABLE_END`] (or with the
    /// end of the slice).
    pub fn parse(words: &[u16]) -> Result<Self, Error> {
        let mut table = Self::default();
        let mut rest = words;
        loop {
            match rest.first() {
                None | Some(&TABLE_END) => break,
                Some(_) => {}
            }
            if rest.len() < RECORD_WORDS {
                error!("truncated endpoint table record");
                return Err(Error::InvalidConfig);
            }
            let (record, tail) = rest.split_at(RECORD_WORDS);
            table.insert(PipeConfig::from_record(record)?)?;
            rest = tail;
        }
        Ok(table)
    }

    fn insert(&mut self, config: PipeConfig) -> Result<(), Error> {
        if self.pipes[config.pipe].is_some() {
            error!("pipe {} configured twice", config.pipe);
            return Err(Error::InvalidConfig);
        }
        for other in self.iter() {
            if other.address() == config.address() {
                error!(
                    "endpoint {:?} bound to both pipe {} and pipe {}",
                    config.address(),
                    other.pipe,
                    config.pipe
                );
                return Err(Error::InvalidConfig);
            }
            if !is_interrupt_pipe(other.pipe) && !is_interrupt_pipe(config.pipe) {
                let (a_start, a_end) = other.block_range();
                let (b_start, b_end) = config.block_range();
                if a_start < b_end && b_start < a_end {
                    error!(
                        "pipe {} buffer overlaps pipe {} buffer",
                        config.pipe,
                        other.pipe
                    );
                    return Err(Error::InvalidConfig);
                }
            }
        }
        self.pipes[config.pipe] = Some(config);
        Ok(())
    }

    pub fn get(&self, pipe: usize) -> Option<&PipeConfig> {
        self.pipes.get(pipe).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipeConfig> {
        self.pipes.iter().filter_map(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// The pipe serving a transfer class: the lowest-numbered pipe of the matching type and
    /// direction.
    pub fn pipe_for_class(&self, class: PipeClass) -> Option<usize> {
        if class == PipeClass::Control {
            return Some(CONTROL_PIPE);
        }
        let (ep_type, direction) = class.matches();
        self.iter()
            .find(|c| c.ep_type == ep_type && c.direction == direction)
            .map(|c| c.pipe)
    }

    /// The pipe bound to an endpoint address.  Endpoint 0 maps to the control pipe in both
    /// directions.
    pub fn pipe_for_address(&self, addr: EndpointAddress) -> Option<usize> {
        if addr.index() == 0 {
            return Some(CONTROL_PIPE);
        }
        self.iter().find(|c| c.address() == addr).map(|c| c.pipe)
    }
}

//! Memory-mapped register block of the USB function controller, and the [`Hardware`]
//! implementation on top of it.

use crate::endpoint::PipeConfig;
use crate::hw::{
    AccessWidth, Fifo, FifoDirection, Hardware, Pid, PipeEvent, PipeEvents, Status, CONTROL_PIPE,
    NUM_PIPES,
};
use static_assertions::const_assert_eq;
use vcell::VolatileCell;

type Reg16 = VolatileCell<u16>;

#[repr(C)]
pub struct FifoPort {
    data: VolatileCell<u32>,
}

#[repr(C)]
pub struct FifoSelect {
    sel: Reg16,
    ctr: Reg16,
}

#[repr(C)]
pub struct RegisterBlock {
    syscfg0: Reg16,  // 0x00
    buswait: Reg16,  // 0x02
    syssts0: Reg16,  // 0x04
    _reserved06: [u8; 0x02],
    dvstctr0: Reg16, // 0x08
    _reserved0a: [u8; 0x0a],
    cfifo: FifoPort,  // 0x14
    d0fifo: FifoPort, // 0x18
    d1fifo: FifoPort, // 0x1c
    cfifo_sel: FifoSelect, // 0x20
    _reserved24: [u8; 0x04],
    d0fifo_sel: FifoSelect, // 0x28
    d1fifo_sel: FifoSelect, // 0x2c
    intenb0: Reg16, // 0x30
    intenb1: Reg16, // 0x32
    _reserved34: [u8; 0x02],
    brdyenb: Reg16, // 0x36
    nrdyenb: Reg16, // 0x38
    bempenb: Reg16, // 0x3a
    sofcfg: Reg16,  // 0x3c
    _reserved3e: [u8; 0x02],
    intsts0: Reg16, // 0x40
    intsts1: Reg16, // 0x42
    _reserved44: [u8; 0x02],
    brdysts: Reg16, // 0x46
    nrdysts: Reg16, // 0x48
    bempsts: Reg16, // 0x4a
    frmnum: Reg16,  // 0x4c
    ufrmnum: Reg16, // 0x4e
    usbaddr: Reg16, // 0x50
    _reserved52: [u8; 0x02],
    usbreq: Reg16,  // 0x54
    usbval: Reg16,  // 0x56
    usbindx: Reg16, // 0x58
    usbleng: Reg16, // 0x5a
    dcpcfg: Reg16,  // 0x5c
    dcpmaxp: Reg16, // 0x5e
    dcpctr: Reg16,  // 0x60
    _reserved62: [u8; 0x02],
    pipesel: Reg16, // 0x64
    _reserved66: [u8; 0x02],
    pipecfg: Reg16,  // 0x68
    pipebuf: Reg16,  // 0x6a
    pipemaxp: Reg16, // 0x6c
    pipeperi: Reg16, // 0x6e
    pipectr: [Reg16; NUM_PIPES - 1], // 0x70 to 0x82
}

// Sanity check our layout
const_assert_eq!(core::mem::offset_of!(RegisterBlock, cfifo), 0x14);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, cfifo_sel), 0x20);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, d0fifo_sel), 0x28);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, intenb0), 0x30);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, intsts0), 0x40);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, usbreq), 0x54);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, dcpctr), 0x60);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, pipecfg), 0x68);
const_assert_eq!(core::mem::offset_of!(RegisterBlock, pipectr), 0x70);

mod syscfg0 {
    pub const USBE: u16 = 1 << 0;
    pub const DPRPU: u16 = 1 << 4;
    pub const DCFM: u16 = 1 << 6;
    pub const HSE: u16 = 1 << 7;
}

mod fifosel {
    pub const MBW_SHIFT: u16 = 10;
    pub const MBW_MASK: u16 = 0x3 << MBW_SHIFT;
    pub const ISEL: u16 = 1 << 5;
    pub const CURPIPE_MASK: u16 = 0xf;
}

mod fifoctr {
    pub const BVAL: u16 = 1 << 15;
    pub const BCLR: u16 = 1 << 14;
    pub const FRDY: u16 = 1 << 13;
    pub const DTLN_MASK: u16 = 0xfff;
}

mod pipectr {
    pub const BSTS: u16 = 1 << 15;
    pub const INBUFM: u16 = 1 << 14;
    pub const ACLRM: u16 = 1 << 9;
    pub const SQCLR: u16 = 1 << 8;
    pub const CCPL: u16 = 1 << 2;
    pub const PID_MASK: u16 = 0x3;
    pub const PID_NAK: u16 = 0;
    pub const PID_BUF: u16 = 1;
    pub const PID_STALL: u16 = 2;
    // Bits that are safe to write back unchanged in a read-modify-write.
    pub const WRITABLE: u16 = ACLRM | PID_MASK;
}

/// [`Hardware`] over the memory-mapped registers.
pub struct Registers<'a> {
    regs: &'a RegisterBlock,
}

// Safety: the register block is only reached through the owning `Registers`, which the
// channel mutex serializes.
unsafe impl<'a> Send for Registers<'a> {}

impl<'a> Registers<'a> {
    pub fn new(regs: &'a RegisterBlock) -> Self {
        Self { regs }
    }

    fn port(&self, fifo: Fifo) -> &FifoPort {
        match fifo {
            Fifo::C => &self.regs.cfifo,
            Fifo::D0 => &self.regs.d0fifo,
            Fifo::D1 => &self.regs.d1fifo,
        }
    }

    fn select(&self, fifo: Fifo) -> &FifoSelect {
        match fifo {
            Fifo::C => &self.regs.cfifo_sel,
            Fifo::D0 => &self.regs.d0fifo_sel,
            Fifo::D1 => &self.regs.d1fifo_sel,
        }
    }

    fn ctr(&self, pipe: usize) -> &Reg16 {
        if pipe == CONTROL_PIPE {
            &self.regs.dcpctr
        } else {
            &self.regs.pipectr[pipe - 1]
        }
    }

    fn modify(reg: &Reg16, f: impl FnOnce(u16) -> u16) {
        reg.set(f(reg.get()));
    }

    fn set_width(&self, fifo: Fifo, width: AccessWidth) {
        let mbw = match width {
            AccessWidth::Byte => 0,
            AccessWidth::Half => 1,
            AccessWidth::Word => 2,
        } << fifosel::MBW_SHIFT;
        let sel = &self.select(fifo).sel;
        let current = sel.get();
        if current & fifosel::MBW_MASK != mbw {
            sel.set((current & !fifosel::MBW_MASK) | mbw);
        }
    }

    fn enables(&self, event: PipeEvent) -> &Reg16 {
        match event {
            PipeEvent::Ready => &self.regs.brdyenb,
            PipeEvent::NotReady => &self.regs.nrdyenb,
            PipeEvent::Empty => &self.regs.bempenb,
        }
    }

    fn statuses(&self, event: PipeEvent) -> &Reg16 {
        match event {
            PipeEvent::Ready => &self.regs.brdysts,
            PipeEvent::NotReady => &self.regs.nrdysts,
            PipeEvent::Empty => &self.regs.bempsts,
        }
    }
}

/// Get the register block at a fixed address.
///
/// # Safety
/// `address` must be the base of the controller's register block, and nothing else may
/// access the controller for the lifetime of the returned reference.
pub unsafe fn register_block(address: usize) -> &'static RegisterBlock {
    &*(address as *const RegisterBlock)
}

impl<'a> Hardware for Registers<'a> {
    fn enable_controller(&mut self) {
        Self::modify(&self.regs.syscfg0, |v| {
            (v | syscfg0::USBE | syscfg0::HSE) & !(syscfg0::DCFM | syscfg0::DPRPU)
        });
    }

    fn set_pullup(&mut self, enabled: bool) {
        Self::modify(&self.regs.syscfg0, |v| {
            if enabled {
                v | syscfg0::DPRPU
            } else {
                v & !syscfg0::DPRPU
            }
        });
    }

    fn status(&mut self) -> Status {
        Status(self.regs.intsts0.get())
    }

    fn clear_status(&mut self, bits: u16) {
        // Status flags are cleared by writing 0; writing 1 leaves them untouched.
        self.regs.intsts0.set(!bits);
    }

    fn set_interrupt_enable(&mut self, bits: u16) {
        self.regs.intenb0.set(bits);
    }

    fn interrupt_enable(&self) -> u16 {
        self.regs.intenb0.get()
    }

    fn pipe_events(&mut self) -> PipeEvents {
        PipeEvents {
            ready: self.regs.brdysts.get() & self.regs.brdyenb.get(),
            not_ready: self.regs.nrdysts.get() & self.regs.nrdyenb.get(),
            empty: self.regs.bempsts.get() & self.regs.bempenb.get(),
        }
    }

    fn clear_pipe_events(&mut self, event: PipeEvent, mask: u16) {
        self.statuses(event).set(!mask);
    }

    fn set_pipe_event_enabled(&mut self, event: PipeEvent, pipe: usize, enabled: bool) {
        Self::modify(self.enables(event), |v| {
            if enabled {
                v | (1 << pipe)
            } else {
                v & !(1 << pipe)
            }
        });
    }

    fn pipe_event_enabled(&self, event: PipeEvent, pipe: usize) -> bool {
        self.enables(event).get() & (1 << pipe) != 0
    }

    fn setup_packet(&mut self) -> [u16; 4] {
        [
            self.regs.usbreq.get(),
            self.regs.usbval.get(),
            self.regs.usbindx.get(),
            self.regs.usbleng.get(),
        ]
    }

    fn set_control_complete(&mut self) {
        Self::modify(&self.regs.dcpctr, |v| (v & pipectr::WRITABLE) | pipectr::CCPL);
    }

    fn set_control_max_packet_size(&mut self, max_packet_size: u16) {
        self.regs.dcpmaxp.set(max_packet_size);
    }

    fn pid(&self, pipe: usize) -> Pid {
        match self.ctr(pipe).get() & pipectr::PID_MASK {
            pipectr::PID_NAK => Pid::Nak,
            pipectr::PID_BUF => Pid::Buf,
            _ => Pid::Stall,
        }
    }

    fn write_pid(&mut self, pipe: usize, pid: Pid) {
        let bits = match pid {
            Pid::Nak => pipectr::PID_NAK,
            Pid::Buf => pipectr::PID_BUF,
            Pid::Stall => pipectr::PID_STALL,
        };
        Self::modify(self.ctr(pipe), |v| {
            (v & pipectr::WRITABLE & !pipectr::PID_MASK) | bits
        });
    }

    fn in_buffer_busy(&self, pipe: usize) -> bool {
        let ctr = self.ctr(pipe).get();
        if pipe == CONTROL_PIPE {
            // The control pipe has no in-buffer monitor; BSTS reports CPU access instead.
            ctr & pipectr::BSTS == 0
        } else {
            ctr & pipectr::INBUFM != 0
        }
    }

    fn clear_toggle(&mut self, pipe: usize) {
        Self::modify(self.ctr(pipe), |v| (v & pipectr::WRITABLE) | pipectr::SQCLR);
    }

    fn clear_pipe_buffer(&mut self, pipe: usize) {
        if pipe == CONTROL_PIPE {
            return;
        }
        let ctr = self.ctr(pipe);
        Self::modify(ctr, |v| (v & pipectr::WRITABLE) | pipectr::ACLRM);
        Self::modify(ctr, |v| v & pipectr::WRITABLE & !pipectr::ACLRM);
    }

    fn configure_pipe(&mut self, config: &PipeConfig) {
        self.regs.pipesel.set(config.pipe as u16);
        self.regs.pipecfg.set(config.cfg_bits());
        self.regs.pipebuf.set(config.buf_bits());
        self.regs.pipemaxp.set(config.max_packet_size);
        self.regs.pipeperi.set(config.peri_bits());
        self.regs.pipesel.set(0);
    }

    fn unconfigure_pipe(&mut self, pipe: usize) {
        self.regs.pipesel.set(pipe as u16);
        self.regs.pipecfg.set(0);
        self.regs.pipebuf.set(0);
        self.regs.pipemaxp.set(0);
        self.regs.pipeperi.set(0);
        self.regs.pipesel.set(0);
    }

    fn select_fifo_pipe(&mut self, fifo: Fifo, pipe: usize, direction: FifoDirection) {
        Self::modify(&self.select(fifo).sel, |v| {
            let mut v = (v & !(fifosel::CURPIPE_MASK | fifosel::ISEL)) | pipe as u16;
            if fifo == Fifo::C && direction == FifoDirection::Write {
                v |= fifosel::ISEL;
            }
            v
        });
    }

    fn fifo_pipe(&self, fifo: Fifo) -> usize {
        (self.select(fifo).sel.get() & fifosel::CURPIPE_MASK) as usize
    }

    fn fifo_ready(&self, fifo: Fifo) -> bool {
        self.select(fifo).ctr.get() & fifoctr::FRDY != 0
    }

    fn fifo_data_len(&self, fifo: Fifo) -> usize {
        (self.select(fifo).ctr.get() & fifoctr::DTLN_MASK) as usize
    }

    fn fifo_read(&mut self, fifo: Fifo, width: AccessWidth) -> u32 {
        self.set_width(fifo, width);
        let ptr = self.port(fifo).data.as_ptr();
        // Narrow accesses go to the lowest address of the port.
        unsafe {
            match width {
                AccessWidth::Byte => (ptr as *const u8).read_volatile() as u32,
                AccessWidth::Half => (ptr as *const u16).read_volatile() as u32,
                AccessWidth::Word => ptr.read_volatile(),
            }
        }
    }

    fn fifo_write(&mut self, fifo: Fifo, width: AccessWidth, value: u32) {
        self.set_width(fifo, width);
        let ptr = self.port(fifo).data.as_ptr();
        unsafe {
            match width {
                AccessWidth::Byte => (ptr as *mut u8).write_volatile(value as u8),
                AccessWidth::Half => (ptr as *mut u16).write_volatile(value as u16),
                AccessWidth::Word => ptr.write_volatile(value),
            }
        }
    }

    fn fifo_commit(&mut self, fifo: Fifo) {
        self.select(fifo).ctr.set(fifoctr::BVAL);
    }

    fn fifo_clear(&mut self, fifo: Fifo) {
        self.select(fifo).ctr.set(fifoctr::BCLR);
    }

    fn delay_us(&mut self, us: u32) {
        embassy_time::block_for(embassy_time::Duration::from_micros(us as u64));
    }
}

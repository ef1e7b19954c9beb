//! A simulated register file for exercising the engine without hardware.
//!
//! The model is deliberately small: it keeps per-pipe packet queues for both directions,
//! honours the PID and event-enable registers, and lets a test inject FIFO bind latency or
//! failure.  Host activity is driven explicitly by the test through the `host_*` helpers.

use crate::endpoint::PipeConfig;
use crate::hw::{
    intsts0, AccessWidth, Fifo, FifoDirection, Hardware, Pid, PipeEvent, PipeEvents, Status,
    CONTROL_PIPE, NUM_PIPES,
};
use std::collections::VecDeque;

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct SimPort {
    selected: usize,
    direction: Option<FifoDirection>,
    // Selection requested but not yet visible, and the polls left before it is.
    pending: Option<usize>,
    lag_left: u32,
    staging: Vec<u8>,
    read_pos: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct SimHardware {
    pub enabled: bool,
    pub pullup: bool,
    pub status: u16,
    /// Values returned by `status()` before falling back to `status`.
    pub status_script: VecDeque<u16>,
    pub interrupt_enable: u16,
    pub event_status: [u16; 3],
    pub event_enable: [u16; 3],
    pub setup: [u16; 4],
    pub control_complete: u32,
    pub control_max_packet_size: u16,
    pub pids: [Pid; NUM_PIPES],
    pub pid_writes: Vec<(usize, Pid)>,
    pub in_busy: [bool; NUM_PIPES],
    pub toggle_clears: [u32; NUM_PIPES],
    pub buffer_clears: [u32; NUM_PIPES],
    pub pipes: [Option<PipeConfig>; NUM_PIPES],
    pub ports: [SimPort; 3],
    /// Packets sent by the host, waiting to be read.
    pub out_packets: [VecDeque<Vec<u8>>; NUM_PIPES],
    /// Packets committed for transmission to the host.
    pub in_packets: [VecDeque<Vec<u8>>; NUM_PIPES],
    /// Every FIFO data register access, in order.
    pub accesses: Vec<(Fifo, AccessWidth)>,
    pub selects: u32,
    pub delay_us: u64,
    /// Polls before a port selection becomes visible.
    pub bind_lag: u32,
    /// When set, port selections never take effect.
    pub bind_fail: bool,
}

impl Default for SimHardware {
    fn default() -> Self {
        Self {
            enabled: false,
            pullup: false,
            status: 0,
            status_script: VecDeque::new(),
            interrupt_enable: 0,
            event_status: [0; 3],
            event_enable: [0; 3],
            setup: [0; 4],
            control_complete: 0,
            control_max_packet_size: 0,
            pids: [Pid::Nak; NUM_PIPES],
            pid_writes: Vec::new(),
            in_busy: [false; NUM_PIPES],
            toggle_clears: [0; NUM_PIPES],
            buffer_clears: [0; NUM_PIPES],
            pipes: [None; NUM_PIPES],
            ports: Default::default(),
            out_packets: Default::default(),
            in_packets: Default::default(),
            accesses: Vec::new(),
            selects: 0,
            delay_us: 0,
            bind_lag: 0,
            bind_fail: false,
        }
    }
}

fn event_index(event: PipeEvent) -> usize {
    match event {
        PipeEvent::Ready => 0,
        PipeEvent::NotReady => 1,
        PipeEvent::Empty => 2,
    }
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn access_size(&self, pipe: usize) -> usize {
        if pipe == CONTROL_PIPE {
            self.control_max_packet_size as usize
        } else {
            self.pipes
                .get(pipe)
                .copied()
                .flatten()
                .map_or(0, |c| c.access_size() as usize)
        }
    }

    fn raise(&mut self, event: PipeEvent, pipe: usize) {
        self.event_status[event_index(event)] |= 1 << pipe;
    }

    fn commit(&mut self, fifo: Fifo) {
        let port = &mut self.ports[fifo.index()];
        let pipe = port.selected;
        let packet = core::mem::take(&mut port.staging);
        self.in_packets[pipe].push_back(packet);
        self.in_busy[pipe] = true;
    }

    fn pop_out_packet(&mut self, fifo: Fifo) {
        let port = &mut self.ports[fifo.index()];
        port.read_pos = 0;
        let pipe = port.selected;
        self.out_packets[pipe].pop_front();
    }

    /// The host sends one OUT (or control write data) packet.
    pub fn host_out(&mut self, pipe: usize, data: &[u8]) {
        self.out_packets[pipe].push_back(data.to_vec());
        self.raise(PipeEvent::Ready, pipe);
    }

    /// The host collects one IN packet, freeing buffer space.
    pub fn host_in(&mut self, pipe: usize) -> Option<Vec<u8>> {
        let packet = self.in_packets[pipe].pop_front()?;
        self.raise(PipeEvent::Ready, pipe);
        if self.in_packets[pipe].is_empty() {
            self.in_busy[pipe] = false;
            self.raise(PipeEvent::Empty, pipe);
        }
        Some(packet)
    }

    /// The host token was NAKed (or stalled).
    pub fn host_not_ready(&mut self, pipe: usize) {
        self.raise(PipeEvent::NotReady, pipe);
    }

    /// Latch a SETUP packet and flag it valid.
    pub fn host_setup(&mut self, packet: [u8; 8]) {
        self.setup = bytemuck::cast(packet);
        self.status |= intsts0::VALID | intsts0::CTRT;
    }

    pub fn set_bus_state(&mut self, dvsq: u16) {
        self.status = (self.status & !intsts0::DVSQ_MASK)
            | (dvsq << intsts0::DVSQ_SHIFT)
            | intsts0::DVST;
    }

    pub fn set_vbus(&mut self, high: bool) {
        if high {
            self.status |= intsts0::VBSTS;
        } else {
            self.status &= !intsts0::VBSTS;
        }
        self.status |= intsts0::VBINT;
    }

    pub fn event_enabled(&self, event: PipeEvent, pipe: usize) -> bool {
        self.event_enable[event_index(event)] & (1 << pipe) != 0
    }

    /// All data committed on a pipe so far, concatenated.
    pub fn sent(&self, pipe: usize) -> Vec<u8> {
        self.in_packets[pipe].iter().flatten().copied().collect()
    }
}

impl Hardware for SimHardware {
    fn enable_controller(&mut self) {
        self.enabled = true;
        self.pullup = false;
    }

    fn set_pullup(&mut self, enabled: bool) {
        self.pullup = enabled;
    }

    fn status(&mut self) -> Status {
        Status(self.status_script.pop_front().unwrap_or(self.status))
    }

    fn clear_status(&mut self, bits: u16) {
        self.status &= !(bits & intsts0::CLEARABLE);
    }

    fn set_interrupt_enable(&mut self, bits: u16) {
        self.interrupt_enable = bits;
    }

    fn interrupt_enable(&self) -> u16 {
        self.interrupt_enable
    }

    fn pipe_events(&mut self) -> PipeEvents {
        PipeEvents {
            ready: self.event_status[0] & self.event_enable[0],
            not_ready: self.event_status[1] & self.event_enable[1],
            empty: self.event_status[2] & self.event_enable[2],
        }
    }

    fn clear_pipe_events(&mut self, event: PipeEvent, mask: u16) {
        self.event_status[event_index(event)] &= !mask;
    }

    fn set_pipe_event_enabled(&mut self, event: PipeEvent, pipe: usize, enabled: bool) {
        let reg = &mut self.event_enable[event_index(event)];
        if enabled {
            *reg |= 1 << pipe;
        } else {
            *reg &= !(1 << pipe);
        }
    }

    fn pipe_event_enabled(&self, event: PipeEvent, pipe: usize) -> bool {
        self.event_enabled(event, pipe)
    }

    fn setup_packet(&mut self) -> [u16; 4] {
        self.setup
    }

    fn set_control_complete(&mut self) {
        self.control_complete += 1;
    }

    fn set_control_max_packet_size(&mut self, max_packet_size: u16) {
        self.control_max_packet_size = max_packet_size;
    }

    fn pid(&self, pipe: usize) -> Pid {
        self.pids[pipe]
    }

    fn write_pid(&mut self, pipe: usize, pid: Pid) {
        self.pids[pipe] = pid;
        self.pid_writes.push((pipe, pid));
    }

    fn in_buffer_busy(&self, pipe: usize) -> bool {
        self.in_busy[pipe]
    }

    fn clear_toggle(&mut self, pipe: usize) {
        self.toggle_clears[pipe] += 1;
    }

    fn clear_pipe_buffer(&mut self, pipe: usize) {
        self.buffer_clears[pipe] += 1;
        self.out_packets[pipe].clear();
        self.in_packets[pipe].clear();
        self.in_busy[pipe] = false;
    }

    fn configure_pipe(&mut self, config: &PipeConfig) {
        self.pipes[config.pipe] = Some(*config);
    }

    fn unconfigure_pipe(&mut self, pipe: usize) {
        self.pipes[pipe] = None;
    }

    fn select_fifo_pipe(&mut self, fifo: Fifo, pipe: usize, direction: FifoDirection) {
        self.selects += 1;
        let lag = self.bind_lag;
        let fail = self.bind_fail;
        let port = &mut self.ports[fifo.index()];
        port.staging.clear();
        port.read_pos = 0;
        port.direction = Some(direction);
        if fail {
            // The request is lost; the port keeps reporting its previous pipe.
            port.pending = None;
            port.selected = usize::MAX;
        } else if port.pending == Some(pipe) {
            // Still switching; asking again does not restart the handshake.
        } else if lag == 0 {
            port.pending = None;
            port.selected = pipe;
        } else {
            port.pending = Some(pipe);
            port.lag_left = lag;
        }
    }

    fn fifo_pipe(&self, fifo: Fifo) -> usize {
        self.ports[fifo.index()].selected
    }

    fn fifo_ready(&self, fifo: Fifo) -> bool {
        let port = &self.ports[fifo.index()];
        port.pending.is_none() && port.selected < NUM_PIPES
    }

    fn fifo_data_len(&self, fifo: Fifo) -> usize {
        let port = &self.ports[fifo.index()];
        self.out_packets
            .get(port.selected)
            .and_then(|q| q.front())
            .map_or(0, |p| p.len())
    }

    fn fifo_read(&mut self, fifo: Fifo, width: AccessWidth) -> u32 {
        self.accesses.push((fifo, width));
        let port = &self.ports[fifo.index()];
        let pos = port.read_pos;
        let Some(packet) = self.out_packets[port.selected].front() else {
            return 0;
        };
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().take(width.bytes()).enumerate() {
            *b = packet.get(pos + i).copied().unwrap_or(0);
        }
        let len = packet.len();
        let port = &mut self.ports[fifo.index()];
        port.read_pos += width.bytes();
        if port.read_pos >= len {
            // Reading the last byte releases the buffer.
            self.pop_out_packet(fifo);
        }
        u32::from_ne_bytes(bytes)
    }

    fn fifo_write(&mut self, fifo: Fifo, width: AccessWidth, value: u32) {
        self.accesses.push((fifo, width));
        let size = self.access_size(self.ports[fifo.index()].selected);
        let port = &mut self.ports[fifo.index()];
        port.staging
            .extend_from_slice(&value.to_ne_bytes()[..width.bytes()]);
        if port.staging.len() >= size {
            self.commit(fifo);
        }
    }

    fn fifo_commit(&mut self, fifo: Fifo) {
        self.commit(fifo);
    }

    fn fifo_clear(&mut self, fifo: Fifo) {
        let port = &mut self.ports[fifo.index()];
        if port.direction == Some(FifoDirection::Write) {
            port.staging.clear();
            let pipe = port.selected;
            if let Some(packets) = self.in_packets.get_mut(pipe) {
                packets.clear();
                self.in_busy[pipe] = false;
            }
        } else {
            self.pop_out_packet(fifo);
        }
    }

    fn delay_us(&mut self, us: u32) {
        self.delay_us += us as u64;
        for port in self.ports.iter_mut() {
            if let Some(pipe) = port.pending {
                port.lag_left = port.lag_left.saturating_sub(1);
                if port.lag_left == 0 {
                    port.pending = None;
                    port.selected = pipe;
                }
            }
        }
    }
}

//! Per-pipe interrupt dispatch for the data pipes.
//!
//! Each data pipe runs IDLE -> WAITING -> {DONE | STALL | NO_RESPONSE}.  Buffer-ready events
//! move data, buffer-empty events finish IN transfers once the last packet has left, and
//! buffer-not-ready events either latch a halt or retry a bounded number of times.

use crate::endpoint::PipeClass;
use crate::error::Error;
use crate::fmt::{debug, trace, warn};
use crate::hw::{Hardware, Pid, PipeEvent, PipeEvents, CONTROL_PIPE, NUM_PIPES};
use crate::state::{ClassHandler, DeviceState, Hal, PipeState, Transfer, TransferBuf};
use crate::transfer::{self, Outcome};

/// Consecutive not-ready events tolerated before a pipe is declared dead.
pub(crate) const MAX_NOT_READY: u8 = 3;

impl<'d, H: Hardware> Hal<'d, H> {
    /// Start a data transfer on the pipe serving `kind`.
    ///
    /// IN transfers write their first buffer immediately; OUT transfers wait for the host.
    pub(crate) fn start<C: ClassHandler>(
        &mut self,
        kind: PipeClass,
        buf: TransferBuf<'d>,
        len: usize,
        class: &mut C,
    ) -> Result<(), Error> {
        if self.state == DeviceState::Disconnected || self.configuration == 0 {
            return Err(Error::NotConnected);
        }
        let pipe = self
            .pipe_of(kind)
            .filter(|&pipe| pipe != CONTROL_PIPE)
            .ok_or(Error::InvalidConfig)?;
        let slot = self.handoff.slot(kind).ok_or(Error::InvalidConfig)?;
        if !slot.is_idle() || self.pipes[pipe].transfer.is_some() {
            return Err(Error::Busy);
        }
        match self.pipes[pipe].state {
            PipeState::Stall => return Err(Error::Stalled),
            PipeState::NoResponse => return Err(Error::NoResponse),
            _ => {}
        }
        slot.begin()?;

        let is_in = self.endpoints.get(pipe).map_or(false, |c| c.is_in());
        let zlp = kind == PipeClass::BulkIn && !self.config.bulk_in_no_short_packet;
        trace!("pipe {}: start {:?} of {} bytes", pipe, kind, len);
        let pipe_slot = &mut self.pipes[pipe];
        pipe_slot.transfer = Some(Transfer::new(buf, len, zlp));
        pipe_slot.state = PipeState::Waiting;
        pipe_slot.retries = 0;

        self.hw.set_pipe_event_enabled(PipeEvent::NotReady, pipe, true);
        self.set_pid(pipe, Pid::Buf);
        if is_in {
            // Buffer events left over from the previous transfer.
            self.hw.clear_pipe_events(PipeEvent::Ready, 1 << pipe);
            self.hw.clear_pipe_events(PipeEvent::Empty, 1 << pipe);
            self.service_write(pipe, class);
        } else {
            self.hw.set_pipe_event_enabled(PipeEvent::Ready, pipe, true);
        }
        Ok(())
    }

    /// Abandon the transfer on the pipe serving `kind` without reporting it anywhere.
    pub(crate) fn abort(&mut self, kind: PipeClass) {
        let Some(pipe) = self.pipe_of(kind).filter(|&pipe| pipe != CONTROL_PIPE) else {
            return;
        };
        if self.pipes[pipe].transfer.take().is_none() {
            return;
        }
        debug!("pipe {}: transfer aborted", pipe);
        if self.hw.pid(pipe) != Pid::Stall {
            self.set_pid(pipe, Pid::Nak);
        }
        self.hw.clear_pipe_buffer(pipe);
        self.disable_pipe_events(pipe);
        let slot = &mut self.pipes[pipe];
        slot.retries = 0;
        if slot.state == PipeState::Waiting {
            slot.state = PipeState::Idle;
        }
    }

    /// Handle the buffer events of pipes 1-9.
    pub(crate) fn dispatch_pipes<C: ClassHandler>(&mut self, events: PipeEvents, class: &mut C) {
        for pipe in 1..NUM_PIPES {
            let bit = 1 << pipe;
            if events.ready & bit != 0 {
                match self.endpoints.get(pipe).map(|c| c.is_in()) {
                    Some(true) => self.service_write(pipe, class),
                    Some(false) => self.service_read(pipe, class),
                    None => {
                        warn!("pipe {}: event on unconfigured pipe", pipe);
                        self.disable_pipe_events(pipe);
                    }
                }
            }
            if events.not_ready & bit != 0 {
                self.pipe_not_ready(pipe, class);
            }
            if events.empty & bit != 0 {
                self.pipe_empty(pipe, class);
            }
        }
    }

    /// Write the next buffer of the pipe's IN transfer.
    pub(crate) fn service_write<C: ClassHandler>(&mut self, pipe: usize, class: &mut C) {
        let Some(geometry) = self.geometry(pipe) else {
            return;
        };
        let Some(transfer) = self.pipes[pipe].transfer.as_mut() else {
            self.hw.set_pipe_event_enabled(PipeEvent::Ready, pipe, false);
            return;
        };
        // Safety: the buffer stays registered until the transfer is completed or aborted.
        let data = unsafe { transfer.buf.source(&self.control_buf) };
        let data = data.get(transfer.offset..transfer.len).unwrap_or(&[]);
        let access = transfer::write_access(&mut self.hw, &mut self.ports, &geometry, data);
        transfer.offset += access.bytes;

        let more = match access.outcome {
            Outcome::Continue => true,
            Outcome::End if transfer.zlp_pending => {
                transfer.zlp_pending = false;
                true
            }
            Outcome::End | Outcome::Short => false,
            Outcome::Overrun | Outcome::Error => {
                class.on_error(Error::FifoTimeout);
                self.set_pid(pipe, Pid::Nak);
                self.complete(pipe, Err(Error::FifoTimeout), class);
                return;
            }
        };
        self.pipes[pipe].retries = 0;
        if more {
            // Continue once the controller has room for the next buffer.
            self.hw.set_pipe_event_enabled(PipeEvent::Ready, pipe, true);
        } else {
            self.hw.set_pipe_event_enabled(PipeEvent::Ready, pipe, false);
            self.hw.set_pipe_event_enabled(PipeEvent::Empty, pipe, true);
        }
    }

    /// Read the next received buffer of the pipe's OUT transfer.
    pub(crate) fn service_read<C: ClassHandler>(&mut self, pipe: usize, class: &mut C) {
        let Some(geometry) = self.geometry(pipe) else {
            return;
        };
        let Some(transfer) = self.pipes[pipe].transfer.as_mut() else {
            // Leave the data in the buffer for the next transfer.
            self.hw.set_pipe_event_enabled(PipeEvent::Ready, pipe, false);
            return;
        };
        let (offset, len) = (transfer.offset, transfer.len);
        let remaining = transfer.remaining();
        // Safety: the buffer stays registered until the transfer is completed or aborted.
        let dst = unsafe { transfer.buf.sink(&mut self.control_buf) }
            .and_then(|buf| buf.get_mut(offset..len));
        let access =
            transfer::read_access(&mut self.hw, &mut self.ports, &geometry, remaining, dst);
        transfer.offset += access.bytes;
        let total = transfer.offset;
        self.pipes[pipe].retries = 0;

        match access.outcome {
            Outcome::Continue => {}
            Outcome::End | Outcome::Short => self.complete(pipe, Ok(total), class),
            Outcome::Overrun => {
                class.on_error(Error::Overrun);
                self.set_pid(pipe, Pid::Nak);
                self.complete(pipe, Err(Error::Overrun), class);
            }
            Outcome::Error => {
                class.on_error(Error::FifoTimeout);
                self.set_pid(pipe, Pid::Nak);
                self.complete(pipe, Err(Error::FifoTimeout), class);
            }
        }
    }

    fn pipe_not_ready<C: ClassHandler>(&mut self, pipe: usize, class: &mut C) {
        let in_flight = self.pipes[pipe].transfer.is_some();
        if self.hw.pid(pipe) == Pid::Stall {
            debug!("pipe {}: stalled", pipe);
            if in_flight {
                self.complete(pipe, Err(Error::Stalled), class);
            } else {
                self.pipes[pipe].state = PipeState::Stall;
            }
            return;
        }
        if !in_flight {
            return;
        }

        let slot = &mut self.pipes[pipe];
        slot.retries += 1;
        if slot.retries >= MAX_NOT_READY {
            warn!("pipe {}: no response after {} attempts", pipe, slot.retries);
            self.set_pid(pipe, Pid::Nak);
            self.complete(pipe, Err(Error::NoResponse), class);
        } else {
            trace!("pipe {}: not ready, retry {}", pipe, slot.retries);
            self.hw.write_pid(pipe, Pid::Buf);
        }
    }

    fn pipe_empty<C: ClassHandler>(&mut self, pipe: usize, class: &mut C) {
        let Some(len) = self.pipes[pipe].transfer.as_ref().map(|t| t.len) else {
            self.hw.set_pipe_event_enabled(PipeEvent::Empty, pipe, false);
            return;
        };
        if self.hw.pid(pipe) == Pid::Stall {
            debug!("pipe {}: stalled", pipe);
            self.complete(pipe, Err(Error::Stalled), class);
        } else if !self.hw.in_buffer_busy(pipe) {
            self.complete(pipe, Ok(len), class);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::endpoint::PipeClass;
    use crate::error::Error;
    use crate::handoff::Handoff;
    use crate::hw::{Pid, PipeEvent};
    use crate::state::tests::{configured, TestChannel};
    use crate::state::{PipeState, TransferBuf};
    use crate::Config;
    use core::task::Context;
    use futures::task::noop_waker;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| i as u8).collect()
    }

    fn start(
        channel: &mut TestChannel<'_>,
        kind: PipeClass,
        buf: TransferBuf<'static>,
        len: usize,
    ) -> Result<(), Error> {
        // Stand in for the task collecting the previous result.
        let waker = noop_waker();
        let _ = channel
            .handoff()
            .slot(kind)
            .unwrap()
            .poll_done(&mut Context::from_waker(&waker));
        let crate::Channel { hal, class } = channel;
        hal.start(kind, buf, len, class)
    }

    static DATA_1000: [u8; 1000] = {
        let mut data = [0u8; 1000];
        let mut i = 0;
        while i < data.len() {
            data[i] = i as u8;
            i += 1;
        }
        data
    };

    #[test]
    fn bulk_in_thousand_bytes() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());

        start(
            &mut channel,
            PipeClass::BulkIn,
            TransferBuf::Static(&DATA_1000),
            1000,
        )
        .unwrap();
        // First buffer written right away.
        assert_eq!(channel.hal.hw.in_packets[2].len(), 1);
        assert_eq!(channel.hal.hw.pids[2], Pid::Buf);

        let first = channel.hw_mut().host_in(2).unwrap();
        assert_eq!(first.len(), 512);
        channel.on_interrupt();
        let second = channel.hw_mut().host_in(2).unwrap();
        assert_eq!(second.len(), 488);
        assert!(channel.class().bulk_in.is_empty());
        channel.on_interrupt();

        assert_eq!(channel.class().bulk_in, [Ok(())]);
        assert_eq!([first, second].concat(), pattern(1000));
        assert_eq!(channel.hal.pipes[2].state, PipeState::Done);
        assert!(channel.hal.hw.in_packets[2].is_empty());
        assert!(!channel.hal.hw.event_enabled(PipeEvent::Empty, 2));
    }

    #[test]
    fn bulk_in_full_packets_end_with_zero_length_packet() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());

        start(
            &mut channel,
            PipeClass::BulkIn,
            TransferBuf::Static(&DATA_1000[..512]),
            512,
        )
        .unwrap();
        assert_eq!(channel.hw_mut().host_in(2).unwrap().len(), 512);
        channel.on_interrupt();
        assert_eq!(channel.hw_mut().host_in(2).unwrap().len(), 0);
        channel.on_interrupt();
        assert_eq!(channel.class().bulk_in, [Ok(())]);

        // Without short packet termination the transfer ends with the data.
        let handoff = Handoff::new();
        let config = Config {
            bulk_in_no_short_packet: true,
            ..Config::default()
        };
        let mut channel = configured(&handoff, config);
        start(
            &mut channel,
            PipeClass::BulkIn,
            TransferBuf::Static(&DATA_1000[..512]),
            512,
        )
        .unwrap();
        channel.hw_mut().host_in(2).unwrap();
        channel.on_interrupt();
        assert_eq!(channel.class().bulk_in, [Ok(())]);
        assert!(channel.hal.hw.in_packets[2].is_empty());
    }

    #[test]
    fn interrupt_in_never_appends_zero_length_packet() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());

        start(
            &mut channel,
            PipeClass::InterruptIn,
            TransferBuf::Static(&DATA_1000[..8]),
            8,
        )
        .unwrap();
        assert_eq!(channel.hw_mut().host_in(6).unwrap().len(), 8);
        channel.on_interrupt();
        assert_eq!(channel.class().interrupt_in, [Ok(())]);
        assert!(channel.hal.hw.in_packets[6].is_empty());
    }

    #[test]
    fn interrupt_in_is_split_into_max_size_packets() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());

        start(
            &mut channel,
            PipeClass::InterruptIn,
            TransferBuf::Static(&DATA_1000[..20]),
            20,
        )
        .unwrap();
        let mut packets = Vec::new();
        while let Some(packet) = channel.hw_mut().host_in(6) {
            packets.push(packet);
            channel.on_interrupt();
        }
        assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), [8, 8, 4]);
        assert_eq!(packets.concat(), pattern(20));
        assert_eq!(channel.class().interrupt_in, [Ok(())]);
        assert_eq!(channel.hal.pipes[6].state, PipeState::Done);
    }

    #[test]
    fn three_not_ready_events_latch_no_response() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64).unwrap();

        for _ in 0..2 {
            channel.hw_mut().host_not_ready(1);
            channel.on_interrupt();
            assert_eq!(channel.hal.pipes[1].state, PipeState::Waiting);
            assert_eq!(channel.hal.hw.pids[1], Pid::Buf);
        }
        channel.hw_mut().host_not_ready(1);
        channel.on_interrupt();
        assert_eq!(channel.hal.pipes[1].state, PipeState::NoResponse);
        assert_eq!(channel.class().bulk_out, [Err(Error::NoResponse)]);

        // Dead until reset.
        assert_eq!(
            start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64),
            Err(Error::NoResponse)
        );
        channel.reset();
        assert_eq!(
            start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64),
            Ok(())
        );
    }

    #[test]
    fn progress_resets_retry_counter() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 1024).unwrap();

        for _ in 0..2 {
            channel.hw_mut().host_not_ready(1);
            channel.on_interrupt();
        }
        channel.hw_mut().host_out(1, &[0; 512]);
        channel.on_interrupt();
        assert_eq!(channel.hal.pipes[1].retries, 0);
        for _ in 0..2 {
            channel.hw_mut().host_not_ready(1);
            channel.on_interrupt();
        }
        assert_eq!(channel.hal.pipes[1].state, PipeState::Waiting);
    }

    #[test]
    fn stall_is_latched_until_cleared() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64).unwrap();

        channel.hal.hw.pids[1] = Pid::Stall;
        channel.hw_mut().host_not_ready(1);
        channel.on_interrupt();
        assert_eq!(channel.class().bulk_out, [Err(Error::Stalled)]);
        assert_eq!(
            start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64),
            Err(Error::Stalled)
        );

        channel.hal.clear_halt(1);
        assert_eq!(channel.hal.hw.pids[1], Pid::Buf);
        assert_eq!(
            start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64),
            Ok(())
        );
    }

    #[test]
    fn stall_seen_on_buffer_empty_is_latched() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(
            &mut channel,
            PipeClass::BulkIn,
            TransferBuf::Static(&DATA_1000),
            100,
        )
        .unwrap();

        channel.hal.hw.pids[2] = Pid::Stall;
        channel.hw_mut().host_in(2).unwrap();
        channel.on_interrupt();
        assert_eq!(channel.class().bulk_in, [Err(Error::Stalled)]);
        assert_eq!(channel.hal.pipes[2].state, PipeState::Stall);
        assert!(channel.hal.pipes[2].transfer.is_none());
        assert_eq!(
            start(
                &mut channel,
                PipeClass::BulkIn,
                TransferBuf::Static(&DATA_1000),
                100
            ),
            Err(Error::Stalled)
        );
    }

    #[test]
    fn overrun_is_reported() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 10).unwrap();

        channel.hw_mut().host_out(1, &[1; 64]);
        channel.on_interrupt();
        assert_eq!(channel.class().errors, [Error::Overrun]);
        assert_eq!(channel.class().bulk_out, [Err(Error::Overrun)]);
        assert_eq!(channel.hal.pipes[1].state, PipeState::Idle);
        assert!(channel.hal.hw.out_packets[1].is_empty());
    }

    #[test]
    fn second_start_is_busy() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64).unwrap();
        assert_eq!(
            start(&mut channel, PipeClass::BulkOut, TransferBuf::Discard, 64),
            Err(Error::Busy)
        );
    }

    #[test]
    fn unconfigured_device_is_not_connected() {
        let handoff = Handoff::new();
        let mut channel = crate::state::tests::channel(&handoff, Config::default());
        let before = channel.hal.hw.clone();
        assert_eq!(
            start(&mut channel, PipeClass::BulkIn, TransferBuf::Static(&DATA_1000), 10),
            Err(Error::NotConnected)
        );
        assert_eq!(channel.hal.hw, before);
    }

    #[test]
    fn bind_failure_fails_transfer() {
        let handoff = Handoff::new();
        let mut channel = configured(&handoff, Config::default());
        channel.hal.hw.bind_fail = true;

        start(
            &mut channel,
            PipeClass::BulkIn,
            TransferBuf::Static(&DATA_1000),
            100,
        )
        .unwrap();
        assert_eq!(channel.class().errors, [Error::FifoTimeout]);
        assert_eq!(channel.class().bulk_in, [Err(Error::FifoTimeout)]);
        assert_eq!(channel.hal.pipes[2].state, PipeState::Idle);
    }
}

//! Data and status stages on the control pipe.
//!
//! Pipe 0 is served through the C port.  IN data stages are paced by the pipe's buffer-empty
//! event, OUT data stages by its buffer-ready event.  Setting BUF together with CCPL lets the
//! controller run the status stage on its own.

use crate::error::Error;
use crate::fmt::{debug, trace, warn};
use crate::hw::{Fifo, FifoDirection, Hardware, Pid, PipeEvent, PipeEvents, CONTROL_PIPE};
use crate::state::{
    Channel, ClassHandler, DeviceState, Hal, Transfer, TransferBuf, CONTROL_BUF_SIZE,
};
use crate::transfer::{self, Outcome};

impl<'d, H: Hardware> Hal<'d, H> {
    /// Finish a request without a data stage.
    pub(crate) fn control_ack(&mut self) -> Result<(), Error> {
        if self.state != DeviceState::ControlSetup {
            return Err(Error::State);
        }
        trace!("control: ack");
        self.finish_status_stage();
        Ok(())
    }

    /// Send `len` bytes of `buf` as the IN data stage, truncated to the request's length.
    pub(crate) fn control_in<C: ClassHandler>(
        &mut self,
        buf: TransferBuf<'d>,
        len: usize,
        class: &mut C,
    ) -> Result<(), Error> {
        if self.state != DeviceState::ControlSetup {
            return Err(Error::State);
        }
        let requested = self.setup.length as usize;
        let len = len.min(requested);
        let mps = self.config.control_max_packet_size as usize;
        // The host stops on a short packet, so a reply that ends on a packet boundary before
        // wLength needs an explicit zero-length packet.
        let zlp = len > 0 && len < requested && len % mps == 0;

        if let Err(err) = self
            .ports
            .bind(&mut self.hw, Fifo::C, CONTROL_PIPE, FifoDirection::Write)
        {
            warn!("control: C FIFO bind failed");
            self.stall_control();
            return Err(err);
        }
        self.hw.fifo_clear(Fifo::C);
        self.hw.clear_pipe_events(PipeEvent::Empty, 1 << CONTROL_PIPE);

        trace!("control: IN {} of {} bytes", len, requested);
        self.pipes[CONTROL_PIPE].transfer = Some(Transfer::new(buf, len, zlp));
        self.state = DeviceState::ControlIn;
        self.continue_control_in(class);
        Ok(())
    }

    /// Arm the control pipe for an OUT data stage of `len` bytes.
    pub(crate) fn control_out(&mut self, len: usize) -> Result<(), Error> {
        if self.state != DeviceState::ControlSetup {
            return Err(Error::State);
        }
        if len > CONTROL_BUF_SIZE {
            warn!("control: OUT data stage of {} bytes does not fit", len);
            self.stall_control();
            return Err(Error::Overrun);
        }

        trace!("control: OUT {} bytes", len);
        self.pipes[CONTROL_PIPE].transfer = Some(Transfer::new(TransferBuf::Control, len, false));
        self.state = DeviceState::ControlOut;
        // The host is held off with NAK until BUF is set, so nothing has arrived yet.
        self.hw.clear_pipe_events(PipeEvent::Ready, 1 << CONTROL_PIPE);
        self.hw
            .set_pipe_event_enabled(PipeEvent::Ready, CONTROL_PIPE, true);
        self.set_pid(CONTROL_PIPE, Pid::Buf);
        Ok(())
    }

    /// Reject the current control request.  The controller clears the stall on the next
    /// SETUP.
    pub(crate) fn stall_control(&mut self) {
        debug!("control: stall");
        self.set_pid(CONTROL_PIPE, Pid::Stall);
        self.pipes[CONTROL_PIPE].transfer = None;
        self.disable_pipe_events(CONTROL_PIPE);
        if self.state != DeviceState::Disconnected {
            self.state = DeviceState::Ready;
        }
    }

    /// Handle the buffer events of the control pipe.
    pub(crate) fn control_pipe_events<C: ClassHandler>(
        &mut self,
        events: PipeEvents,
        class: &mut C,
    ) {
        let bit = 1 << CONTROL_PIPE;
        if events.empty & bit != 0 {
            if self.state == DeviceState::ControlIn {
                self.continue_control_in(class);
            } else {
                self.hw
                    .set_pipe_event_enabled(PipeEvent::Empty, CONTROL_PIPE, false);
            }
        }
        if events.not_ready & bit != 0 && self.hw.pid(CONTROL_PIPE) == Pid::Stall {
            debug!("control: host saw the stall");
        }
        if events.ready & bit != 0 {
            if self.state == DeviceState::ControlOut {
                self.continue_control_out(class);
            } else {
                self.hw
                    .set_pipe_event_enabled(PipeEvent::Ready, CONTROL_PIPE, false);
            }
        }
    }

    fn finish_status_stage(&mut self) {
        self.pipes[CONTROL_PIPE].transfer = None;
        self.disable_pipe_events(CONTROL_PIPE);
        self.set_pid(CONTROL_PIPE, Pid::Buf);
        self.hw.set_control_complete();
        self.state = DeviceState::Ready;
    }

    fn continue_control_in<C: ClassHandler>(&mut self, class: &mut C) {
        if self.hw.in_buffer_busy(CONTROL_PIPE) {
            // The previous packet has not left yet.
            return;
        }
        let Some(geometry) = self.geometry(CONTROL_PIPE) else {
            return;
        };
        let Some(transfer) = self.pipes[CONTROL_PIPE].transfer.as_mut() else {
            self.hw
                .set_pipe_event_enabled(PipeEvent::Empty, CONTROL_PIPE, false);
            return;
        };
        // Safety: control transfers only use the control buffer or borrowed-for-'d tables.
        let data = unsafe { transfer.buf.source(&self.control_buf) };
        let data = data.get(transfer.offset..transfer.len).unwrap_or(&[]);
        let access = transfer::write_access(&mut self.hw, &mut self.ports, &geometry, data);
        transfer.offset += access.bytes;

        match access.outcome {
            Outcome::Continue => {}
            Outcome::End if transfer.zlp_pending => transfer.zlp_pending = false,
            Outcome::End | Outcome::Short => {
                self.finish_status_stage();
                return;
            }
            Outcome::Overrun | Outcome::Error => {
                self.stall_control();
                class.on_error(Error::FifoTimeout);
                return;
            }
        }
        self.hw
            .set_pipe_event_enabled(PipeEvent::Empty, CONTROL_PIPE, true);
        self.set_pid(CONTROL_PIPE, Pid::Buf);
    }

    fn continue_control_out<C: ClassHandler>(&mut self, class: &mut C) {
        let Some(geometry) = self.geometry(CONTROL_PIPE) else {
            return;
        };
        let Some(transfer) = self.pipes[CONTROL_PIPE].transfer.as_mut() else {
            self.hw
                .set_pipe_event_enabled(PipeEvent::Ready, CONTROL_PIPE, false);
            return;
        };
        let (offset, len) = (transfer.offset, transfer.len);
        let remaining = transfer.remaining();
        // Safety: control OUT transfers always land in the control buffer.
        let dst = unsafe { transfer.buf.sink(&mut self.control_buf) }
            .and_then(|buf| buf.get_mut(offset..len));
        let access =
            transfer::read_access(&mut self.hw, &mut self.ports, &geometry, remaining, dst);
        transfer.offset += access.bytes;
        let received = transfer.offset;

        match access.outcome {
            Outcome::Continue => {}
            Outcome::End | Outcome::Short => {
                self.finish_status_stage();
                class.on_control_out_done(Ok(&self.control_buf[..received]));
            }
            Outcome::Overrun => {
                self.stall_control();
                class.on_error(Error::Overrun);
                class.on_control_out_done(Err(Error::Overrun));
            }
            Outcome::Error => {
                self.stall_control();
                class.on_error(Error::FifoTimeout);
                class.on_control_out_done(Err(Error::FifoTimeout));
            }
        }
    }
}

impl<'d, H: Hardware, C: ClassHandler> Channel<'d, H, C> {
    /// Finish a deferred request without a data stage.
    pub fn control_ack(&mut self) -> Result<(), Error> {
        self.hal.control_ack()
    }

    /// Answer a deferred IN request with `data`, truncated to the request's length.
    pub fn control_in(&mut self, data: &'d [u8]) -> Result<(), Error> {
        let Self { hal, class } = self;
        hal.control_in(TransferBuf::Static(data), data.len(), class)
    }

    /// Receive the OUT data stage of a deferred request.  The data is delivered to
    /// [`ClassHandler::on_control_out_done`].
    pub fn control_out(&mut self, len: usize) -> Result<(), Error> {
        self.hal.control_out(len)
    }
}

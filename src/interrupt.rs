use crate::fmt::{debug, trace, warn};
use crate::hw::{intsts0, ControlStage, Hardware, PipeEvent, Status, CONTROL_PIPE};
use crate::state::{Channel, ClassHandler, Hal};

/// Reads of the interrupt status register allowed while waiting for it to settle.
const STATUS_READS: usize = 4;

/// Latched status bits acknowledged at the start of every pass.
const ACKNOWLEDGED: u16 = intsts0::VBINT | intsts0::RESM | intsts0::DVST | intsts0::CTRT;

impl<'d, H: Hardware, C: ClassHandler> Channel<'d, H, C> {
    /// The USB interrupt handler.
    ///
    /// Runs one complete pass over every pending event.  Class callbacks are invoked from
    /// inside this call.
    pub fn on_interrupt(&mut self) {
        let Self { hal, class } = self;
        hal.on_interrupt(class);
    }
}

impl<'d, H: Hardware> Hal<'d, H> {
    fn on_interrupt<C: ClassHandler>(&mut self, class: &mut C) {
        let status = self.status_snapshot();
        let pending = status.0 & self.hw.interrupt_enable();
        trace!("USB interrupt: status {:#x}", status.0);
        self.hw.clear_status(status.0 & ACKNOWLEDGED);

        let events = self.hw.pipe_events();
        for (event, mask) in [
            (PipeEvent::Ready, events.ready),
            (PipeEvent::NotReady, events.not_ready),
            (PipeEvent::Empty, events.empty),
        ] {
            if mask != 0 {
                self.hw.clear_pipe_events(event, mask);
            }
        }
        if !events.is_empty() {
            let control = 1 << CONTROL_PIPE;
            if (events.ready | events.not_ready | events.empty) & control != 0 {
                self.control_pipe_events(events, class);
            }
            self.dispatch_pipes(events, class);
        }

        if pending & intsts0::DVST != 0 {
            self.device_state_change(status, class);
        }

        if status.has(intsts0::VALID) {
            self.hw.clear_status(intsts0::VALID);
            self.handle_setup(class);
        } else if pending & intsts0::CTRT != 0
            && status.control_stage() == ControlStage::SequenceError
        {
            warn!("control transfer sequence error");
            self.stall_control();
        }

        if pending & intsts0::RESM != 0 {
            debug!("resume");
        }
        if pending & intsts0::VBINT != 0 {
            self.vbus_change(class);
        }
    }

    /// Read the interrupt status until two consecutive reads agree.
    fn status_snapshot(&mut self) -> Status {
        let mut status = self.hw.status();
        for _ in 1..STATUS_READS {
            let next = self.hw.status();
            if next == status {
                break;
            }
            status = next;
        }
        status
    }
}

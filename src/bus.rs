//! Bus-level events: VBUS, bus reset and device state changes.

use crate::endpoint::{EndpointTable, PipeClass};
use crate::fmt::{debug, error, info, trace};
use crate::hw::{BusState, Fifo, FifoDirection, Hardware, Status, CONTROL_PIPE};
use crate::state::{ClassHandler, DeviceState, Hal};

/// Status reads that must agree before a VBUS level is believed.
const VBUS_DEBOUNCE_READS: usize = 3;

impl<'d, H: Hardware> Hal<'d, H> {
    /// The VBUS level, or `None` while it is still bouncing.
    pub(crate) fn vbus_debounced(&mut self) -> Option<bool> {
        let first = self.hw.status().vbus();
        for _ in 1..VBUS_DEBOUNCE_READS {
            if self.hw.status().vbus() != first {
                return None;
            }
        }
        Some(first)
    }

    pub(crate) fn vbus_change<C: ClassHandler>(&mut self, class: &mut C) {
        match self.vbus_debounced() {
            Some(true) if !self.attached => self.attach(class),
            Some(false) if self.attached || self.state != DeviceState::Disconnected => {
                self.detach(class)
            }
            Some(_) => trace!("VBUS unchanged"),
            // Another VBUS interrupt follows once the level settles.
            None => debug!("VBUS bouncing"),
        }
    }

    /// Connect to the bus.  The device stays disconnected until the host resets the bus.
    pub(crate) fn attach<C: ClassHandler>(&mut self, class: &mut C) {
        info!("attaching to the bus");
        self.hw.set_pullup(true);
        self.attached = true;
        self.bind_control_port(class);
    }

    /// VBUS was lost: stop everything and tell the class layer.
    pub(crate) fn detach<C: ClassHandler>(&mut self, class: &mut C) {
        info!("detached from the bus");
        self.hw.set_pullup(false);
        self.attached = false;
        self.cancel();
        self.reset_endpoints(&EndpointTable::default());
        self.configuration = 0;
        self.state = DeviceState::Disconnected;
        if self.connected {
            self.connected = false;
            class.on_cable_change(false);
        }
    }

    pub(crate) fn bus_reset<C: ClassHandler>(&mut self, class: &mut C) {
        debug!("bus reset");
        self.reset();
        self.hw
            .set_control_max_packet_size(self.config.control_max_packet_size);
        self.set_configuration(0);
        self.bind_control_port(class);
        self.state = DeviceState::Ready;
    }

    pub(crate) fn device_state_change<C: ClassHandler>(&mut self, status: Status, class: &mut C) {
        if !self.attached {
            trace!("bus state change while detached");
            return;
        }
        match status.bus_state() {
            BusState::Default => self.bus_reset(class),
            BusState::Configured => {
                if !self.connected {
                    self.connected = true;
                    class.on_cable_change(true);
                }
                for kind in [PipeClass::BulkOut, PipeClass::BulkIn] {
                    if let Some(pipe) = self.pipe_of(kind) {
                        self.hw.clear_toggle(pipe);
                    }
                }
            }
            state => debug!("bus state {:?}", state),
        }
    }

    fn bind_control_port<C: ClassHandler>(&mut self, class: &mut C) {
        if let Err(err) =
            self.ports
                .bind_admin(&mut self.hw, Fifo::C, CONTROL_PIPE, FifoDirection::Read)
        {
            error!("control pipe could not reclaim its FIFO port");
            class.on_error(err);
        }
    }
}

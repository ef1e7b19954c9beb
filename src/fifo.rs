//! FIFO port binding.
//!
//! Each of the three FIFO ports exposes the buffer of exactly one pipe at a time.  Switching a
//! port to another pipe is not instantaneous: the controller has to finish any access in
//! progress before the new selection reads back, so every bind is a polled handshake.

use crate::error::Error;
use crate::fmt::{trace, warn};
use crate::hw::{Fifo, FifoDirection, Hardware};

/// Confirmation polls per bind attempt.
pub(crate) const BIND_POLLS: u32 = 20;
const BIND_POLL_DELAY_US: u32 = 1;
/// Delay after a confirmed bind before the buffer is touched.
const BIND_SETTLE_US: u32 = 1;
/// Full bind attempts made by [`FifoPorts::bind_admin`] before giving up.
pub(crate) const ADMIN_BIND_ATTEMPTS: u32 = 8;

/// Current owner of each FIFO port.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct FifoPorts {
    owner: [Option<usize>; 3],
}

impl FifoPorts {
    pub(crate) const fn new() -> Self {
        Self { owner: [None; 3] }
    }

    #[cfg(test)]
    pub(crate) fn owner(&self, fifo: Fifo) -> Option<usize> {
        self.owner[fifo.index()]
    }

    /// Forget all owners, e.g. after the controller's buffers were cleared.
    pub(crate) fn release_all(&mut self) {
        self.owner = [None; 3];
    }

    /// Bind `pipe` to `fifo`, revoking the previous owner.
    ///
    /// The port is re-selected even when `pipe` already owns it, since the C port direction may
    /// need to change.
    pub(crate) fn bind<H: Hardware>(
        &mut self,
        hw: &mut H,
        fifo: Fifo,
        pipe: usize,
        direction: FifoDirection,
    ) -> Result<(), Error> {
        match self.owner[fifo.index()] {
            Some(prev) if prev != pipe => {
                trace!("{:?} FIFO: pipe {} revoked by pipe {}", fifo, prev, pipe);
            }
            _ => {}
        }

        hw.select_fifo_pipe(fifo, pipe, direction);
        for _ in 0..BIND_POLLS {
            if hw.fifo_pipe(fifo) == pipe && hw.fifo_ready(fifo) {
                hw.delay_us(BIND_SETTLE_US);
                self.owner[fifo.index()] = Some(pipe);
                return Ok(());
            }
            hw.delay_us(BIND_POLL_DELAY_US);
        }

        // The port is in an unknown state now; nobody owns it.
        self.owner[fifo.index()] = None;
        Err(Error::FifoTimeout)
    }

    /// Bind used on the bus reset and attach paths, where the control pipe must get its port
    /// back.  Retries the full handshake a bounded number of times.
    pub(crate) fn bind_admin<H: Hardware>(
        &mut self,
        hw: &mut H,
        fifo: Fifo,
        pipe: usize,
        direction: FifoDirection,
    ) -> Result<(), Error> {
        for attempt in 0..ADMIN_BIND_ATTEMPTS {
            match self.bind(hw, fifo, pipe, direction) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    warn!(
                        "{:?} FIFO: bind of pipe {} timed out (attempt {})",
                        fifo,
                        pipe,
                        attempt + 1
                    );
                }
            }
        }
        Err(Error::FifoStuck)
    }
}

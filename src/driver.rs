use crate::endpoint::PipeClass;
use crate::error::Error;
use crate::fmt::trace;
use crate::handoff::{Completion, Handoff};
use crate::hw::Hardware;
use crate::state::{Channel, ClassHandler, TransferBuf};
use core::cell::RefCell;
use core::future::poll_fn;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// A channel shared between the interrupt handler and tasks.
pub type SharedChannel<'d, H, C> = Mutex<CriticalSectionRawMutex, RefCell<Channel<'d, H, C>>>;

/// Task-side handle to a shared [`Channel`].
///
/// Bulk and interrupt transfers are started under the channel lock and then awaited without
/// it; the interrupt handler publishes their results through the channel's [`Handoff`].
///
/// None of these methods may be called from [`ClassHandler`] callbacks, which already run
/// with the channel locked.
pub struct Driver<'d, H: Hardware, C: ClassHandler> {
    channel: &'d SharedChannel<'d, H, C>,
    handoff: &'d Handoff,
}

impl<'d, H: Hardware, C: ClassHandler> Clone for Driver<'d, H, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'d, H: Hardware, C: ClassHandler> Copy for Driver<'d, H, C> {}

impl<'d, H: Hardware, C: ClassHandler> Driver<'d, H, C> {
    pub fn new(channel: &'d SharedChannel<'d, H, C>) -> Self {
        let handoff = channel.lock(|channel| channel.borrow().handoff());
        Self { channel, handoff }
    }

    /// Run `f` with the channel locked.
    pub fn with_channel<R>(&self, f: impl FnOnce(&mut Channel<'d, H, C>) -> R) -> R {
        self.channel.lock(|channel| f(&mut channel.borrow_mut()))
    }

    pub fn init(&self) {
        self.with_channel(|channel| channel.init())
    }

    /// Call from the USB interrupt handler.
    pub fn on_interrupt(&self) {
        self.with_channel(|channel| channel.on_interrupt())
    }

    /// Receive one bulk OUT transfer into `buf`.
    ///
    /// Completes on a short packet or once `buf` is full, returning the number of bytes
    /// received.
    pub async fn bulk_out(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = buf.len();
        self.start(PipeClass::BulkOut, TransferBuf::read(buf), len)?
            .wait()
            .await
    }

    /// Receive and drop a bulk OUT transfer of up to `len` bytes.
    pub async fn discard_bulk_out(&self, len: usize) -> Result<usize, Error> {
        self.start(PipeClass::BulkOut, TransferBuf::Discard, len)?
            .wait()
            .await
    }

    /// Send `data` on the bulk IN pipe.
    pub async fn bulk_in(&self, data: &[u8]) -> Result<(), Error> {
        self.start(PipeClass::BulkIn, TransferBuf::write(data), data.len())?
            .wait()
            .await
            .map(|_| ())
    }

    /// Send `data` on the interrupt IN pipe.
    pub async fn interrupt_in(&self, data: &[u8]) -> Result<(), Error> {
        self.start(PipeClass::InterruptIn, TransferBuf::write(data), data.len())?
            .wait()
            .await
            .map(|_| ())
    }

    /// True while a transfer on the pipe serving `class` is in flight.
    pub fn pending(&self, class: PipeClass) -> bool {
        self.handoff.slot(class).map_or(false, Completion::is_busy)
    }

    pub fn stall(&self, class: PipeClass) -> Result<(), Error> {
        self.with_channel(|channel| channel.stall(class))
    }

    pub fn device_state(&self) -> u8 {
        self.with_channel(|channel| channel.device_state())
    }

    pub fn is_endpoint_stalled(&self, pipe: usize) -> bool {
        self.with_channel(|channel| channel.is_endpoint_stalled(pipe))
    }

    pub fn cancel(&self) {
        self.with_channel(|channel| channel.cancel())
    }

    pub fn reset(&self) {
        self.with_channel(|channel| channel.reset())
    }

    pub fn reset_endpoints(&self, words: &[u16]) -> Result<(), Error> {
        self.with_channel(|channel| channel.reset_endpoints(words))
    }

    fn start(
        &self,
        kind: PipeClass,
        buf: TransferBuf<'d>,
        len: usize,
    ) -> Result<TransferOperation<'_, 'd, H, C>, Error> {
        let slot = self.handoff.slot(kind).ok_or(Error::InvalidConfig)?;
        self.with_channel(|channel| {
            let Channel { hal, class } = channel;
            hal.start(kind, buf, len, class)
        })?;
        Ok(TransferOperation {
            driver: self,
            kind,
            slot,
            finished: false,
        })
    }
}

/// An in-flight transfer.  Dropping it before completion aborts the transfer, so the
/// controller never touches the caller's buffer after the borrow ends.
struct TransferOperation<'a, 'd, H: Hardware, C: ClassHandler> {
    driver: &'a Driver<'d, H, C>,
    kind: PipeClass,
    slot: &'d Completion,
    finished: bool,
}

impl<'a, 'd, H: Hardware, C: ClassHandler> TransferOperation<'a, 'd, H, C> {
    async fn wait(mut self) -> Result<usize, Error> {
        let slot = self.slot;
        let result = poll_fn(|cx| slot.poll_done(cx)).await;
        self.finished = true;
        result
    }
}

impl<'a, 'd, H: Hardware, C: ClassHandler> Drop for TransferOperation<'a, 'd, H, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        trace!("{:?} transfer dropped before completion", self.kind);
        let (kind, slot) = (self.kind, self.slot);
        self.driver.with_channel(|channel| {
            channel.hal.abort(kind);
            slot.abandon();
        });
    }
}

//! Completion handoff between the interrupt handler and task-context callers.
//!
//! Each task-visible transfer class has one [`Completion`] slot.  The slot's state moves
//! IDLE -> BUSY when a task starts a transfer, BUSY -> DONE when the interrupt handler finishes
//! it, and DONE -> IDLE when the task collects the result.  The result fields are written before
//! the release store of DONE, and read after the matching acquire load, so the task always sees
//! the result that belongs to the completion it observed.

use crate::endpoint::PipeClass;
use crate::error::Error;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use core::task::{Context, Poll};
use embassy_sync::waitqueue::AtomicWaker;

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const DONE: u8 = 2;

/// A single-producer single-consumer completion slot.
pub struct Completion {
    state: AtomicU8,
    error: AtomicU8,
    len: AtomicUsize,
    waker: AtomicWaker,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            error: AtomicU8::new(0),
            len: AtomicUsize::new(0),
            waker: AtomicWaker::new(),
        }
    }

    /// True while a transfer is in flight.
    pub fn is_busy(&self) -> bool {
        self.state.load(Ordering::Acquire) == BUSY
    }

    /// True when the slot can take a new transfer.
    pub(crate) fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == IDLE
    }

    pub(crate) fn begin(&self) -> Result<(), Error> {
        self.state
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    /// Publish the result of the in-flight transfer.  Does nothing if no transfer is in flight.
    pub(crate) fn finish(&self, result: Result<usize, Error>) -> bool {
        if self.state.load(Ordering::Acquire) != BUSY {
            return false;
        }
        match result {
            Ok(len) => {
                self.len.store(len, Ordering::Relaxed);
                self.error.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                self.len.store(0, Ordering::Relaxed);
                self.error.store(err.code(), Ordering::Relaxed);
            }
        }
        self.state.store(DONE, Ordering::Release);
        self.waker.wake();
        true
    }

    pub(crate) fn poll_done(&self, cx: &mut Context<'_>) -> Poll<Result<usize, Error>> {
        self.waker.register(cx.waker());
        if self.state.load(Ordering::Acquire) != DONE {
            return Poll::Pending;
        }
        let result = match Error::from_code(self.error.load(Ordering::Relaxed)) {
            Some(err) => Err(err),
            None => Ok(self.len.load(Ordering::Relaxed)),
        };
        self.state.store(IDLE, Ordering::Release);
        Poll::Ready(result)
    }

    /// Drop whatever the slot holds.  Only used by the task once the transfer is aborted.
    pub(crate) fn abandon(&self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// The completion slots shared by a [`Channel`](crate::Channel) and its
/// [`Driver`](crate::Driver).
#[derive(Default)]
pub struct Handoff {
    pub bulk_out: Completion,
    pub bulk_in: Completion,
    pub interrupt_in: Completion,
}

impl Handoff {
    pub const fn new() -> Self {
        Self {
            bulk_out: Completion::new(),
            bulk_in: Completion::new(),
            interrupt_in: Completion::new(),
        }
    }

    pub fn slot(&self, class: PipeClass) -> Option<&Completion> {
        match class {
            PipeClass::BulkOut => Some(&self.bulk_out),
            PipeClass::BulkIn => Some(&self.bulk_in),
            PipeClass::InterruptIn => Some(&self.interrupt_in),
            PipeClass::Control => None,
        }
    }

    pub(crate) fn slots(&self) -> [&Completion; 3] {
        [&self.bulk_out, &self.bulk_in, &self.interrupt_in]
    }
}

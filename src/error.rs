use embassy_usb_driver::EndpointError;

/// Errors reported by the engine, either as a return value or through
/// [`ClassHandler::on_error`](crate::ClassHandler::on_error).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A FIFO port did not acknowledge a pipe selection within its retry budget.
    FifoTimeout,
    /// The administrative FIFO bind used during bus reset and attach gave up.
    /// The controller is most likely wedged and needs a full re-initialization.
    FifoStuck,
    /// The pipe is halted.
    Stalled,
    /// The host stopped servicing the pipe: three consecutive not-ready events without any
    /// progress.  The pipe stays dead until reset.
    NoResponse,
    /// The cable is unplugged or the device is not configured.
    NotConnected,
    /// A transfer is already in flight on the pipe.
    Busy,
    /// Neither the standard request handler nor the class layer recognized a SETUP packet.
    UnknownRequest,
    /// The operation is not valid in the current control transfer stage.
    State,
    /// The host sent more data than the destination buffer can hold.
    Overrun,
    /// The transfer was dropped by a reset before it completed.
    Aborted,
    /// The descriptor set, endpoint table or configuration is malformed.
    InvalidConfig,
}

impl Error {
    pub(crate) const fn code(self) -> u8 {
        match self {
            Error::FifoTimeout => 1,
            Error::FifoStuck => 2,
            Error::Stalled => 3,
            Error::NoResponse => 4,
            Error::NotConnected => 5,
            Error::Busy => 6,
            Error::UnknownRequest => 7,
            Error::State => 8,
            Error::Overrun => 9,
            Error::Aborted => 10,
            Error::InvalidConfig => 11,
        }
    }

    // Code 0 means "no error".
    pub(crate) const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Error::FifoTimeout,
            2 => Error::FifoStuck,
            3 => Error::Stalled,
            4 => Error::NoResponse,
            5 => Error::NotConnected,
            6 => Error::Busy,
            7 => Error::UnknownRequest,
            8 => Error::State,
            9 => Error::Overrun,
            10 => Error::Aborted,
            11 => Error::InvalidConfig,
            _ => return None,
        })
    }
}

impl From<Error> for EndpointError {
    fn from(err: Error) -> Self {
        match err {
            Error::Overrun => EndpointError::BufferOverflow,
            _ => EndpointError::Disabled,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Error::FifoTimeout => "FIFO port selection timed out",
            Error::FifoStuck => "FIFO port never acknowledged the control pipe",
            Error::Stalled => "pipe is stalled",
            Error::NoResponse => "pipe is not responding",
            Error::NotConnected => "device is not connected",
            Error::Busy => "pipe is busy",
            Error::UnknownRequest => "unknown control request",
            Error::State => "invalid control transfer state",
            Error::Overrun => "received more data than requested",
            Error::Aborted => "transfer aborted",
            Error::InvalidConfig => "invalid configuration",
        };
        f.write_str(msg)
    }
}

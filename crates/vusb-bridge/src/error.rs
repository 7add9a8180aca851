//! Error kinds and their mapping onto the negative-errno statuses the kernel
//! expects in `ret_submit`.

use thiserror::Error;

use vusb_protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum BackingError {
    #[error("USB library failure: {0}")]
    LibraryFailure(rusb::Error),
    #[error("device is gone")]
    DeviceGone,
    #[error("request not supported by backing")]
    NotSupported,
    #[error("endpoint stalled")]
    Stall,
    #[error("transfer timed out")]
    Timeout,
    #[error("no endpoint with address {0:#04x}")]
    NoSuchEndpoint(u8),
}

impl BackingError {
    /// The URB status the kernel should see for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            BackingError::Stall | BackingError::NotSupported | BackingError::NoSuchEndpoint(_) => {
                -libc::EPIPE
            }
            BackingError::DeviceGone => -libc::ENODEV,
            BackingError::Timeout => -libc::ETIMEDOUT,
            BackingError::LibraryFailure(_) => -libc::EIO,
        }
    }

    pub fn from_rusb(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Pipe => BackingError::Stall,
            rusb::Error::NoDevice | rusb::Error::NotFound => BackingError::DeviceGone,
            rusb::Error::Timeout => BackingError::Timeout,
            rusb::Error::NotSupported => BackingError::NotSupported,
            other => BackingError::LibraryFailure(other),
        }
    }

    /// Maps a raw libusb return code, as plugins speak them over the mock ABI.
    pub fn from_libusb_code(code: i32) -> Self {
        match code {
            rusb::constants::LIBUSB_ERROR_PIPE => BackingError::Stall,
            rusb::constants::LIBUSB_ERROR_NO_DEVICE => BackingError::DeviceGone,
            rusb::constants::LIBUSB_ERROR_TIMEOUT => BackingError::Timeout,
            rusb::constants::LIBUSB_ERROR_NOT_SUPPORTED => BackingError::NotSupported,
            _ => BackingError::LibraryFailure(rusb::Error::Other),
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to spawn bridge thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Error)]
pub enum VhciError {
    #[error("no vhci_hcd controller found; is the kernel module loaded?")]
    NoController,
    #[error("no free VHCI port for the requested speed")]
    NoFreePort,
    #[error("VHCI port {port} refused the attach")]
    BusyPort { port: u8 },
    #[error("malformed vhci status line {line:?}")]
    Status { line: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

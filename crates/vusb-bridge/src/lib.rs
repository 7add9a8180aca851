//! USB/IP bridge engine.
//!
//! Attaches a virtual USB device to the local kernel's VHCI controller and
//! bridges every USB transaction between the kernel and a [`Backing`]: either
//! a real device driven through libusb (the proxy backing) or a plugin-backed
//! mock device.
//!
//! The moving parts, bottom up:
//! - [`socket::EndpointSocket`] — the socketpair whose far end is handed to
//!   the kernel;
//! - [`vhci`] — free-port discovery and the sysfs attach handshake;
//! - [`transfer::TransferTable`] — in-flight transfer registry with the
//!   cancel/complete discipline;
//! - [`backing`] — the operation surface both backings implement;
//! - [`proxy::ProxyBacking`] / [`mock::MockBacking`] — the two backings;
//! - [`bridge::Bridge`] — the protocol engine and its threads.

pub mod abi;
pub mod backing;
pub mod bridge;
pub mod error;
pub mod mock;
pub mod proxy;
pub mod socket;
pub mod transfer;
pub mod vhci;

pub use backing::{Backing, DeviceSpeed, IsoRequest, TransferInfo};
pub use bridge::Bridge;
pub use error::{BackingError, BridgeError, VhciError};
pub use mock::MockBacking;
pub use proxy::ProxyBacking;
pub use socket::EndpointSocket;
pub use transfer::{CompletedTransfer, TransferStatus, TransferTable};
pub use vhci::VhciDriver;

//! The operation surface the bridge engine drives.
//!
//! Two implementations exist: [`crate::proxy::ProxyBacking`] forwards to a
//! real device through libusb, [`crate::mock::MockBacking`] to a plugin. The
//! bridge holds one owned trait object and never cares which.

use std::sync::Arc;

use vusb_descriptors::TransferKind;
use vusb_protocol::{IsoPacketDescriptor, SetupPacket};

use crate::error::BackingError;
use crate::transfer::{CompletionCallback, TransferTable};

/// Device speed codes as the VHCI attach attribute spells them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceSpeed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Wireless = 4,
    Super = 5,
    SuperPlus = 6,
}

impl DeviceSpeed {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Derives the advertised speed from a device descriptor's `bcdUSB`.
    pub fn from_bcd_usb(bcd_usb: u16) -> Self {
        match bcd_usb {
            0x0300.. => DeviceSpeed::Super,
            0x0200.. => DeviceSpeed::High,
            _ => DeviceSpeed::Full,
        }
    }

    pub fn is_super_speed(self) -> bool {
        self >= DeviceSpeed::Super
    }
}

/// One asynchronous submission handed to a backing. The backing takes
/// ownership and eventually invokes `callback` exactly once, unless the
/// transfer is cancelled first.
pub struct TransferInfo {
    /// Endpoint address with the direction bit (`0x81` style).
    pub ep_address: u8,
    pub kind: TransferKind,
    /// Seqnum of the originating wire command, recorded in the transfer
    /// table for unlink reconciliation.
    pub seqnum: u32,
    /// OUT: the bytes to send. IN: a zeroed buffer of the requested size.
    pub buffer: Vec<u8>,
    pub iso: Option<IsoRequest>,
    pub callback: CompletionCallback,
}

/// ISO-specific submission parameters.
pub struct IsoRequest {
    pub packet_count: usize,
    /// The per-packet table parsed from an OUT payload; empty for IN.
    pub descriptors: Vec<IsoPacketDescriptor>,
}

pub trait Backing: Send + Sync {
    /// Packed DEVICE descriptor bytes (followed by the default configuration,
    /// see the descriptor tree's contract).
    fn device_descriptor(&self) -> Vec<u8>;

    /// Packed CONFIG descriptor bytes for `index`.
    fn config_descriptor(&self, index: u8) -> Vec<u8>;

    /// Packed string descriptor bytes, empty if absent.
    fn string_descriptor(&self, language_id: u16, index: u8) -> Vec<u8>;

    /// Packed BOS bytes, empty if the device has none.
    fn bos_descriptor(&self) -> Vec<u8>;

    /// Packed HID report descriptor bytes, empty if the device has none.
    fn report_descriptor(&self) -> Vec<u8>;

    fn endpoint_transfer_type(&self, address: u8) -> Result<TransferKind, BackingError>;

    /// Answers GET_STATUS on the device.
    fn is_self_powered(&self) -> bool;

    fn set_configuration(&self, value: u8) -> Result<(), BackingError>;

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), BackingError>;

    /// Last altsetting successfully set for `interface`, 0 if never set.
    fn current_altsetting(&self, interface: u8) -> u8;

    /// Speed advertised to VHCI when attaching.
    fn speed(&self) -> DeviceSpeed;

    /// The table this backing routes completions through. The bridge keeps a
    /// reference for unlink reconciliation.
    fn transfer_table(&self) -> Arc<TransferTable>;

    fn submit_bulk(&self, info: TransferInfo) -> Result<(), BackingError>;

    fn submit_interrupt(&self, info: TransferInfo) -> Result<(), BackingError>;

    fn submit_iso(&self, info: TransferInfo) -> Result<(), BackingError>;

    /// Blocking control transfer. Returns the response bytes for IN setups,
    /// empty for OUT.
    fn submit_control(
        &self,
        setup: SetupPacket,
        out_payload: &[u8],
    ) -> Result<Vec<u8>, BackingError>;

    /// Cancels every in-flight transfer and blocks until all completion
    /// callbacks have observed the cancellation.
    fn cancel_transfers(&self);
}

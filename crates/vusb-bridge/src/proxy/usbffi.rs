//! Raw libusb asynchronous transfer plumbing.
//!
//! rusb's safe surface covers discovery, claiming and synchronous control
//! transfers, but not the asynchronous `libusb_transfer` API the bridge needs
//! for bulk/interrupt/ISO submissions. This module confines that unsafe
//! surface: allocate and fill a transfer, submit it, and route its completion
//! back through the [`TransferTable`] from the event-pump thread.
//!
//! Ownership: the transfer's `user_data` carries one `Arc<TransferTable>`
//! reference and its `buffer` one boxed slice; both are reclaimed in the
//! completion trampoline (or in [`abandon`] when a submit fails).

use std::ffi::{c_int, c_uint, c_void};
use std::sync::Arc;

use rusb::ffi;
use rusb::ffi::constants::{
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_BULK,
    LIBUSB_TRANSFER_TYPE_INTERRUPT, LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
};

use vusb_descriptors::TransferKind;

use crate::error::BackingError;
use crate::transfer::{CompletedTransfer, IsoPacket, TransferStatus, TransferTable};

const TRANSFER_TIMEOUT_MS: c_uint = 10_000;

pub(super) fn transfer_type_code(kind: TransferKind) -> u8 {
    match kind {
        TransferKind::Bulk => LIBUSB_TRANSFER_TYPE_BULK,
        TransferKind::Interrupt => LIBUSB_TRANSFER_TYPE_INTERRUPT,
        TransferKind::Isochronous => LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
        TransferKind::Control => unreachable!("control transfers use the synchronous path"),
    }
}

/// Allocates and fills a transfer. ISO packet lengths are uniform slices of
/// the buffer.
///
/// # Safety
///
/// `dev_handle` must be a live libusb device handle.
pub(super) unsafe fn fill_transfer(
    dev_handle: *mut ffi::libusb_device_handle,
    ep_address: u8,
    kind: TransferKind,
    buffer: Vec<u8>,
    iso_packets: usize,
    table: Arc<TransferTable>,
) -> *mut ffi::libusb_transfer {
    let xfer = ffi::libusb_alloc_transfer(iso_packets as c_int);
    assert!(!xfer.is_null(), "libusb_alloc_transfer failed");

    let length = buffer.len();
    let buffer = Box::into_raw(buffer.into_boxed_slice()) as *mut u8;

    (*xfer).dev_handle = dev_handle;
    (*xfer).flags = 0;
    (*xfer).endpoint = ep_address;
    (*xfer).transfer_type = transfer_type_code(kind);
    (*xfer).timeout = TRANSFER_TIMEOUT_MS;
    (*xfer).length = length as c_int;
    (*xfer).actual_length = 0;
    (*xfer).buffer = buffer;
    (*xfer).num_iso_packets = iso_packets as c_int;
    (*xfer).callback = on_transfer_done;
    (*xfer).user_data = Arc::into_raw(table) as *mut c_void;

    if iso_packets > 0 {
        let packet_length = (length / iso_packets) as c_uint;
        for descriptor in iso_descriptors_mut(xfer) {
            descriptor.length = packet_length;
            descriptor.actual_length = 0;
            descriptor.status = LIBUSB_TRANSFER_COMPLETED;
        }
    }

    xfer
}

/// Handle key under which a transfer is registered in the table.
pub(super) fn handle_key(xfer: *mut ffi::libusb_transfer) -> u64 {
    xfer as u64
}

/// A cancel hook for the transfer table. libusb queues the request; the
/// completion (status `Cancelled`) arrives later on the event pump.
pub(super) fn cancel_hook(xfer: *mut ffi::libusb_transfer) -> Box<dyn Fn() + Send> {
    let addr = xfer as usize;
    Box::new(move || unsafe {
        ffi::libusb_cancel_transfer(addr as *mut ffi::libusb_transfer);
    })
}

/// # Safety
///
/// `xfer` must have been produced by [`fill_transfer`] and not yet submitted
/// (or have failed to submit).
pub(super) unsafe fn submit(xfer: *mut ffi::libusb_transfer) -> Result<(), BackingError> {
    match ffi::libusb_submit_transfer(xfer) {
        0 => Ok(()),
        code => Err(BackingError::from_libusb_code(code)),
    }
}

/// Reclaims everything a filled-but-never-submitted transfer owns.
///
/// # Safety
///
/// `xfer` must have been produced by [`fill_transfer`] and must not be in
/// flight.
pub(super) unsafe fn abandon(xfer: *mut ffi::libusb_transfer) {
    drop(Arc::from_raw((*xfer).user_data as *const TransferTable));
    free_transfer(xfer);
}

unsafe fn free_transfer(xfer: *mut ffi::libusb_transfer) {
    let buffer = (*xfer).buffer;
    let length = (*xfer).length as usize;
    if !buffer.is_null() {
        drop(Box::from_raw(std::slice::from_raw_parts_mut(
            buffer, length,
        )));
    }
    ffi::libusb_free_transfer(xfer);
}

unsafe fn iso_descriptors_mut<'a>(
    xfer: *mut ffi::libusb_transfer,
) -> &'a mut [ffi::libusb_iso_packet_descriptor] {
    std::slice::from_raw_parts_mut(
        (*xfer).iso_packet_desc.as_mut_ptr(),
        (*xfer).num_iso_packets as usize,
    )
}

fn map_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        _ => TransferStatus::Error,
    }
}

fn kind_from_code(transfer_type: u8) -> TransferKind {
    match transfer_type {
        LIBUSB_TRANSFER_TYPE_ISOCHRONOUS => TransferKind::Isochronous,
        LIBUSB_TRANSFER_TYPE_INTERRUPT => TransferKind::Interrupt,
        _ => TransferKind::Bulk,
    }
}

/// Completion trampoline, invoked by libusb on the event-pump thread.
///
/// The table entry is removed (and its callback run) before the transfer is
/// freed, so a concurrent unlink can never cancel a dangling pointer: the
/// cancel hook only runs while the entry still exists, under the table lock.
extern "system" fn on_transfer_done(xfer: *mut ffi::libusb_transfer) {
    unsafe {
        let table = Arc::from_raw((*xfer).user_data as *const TransferTable);
        let completed = collect(xfer);
        table.complete(handle_key(xfer), completed);
        free_transfer(xfer);
    }
}

unsafe fn collect(xfer: *mut ffi::libusb_transfer) -> CompletedTransfer {
    let ep_address = (*xfer).endpoint;
    let is_in = (ep_address & 0x80) != 0;
    let kind = kind_from_code((*xfer).transfer_type);
    let status = map_status((*xfer).status);
    let buffer = std::slice::from_raw_parts((*xfer).buffer, (*xfer).length as usize);

    if (*xfer).num_iso_packets > 0 {
        let iso_packets: Vec<IsoPacket> = iso_descriptors_mut(xfer)
            .iter()
            .map(|d| IsoPacket {
                length: d.length,
                actual_length: d.actual_length,
                status: d.status,
            })
            .collect();

        // IN data is the completed packets' bytes, read at each packet's
        // submitted offset.
        let mut data = Vec::new();
        if is_in {
            let mut offset = 0usize;
            for packet in &iso_packets {
                if packet.status == LIBUSB_TRANSFER_COMPLETED {
                    let end = (offset + packet.actual_length as usize).min(buffer.len());
                    data.extend_from_slice(&buffer[offset.min(buffer.len())..end]);
                }
                offset += packet.length as usize;
            }
        }
        let actual_length = iso_packets
            .iter()
            .map(|p| p.actual_length as usize)
            .sum();

        return CompletedTransfer {
            ep_address,
            kind,
            status,
            data,
            actual_length,
            iso_packets,
        };
    }

    let actual_length = (*xfer).actual_length.max(0) as usize;
    let data = if is_in {
        buffer[..actual_length.min(buffer.len())].to_vec()
    } else {
        Vec::new()
    };

    CompletedTransfer {
        ep_address,
        kind,
        status,
        data,
        actual_length,
        iso_packets: Vec::new(),
    }
}

//! In-flight transfer registry.
//!
//! Every asynchronous submission — a raw libusb transfer for the proxy
//! backing, a plugin-held mock transfer for the mock backing — is registered
//! here under a stable handle together with its completion callback and the
//! seqnum of the originating wire command. Completion removes the entry under
//! the lock and invokes the callback outside it; nothing in this module ever
//! holds the lock across user code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use vusb_descriptors::TransferKind;
use vusb_protocol::IsoPacketDescriptor;

const CANCEL_DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Handle of a registered transfer. Device transfers use the raw libusb
/// transfer address (always even); mock transfers draw odd values from a
/// counter, so the two can never collide.
pub type TransferHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    TimedOut,
    Stall,
    NoDevice,
    Error,
}

impl TransferStatus {
    /// URB status as the kernel spells it.
    pub fn errno(self) -> i32 {
        match self {
            TransferStatus::Completed => 0,
            TransferStatus::Cancelled => -libc::ECONNRESET,
            TransferStatus::TimedOut => -libc::ETIMEDOUT,
            TransferStatus::Stall => -libc::EPIPE,
            TransferStatus::NoDevice => -libc::ENODEV,
            TransferStatus::Error => -libc::EIO,
        }
    }

    pub fn is_success(self) -> bool {
        self == TransferStatus::Completed
    }
}

/// Per-packet result of an ISO transfer, in submission order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacket {
    pub length: u32,
    pub actual_length: u32,
    /// 0 on success, a libusb transfer status otherwise.
    pub status: i32,
}

/// Everything a completion callback learns about a finished transfer.
#[derive(Debug)]
pub struct CompletedTransfer {
    pub ep_address: u8,
    pub kind: TransferKind,
    pub status: TransferStatus,
    /// IN: bytes produced by the device (for ISO, the completed packets'
    /// bytes concatenated). OUT: empty.
    pub data: Vec<u8>,
    /// IN: `data.len()`. OUT: bytes the device accepted.
    pub actual_length: usize,
    pub iso_packets: Vec<IsoPacket>,
}

impl CompletedTransfer {
    /// Converts the per-packet results into the wire descriptor table:
    /// offsets accumulate by submitted length, failed packets carry
    /// `-EINVAL`, and `error_count` counts them.
    pub fn usbip_iso_table(&self) -> (Vec<IsoPacketDescriptor>, usize, i32) {
        let mut descriptors = Vec::with_capacity(self.iso_packets.len());
        let mut offset = 0u32;
        let mut data_size = 0usize;
        let mut error_count = 0i32;

        for packet in &self.iso_packets {
            let status = if packet.status == 0 {
                0
            } else {
                error_count += 1;
                -libc::EINVAL
            };
            descriptors.push(IsoPacketDescriptor {
                offset,
                length: packet.length,
                actual_length: packet.actual_length,
                status,
            });
            data_size += packet.actual_length as usize;
            offset += packet.length;
        }

        (descriptors, data_size, error_count)
    }
}

pub type CompletionCallback = Box<dyn FnOnce(CompletedTransfer) + Send>;

enum EntryKind {
    /// Plugin-held transfer: cancellation releases it immediately. The
    /// release hook drops the table's reference to the plugin-side state.
    Mock { release: Box<dyn FnOnce() + Send> },
    /// Raw libusb transfer: cancellation asks the library, and the event
    /// pump later delivers a `Cancelled` completion.
    Device { cancel: Box<dyn Fn() + Send> },
}

struct Entry {
    seqnum: u32,
    callback: CompletionCallback,
    kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    /// The handle is already registered.
    Duplicate,
    /// `cancel_all` has run; no new transfers are accepted.
    ShuttingDown,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<TransferHandle, Entry>,
    cancelled: bool,
}

/// Registry of in-flight transfers. One exclusive lock; callbacks always run
/// outside it.
#[derive(Default)]
pub struct TransferTable {
    inner: Mutex<Inner>,
    next_mock_handle: AtomicU64,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle for a mock transfer. Odd by construction so it can
    /// never alias a libusb transfer address.
    pub fn allocate_mock_handle(&self) -> TransferHandle {
        (self.next_mock_handle.fetch_add(1, Ordering::Relaxed) << 1) | 1
    }

    pub fn attach_device(
        &self,
        handle: TransferHandle,
        seqnum: u32,
        cancel: Box<dyn Fn() + Send>,
        callback: CompletionCallback,
    ) -> Result<(), AttachError> {
        self.attach(handle, seqnum, EntryKind::Device { cancel }, callback)
    }

    pub fn attach_mock(
        &self,
        handle: TransferHandle,
        seqnum: u32,
        release: Box<dyn FnOnce() + Send>,
        callback: CompletionCallback,
    ) -> Result<(), AttachError> {
        self.attach(handle, seqnum, EntryKind::Mock { release }, callback)
    }

    fn attach(
        &self,
        handle: TransferHandle,
        seqnum: u32,
        kind: EntryKind,
        callback: CompletionCallback,
    ) -> Result<(), AttachError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancelled {
            return Err(AttachError::ShuttingDown);
        }
        if inner.entries.contains_key(&handle) {
            return Err(AttachError::Duplicate);
        }
        inner.entries.insert(
            handle,
            Entry {
                seqnum,
                callback,
                kind,
            },
        );
        Ok(())
    }

    /// Dispatches the completion callback exactly once and removes the entry.
    /// A completion for an unknown handle (already cancelled or released) is
    /// a no-op.
    pub fn complete(&self, handle: TransferHandle, transfer: CompletedTransfer) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.remove(&handle)
        };
        if let Some(entry) = entry {
            (entry.callback)(transfer);
        }
    }

    /// Removes an entry without running its callback. Returns whether the
    /// handle was registered.
    pub fn release(&self, handle: TransferHandle) -> bool {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            inner.entries.remove(&handle)
        };
        match entry {
            Some(Entry {
                kind: EntryKind::Mock { release },
                ..
            }) => {
                release();
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Kernel-initiated cancel: finds the transfer submitted for `seqnum`.
    /// Mock transfers are released on the spot; device transfers get a
    /// library cancel and complete asynchronously with `Cancelled`.
    pub fn cancel_by_seqnum(&self, seqnum: u32) -> bool {
        let release = {
            let mut inner = self.inner.lock().unwrap();
            let Some((handle, is_mock)) = inner
                .entries
                .iter()
                .find(|(_, entry)| entry.seqnum == seqnum)
                .map(|(&handle, entry)| (handle, matches!(entry.kind, EntryKind::Mock { .. })))
            else {
                return false;
            };

            if is_mock {
                match inner.entries.remove(&handle) {
                    Some(Entry {
                        kind: EntryKind::Mock { release },
                        ..
                    }) => Some(release),
                    _ => None,
                }
            } else {
                if let Some(Entry {
                    kind: EntryKind::Device { cancel },
                    ..
                }) = inner.entries.get(&handle)
                {
                    // libusb queues the cancel; the completion arrives later
                    // on the event pump, never synchronously under this lock.
                    cancel();
                }
                None
            }
        };

        if let Some(release) = release {
            release();
        }
        true
    }

    /// Bridge-initiated teardown: stop accepting new transfers, cancel every
    /// in-flight one, then block until all callbacks have drained. Device
    /// transfer callbacks arrive from the event pump, which must keep running
    /// while this waits.
    pub fn cancel_all(&self) {
        let releases = {
            let mut inner = self.inner.lock().unwrap();
            inner.cancelled = true;

            let mock_handles: Vec<TransferHandle> = inner
                .entries
                .iter()
                .filter(|(_, e)| matches!(e.kind, EntryKind::Mock { .. }))
                .map(|(&h, _)| h)
                .collect();

            let mut releases = Vec::new();
            for handle in mock_handles {
                if let Some(Entry {
                    kind: EntryKind::Mock { release },
                    ..
                }) = inner.entries.remove(&handle)
                {
                    releases.push(release);
                }
            }

            for entry in inner.entries.values() {
                if let EntryKind::Device { cancel } = &entry.kind {
                    cancel();
                }
            }
            releases
        };

        for release in releases {
            release();
        }

        while !self.is_empty() {
            thread::sleep(CANCEL_DRAIN_INTERVAL);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn completed(status: TransferStatus) -> CompletedTransfer {
        CompletedTransfer {
            ep_address: 0x81,
            kind: TransferKind::Interrupt,
            status,
            data: Vec::new(),
            actual_length: 0,
            iso_packets: Vec::new(),
        }
    }

    #[test]
    fn complete_runs_callback_exactly_once() {
        let table = TransferTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let handle = table.allocate_mock_handle();

        let hits_cb = hits.clone();
        table
            .attach_mock(
                handle,
                1,
                Box::new(|| {}),
                Box::new(move |_| {
                    hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(table.len(), 1);
        table.complete(handle, completed(TransferStatus::Completed));
        table.complete(handle, completed(TransferStatus::Completed));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_handles_are_rejected() {
        let table = TransferTable::new();
        let handle = table.allocate_mock_handle();
        table
            .attach_mock(handle, 1, Box::new(|| {}), Box::new(|_| {}))
            .unwrap();
        assert_eq!(
            table.attach_mock(handle, 2, Box::new(|| {}), Box::new(|_| {})),
            Err(AttachError::Duplicate)
        );
    }

    #[test]
    fn cancel_by_seqnum_releases_mock_without_callback() {
        let table = TransferTable::new();
        let released = Arc::new(AtomicUsize::new(0));
        let invoked = Arc::new(AtomicUsize::new(0));
        let handle = table.allocate_mock_handle();

        let released_hook = released.clone();
        let invoked_cb = invoked.clone();
        table
            .attach_mock(
                handle,
                100,
                Box::new(move || {
                    released_hook.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(move |_| {
                    invoked_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(table.cancel_by_seqnum(100));
        assert!(!table.cancel_by_seqnum(100), "entry is gone");
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        // A late completion for the cancelled transfer is a no-op.
        table.complete(handle, completed(TransferStatus::Completed));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_all_refuses_new_attaches_and_drains() {
        let table = Arc::new(TransferTable::new());
        let handle = table.allocate_mock_handle();
        table
            .attach_mock(handle, 1, Box::new(|| {}), Box::new(|_| {}))
            .unwrap();

        table.cancel_all();
        assert!(table.is_empty());
        assert_eq!(
            table.attach_mock(
                table.allocate_mock_handle(),
                2,
                Box::new(|| {}),
                Box::new(|_| {})
            ),
            Err(AttachError::ShuttingDown)
        );
    }

    #[test]
    fn cancel_all_waits_for_device_completions() {
        let table = Arc::new(TransferTable::new());
        let cancel_requested = Arc::new(AtomicUsize::new(0));

        let handle = 0x1000; // even: device-style handle
        let cancel_flag = cancel_requested.clone();
        let table_for_cancel = table.clone();
        table
            .attach_device(
                handle,
                7,
                Box::new(move || {
                    cancel_flag.fetch_add(1, Ordering::SeqCst);
                }),
                Box::new(|transfer| {
                    assert_eq!(transfer.status, TransferStatus::Cancelled);
                }),
            )
            .unwrap();

        // Simulate the event pump delivering the cancelled completion.
        let pump = std::thread::spawn(move || {
            while cancel_requested.load(Ordering::SeqCst) == 0 {
                std::thread::sleep(Duration::from_millis(1));
            }
            table_for_cancel.complete(handle, completed(TransferStatus::Cancelled));
        });

        table.cancel_all();
        assert!(table.is_empty());
        pump.join().unwrap();
    }

    #[test]
    fn iso_table_accumulates_offsets_and_errors() {
        let transfer = CompletedTransfer {
            ep_address: 0x83,
            kind: TransferKind::Isochronous,
            status: TransferStatus::Completed,
            data: vec![0; 128],
            actual_length: 128,
            iso_packets: vec![
                IsoPacket {
                    length: 64,
                    actual_length: 64,
                    status: 0,
                },
                IsoPacket {
                    length: 64,
                    actual_length: 0,
                    status: rusb::constants::LIBUSB_TRANSFER_ERROR,
                },
                IsoPacket {
                    length: 64,
                    actual_length: 64,
                    status: 0,
                },
            ],
        };

        let (descriptors, data_size, error_count) = transfer.usbip_iso_table();
        assert_eq!(data_size, 128);
        assert_eq!(error_count, 1);
        assert_eq!(descriptors[0].offset, 0);
        assert_eq!(descriptors[1].offset, 64);
        assert_eq!(descriptors[2].offset, 128);
        assert_eq!(descriptors[1].status, -libc::EINVAL);
        assert_eq!(descriptors[0].status, 0);
    }
}

//! Plugin-backed mock backing.
//!
//! Descriptors come from a loaded [`Tree`]; control setups and transfers are
//! dispatched to the plugin through the C ABI in [`crate::abi`]. A mock
//! transfer has no underlying I/O handle: submission registers it in the
//! transfer table and immediately hands the plugin a transfer-control vtable.
//! The plugin calls `fill`/`read` and then `complete`, which fires the
//! callback the bridge attached.

use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vusb_descriptors::{Tree, TransferKind};
use vusb_protocol::SetupPacket;

use crate::abi::{MockDevice, MockTransferControl, RawControlSetup, RawIsoPacketDescriptor};
use crate::backing::{Backing, DeviceSpeed, TransferInfo};
use crate::error::BackingError;
use crate::transfer::{
    CompletedTransfer, IsoPacket, TransferHandle, TransferStatus, TransferTable,
};

/// Owning wrapper around a plugin-created [`MockDevice`].
///
/// The vtable functions are called from bridge threads; the plugin contract
/// requires them to be thread-safe.
pub struct PluginHandle {
    device: *mut MockDevice,
}

// The raw pointer is only dereferenced through the vtable, whose contract is
// cross-thread dispatch.
unsafe impl Send for PluginHandle {}
unsafe impl Sync for PluginHandle {}

impl PluginHandle {
    /// # Safety
    ///
    /// `device` must be a valid pointer obtained from a plugin factory and
    /// stay valid until `destroy` runs.
    pub unsafe fn from_raw(device: *mut MockDevice) -> Self {
        assert!(!device.is_null(), "plugin factory returned null");
        Self { device }
    }

    fn on_transfer_request(&self, xfer: MockTransferControl) {
        unsafe { ((*self.device).on_transfer_request)((*self.device).ctx, xfer) }
    }

    fn on_transfer_complete(&self, xfer: MockTransferControl) {
        unsafe { ((*self.device).on_transfer_complete)((*self.device).ctx, xfer) }
    }

    fn on_control_setup(&self, setup: RawControlSetup, data: &mut [u8]) -> c_int {
        unsafe {
            ((*self.device).on_control_setup)(
                (*self.device).ctx,
                setup,
                data.as_mut_ptr(),
                data.len(),
                0,
            )
        }
    }

    fn on_set_configuration(&self, index: u8) -> c_int {
        unsafe { ((*self.device).on_set_configuration)((*self.device).ctx, index) }
    }

    fn on_set_interface(&self, interface: u8, alt_setting: u8) -> c_int {
        unsafe { ((*self.device).on_set_interface)((*self.device).ctx, interface, alt_setting) }
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        unsafe {
            if let Some(destroy) = (*self.device).destroy {
                destroy(self.device);
            }
        }
    }
}

struct MockTransferInner {
    buffer: Vec<u8>,
    actual_length: usize,
    iso_packets: Vec<IsoPacket>,
}

/// Shared state behind a [`MockTransferControl`]'s `ctx` pointer.
///
/// Two strong references exist while the transfer is in flight: one riding
/// in `ctx`, one captured by the table entry's release hook. The `completed`
/// flag arbitrates which of `complete` and the release hook reclaims the
/// `ctx` reference, so a cancelled transfer frees immediately, without
/// plugin cooperation. A cancelled transfer's control value is dead; the
/// plugin must not touch it afterwards.
struct MockTransferState {
    handle: TransferHandle,
    ep_address: u8,
    kind: TransferKind,
    table: Arc<TransferTable>,
    plugin: Arc<PluginHandle>,
    completed: AtomicBool,
    inner: Mutex<MockTransferInner>,
}

impl MockTransferState {
    fn is_in(&self) -> bool {
        (self.ep_address & 0x80) != 0
    }

    fn finish(self: &Arc<Self>) -> CompletedTransfer {
        let inner = self.inner.lock().unwrap();
        let (data, actual_length) = if !self.is_in() {
            (Vec::new(), inner.actual_length)
        } else if inner.iso_packets.is_empty() {
            let data = inner.buffer[..inner.actual_length.min(inner.buffer.len())].to_vec();
            let len = data.len();
            (data, len)
        } else {
            // Gather the completed packets: slot i sits at the cumulative
            // offset of the preceding packet lengths.
            let mut data = Vec::new();
            let mut offset = 0usize;
            for packet in &inner.iso_packets {
                if packet.status == 0 {
                    let end = (offset + packet.actual_length as usize).min(inner.buffer.len());
                    let start = offset.min(inner.buffer.len());
                    data.extend_from_slice(&inner.buffer[start..end]);
                }
                offset += packet.length as usize;
            }
            let len = data.len();
            (data, len)
        };

        CompletedTransfer {
            ep_address: self.ep_address,
            kind: self.kind,
            status: TransferStatus::Completed,
            data,
            actual_length,
            iso_packets: inner.iso_packets.clone(),
        }
    }
}

unsafe fn state_ref<'a>(ctx: *mut c_void) -> &'a MockTransferState {
    &*(ctx as *const MockTransferState)
}

unsafe extern "C" fn control_complete(ctx: *mut c_void) {
    let state = state_ref(ctx);
    if state.completed.swap(true, Ordering::SeqCst) {
        return;
    }
    // Take back the reference `ctx` carries; the state stays alive for the
    // rest of this scope.
    let state = Arc::from_raw(ctx as *const MockTransferState);
    let completed = state.finish();
    state.table.complete(state.handle, completed);
    state.plugin.on_transfer_complete(make_control(&state));
}

unsafe extern "C" fn control_is_in(ctx: *mut c_void) -> bool {
    state_ref(ctx).is_in()
}

unsafe extern "C" fn control_is_out(ctx: *mut c_void) -> bool {
    !state_ref(ctx).is_in()
}

unsafe extern "C" fn control_fill(ctx: *mut c_void, data: *const u8, size: usize) {
    let state = state_ref(ctx);
    debug_assert!(state.is_in(), "fill is for IN transfers");
    let mut inner = state.inner.lock().unwrap();
    let n = size.min(inner.buffer.len());
    inner.buffer[..n].copy_from_slice(std::slice::from_raw_parts(data, n));
    inner.actual_length = n;
    for packet in &mut inner.iso_packets {
        packet.actual_length = packet.length;
    }
}

unsafe extern "C" fn control_read(ctx: *mut c_void, data: *mut u8, size: u32) {
    let state = state_ref(ctx);
    let mut inner = state.inner.lock().unwrap();
    let n = if size == 0 {
        inner.buffer.len()
    } else {
        (size as usize).min(inner.buffer.len())
    };
    std::slice::from_raw_parts_mut(data, n).copy_from_slice(&inner.buffer[..n]);
    inner.actual_length = n;
    for packet in &mut inner.iso_packets {
        packet.actual_length = packet.length;
    }
}

unsafe extern "C" fn control_size(ctx: *mut c_void) -> c_int {
    state_ref(ctx).inner.lock().unwrap().buffer.len() as c_int
}

unsafe extern "C" fn control_transfer_type(ctx: *mut c_void) -> u8 {
    match state_ref(ctx).kind {
        TransferKind::Control => 0,
        TransferKind::Isochronous => 1,
        TransferKind::Bulk => 2,
        TransferKind::Interrupt => 3,
    }
}

unsafe extern "C" fn control_ep(ctx: *mut c_void) -> u8 {
    state_ref(ctx).ep_address
}

unsafe extern "C" fn control_read_iso_packet_descriptors(
    ctx: *mut c_void,
    out_descriptors: *mut RawIsoPacketDescriptor,
    out_count: usize,
) {
    let state = state_ref(ctx);
    let inner = state.inner.lock().unwrap();
    let n = out_count.min(inner.iso_packets.len());
    for (i, packet) in inner.iso_packets.iter().take(n).enumerate() {
        *out_descriptors.add(i) = RawIsoPacketDescriptor {
            length: packet.length,
            actual_length: packet.actual_length,
            status: packet.status,
        };
    }
}

unsafe extern "C" fn control_iso_packet_descriptor_count(ctx: *mut c_void) -> usize {
    state_ref(ctx).inner.lock().unwrap().iso_packets.len()
}

unsafe extern "C" fn control_fill_iso_packet_descriptors(
    ctx: *mut c_void,
    data: *const RawIsoPacketDescriptor,
    count: usize,
) {
    let state = state_ref(ctx);
    let mut inner = state.inner.lock().unwrap();
    let n = count.min(inner.iso_packets.len());
    for i in 0..n {
        let raw = *data.add(i);
        inner.iso_packets[i] = IsoPacket {
            length: raw.length,
            actual_length: raw.actual_length,
            status: raw.status,
        };
    }
}

fn make_control(state: &Arc<MockTransferState>) -> MockTransferControl {
    MockTransferControl {
        ctx: Arc::as_ptr(state) as *mut c_void,
        complete: control_complete,
        is_in: control_is_in,
        is_out: control_is_out,
        fill: control_fill,
        read: control_read,
        size: control_size,
        transfer_type: control_transfer_type,
        ep: control_ep,
        read_iso_packet_descriptors: control_read_iso_packet_descriptors,
        iso_packet_descriptor_count: control_iso_packet_descriptor_count,
        fill_iso_packet_descriptors: control_fill_iso_packet_descriptors,
    }
}

pub struct MockBacking {
    tree: Tree,
    plugin: Arc<PluginHandle>,
    table: Arc<TransferTable>,
    altsettings: Mutex<HashMap<u8, u8>>,
}

impl MockBacking {
    pub fn new(tree: Tree, plugin: PluginHandle) -> Self {
        Self {
            tree,
            plugin: Arc::new(plugin),
            table: Arc::new(TransferTable::new()),
            altsettings: Mutex::new(HashMap::new()),
        }
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    fn submit(&self, info: TransferInfo) -> Result<(), BackingError> {
        let handle = self.table.allocate_mock_handle();

        let packet_count = info.iso.as_ref().map_or(0, |iso| iso.packet_count);
        let packet_length = if packet_count > 0 {
            (info.buffer.len() / packet_count) as u32
        } else {
            0
        };
        let iso_packets = vec![
            IsoPacket {
                length: packet_length,
                actual_length: 0,
                status: 0,
            };
            packet_count
        ];

        let state = Arc::new(MockTransferState {
            handle,
            ep_address: info.ep_address,
            kind: info.kind,
            table: self.table.clone(),
            plugin: self.plugin.clone(),
            completed: AtomicBool::new(false),
            inner: Mutex::new(MockTransferInner {
                buffer: info.buffer,
                actual_length: 0,
                iso_packets,
            }),
        });

        // On cancel the release hook must free the transfer without plugin
        // cooperation: it reclaims the reference riding in `ctx` unless the
        // plugin already completed, then drops its own.
        let release_state = state.clone();
        let release: Box<dyn FnOnce() + Send> = Box::new(move || {
            if !release_state.completed.swap(true, Ordering::SeqCst) {
                unsafe {
                    drop(Arc::from_raw(Arc::as_ptr(&release_state)));
                }
            }
        });
        self.table
            .attach_mock(handle, info.seqnum, release, info.callback)
            .map_err(|_| BackingError::DeviceGone)?;

        // This reference rides in `ctx` and is reclaimed by whichever of
        // `complete` and the release hook runs first.
        let ctx_state = state.clone();
        let control = make_control(&ctx_state);
        std::mem::forget(ctx_state);

        self.plugin.on_transfer_request(control);
        Ok(())
    }
}

impl Backing for MockBacking {
    fn device_descriptor(&self) -> Vec<u8> {
        self.tree.pack_device_descriptor()
    }

    fn config_descriptor(&self, index: u8) -> Vec<u8> {
        self.tree.pack_config_descriptor(index)
    }

    fn string_descriptor(&self, language_id: u16, index: u8) -> Vec<u8> {
        self.tree.pack_string_descriptor(language_id, index)
    }

    fn bos_descriptor(&self) -> Vec<u8> {
        self.tree.pack_bos_descriptor()
    }

    fn report_descriptor(&self) -> Vec<u8> {
        self.tree.pack_report_descriptor()
    }

    fn endpoint_transfer_type(&self, address: u8) -> Result<TransferKind, BackingError> {
        self.tree
            .endpoint_transfer_type(address)
            .map_err(|_| BackingError::NoSuchEndpoint(address))
    }

    fn is_self_powered(&self) -> bool {
        self.tree.is_self_powered()
    }

    fn set_configuration(&self, value: u8) -> Result<(), BackingError> {
        match self.plugin.on_set_configuration(value) {
            0 => Ok(()),
            code => Err(BackingError::from_libusb_code(code)),
        }
    }

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), BackingError> {
        match self.plugin.on_set_interface(interface, alt_setting) {
            0 => {
                self.altsettings
                    .lock()
                    .unwrap()
                    .insert(interface, alt_setting);
                Ok(())
            }
            code => Err(BackingError::from_libusb_code(code)),
        }
    }

    fn current_altsetting(&self, interface: u8) -> u8 {
        self.altsettings
            .lock()
            .unwrap()
            .get(&interface)
            .copied()
            .unwrap_or(0)
    }

    fn speed(&self) -> DeviceSpeed {
        DeviceSpeed::from_bcd_usb(self.tree.device.bcd_usb)
    }

    fn transfer_table(&self) -> Arc<TransferTable> {
        self.table.clone()
    }

    fn submit_bulk(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit(info)
    }

    fn submit_interrupt(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit(info)
    }

    fn submit_iso(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit(info)
    }

    fn submit_control(
        &self,
        setup: SetupPacket,
        out_payload: &[u8],
    ) -> Result<Vec<u8>, BackingError> {
        let mut data = vec![0u8; setup.length as usize];
        let n = out_payload.len().min(data.len());
        data[..n].copy_from_slice(&out_payload[..n]);

        let raw = RawControlSetup {
            bm_request_type: setup.request_type,
            b_request: setup.request,
            w_value: setup.value,
            w_index: setup.index,
            w_length: setup.length,
        };

        let result = self.plugin.on_control_setup(raw, &mut data);
        if result >= 0 {
            data.truncate(result as usize);
            Ok(data)
        } else {
            Err(BackingError::from_libusb_code(result))
        }
    }

    fn cancel_transfers(&self) {
        self.table.cancel_all();
    }
}

//! The plain-C plugin ABI.
//!
//! Mock backings are driven by externally loaded plugins. Everything that
//! crosses the boundary is a `#[repr(C)]` struct of function pointers; the
//! bridge implements the transfer-control vtable, the plugin implements the
//! device vtable, and the catalog API is what a plugin's `on_plug` entry
//! point registers its device factories against.
//!
//! Status codes on this surface are libusb return codes (0 success,
//! `LIBUSB_ERROR_NOT_SUPPORTED` for unhandled requests); per-packet ISO
//! statuses are libusb transfer statuses (0 completed).

use std::ffi::{c_char, c_int, c_uint, c_void};

/// The 8 setup bytes in struct form, field for field as libusb lays it out.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawControlSetup {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

/// One ISO packet slot, layout-compatible with
/// `libusb_iso_packet_descriptor`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawIsoPacketDescriptor {
    pub length: c_uint,
    pub actual_length: c_uint,
    pub status: c_int,
}

/// Bridge-implemented view of one in-flight transfer, handed to the plugin's
/// `on_transfer_request`. The plugin reads or fills the buffer and then calls
/// `complete` exactly once; after `complete` the control value is dead.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MockTransferControl {
    pub ctx: *mut c_void,
    /// Finishes the transfer and routes its completion through the bridge.
    pub complete: unsafe extern "C" fn(ctx: *mut c_void),
    pub is_in: unsafe extern "C" fn(ctx: *mut c_void) -> bool,
    pub is_out: unsafe extern "C" fn(ctx: *mut c_void) -> bool,
    /// IN transfers: stores `size` bytes as the device's answer.
    pub fill: unsafe extern "C" fn(ctx: *mut c_void, data: *const u8, size: usize),
    /// OUT transfers: copies the host's bytes out. `size == 0` reads the
    /// whole buffer.
    pub read: unsafe extern "C" fn(ctx: *mut c_void, data: *mut u8, size: u32),
    /// Transfer buffer capacity in bytes.
    pub size: unsafe extern "C" fn(ctx: *mut c_void) -> c_int,
    /// Endpoint transfer type (0 control, 1 iso, 2 bulk, 3 interrupt).
    pub transfer_type: unsafe extern "C" fn(ctx: *mut c_void) -> u8,
    /// Endpoint address including the direction bit.
    pub ep: unsafe extern "C" fn(ctx: *mut c_void) -> u8,
    pub read_iso_packet_descriptors: unsafe extern "C" fn(
        ctx: *mut c_void,
        out_descriptors: *mut RawIsoPacketDescriptor,
        out_count: usize,
    ),
    pub iso_packet_descriptor_count: unsafe extern "C" fn(ctx: *mut c_void) -> usize,
    pub fill_iso_packet_descriptors: unsafe extern "C" fn(
        ctx: *mut c_void,
        data: *const RawIsoPacketDescriptor,
        count: usize,
    ),
}

/// Plugin-implemented device. `destroy` is part of the ABI: the handle that
/// created the value also knows how to tear it down.
#[repr(C)]
pub struct MockDevice {
    pub ctx: *mut c_void,
    pub on_transfer_request:
        unsafe extern "C" fn(ctx: *mut c_void, xfer: MockTransferControl),
    /// Handles a control setup. `data` is a `w_length`-sized buffer holding
    /// the OUT payload on entry; the plugin writes its answer in place and
    /// returns the byte count, or a negative libusb code.
    pub on_control_setup: unsafe extern "C" fn(
        ctx: *mut c_void,
        setup: RawControlSetup,
        data: *mut u8,
        data_size: usize,
        result: c_int,
    ) -> c_int,
    pub on_set_configuration: unsafe extern "C" fn(ctx: *mut c_void, index: u8) -> c_int,
    pub on_set_interface:
        unsafe extern "C" fn(ctx: *mut c_void, interface: u8, alt_setting: u8) -> c_int,
    /// Post-completion hook; recorder-style plugins observe finished
    /// transfers here.
    pub on_transfer_complete:
        unsafe extern "C" fn(ctx: *mut c_void, xfer: MockTransferControl),
    pub destroy: Option<unsafe extern "C" fn(device: *mut MockDevice)>,
}

/// Factory registered per device name by a plugin.
pub type DeviceFactoryFn = unsafe extern "C" fn() -> *mut MockDevice;

/// Catalog surface passed to a plugin's `on_plug` entry point.
#[repr(C)]
pub struct PluginCatalogApi {
    pub ctx: *mut c_void,
    pub set_name: unsafe extern "C" fn(ctx: *mut c_void, name: *const c_char),
    pub set_version: unsafe extern "C" fn(ctx: *mut c_void, version: *const c_char),
    pub register_device: unsafe extern "C" fn(
        ctx: *mut c_void,
        device_name: *const c_char,
        factory: DeviceFactoryFn,
    ),
}

/// Entry point every plugin exports.
pub type OnPlugFn = unsafe extern "C" fn(api: *mut PluginCatalogApi);

/// Symbol name the plugin loader resolves.
pub const ON_PLUG_SYMBOL: &[u8] = b"on_plug\0";

#[cfg(test)]
mod tests {
    use std::ffi::{c_char, c_void, CStr};

    use super::*;

    #[derive(Default)]
    struct Catalog {
        name: Option<String>,
        version: Option<String>,
        devices: Vec<String>,
    }

    unsafe fn catalog<'a>(ctx: *mut c_void) -> &'a mut Catalog {
        &mut *(ctx as *mut Catalog)
    }

    unsafe fn text(ptr: *const c_char) -> String {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }

    unsafe extern "C" fn set_name(ctx: *mut c_void, name: *const c_char) {
        catalog(ctx).name = Some(text(name));
    }

    unsafe extern "C" fn set_version(ctx: *mut c_void, version: *const c_char) {
        catalog(ctx).version = Some(text(version));
    }

    unsafe extern "C" fn register_device(
        ctx: *mut c_void,
        device_name: *const c_char,
        _factory: DeviceFactoryFn,
    ) {
        catalog(ctx).devices.push(text(device_name));
    }

    unsafe extern "C" fn null_factory() -> *mut MockDevice {
        std::ptr::null_mut()
    }

    /// A plugin's `on_plug`, as the loader would resolve and call it.
    unsafe extern "C" fn on_plug(api: *mut PluginCatalogApi) {
        ((*api).set_name)((*api).ctx, b"demo\0".as_ptr() as *const c_char);
        ((*api).set_version)((*api).ctx, b"1.0\0".as_ptr() as *const c_char);
        ((*api).register_device)((*api).ctx, b"mouse\0".as_ptr() as *const c_char, null_factory);
    }

    #[test]
    fn on_plug_registers_through_the_catalog_api() {
        let mut catalog = Catalog::default();
        let mut api = PluginCatalogApi {
            ctx: &mut catalog as *mut Catalog as *mut c_void,
            set_name,
            set_version,
            register_device,
        };

        let entry: OnPlugFn = on_plug;
        unsafe { entry(&mut api) };

        assert_eq!(catalog.name.as_deref(), Some("demo"));
        assert_eq!(catalog.version.as_deref(), Some("1.0"));
        assert_eq!(catalog.devices, vec!["mouse".to_owned()]);
    }

    #[test]
    fn on_plug_symbol_is_nul_terminated() {
        assert_eq!(ON_PLUG_SYMBOL.last(), Some(&0));
    }
}

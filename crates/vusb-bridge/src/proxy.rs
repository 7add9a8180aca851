//! Live-device backing: forwards every operation to a real USB device
//! through libusb.
//!
//! Opens exactly one `(vid, pid)` match, auto-detaches any bound kernel
//! driver and claims every interface of the active configuration. Descriptor
//! GETs are answered with the device's own packed bytes; asynchronous
//! bulk/interrupt/ISO submissions go through the raw transfer plumbing in
//! [`usbffi`] and complete on the event-pump thread, the only thread allowed
//! to drive libusb's event loop.

mod usbffi;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, warn};

use vusb_descriptors::{
    Bos, Config, DeviceDescriptor, StringDescriptorMap, TransferKind, Tree, DT_BOS, DT_CONFIG,
    DT_DEVICE, DT_REPORT, DT_STRING,
};
use vusb_protocol::{SetupPacket, REQUEST_GET_DESCRIPTOR};

use crate::backing::{Backing, DeviceSpeed, TransferInfo};
use crate::error::BackingError;
use crate::transfer::TransferTable;

// Zero means no timeout: a control transfer waits as long as the device
// needs, like the URB it stands in for.
const CONTROL_TIMEOUT: Duration = Duration::ZERO;
const EVENT_POLL: libc::timeval = libc::timeval {
    tv_sec: 0,
    tv_usec: 100_000,
};
const MAX_REPORT_DESCRIPTOR: usize = 4096;

pub struct ProxyBacking {
    context: Context,
    handle: DeviceHandle<Context>,
    speed: DeviceSpeed,
    table: Arc<TransferTable>,
    active_config: Mutex<Config>,
    claimed: Mutex<Vec<u8>>,
    altsettings: Mutex<HashMap<u8, u8>>,
    shutdown: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyBacking {
    /// Opens the single device matching `(vid, pid)` and starts the event
    /// pump.
    pub fn open(vid: u16, pid: u16) -> Result<Self, BackingError> {
        let context = Context::new().map_err(BackingError::from_rusb)?;

        let devices = context.devices().map_err(BackingError::from_rusb)?;
        let mut matched = None;
        for device in devices.iter() {
            let descriptor = device.device_descriptor().map_err(BackingError::from_rusb)?;
            if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
                if matched.is_some() {
                    warn!(vid, pid, "multiple matching devices, using the first");
                    break;
                }
                matched = Some(device);
            }
        }
        let device = matched.ok_or(BackingError::DeviceGone)?;
        let speed = map_speed(device.speed());

        let handle = device.open().map_err(BackingError::from_rusb)?;
        if let Err(err) = handle.set_auto_detach_kernel_driver(true) {
            debug!(%err, "kernel driver auto-detach unavailable, continuing");
        }

        let backing = Self {
            context,
            handle,
            speed,
            table: Arc::new(TransferTable::new()),
            active_config: Mutex::new(Config::default()),
            claimed: Mutex::new(Vec::new()),
            altsettings: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        };

        let config = Config::parse(&backing.read_active_config_bytes()?)
            .map_err(|_| BackingError::LibraryFailure(rusb::Error::Other))?;
        *backing.active_config.lock().unwrap() = config;
        backing.claim_interfaces()?;
        backing.start_event_pump();

        Ok(backing)
    }

    /// Captures the device's full descriptor tree, for persisting with the
    /// descriptor store.
    pub fn snapshot_tree(&self) -> Result<Tree, BackingError> {
        let device = DeviceDescriptor::parse(&self.read_descriptor(DT_DEVICE, 0, 0, 18)?)
            .map_err(|_| BackingError::LibraryFailure(rusb::Error::Other))?;
        let config = self.active_config.lock().unwrap().clone();
        let strings = self.read_string_descriptors();
        let report = self.report_descriptor();
        let bos = match self.read_bos_bytes() {
            Some(bytes) => {
                Bos::parse(&bytes).map_err(|_| BackingError::LibraryFailure(rusb::Error::Other))?
            }
            None => Bos::default(),
        };
        Ok(Tree::new(device, config, strings, report, bos))
    }

    fn start_event_pump(&self) {
        let context = self.context.clone();
        let shutdown = self.shutdown.clone();
        let pump = thread::Builder::new()
            .name("usb-event-pump".to_owned())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let mut tv = EVENT_POLL;
                    let rc = unsafe {
                        rusb::ffi::libusb_handle_events_timeout_completed(
                            context.as_raw(),
                            &mut tv as *mut libc::timeval,
                            std::ptr::null_mut(),
                        )
                    };
                    if rc != 0 {
                        warn!(rc, "libusb event handling failed");
                        break;
                    }
                }
            })
            .expect("failed to spawn usb-event-pump");
        *self.pump.lock().unwrap() = Some(pump);
    }

    fn claim_interfaces(&self) -> Result<(), BackingError> {
        let count = self.active_config.lock().unwrap().descriptor.b_num_interfaces;
        let mut claimed = self.claimed.lock().unwrap();
        for interface in 0..count {
            self.handle
                .claim_interface(interface)
                .map_err(BackingError::from_rusb)?;
            claimed.push(interface);
        }
        Ok(())
    }

    fn release_interfaces(&self) -> Result<(), BackingError> {
        let mut claimed = self.claimed.lock().unwrap();
        for interface in claimed.drain(..) {
            self.handle
                .release_interface(interface)
                .map_err(BackingError::from_rusb)?;
        }
        Ok(())
    }

    /// Raw GET_DESCRIPTOR control-in.
    fn read_descriptor(
        &self,
        descriptor_type: u8,
        index: u8,
        language_id: u16,
        length: usize,
    ) -> Result<Vec<u8>, BackingError> {
        let mut buffer = vec![0u8; length];
        let n = self
            .handle
            .read_control(
                0x80,
                REQUEST_GET_DESCRIPTOR,
                (u16::from(descriptor_type) << 8) | u16::from(index),
                language_id,
                &mut buffer,
                CONTROL_TIMEOUT,
            )
            .map_err(BackingError::from_rusb)?;
        buffer.truncate(n);
        Ok(buffer)
    }

    /// The active configuration's full packed bytes (`wTotalLength` worth).
    fn read_active_config_bytes(&self) -> Result<Vec<u8>, BackingError> {
        let value = self
            .handle
            .active_configuration()
            .map_err(BackingError::from_rusb)?;
        // Configuration indices are zero-based; values usually start at 1.
        let index = value.saturating_sub(1);
        self.read_config_bytes(index)
    }

    fn read_config_bytes(&self, index: u8) -> Result<Vec<u8>, BackingError> {
        let header = self.read_descriptor(DT_CONFIG, index, 0, 9)?;
        if header.len() < 4 {
            return Err(BackingError::Stall);
        }
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        self.read_descriptor(DT_CONFIG, index, 0, total.max(9))
    }

    fn read_bos_bytes(&self) -> Option<Vec<u8>> {
        let header = self.read_descriptor(DT_BOS, 0, 0, 5).ok()?;
        if header.len() < 4 {
            return None;
        }
        let total = u16::from_le_bytes([header[2], header[3]]) as usize;
        self.read_descriptor(DT_BOS, 0, 0, total.max(5)).ok()
    }

    /// Enumerates every string descriptor the device exposes, walking the
    /// supported-language list and probing indices until the first gap.
    fn read_string_descriptors(&self) -> StringDescriptorMap {
        let mut strings = StringDescriptorMap::new();

        let Ok(languages) = self.read_descriptor(DT_STRING, 0, 0, 255) else {
            return strings;
        };
        if languages.len() < 4 {
            return strings;
        }
        strings.insert(0, vec![languages.clone()]);

        let language_ids: Vec<u16> = languages[2..]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        for language_id in language_ids {
            let mut descriptors = Vec::new();
            for index in 1..=u8::MAX {
                match self.read_descriptor(DT_STRING, index, language_id, 255) {
                    Ok(descriptor) if descriptor.len() > 2 => descriptors.push(descriptor),
                    _ => break,
                }
            }
            if !descriptors.is_empty() {
                strings.insert(language_id, descriptors);
            }
        }

        strings
    }

    fn submit_async(&self, info: TransferInfo) -> Result<(), BackingError> {
        let iso_packets = info.iso.as_ref().map_or(0, |iso| iso.packet_count);
        let xfer = unsafe {
            usbffi::fill_transfer(
                self.handle.as_raw(),
                info.ep_address,
                info.kind,
                info.buffer,
                iso_packets,
                self.table.clone(),
            )
        };

        let key = usbffi::handle_key(xfer);
        if self
            .table
            .attach_device(key, info.seqnum, usbffi::cancel_hook(xfer), info.callback)
            .is_err()
        {
            unsafe { usbffi::abandon(xfer) };
            return Err(BackingError::DeviceGone);
        }

        if let Err(err) = unsafe { usbffi::submit(xfer) } {
            self.table.release(key);
            unsafe { usbffi::abandon(xfer) };
            return Err(err);
        }
        Ok(())
    }
}

impl Backing for ProxyBacking {
    fn device_descriptor(&self) -> Vec<u8> {
        let mut out = match self.read_descriptor(DT_DEVICE, 0, 0, 18) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "device descriptor read failed");
                return Vec::new();
            }
        };
        match self.read_active_config_bytes() {
            Ok(config) => out.extend_from_slice(&config),
            Err(err) => warn!(%err, "active config read failed"),
        }
        out
    }

    fn config_descriptor(&self, index: u8) -> Vec<u8> {
        self.read_config_bytes(index).unwrap_or_else(|err| {
            warn!(%err, index, "config descriptor read failed");
            Vec::new()
        })
    }

    fn string_descriptor(&self, language_id: u16, index: u8) -> Vec<u8> {
        self.read_descriptor(DT_STRING, index, language_id, 255)
            .unwrap_or_default()
    }

    fn bos_descriptor(&self) -> Vec<u8> {
        self.read_bos_bytes().unwrap_or_default()
    }

    fn report_descriptor(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; MAX_REPORT_DESCRIPTOR];
        match self.handle.read_control(
            0x81, // device-to-host, standard, interface
            REQUEST_GET_DESCRIPTOR,
            u16::from(DT_REPORT) << 8,
            0,
            &mut buffer,
            CONTROL_TIMEOUT,
        ) {
            Ok(n) => {
                buffer.truncate(n);
                buffer
            }
            Err(_) => Vec::new(),
        }
    }

    fn endpoint_transfer_type(&self, address: u8) -> Result<TransferKind, BackingError> {
        let config = self.active_config.lock().unwrap();
        config
            .interfaces
            .iter()
            .flat_map(|iface| &iface.altsettings)
            .flat_map(|alt| &alt.endpoints)
            .find(|ep| ep.descriptor.b_endpoint_address == address)
            .map(|ep| TransferKind::from_attributes(ep.descriptor.bm_attributes))
            .ok_or(BackingError::NoSuchEndpoint(address))
    }

    fn is_self_powered(&self) -> bool {
        (self.active_config.lock().unwrap().descriptor.bm_attributes & 0x40) != 0
    }

    fn set_configuration(&self, value: u8) -> Result<(), BackingError> {
        let current = self
            .handle
            .active_configuration()
            .map_err(BackingError::from_rusb)?;
        if current == value {
            return Ok(());
        }

        self.handle
            .set_auto_detach_kernel_driver(false)
            .map_err(BackingError::from_rusb)?;
        self.release_interfaces()?;
        self.handle
            .set_active_configuration(value)
            .map_err(BackingError::from_rusb)?;
        self.handle
            .set_auto_detach_kernel_driver(true)
            .map_err(BackingError::from_rusb)?;

        let config = Config::parse(&self.read_active_config_bytes()?)
            .map_err(|_| BackingError::LibraryFailure(rusb::Error::Other))?;
        *self.active_config.lock().unwrap() = config;
        self.claim_interfaces()
    }

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), BackingError> {
        self.handle
            .set_alternate_setting(interface, alt_setting)
            .map_err(BackingError::from_rusb)?;
        self.altsettings
            .lock()
            .unwrap()
            .insert(interface, alt_setting);
        Ok(())
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
        self.speed
    }

    fn transfer_table(&self) -> Arc<TransferTable> {
        self.table.clone()
    }

    fn submit_bulk(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit_async(info)
    }

    fn submit_interrupt(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit_async(info)
    }

    fn submit_iso(&self, info: TransferInfo) -> Result<(), BackingError> {
        self.submit_async(info)
    }

    fn submit_control(
        &self,
        setup: SetupPacket,
        out_payload: &[u8],
    ) -> Result<Vec<u8>, BackingError> {
        if setup.is_device_to_host() {
            let mut buffer = vec![0u8; setup.length as usize];
            let n = self
                .handle
                .read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut buffer,
                    CONTROL_TIMEOUT,
                )
                .map_err(BackingError::from_rusb)?;
            buffer.truncate(n);
            Ok(buffer)
        } else {
            let mut data = vec![0u8; setup.length as usize];
            let n = out_payload.len().min(data.len());
            data[..n].copy_from_slice(&out_payload[..n]);
            self.handle
                .write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &data,
                    CONTROL_TIMEOUT,
                )
                .map_err(BackingError::from_rusb)?;
            Ok(Vec::new())
        }
    }

    fn cancel_transfers(&self) {
        // The event pump keeps running while this drains; cancelled
        // completions arrive through it.
        self.table.cancel_all();
    }
}

impl Drop for ProxyBacking {
    fn drop(&mut self) {
        self.table.cancel_all();
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().unwrap().take() {
            let _ = pump.join();
        }
        if let Err(err) = self.release_interfaces() {
            warn!(%err, "failed to release interfaces");
        }
    }
}

fn map_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_mapping_matches_vhci_codes() {
        assert_eq!(map_speed(rusb::Speed::Low).code(), 1);
        assert_eq!(map_speed(rusb::Speed::Full).code(), 2);
        assert_eq!(map_speed(rusb::Speed::High).code(), 3);
        assert_eq!(map_speed(rusb::Speed::Super).code(), 5);
        assert_eq!(map_speed(rusb::Speed::SuperPlus).code(), 6);
    }
}

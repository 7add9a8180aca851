//! USB descriptor tree.
//!
//! A typed, immutable-after-construction model of the full descriptor
//! hierarchy a device exposes: device / configuration / interface /
//! altsetting / endpoint, plus string descriptors, the HID report descriptor
//! and the USB 3.x BOS group. Every container carries an opaque trailing
//! `extra` byte vector preserved verbatim — class-specific descriptors (HID,
//! audio companions, SuperSpeed endpoint companions) ride along uninterpreted,
//! which is what makes round-trips byte-exact.
//!
//! Three byte layouts live here:
//! - the *packed* layout (`pack_*`): exactly what a real device returns for a
//!   `GET_DESCRIPTOR`, little-endian integer fields, nested containers inline;
//! - the *stream* layout (`save`/`load`): whitespace-separated decimal
//!   integers with length-prefixed vectors, preserving container shape;
//! - the *vendor JSON* form, flattened by [`json`] into the stream layout.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

mod json;
mod model;
mod parse;
mod stream;

pub use model::{
    Altsetting, Bos, BosDescriptor, Config, ConfigDescriptor, DeviceCapability,
    DeviceCapabilityDescriptor, DeviceDescriptor, Endpoint, EndpointDescriptor, Interface,
    InterfaceDescriptor,
};

// Descriptor type codes, as carried in the high byte of a GET_DESCRIPTOR
// wValue.
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_STRING: u8 = 0x03;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;
pub const DT_BOS: u8 = 0x0F;
pub const DT_DEVICE_CAPABILITY: u8 = 0x10;
pub const DT_HID: u8 = 0x21;
pub const DT_REPORT: u8 = 0x22;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("no endpoint with address {address:#04x}")]
    EndpointNotFound { address: u8 },
    #[error("descriptor stream ended early while reading {context}")]
    UnexpectedEof { context: &'static str },
    #[error("invalid descriptor stream token {token:?}: {context}")]
    Parse { token: String, context: &'static str },
    #[error("vendor JSON: {0}")]
    Json(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// `bmAttributes & 0x03` of an endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    pub fn from_attributes(bm_attributes: u8) -> Self {
        match bm_attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Ordered map of `language id -> raw string descriptors`.
///
/// Language id 0 stores the supported-languages descriptor itself at slot 0.
/// For every other language, slot `i` holds the descriptor with index `i + 1`.
pub type StringDescriptorMap = BTreeMap<u16, Vec<Vec<u8>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub device: DeviceDescriptor,
    pub config: Config,
    pub strings: StringDescriptorMap,
    pub report: Vec<u8>,
    pub bos: Bos,
}

impl Tree {
    pub fn new(
        device: DeviceDescriptor,
        config: Config,
        strings: StringDescriptorMap,
        report: Vec<u8>,
        bos: Bos,
    ) -> Self {
        Self {
            device,
            config,
            strings,
            report,
            bos,
        }
    }

    /// Loads a tree from the persisted stream format, or from the vendor JSON
    /// form when the path carries a `.json` extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DescriptorError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_stream_str(&json::flatten(&text)?)
        } else {
            Self::from_stream_str(&text)
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DescriptorError> {
        fs::write(path, self.to_stream_string())?;
        Ok(())
    }

    pub fn from_stream_str(text: &str) -> Result<Self, DescriptorError> {
        stream::read_tree(&mut stream::Reader::new(text))
    }

    pub fn to_stream_string(&self) -> String {
        stream::write_tree(self)
    }

    pub fn device_descriptor(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// The 18-byte DEVICE descriptor followed by the packed default
    /// configuration, matching the kernel's single-GET enumeration probe.
    pub fn pack_device_descriptor(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.device.pack_into(&mut out);
        self.config.pack_into(&mut out);
        out
    }

    /// The full configuration descriptor: every interface, altsetting and
    /// endpoint with their extras emitted inline, which is what produces the
    /// `wTotalLength` the kernel expects.
    pub fn pack_config_descriptor(&self, _index: u8) -> Vec<u8> {
        let mut out = Vec::new();
        self.config.pack_into(&mut out);
        out
    }

    /// Raw string descriptor bytes, or empty when the language or index is
    /// absent. Index 0 reads slot 0 (the supported-languages descriptor under
    /// language 0); any other index reads slot `index - 1`.
    pub fn pack_string_descriptor(&self, language_id: u16, index: u8) -> Vec<u8> {
        let Some(strings) = self.strings.get(&language_id) else {
            return Vec::new();
        };
        let slot = if index == 0 { 0 } else { index as usize - 1 };
        strings.get(slot).cloned().unwrap_or_default()
    }

    pub fn pack_bos_descriptor(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.bos.pack_into(&mut out);
        out
    }

    pub fn pack_report_descriptor(&self) -> Vec<u8> {
        self.report.clone()
    }

    /// Walks every interface and altsetting for the endpoint whose
    /// `bEndpointAddress` matches `address` and returns its transfer type.
    pub fn endpoint_transfer_type(&self, address: u8) -> Result<TransferKind, DescriptorError> {
        self.config
            .interfaces
            .iter()
            .flat_map(|iface| &iface.altsettings)
            .flat_map(|alt| &alt.endpoints)
            .find(|ep| ep.descriptor.b_endpoint_address == address)
            .map(|ep| TransferKind::from_attributes(ep.descriptor.bm_attributes))
            .ok_or(DescriptorError::EndpointNotFound { address })
    }

    /// Bit 6 of the configuration's `bmAttributes`.
    pub fn is_self_powered(&self) -> bool {
        (self.config.descriptor.bm_attributes & 0x40) != 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) fn sample_tree() -> Tree {
        let endpoint_in = Endpoint {
            descriptor: EndpointDescriptor {
                b_length: 7,
                b_descriptor_type: DT_ENDPOINT,
                b_endpoint_address: 0x81,
                bm_attributes: 0x03,
                w_max_packet_size: 8,
                b_interval: 10,
                b_refresh: 0,
                b_synch_address: 0,
            },
            extra: vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00],
        };
        let endpoint_out = Endpoint {
            descriptor: EndpointDescriptor {
                b_length: 7,
                b_descriptor_type: DT_ENDPOINT,
                b_endpoint_address: 0x02,
                bm_attributes: 0x02,
                w_max_packet_size: 64,
                b_interval: 0,
                b_refresh: 0,
                b_synch_address: 0,
            },
            extra: Vec::new(),
        };
        let endpoint_iso = Endpoint {
            descriptor: EndpointDescriptor {
                b_length: 9,
                b_descriptor_type: DT_ENDPOINT,
                b_endpoint_address: 0x83,
                bm_attributes: 0x01,
                w_max_packet_size: 64,
                b_interval: 1,
                b_refresh: 0,
                b_synch_address: 0,
            },
            extra: Vec::new(),
        };

        let altsetting = Altsetting {
            descriptor: InterfaceDescriptor {
                b_length: 9,
                b_descriptor_type: DT_INTERFACE,
                b_interface_number: 0,
                b_alternate_setting: 0,
                b_num_endpoints: 3,
                b_interface_class: 3,
                b_interface_sub_class: 1,
                b_interface_protocol: 2,
                i_interface: 0,
            },
            endpoints: vec![endpoint_in, endpoint_out, endpoint_iso],
            extra: Vec::new(),
        };

        let mut config = Config {
            descriptor: ConfigDescriptor {
                b_length: 9,
                b_descriptor_type: DT_CONFIG,
                w_total_length: 0,
                b_num_interfaces: 1,
                b_configuration_value: 1,
                i_configuration: 0,
                bm_attributes: 0xA0,
                max_power: 50,
            },
            interfaces: vec![Interface {
                altsettings: vec![altsetting],
            }],
            extra: Vec::new(),
        };
        config.descriptor.w_total_length = config.packed_len() as u16;

        let mut strings = StringDescriptorMap::new();
        strings.insert(0, vec![vec![0x04, DT_STRING, 0x09, 0x04]]);
        strings.insert(
            0x0409,
            vec![
                vec![0x0A, DT_STRING, b'v', 0, b'u', 0, b's', 0, b'b', 0],
                vec![0x08, DT_STRING, b'd', 0, b'e', 0, b'v', 0],
            ],
        );

        let bos = Bos {
            descriptor: BosDescriptor {
                b_length: 5,
                b_descriptor_type: DT_BOS,
                w_total_length: 12,
                b_num_device_caps: 1,
            },
            capabilities: vec![DeviceCapability {
                descriptor: DeviceCapabilityDescriptor {
                    b_length: 7,
                    b_descriptor_type: DT_DEVICE_CAPABILITY,
                    b_dev_capability_type: 2,
                },
                data: vec![0x02, 0x00, 0x00, 0x00],
            }],
        };

        Tree::new(
            DeviceDescriptor {
                b_length: 18,
                b_descriptor_type: DT_DEVICE,
                bcd_usb: 0x0200,
                b_device_class: 0,
                b_device_sub_class: 0,
                b_device_protocol: 0,
                b_max_packet_size0: 8,
                id_vendor: 0x1D6B,
                id_product: 0x0104,
                bcd_device: 0x0100,
                i_manufacturer: 1,
                i_product: 2,
                i_serial_number: 0,
                b_num_configurations: 1,
            },
            config,
            strings,
            vec![0x05, 0x01, 0x09, 0x02, 0xA1, 0x01, 0xC0],
            bos,
        )
    }

    #[test]
    fn device_descriptor_packs_18_bytes_then_config() {
        let tree = sample_tree();
        let packed = tree.pack_device_descriptor();
        assert_eq!(packed[0], 18);
        assert_eq!(packed[1], DT_DEVICE);
        // idVendor is little-endian at offset 8.
        assert_eq!(&packed[8..10], &[0x6B, 0x1D]);
        assert_eq!(packed.len(), 18 + tree.config.packed_len());
        assert_eq!(packed[18], 9);
        assert_eq!(packed[19], DT_CONFIG);
    }

    #[test]
    fn config_total_length_matches_packed_size() {
        let tree = sample_tree();
        let packed = tree.pack_config_descriptor(0);
        let total = u16::from_le_bytes([packed[2], packed[3]]);
        assert_eq!(packed.len(), total as usize);
        // 9 (config) + 9 (interface) + 7 + 9 (hid extra) + 7 + 9 (audio ep).
        assert_eq!(total, 50);
    }

    #[test]
    fn audio_endpoint_packs_nine_bytes() {
        let tree = sample_tree();
        let packed = tree.pack_config_descriptor(0);
        // The ISO endpoint is last; bLength 9 keeps bRefresh/bSynchAddress.
        let ep = &packed[packed.len() - 9..];
        assert_eq!(ep[0], 9);
        assert_eq!(ep[1], DT_ENDPOINT);
        assert_eq!(ep[2], 0x83);
    }

    #[test]
    fn string_lookup_uses_language_then_index() {
        let tree = sample_tree();
        assert_eq!(tree.pack_string_descriptor(0, 0)[0], 0x04);
        assert_eq!(tree.pack_string_descriptor(0x0409, 1)[2], b'v');
        assert_eq!(tree.pack_string_descriptor(0x0409, 2)[2], b'd');
        assert!(tree.pack_string_descriptor(0x0409, 9).is_empty());
        assert!(tree.pack_string_descriptor(0x0407, 1).is_empty());
    }

    #[test]
    fn bos_packs_header_and_capability_data() {
        let tree = sample_tree();
        let packed = tree.pack_bos_descriptor();
        assert_eq!(packed.len(), 12);
        assert_eq!(packed[0], 5);
        assert_eq!(packed[1], DT_BOS);
        assert_eq!(u16::from_le_bytes([packed[2], packed[3]]), 12);
        assert_eq!(packed[5], 7);
        assert_eq!(&packed[8..], &[0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn endpoint_transfer_type_walks_all_altsettings() {
        let tree = sample_tree();
        assert_eq!(
            tree.endpoint_transfer_type(0x81).unwrap(),
            TransferKind::Interrupt
        );
        assert_eq!(tree.endpoint_transfer_type(0x02).unwrap(), TransferKind::Bulk);
        assert_eq!(
            tree.endpoint_transfer_type(0x83).unwrap(),
            TransferKind::Isochronous
        );
        assert!(matches!(
            tree.endpoint_transfer_type(0x04),
            Err(DescriptorError::EndpointNotFound { address: 0x04 })
        ));
    }

    #[test]
    fn stream_round_trip_is_structural_identity() {
        let tree = sample_tree();
        let text = tree.to_stream_string();
        let reloaded = Tree::from_stream_str(&text).unwrap();
        assert_eq!(reloaded, tree);
        // Double load packs byte-identically.
        let again = Tree::from_stream_str(&reloaded.to_stream_string()).unwrap();
        assert_eq!(
            again.pack_device_descriptor(),
            tree.pack_device_descriptor()
        );
    }

    #[test]
    fn is_self_powered_reads_config_attributes() {
        let mut tree = sample_tree();
        assert!(!tree.is_self_powered());
        tree.config.descriptor.bm_attributes |= 0x40;
        assert!(tree.is_self_powered());
    }
}

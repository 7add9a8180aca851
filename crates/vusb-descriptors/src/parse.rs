//! Parsing packed descriptor bytes back into the tree model.
//!
//! This is the inverse of the `pack_*` layout and follows the same grouping
//! rules libusb applies: descriptors of unknown type attach as `extra` bytes
//! to the most recently parsed config, altsetting or endpoint; bytes past a
//! descriptor's known fields (an over-long `bLength`) land at the front of
//! its `extra`, which keeps pack ∘ parse byte-exact.

use crate::model::{
    Altsetting, Bos, BosDescriptor, Config, ConfigDescriptor, DeviceCapability,
    DeviceCapabilityDescriptor, DeviceDescriptor, Endpoint, EndpointDescriptor, Interface,
    InterfaceDescriptor,
};
use crate::{DescriptorError, DT_DEVICE_CAPABILITY, DT_ENDPOINT, DT_INTERFACE};

fn truncated(context: &'static str) -> DescriptorError {
    DescriptorError::UnexpectedEof { context }
}

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

impl DeviceDescriptor {
    /// Parses the packed 18-byte DEVICE descriptor.
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < Self::PACKED_LEN {
            return Err(truncated("device descriptor"));
        }
        Ok(Self {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            bcd_usb: le16(bytes, 2),
            b_device_class: bytes[4],
            b_device_sub_class: bytes[5],
            b_device_protocol: bytes[6],
            b_max_packet_size0: bytes[7],
            id_vendor: le16(bytes, 8),
            id_product: le16(bytes, 10),
            bcd_device: le16(bytes, 12),
            i_manufacturer: bytes[14],
            i_product: bytes[15],
            i_serial_number: bytes[16],
            b_num_configurations: bytes[17],
        })
    }
}

/// Where unknown trailing descriptors currently attach.
enum ExtraSink {
    Config,
    Altsetting,
    Endpoint,
}

impl Config {
    /// Parses a full packed configuration (the `wTotalLength` bytes a device
    /// returns for `GET_DESCRIPTOR(CONFIG)`).
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < ConfigDescriptor::PACKED_LEN {
            return Err(truncated("config descriptor"));
        }

        let descriptor = ConfigDescriptor {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            w_total_length: le16(bytes, 2),
            b_num_interfaces: bytes[4],
            b_configuration_value: bytes[5],
            i_configuration: bytes[6],
            bm_attributes: bytes[7],
            max_power: bytes[8],
        };

        let mut config = Config {
            descriptor,
            interfaces: Vec::new(),
            extra: Vec::new(),
        };
        // Interface groups in first-seen order, keyed by bInterfaceNumber.
        let mut group_numbers: Vec<u8> = Vec::new();
        let mut sink = ExtraSink::Config;

        let mut pos = (descriptor.b_length as usize).max(ConfigDescriptor::PACKED_LEN);
        if pos > ConfigDescriptor::PACKED_LEN {
            let end = pos.min(bytes.len());
            config
                .extra
                .extend_from_slice(&bytes[ConfigDescriptor::PACKED_LEN..end]);
        }

        while pos + 2 <= bytes.len() {
            let d_len = bytes[pos] as usize;
            let d_type = bytes[pos + 1];
            if d_len < 2 || pos + d_len > bytes.len() {
                return Err(truncated("config sub-descriptor"));
            }
            let d = &bytes[pos..pos + d_len];

            match d_type {
                DT_INTERFACE if d_len >= InterfaceDescriptor::PACKED_LEN => {
                    let altsetting = Altsetting {
                        descriptor: InterfaceDescriptor {
                            b_length: d[0],
                            b_descriptor_type: d[1],
                            b_interface_number: d[2],
                            b_alternate_setting: d[3],
                            b_num_endpoints: d[4],
                            b_interface_class: d[5],
                            b_interface_sub_class: d[6],
                            b_interface_protocol: d[7],
                            i_interface: d[8],
                        },
                        endpoints: Vec::new(),
                        extra: d[InterfaceDescriptor::PACKED_LEN..].to_vec(),
                    };
                    let number = altsetting.descriptor.b_interface_number;
                    let group = match group_numbers.iter().position(|&n| n == number) {
                        Some(idx) => &mut config.interfaces[idx],
                        None => {
                            group_numbers.push(number);
                            config.interfaces.push(Interface::default());
                            config.interfaces.last_mut().unwrap()
                        }
                    };
                    group.altsettings.push(altsetting);
                    sink = ExtraSink::Altsetting;
                }
                DT_ENDPOINT if d_len >= 7 => {
                    let altsetting = config
                        .interfaces
                        .last_mut()
                        .and_then(|iface| iface.altsettings.last_mut())
                        .ok_or(DescriptorError::UnexpectedEof {
                            context: "endpoint before any interface",
                        })?;
                    let audio = d_len >= EndpointDescriptor::AUDIO_PACKED_LEN;
                    altsetting.endpoints.push(Endpoint {
                        descriptor: EndpointDescriptor {
                            b_length: d[0],
                            b_descriptor_type: d[1],
                            b_endpoint_address: d[2],
                            bm_attributes: d[3],
                            w_max_packet_size: le16(d, 4),
                            b_interval: d[6],
                            b_refresh: if audio { d[7] } else { 0 },
                            b_synch_address: if audio { d[8] } else { 0 },
                        },
                        extra: if audio {
                            d[EndpointDescriptor::AUDIO_PACKED_LEN..].to_vec()
                        } else {
                            d[7..].to_vec()
                        },
                    });
                    sink = ExtraSink::Endpoint;
                }
                _ => {
                    let extra = match sink {
                        ExtraSink::Config => &mut config.extra,
                        ExtraSink::Altsetting => {
                            &mut last_altsetting(&mut config)?.extra
                        }
                        ExtraSink::Endpoint => {
                            &mut last_endpoint(&mut config)?.extra
                        }
                    };
                    extra.extend_from_slice(d);
                }
            }

            pos += d_len;
        }

        Ok(config)
    }
}

fn last_altsetting(config: &mut Config) -> Result<&mut Altsetting, DescriptorError> {
    config
        .interfaces
        .last_mut()
        .and_then(|iface| iface.altsettings.last_mut())
        .ok_or(DescriptorError::UnexpectedEof {
            context: "class descriptor before any interface",
        })
}

fn last_endpoint(config: &mut Config) -> Result<&mut Endpoint, DescriptorError> {
    last_altsetting(config)?
        .endpoints
        .last_mut()
        .ok_or(DescriptorError::UnexpectedEof {
            context: "class descriptor before any endpoint",
        })
}

impl Bos {
    /// Parses the packed BOS group (`wTotalLength` bytes).
    pub fn parse(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < BosDescriptor::PACKED_LEN {
            return Err(truncated("bos descriptor"));
        }
        let descriptor = BosDescriptor {
            b_length: bytes[0],
            b_descriptor_type: bytes[1],
            w_total_length: le16(bytes, 2),
            b_num_device_caps: bytes[4],
        };

        let mut capabilities = Vec::new();
        let mut pos = (descriptor.b_length as usize).max(BosDescriptor::PACKED_LEN);
        while pos + 2 <= bytes.len() {
            let d_len = bytes[pos] as usize;
            if d_len < DeviceCapabilityDescriptor::PACKED_LEN || pos + d_len > bytes.len() {
                return Err(truncated("device capability"));
            }
            let d = &bytes[pos..pos + d_len];
            debug_assert_eq!(d[1], DT_DEVICE_CAPABILITY);
            capabilities.push(DeviceCapability {
                descriptor: DeviceCapabilityDescriptor {
                    b_length: d[0],
                    b_descriptor_type: d[1],
                    b_dev_capability_type: d[2],
                },
                data: d[DeviceCapabilityDescriptor::PACKED_LEN..].to_vec(),
            });
            pos += d_len;
        }

        Ok(Self {
            descriptor,
            capabilities,
        })
    }
}

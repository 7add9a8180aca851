//! Typed descriptor records and their packed (wire) layout.
//!
//! Packing order at every level is: the descriptor's own fields, then its
//! `extra` bytes, then its children. Integer fields are little-endian.

/// Standard 18-byte DEVICE descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub const PACKED_LEN: usize = 18;

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.extend_from_slice(&self.bcd_usb.to_le_bytes());
        out.push(self.b_device_class);
        out.push(self.b_device_sub_class);
        out.push(self.b_device_protocol);
        out.push(self.b_max_packet_size0);
        out.extend_from_slice(&self.id_vendor.to_le_bytes());
        out.extend_from_slice(&self.id_product.to_le_bytes());
        out.extend_from_slice(&self.bcd_device.to_le_bytes());
        out.push(self.i_manufacturer);
        out.push(self.i_product);
        out.push(self.i_serial_number);
        out.push(self.b_num_configurations);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const PACKED_LEN: usize = 9;

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.extend_from_slice(&self.w_total_length.to_le_bytes());
        out.push(self.b_num_interfaces);
        out.push(self.b_configuration_value);
        out.push(self.i_configuration);
        out.push(self.bm_attributes);
        out.push(self.max_power);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    pub const PACKED_LEN: usize = 9;

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.push(self.b_interface_number);
        out.push(self.b_alternate_setting);
        out.push(self.b_num_endpoints);
        out.push(self.b_interface_class);
        out.push(self.b_interface_sub_class);
        out.push(self.b_interface_protocol);
        out.push(self.i_interface);
    }
}

/// Endpoint descriptor, stored in its widest (audio, 9-byte) shape.
///
/// `bLength == 9` selects the audio-class packing that keeps `bRefresh` and
/// `bSynchAddress`; anything else packs the 7-byte standard form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
    pub b_refresh: u8,
    pub b_synch_address: u8,
}

impl EndpointDescriptor {
    pub const AUDIO_PACKED_LEN: usize = 9;

    pub fn is_audio(&self) -> bool {
        self.b_length as usize == Self::AUDIO_PACKED_LEN
    }

    pub fn packed_len(&self) -> usize {
        if self.is_audio() {
            9
        } else {
            7
        }
    }

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.push(self.b_endpoint_address);
        out.push(self.bm_attributes);
        out.extend_from_slice(&self.w_max_packet_size.to_le_bytes());
        out.push(self.b_interval);
        if self.is_audio() {
            out.push(self.b_refresh);
            out.push(self.b_synch_address);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub extra: Vec<u8>,
}

impl Endpoint {
    pub fn packed_len(&self) -> usize {
        self.descriptor.packed_len() + self.extra.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        self.descriptor.pack_into(out);
        out.extend_from_slice(&self.extra);
    }
}

/// One altsetting: an interface descriptor plus its endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Altsetting {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<Endpoint>,
    pub extra: Vec<u8>,
}

impl Altsetting {
    pub fn packed_len(&self) -> usize {
        InterfaceDescriptor::PACKED_LEN
            + self.extra.len()
            + self.endpoints.iter().map(Endpoint::packed_len).sum::<usize>()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        self.descriptor.pack_into(out);
        out.extend_from_slice(&self.extra);
        for endpoint in &self.endpoints {
            endpoint.pack_into(out);
        }
    }
}

/// One interface: its ordered altsettings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interface {
    pub altsettings: Vec<Altsetting>,
}

impl Interface {
    pub fn packed_len(&self) -> usize {
        self.altsettings.iter().map(Altsetting::packed_len).sum()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        for altsetting in &self.altsettings {
            altsetting.pack_into(out);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub descriptor: ConfigDescriptor,
    pub interfaces: Vec<Interface>,
    pub extra: Vec<u8>,
}

impl Config {
    pub fn packed_len(&self) -> usize {
        ConfigDescriptor::PACKED_LEN
            + self.extra.len()
            + self.interfaces.iter().map(Interface::packed_len).sum::<usize>()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        self.descriptor.pack_into(out);
        out.extend_from_slice(&self.extra);
        for interface in &self.interfaces {
            interface.pack_into(out);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BosDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_device_caps: u8,
}

impl BosDescriptor {
    pub const PACKED_LEN: usize = 5;

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.extend_from_slice(&self.w_total_length.to_le_bytes());
        out.push(self.b_num_device_caps);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapabilityDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_dev_capability_type: u8,
}

impl DeviceCapabilityDescriptor {
    pub const PACKED_LEN: usize = 3;

    fn pack_into(&self, out: &mut Vec<u8>) {
        out.push(self.b_length);
        out.push(self.b_descriptor_type);
        out.push(self.b_dev_capability_type);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCapability {
    pub descriptor: DeviceCapabilityDescriptor,
    /// Capability payload following the 3 header bytes, kept verbatim.
    pub data: Vec<u8>,
}

impl DeviceCapability {
    pub fn packed_len(&self) -> usize {
        DeviceCapabilityDescriptor::PACKED_LEN + self.data.len()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        self.descriptor.pack_into(out);
        out.extend_from_slice(&self.data);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bos {
    pub descriptor: BosDescriptor,
    pub capabilities: Vec<DeviceCapability>,
}

impl Bos {
    pub fn packed_len(&self) -> usize {
        BosDescriptor::PACKED_LEN
            + self
                .capabilities
                .iter()
                .map(DeviceCapability::packed_len)
                .sum::<usize>()
    }

    pub fn pack_into(&self, out: &mut Vec<u8>) {
        self.descriptor.pack_into(out);
        for capability in &self.capabilities {
            capability.pack_into(out);
        }
    }
}

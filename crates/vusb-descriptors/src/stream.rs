//! The persisted stream format: whitespace-separated decimal integers with
//! length-prefixed vectors.
//!
//! Stream order at every container level is: the descriptor's own fields,
//! then its children (each vector length-prefixed), then its `extra` bytes.
//! Note this differs from the packed layout, which emits extras *before*
//! children; both orders are load-bearing for compatibility.

use std::fmt::Write as _;
use std::str::SplitAsciiWhitespace;

use crate::model::{
    Altsetting, Bos, BosDescriptor, Config, ConfigDescriptor, DeviceCapability,
    DeviceCapabilityDescriptor, DeviceDescriptor, Endpoint, EndpointDescriptor, Interface,
    InterfaceDescriptor,
};
use crate::{DescriptorError, StringDescriptorMap, Tree};

pub(crate) struct Reader<'a> {
    tokens: SplitAsciiWhitespace<'a>,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self {
            tokens: text.split_ascii_whitespace(),
        }
    }

    fn u64(&mut self, context: &'static str) -> Result<u64, DescriptorError> {
        let token = self
            .tokens
            .next()
            .ok_or(DescriptorError::UnexpectedEof { context })?;
        token.parse().map_err(|_| DescriptorError::Parse {
            token: token.to_owned(),
            context,
        })
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, DescriptorError> {
        Ok(self.u64(context)? as u8)
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, DescriptorError> {
        Ok(self.u64(context)? as u16)
    }

    fn len(&mut self, context: &'static str) -> Result<usize, DescriptorError> {
        Ok(self.u64(context)? as usize)
    }

    fn bytes(&mut self, len: usize, context: &'static str) -> Result<Vec<u8>, DescriptorError> {
        (0..len).map(|_| self.u8(context)).collect()
    }

    fn byte_vector(&mut self, context: &'static str) -> Result<Vec<u8>, DescriptorError> {
        let len = self.len(context)?;
        self.bytes(len, context)
    }
}

struct Writer {
    out: String,
}

impl Writer {
    fn new() -> Self {
        Self { out: String::new() }
    }

    fn num(&mut self, value: impl Into<u64>) {
        let _ = write!(self.out, "{} ", value.into());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.num(byte);
        }
    }

    fn byte_vector(&mut self, bytes: &[u8]) {
        self.num(bytes.len() as u64);
        self.bytes(bytes);
    }
}

pub(crate) fn read_tree(r: &mut Reader<'_>) -> Result<Tree, DescriptorError> {
    let device = read_device(r)?;
    let config = read_config(r)?;
    let strings = read_strings(r)?;
    let report = r.byte_vector("report descriptor")?;
    let bos = read_bos(r)?;
    Ok(Tree::new(device, config, strings, report, bos))
}

pub(crate) fn write_tree(tree: &Tree) -> String {
    let mut w = Writer::new();
    write_device(&mut w, &tree.device);
    write_config(&mut w, &tree.config);
    write_strings(&mut w, &tree.strings);
    w.byte_vector(&tree.report);
    write_bos(&mut w, &tree.bos);
    w.out
}

fn read_device(r: &mut Reader<'_>) -> Result<DeviceDescriptor, DescriptorError> {
    const CTX: &str = "device descriptor";
    Ok(DeviceDescriptor {
        b_length: r.u8(CTX)?,
        b_descriptor_type: r.u8(CTX)?,
        bcd_usb: r.u16(CTX)?,
        b_device_class: r.u8(CTX)?,
        b_device_sub_class: r.u8(CTX)?,
        b_device_protocol: r.u8(CTX)?,
        b_max_packet_size0: r.u8(CTX)?,
        id_vendor: r.u16(CTX)?,
        id_product: r.u16(CTX)?,
        bcd_device: r.u16(CTX)?,
        i_manufacturer: r.u8(CTX)?,
        i_product: r.u8(CTX)?,
        i_serial_number: r.u8(CTX)?,
        b_num_configurations: r.u8(CTX)?,
    })
}

fn write_device(w: &mut Writer, d: &DeviceDescriptor) {
    w.num(d.b_length);
    w.num(d.b_descriptor_type);
    w.num(d.bcd_usb);
    w.num(d.b_device_class);
    w.num(d.b_device_sub_class);
    w.num(d.b_device_protocol);
    w.num(d.b_max_packet_size0);
    w.num(d.id_vendor);
    w.num(d.id_product);
    w.num(d.bcd_device);
    w.num(d.i_manufacturer);
    w.num(d.i_product);
    w.num(d.i_serial_number);
    w.num(d.b_num_configurations);
}

fn read_endpoint(r: &mut Reader<'_>) -> Result<Endpoint, DescriptorError> {
    const CTX: &str = "endpoint descriptor";
    let descriptor = EndpointDescriptor {
        b_length: r.u8(CTX)?,
        b_descriptor_type: r.u8(CTX)?,
        b_endpoint_address: r.u8(CTX)?,
        bm_attributes: r.u8(CTX)?,
        w_max_packet_size: r.u16(CTX)?,
        b_interval: r.u8(CTX)?,
        b_refresh: r.u8(CTX)?,
        b_synch_address: r.u8(CTX)?,
    };
    let extra = r.byte_vector("endpoint extra")?;
    Ok(Endpoint { descriptor, extra })
}

fn write_endpoint(w: &mut Writer, ep: &Endpoint) {
    let d = &ep.descriptor;
    w.num(d.b_length);
    w.num(d.b_descriptor_type);
    w.num(d.b_endpoint_address);
    w.num(d.bm_attributes);
    w.num(d.w_max_packet_size);
    w.num(d.b_interval);
    w.num(d.b_refresh);
    w.num(d.b_synch_address);
    w.byte_vector(&ep.extra);
}

fn read_altsetting(r: &mut Reader<'_>) -> Result<Altsetting, DescriptorError> {
    const CTX: &str = "interface descriptor";
    let descriptor = InterfaceDescriptor {
        b_length: r.u8(CTX)?,
        b_descriptor_type: r.u8(CTX)?,
        b_interface_number: r.u8(CTX)?,
        b_alternate_setting: r.u8(CTX)?,
        b_num_endpoints: r.u8(CTX)?,
        b_interface_class: r.u8(CTX)?,
        b_interface_sub_class: r.u8(CTX)?,
        b_interface_protocol: r.u8(CTX)?,
        i_interface: r.u8(CTX)?,
    };
    let endpoint_count = r.len("endpoint count")?;
    let endpoints = (0..endpoint_count)
        .map(|_| read_endpoint(r))
        .collect::<Result<_, _>>()?;
    let extra = r.byte_vector("interface extra")?;
    Ok(Altsetting {
        descriptor,
        endpoints,
        extra,
    })
}

fn write_altsetting(w: &mut Writer, alt: &Altsetting) {
    let d = &alt.descriptor;
    w.num(d.b_length);
    w.num(d.b_descriptor_type);
    w.num(d.b_interface_number);
    w.num(d.b_alternate_setting);
    w.num(d.b_num_endpoints);
    w.num(d.b_interface_class);
    w.num(d.b_interface_sub_class);
    w.num(d.b_interface_protocol);
    w.num(d.i_interface);
    w.num(alt.endpoints.len() as u64);
    for endpoint in &alt.endpoints {
        write_endpoint(w, endpoint);
    }
    w.byte_vector(&alt.extra);
}

fn read_config(r: &mut Reader<'_>) -> Result<Config, DescriptorError> {
    const CTX: &str = "config descriptor";
    let descriptor = ConfigDescriptor {
        b_length: r.u8(CTX)?,
        b_descriptor_type: r.u8(CTX)?,
        w_total_length: r.u16(CTX)?,
        b_num_interfaces: r.u8(CTX)?,
        b_configuration_value: r.u8(CTX)?,
        i_configuration: r.u8(CTX)?,
        bm_attributes: r.u8(CTX)?,
        max_power: r.u8(CTX)?,
    };
    let interface_count = r.len("interface count")?;
    let interfaces = (0..interface_count)
        .map(|_| {
            let altsetting_count = r.len("altsetting count")?;
            let altsettings = (0..altsetting_count)
                .map(|_| read_altsetting(r))
                .collect::<Result<_, _>>()?;
            Ok(Interface { altsettings })
        })
        .collect::<Result<_, DescriptorError>>()?;
    let extra = r.byte_vector("config extra")?;
    Ok(Config {
        descriptor,
        interfaces,
        extra,
    })
}

fn write_config(w: &mut Writer, config: &Config) {
    let d = &config.descriptor;
    w.num(d.b_length);
    w.num(d.b_descriptor_type);
    w.num(d.w_total_length);
    w.num(d.b_num_interfaces);
    w.num(d.b_configuration_value);
    w.num(d.i_configuration);
    w.num(d.bm_attributes);
    w.num(d.max_power);
    w.num(config.interfaces.len() as u64);
    for interface in &config.interfaces {
        w.num(interface.altsettings.len() as u64);
        for altsetting in &interface.altsettings {
            write_altsetting(w, altsetting);
        }
    }
    w.byte_vector(&config.extra);
}

fn read_strings(r: &mut Reader<'_>) -> Result<StringDescriptorMap, DescriptorError> {
    let mut strings = StringDescriptorMap::new();
    let entry_count = r.len("string map size")?;
    for _ in 0..entry_count {
        let language_id = r.u16("language id")?;
        let string_count = r.len("string count")?;
        let descriptors = (0..string_count)
            .map(|_| r.byte_vector("string descriptor"))
            .collect::<Result<_, _>>()?;
        strings.insert(language_id, descriptors);
    }
    Ok(strings)
}

fn write_strings(w: &mut Writer, strings: &StringDescriptorMap) {
    w.num(strings.len() as u64);
    for (&language_id, descriptors) in strings {
        w.num(language_id);
        w.num(descriptors.len() as u64);
        for descriptor in descriptors {
            w.byte_vector(descriptor);
        }
    }
}

fn read_bos(r: &mut Reader<'_>) -> Result<Bos, DescriptorError> {
    const CTX: &str = "bos descriptor";
    let descriptor = BosDescriptor {
        b_length: r.u8(CTX)?,
        b_descriptor_type: r.u8(CTX)?,
        w_total_length: r.u16(CTX)?,
        b_num_device_caps: r.u8(CTX)?,
    };
    let capability_count = r.len("device capability count")?;
    let capabilities = (0..capability_count)
        .map(|_| {
            const CAP: &str = "device capability";
            let descriptor = DeviceCapabilityDescriptor {
                b_length: r.u8(CAP)?,
                b_descriptor_type: r.u8(CAP)?,
                b_dev_capability_type: r.u8(CAP)?,
            };
            let data = r.byte_vector("device capability data")?;
            Ok(DeviceCapability { descriptor, data })
        })
        .collect::<Result<_, DescriptorError>>()?;
    Ok(Bos {
        descriptor,
        capabilities,
    })
}

fn write_bos(w: &mut Writer, bos: &Bos) {
    let d = &bos.descriptor;
    w.num(d.b_length);
    w.num(d.b_descriptor_type);
    w.num(d.w_total_length);
    w.num(d.b_num_device_caps);
    w.num(bos.capabilities.len() as u64);
    for capability in &bos.capabilities {
        w.num(capability.descriptor.b_length);
        w.num(capability.descriptor.b_descriptor_type);
        w.num(capability.descriptor.b_dev_capability_type);
        w.byte_vector(&capability.data);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_tree_round_trips() {
        let tree = Tree::default();
        let text = write_tree(&tree);
        let reloaded = read_tree(&mut Reader::new(&text)).unwrap();
        assert_eq!(reloaded, tree);
    }

    #[test]
    fn eof_reports_context() {
        let err = read_tree(&mut Reader::new("18 1")).unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::UnexpectedEof {
                context: "device descriptor"
            }
        ));
    }

    #[test]
    fn garbage_token_reports_context() {
        let err = read_tree(&mut Reader::new("18 xyz")).unwrap_err();
        match err {
            DescriptorError::Parse { token, .. } => assert_eq!(token, "xyz"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

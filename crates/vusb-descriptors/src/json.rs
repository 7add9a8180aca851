//! Vendor JSON importer.
//!
//! Flattens the lsusb-style JSON device dump into the same token stream the
//! binary loader reads, so both sources build identical trees. Numeric values
//! may appear as JSON integers or as `"0x…"` strings; absent fields read as
//! zero. A `daExtra` byte array and, on endpoints, a structured
//! `"Endpoint Companion"` object become the container's `extra` bytes.

use std::fmt::Write as _;

use serde_json::{Map, Value};

use crate::DescriptorError;

type JsonObject = Map<String, Value>;

struct Flattener {
    out: String,
}

pub(crate) fn flatten(text: &str) -> Result<String, DescriptorError> {
    let root: Value =
        serde_json::from_str(text).map_err(|err| DescriptorError::Json(err.to_string()))?;
    let mut f = Flattener { out: String::new() };
    f.device(&root)?;
    Ok(f.out)
}

fn err(message: impl Into<String>) -> DescriptorError {
    DescriptorError::Json(message.into())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a JsonObject, DescriptorError> {
    value
        .as_object()
        .ok_or_else(|| err(format!("{what} is not an object")))
}

fn object_in<'a>(obj: &'a JsonObject, key: &str) -> Result<&'a JsonObject, DescriptorError> {
    obj.get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| err(format!("missing object {key:?}")))
}

fn array_in<'a>(obj: &'a JsonObject, key: &str) -> Result<&'a Vec<Value>, DescriptorError> {
    obj.get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| err(format!("missing array {key:?}")))
}

/// Accepts a JSON integer or a numeric string; `0x` selects hex and a
/// leading zero octal, as in the C `strtoul(…, 0)` convention.
fn parse_u32(value: &Value) -> Result<u32, DescriptorError> {
    if let Some(n) = value.as_u64() {
        return Ok(n as u32);
    }
    if let Some(s) = value.as_str() {
        let s = s.trim();
        let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16)
        } else if s.len() > 1 && s.starts_with('0') {
            u32::from_str_radix(&s[1..], 8)
        } else {
            s.parse()
        };
        return parsed.map_err(|_| err(format!("expected a number, got {s:?}")));
    }
    Err(err(format!("expected int or numeric string, got {value}")))
}

fn opt_field(obj: &JsonObject, key: &str) -> Result<u32, DescriptorError> {
    obj.get(key).map(parse_u32).transpose().map(Option::unwrap_or_default)
}

impl Flattener {
    fn num(&mut self, value: u32) {
        let _ = write!(self.out, "{value} ");
    }

    fn field(&mut self, obj: &JsonObject, key: &str) -> Result<(), DescriptorError> {
        let value = opt_field(obj, key)?;
        self.num(value);
        Ok(())
    }

    fn numbers(&mut self, values: &[Value]) -> Result<(), DescriptorError> {
        for value in values {
            let n = parse_u32(value)?;
            self.num(n);
        }
        Ok(())
    }

    /// Emits a container's extra block: a synthesized 6-byte SuperSpeed
    /// endpoint companion (when present) followed by raw `daExtra` bytes,
    /// length-prefixed as one vector.
    fn extra(&mut self, obj: &JsonObject) -> Result<(), DescriptorError> {
        let companion = obj.get("Endpoint Companion").and_then(Value::as_object);
        let da_extra = obj.get("daExtra").and_then(Value::as_array);

        let total = companion.map_or(0, |_| 6) + da_extra.map_or(0, Vec::len);
        self.num(total as u32);
        if total == 0 {
            return Ok(());
        }

        if let Some(companion) = companion {
            self.field(companion, "bLength")?;
            self.field(companion, "bDescriptorType")?;
            self.field(companion, "bMaxBurst")?;
            self.field(companion, "bmAttributes")?;
            let bytes_per_interval = opt_field(companion, "wBytesPerInterval")? as u16;
            self.num(u32::from(bytes_per_interval & 0xFF));
            self.num(u32::from(bytes_per_interval >> 8));
        }

        if let Some(extra) = da_extra {
            self.numbers(extra)?;
        }
        Ok(())
    }

    fn endpoint(&mut self, ep: &JsonObject) -> Result<(), DescriptorError> {
        let d = object_in(ep, "Endpoint Descriptor")?;
        for key in [
            "bLength",
            "bDescriptorType",
            "bEndpointAddress",
            "bmAttributes",
            "wMaxPacketSize",
            "bInterval",
            "bRefresh",
            "bSynchAddress",
        ] {
            self.field(d, key)?;
        }
        self.extra(ep)
    }

    fn interface(&mut self, iface: &JsonObject) -> Result<(), DescriptorError> {
        let d = object_in(iface, "Interface Descriptor")?;
        for key in [
            "bLength",
            "bDescriptorType",
            "bInterfaceNumber",
            "bAlternateSetting",
            "bNumEndpoints",
            "bInterfaceClass",
            "bInterfaceSubClass",
            "bInterfaceProtocol",
            "iInterface",
        ] {
            self.field(d, key)?;
        }

        let endpoints = array_in(d, "aofEndpoints")?;
        self.num(endpoints.len() as u32);
        for ep in endpoints {
            self.endpoint(as_object(ep, "endpoint")?)?;
        }

        self.extra(d)
    }

    fn configuration(&mut self, cfg: &JsonObject) -> Result<(), DescriptorError> {
        let d = object_in(cfg, "Configuration Descriptor")?;
        for key in [
            "bLength",
            "bDescriptorType",
            "wTotalLength",
            "bNumInterfaces",
            "bConfigurationValue",
            "iConfiguration",
            "bmAttributes",
            "MaxPower",
        ] {
            self.field(d, key)?;
        }

        let altsettings = array_in(d, "aofAltsettings")?;
        self.num(altsettings.len() as u32);
        for alt in altsettings {
            let interfaces = array_in(as_object(alt, "altsetting")?, "aofInterfaces")?;
            self.num(interfaces.len() as u32);
            for iface in interfaces {
                self.interface(as_object(iface, "interface")?)?;
            }
        }

        self.extra(cfg)
    }

    fn string_descriptors(&mut self, dev: &JsonObject) -> Result<(), DescriptorError> {
        let langs = array_in(dev, "aofStringDescriptors")?;
        self.num(langs.len() as u32);

        for lang in langs {
            let lang = as_object(lang, "string descriptor language")?;
            match lang.get("wLanguageId") {
                Some(Value::Array(values)) => self.numbers(values)?,
                Some(value) => {
                    let id = parse_u32(value)?;
                    self.num(id);
                }
                None => self.num(0),
            }

            let strings = array_in(lang, "aofStrings")?;
            self.num(strings.len() as u32);

            for s in strings {
                let sd = object_in(as_object(s, "string entry")?, "StringDescriptor")?;
                // First write is the vector length prefix, second the
                // descriptor's own first byte; both equal bLength.
                self.field(sd, "bLength")?;
                self.field(sd, "bLength")?;
                self.field(sd, "bDescriptorType")?;

                match sd.get("string") {
                    Some(Value::Array(values)) => self.numbers(values)?,
                    Some(Value::String(text)) => {
                        for byte in text.bytes() {
                            self.num(u32::from(byte));
                            self.num(0);
                        }
                    }
                    other => {
                        return Err(err(format!("StringDescriptor.string: {other:?}")));
                    }
                }
            }
        }
        Ok(())
    }

    fn bos(&mut self, bos: &JsonObject) -> Result<(), DescriptorError> {
        for key in ["bLength", "bDescriptorType", "wTotalLength", "bNumDeviceCaps"] {
            self.field(bos, key)?;
        }

        let caps = array_in(bos, "aofDeviceCaps")?;
        self.num(caps.len() as u32);

        for cap in caps {
            let c = as_object(cap, "device capability")?;
            self.field(c, "bLength")?;
            self.field(c, "bDescriptorType")?;
            let cap_type = opt_field(c, "bDevCapabilityType")?;
            self.num(cap_type);

            if cap_type == 2 && c.contains_key("USB 2.0 Extension") {
                let ext = object_in(c, "USB 2.0 Extension")?;
                let bm_attr = opt_field(ext, "bmAttributes")?;
                self.num(4);
                for shift in [0, 8, 16, 24] {
                    self.num((bm_attr >> shift) & 0xFF);
                }
            } else if cap_type == 3 && c.contains_key("SuperSpeed USB") {
                let ss = object_in(c, "SuperSpeed USB")?;
                let bm_attr = opt_field(ss, "bmAttributes")?;
                let speed = opt_field(ss, "wSpeedSupported")?;
                let functionality = opt_field(ss, "bFunctionalitySupport")?;
                let u1_latency = opt_field(ss, "bU1DevExitLat")?;
                let u2_latency = opt_field(ss, "bU2DevExitLat")?;

                self.num(7);
                self.num(bm_attr & 0xFF);
                self.num(speed & 0xFF);
                self.num((speed >> 8) & 0xFF);
                self.num(functionality & 0xFF);
                self.num(u1_latency & 0xFF);
                self.num(u2_latency & 0xFF);
                self.num((u2_latency >> 8) & 0xFF);
            } else if let Some(data) = c.get("daDevCapability").and_then(Value::as_array) {
                self.num(data.len() as u32);
                self.numbers(data)?;
            } else {
                self.num(0);
            }
        }
        Ok(())
    }

    fn device(&mut self, root: &Value) -> Result<(), DescriptorError> {
        let devices = array_in(as_object(root, "document root")?, "aofDevices")?;
        let dev = as_object(
            devices.first().ok_or_else(|| err("aofDevices is empty"))?,
            "device",
        )?;
        let dd = object_in(dev, "Device Descriptor")?;

        for key in [
            "bLength",
            "bDescriptorType",
            "bcdUSB",
            "bDeviceClass",
            "bDeviceSubClass",
            "bDeviceProtocol",
            "bMaxPacketSize0",
            "idVendor",
            "idProduct",
            "bcdDevice",
            "iManufacturer",
            "iProduct",
            "iSerial",
            "bNumConfigurations",
        ] {
            self.field(dd, key)?;
        }

        for cfg in array_in(dd, "aofConfigurations")? {
            self.configuration(as_object(cfg, "configuration")?)?;
        }

        self.string_descriptors(dev)?;

        let report = array_in(dev, "daReportDescriptor")?;
        self.num(report.len() as u32);
        self.numbers(report)?;

        self.bos(object_in(dev, "BOS Descriptor")?)
    }
}

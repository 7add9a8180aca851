//! VHCI attachment.
//!
//! The kernel's `vhci_hcd` platform devices live under
//! `/sys/devices/platform/vhci_hcd.<n>`. Each exposes `nports`, a `status`
//! table (plus `status.<n>` for the extra controllers) and an `attach`
//! attribute that takes `"<port> <sockfd> <devid> <speed>"`. Attaching hands
//! the kernel one end of the endpoint socketpair and makes the virtual
//! device appear on the chosen port.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::backing::DeviceSpeed;
use crate::error::VhciError;
use crate::socket::EndpointSocket;

const PLATFORM_PATH: &str = "/sys/devices/platform";
const CONTROLLER_PREFIX: &str = "vhci_hcd.";

// Port states as printed in the `sta` column.
pub const VDEV_ST_NULL: u32 = 4;
pub const VDEV_ST_NOTASSIGNED: u32 = 5;
pub const VDEV_ST_USED: u32 = 6;
pub const VDEV_ST_ERROR: u32 = 7;

/// Which root hub a port belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubSpeed {
    High,
    Super,
}

impl HubSpeed {
    fn for_device(speed: DeviceSpeed) -> Self {
        if speed.is_super_speed() {
            HubSpeed::Super
        } else {
            HubSpeed::High
        }
    }
}

/// One parsed row of the `status` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub hub: HubSpeed,
    pub port: u8,
    pub status: u32,
    pub speed: u32,
    pub devid: u32,
    pub sockfd: i32,
    pub bus_id: String,
}

impl PortStatus {
    pub fn busnum(&self) -> u16 {
        (self.devid >> 16) as u16
    }

    pub fn devnum(&self) -> u16 {
        (self.devid & 0xFFFF) as u16
    }

    pub fn is_free(&self) -> bool {
        self.status == VDEV_ST_NULL
    }
}

/// Parses the text table behind the `status` attribute. The first line is the
/// column header; columns are `hub port sta spd dev sockfd local_busid`. All
/// numeric columns are decimal except `dev`, which the kernel prints as
/// eight hex digits.
pub fn parse_status_table(text: &str) -> Result<Vec<PortStatus>, VhciError> {
    let malformed = |line: &str| VhciError::Status {
        line: line.to_owned(),
    };

    let mut ports = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_ascii_whitespace();
        let mut next = || fields.next().ok_or_else(|| malformed(line));

        let hub = match next()? {
            "hs" => HubSpeed::High,
            "ss" => HubSpeed::Super,
            _ => return Err(malformed(line)),
        };
        let port = next()?.parse().map_err(|_| malformed(line))?;
        let status = next()?.parse().map_err(|_| malformed(line))?;
        let speed = next()?.parse().map_err(|_| malformed(line))?;
        let devid = u32::from_str_radix(next()?, 16).map_err(|_| malformed(line))?;
        let sockfd = next()?.parse().map_err(|_| malformed(line))?;
        let bus_id = next()?.to_owned();

        ports.push(PortStatus {
            hub,
            port,
            status,
            speed,
            devid,
            sockfd,
            bus_id,
        });
    }
    Ok(ports)
}

/// Free ports on the hub matching the advertised speed, in table order.
pub fn free_ports(ports: &[PortStatus], speed: DeviceSpeed) -> Vec<u8> {
    let hub = HubSpeed::for_device(speed);
    ports
        .iter()
        .filter(|p| p.hub == hub && p.is_free())
        .map(|p| p.port)
        .collect()
}

/// Handle onto the local VHCI controllers.
pub struct VhciDriver {
    controller_path: PathBuf,
    num_ports: usize,
    num_controllers: usize,
}

impl VhciDriver {
    pub fn open() -> Result<Self, VhciError> {
        Self::open_at(Path::new(PLATFORM_PATH))
    }

    fn open_at(platform: &Path) -> Result<Self, VhciError> {
        let controller_path = platform.join(format!("{CONTROLLER_PREFIX}0"));
        if !controller_path.exists() {
            return Err(VhciError::NoController);
        }

        let num_ports: usize = fs::read_to_string(controller_path.join("nports"))?
            .trim()
            .parse()
            .map_err(|_| VhciError::NoController)?;
        if num_ports == 0 {
            return Err(VhciError::NoController);
        }

        let num_controllers = fs::read_dir(platform)?
            .filter_map(Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(CONTROLLER_PREFIX)
            })
            .count();

        debug!(num_ports, num_controllers, "opened vhci_hcd");
        Ok(Self {
            controller_path,
            num_ports,
            num_controllers,
        })
    }

    pub fn num_ports(&self) -> usize {
        self.num_ports
    }

    /// Reads and parses every controller's status table.
    pub fn port_status(&self) -> Result<Vec<PortStatus>, VhciError> {
        let mut ports = Vec::new();
        for i in 0..self.num_controllers.max(1) {
            let attr = if i == 0 {
                "status".to_owned()
            } else {
                format!("status.{i}")
            };
            let text = fs::read_to_string(self.controller_path.join(attr))?;
            ports.extend(parse_status_table(&text)?);
        }
        Ok(ports)
    }

    /// Attaches the socket's kernel end to the first free port matching the
    /// advertised speed. Ports that refuse the attach (`EBUSY`: the kernel
    /// grabbed them since the status read) are skipped for the next
    /// candidate.
    pub fn attach(
        &self,
        socket: &EndpointSocket,
        speed: DeviceSpeed,
        devid: u32,
    ) -> Result<u8, VhciError> {
        let sockfd = socket
            .kernel_fd()
            .expect("endpoint socket no longer owns its kernel end");

        let candidates = free_ports(&self.port_status()?, speed);
        if candidates.is_empty() {
            return Err(VhciError::NoFreePort);
        }

        let wire_speed = speed.min(DeviceSpeed::Super).code();
        let mut last_busy = None;
        for port in candidates {
            let value = format!("{port} {sockfd} {devid} {wire_speed}");
            match fs::write(self.controller_path.join("attach"), &value) {
                Ok(()) => {
                    debug!(port, devid, wire_speed, "attached to vhci port");
                    return Ok(port);
                }
                Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                    warn!(port, "vhci port busy, trying next");
                    last_busy = Some(port);
                }
                Err(err) => return Err(err.into()),
            }
        }

        match last_busy {
            Some(port) => Err(VhciError::BusyPort { port }),
            None => Err(VhciError::NoFreePort),
        }
    }
}

//! Shared harness for the bridge scenario tests: an in-process plugin
//! speaking the C ABI, a descriptor tree for a small composite test device,
//! and a driver for the kernel end of the endpoint socketpair.

#![allow(dead_code)]

use std::ffi::{c_int, c_void};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vusb_bridge::abi::{MockDevice, MockTransferControl, RawControlSetup, RawIsoPacketDescriptor};
use vusb_bridge::mock::{MockBacking, PluginHandle};
use vusb_bridge::{Bridge, EndpointSocket};
use vusb_descriptors::{
    Altsetting, Bos, BosDescriptor, Config, ConfigDescriptor, DeviceCapability,
    DeviceCapabilityDescriptor, DeviceDescriptor, Endpoint, EndpointDescriptor, Interface,
    InterfaceDescriptor, StringDescriptorMap, Tree, DT_BOS, DT_CONFIG, DT_DEVICE,
    DT_DEVICE_CAPABILITY, DT_ENDPOINT, DT_INTERFACE, DT_STRING,
};
use vusb_protocol::{
    Command, CommandBody, CmdSubmit, CmdUnlink, HeaderBasic, Reply, ReplyBody, RetSubmit,
    DIRECTION_IN, DIRECTION_OUT, USBIP_CMD_SUBMIT, USBIP_CMD_UNLINK, USBIP_HEADER_LEN,
};

const LIBUSB_ERROR_NOT_SUPPORTED: c_int = -12;

/// A transfer-control value parked by the plugin (e.g. an IN submission it
/// deliberately never completes).
pub struct HeldTransfer(pub MockTransferControl);
unsafe impl Send for HeldTransfer {}

/// The test plugin's behaviour knobs and observation points.
pub struct PluginState {
    /// Per-endpoint echo storage: OUT writes land here, IN reads serve it.
    pub ep_data: Mutex<Vec<Vec<u8>>>,
    /// When set, IN submissions are parked in `held` instead of completing.
    pub hold_in: AtomicBool,
    pub held: Mutex<Vec<HeldTransfer>>,
    /// One-shot script for the next ISO IN: buffer bytes plus the per-packet
    /// descriptor overrides.
    pub iso_fill: Mutex<Option<(Vec<u8>, Vec<RawIsoPacketDescriptor>)>>,
    pub set_configurations: Mutex<Vec<u8>>,
    pub set_interfaces: Mutex<Vec<(u8, u8)>>,
    pub control_setups: Mutex<Vec<RawControlSetup>>,
}

impl PluginState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ep_data: Mutex::new(vec![Vec::new(); 16]),
            hold_in: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            iso_fill: Mutex::new(None),
            set_configurations: Mutex::new(Vec::new()),
            set_interfaces: Mutex::new(Vec::new()),
            control_setups: Mutex::new(Vec::new()),
        })
    }
}

unsafe fn plugin_state<'a>(ctx: *mut c_void) -> &'a PluginState {
    &*(ctx as *const PluginState)
}

unsafe extern "C" fn on_transfer_request(ctx: *mut c_void, xfer: MockTransferControl) {
    let state = plugin_state(ctx);
    let ep = ((xfer.ep)(xfer.ctx) & 0x0F) as usize;

    if (xfer.is_in)(xfer.ctx) {
        if state.hold_in.load(Ordering::SeqCst) {
            state.held.lock().unwrap().push(HeldTransfer(xfer));
            return;
        }
        if let Some((data, descriptors)) = state.iso_fill.lock().unwrap().take() {
            (xfer.fill)(xfer.ctx, data.as_ptr(), data.len());
            (xfer.fill_iso_packet_descriptors)(xfer.ctx, descriptors.as_ptr(), descriptors.len());
            (xfer.complete)(xfer.ctx);
            return;
        }
        let data = state.ep_data.lock().unwrap()[ep].clone();
        (xfer.fill)(xfer.ctx, data.as_ptr(), data.len());
        (xfer.complete)(xfer.ctx);
    } else {
        let size = (xfer.size)(xfer.ctx) as usize;
        let mut buffer = vec![0u8; size];
        (xfer.read)(xfer.ctx, buffer.as_mut_ptr(), 0);
        state.ep_data.lock().unwrap()[ep] = buffer;
        (xfer.complete)(xfer.ctx);
    }
}

unsafe extern "C" fn on_control_setup(
    ctx: *mut c_void,
    setup: RawControlSetup,
    data: *mut u8,
    data_size: usize,
    _result: c_int,
) -> c_int {
    let state = plugin_state(ctx);
    state.control_setups.lock().unwrap().push(setup);

    // One vendor request the plugin answers, so forwarding is observable.
    if setup.bm_request_type & 0x60 == 0x40 && setup.b_request == 0x01 {
        let n = data_size.min(4);
        for i in 0..n {
            *data.add(i) = 0xAB;
        }
        return n as c_int;
    }

    LIBUSB_ERROR_NOT_SUPPORTED
}

unsafe extern "C" fn on_set_configuration(ctx: *mut c_void, index: u8) -> c_int {
    plugin_state(ctx).set_configurations.lock().unwrap().push(index);
    0
}

unsafe extern "C" fn on_set_interface(ctx: *mut c_void, interface: u8, alt_setting: u8) -> c_int {
    plugin_state(ctx)
        .set_interfaces
        .lock()
        .unwrap()
        .push((interface, alt_setting));
    0
}

unsafe extern "C" fn on_transfer_complete(_ctx: *mut c_void, _xfer: MockTransferControl) {}

unsafe extern "C" fn destroy(device: *mut MockDevice) {
    drop(Arc::from_raw((*device).ctx as *const PluginState));
    drop(Box::from_raw(device));
}

pub fn make_plugin(state: Arc<PluginState>) -> PluginHandle {
    let ctx = Arc::into_raw(state) as *mut c_void;
    let device = Box::into_raw(Box::new(MockDevice {
        ctx,
        on_transfer_request,
        on_control_setup,
        on_set_configuration,
        on_set_interface,
        on_transfer_complete,
        destroy: Some(destroy),
    }));
    unsafe { PluginHandle::from_raw(device) }
}

/// A small HID-flavoured test device: interrupt IN/OUT on EP1, bulk OUT/IN
/// on EP2, ISO IN/OUT on EP3; English and German string tables; a BOS with
/// one USB 2.0 Extension capability.
pub fn test_tree() -> Tree {
    let endpoint = |address: u8, attributes: u8, max_packet: u16| Endpoint {
        descriptor: EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: DT_ENDPOINT,
            b_endpoint_address: address,
            bm_attributes: attributes,
            w_max_packet_size: max_packet,
            b_interval: if attributes == 0x03 { 10 } else { 0 },
            b_refresh: 0,
            b_synch_address: 0,
        },
        extra: Vec::new(),
    };

    let endpoints = vec![
        endpoint(0x81, 0x03, 8),
        endpoint(0x01, 0x03, 8),
        endpoint(0x02, 0x02, 64),
        endpoint(0x82, 0x02, 64),
        endpoint(0x83, 0x01, 64),
        endpoint(0x03, 0x01, 64),
    ];

    let altsetting = Altsetting {
        descriptor: InterfaceDescriptor {
            b_length: 9,
            b_descriptor_type: DT_INTERFACE,
            b_interface_number: 0,
            b_alternate_setting: 0,
            b_num_endpoints: endpoints.len() as u8,
            b_interface_class: 3,
            b_interface_sub_class: 0,
            b_interface_protocol: 0,
            i_interface: 0,
        },
        endpoints,
        extra: vec![0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x07, 0x00],
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

    let string = |text: &str| {
        let mut descriptor = vec![(2 + 2 * text.len()) as u8, DT_STRING];
        for byte in text.bytes() {
            descriptor.push(byte);
            descriptor.push(0);
        }
        descriptor
    };

    let mut strings = StringDescriptorMap::new();
    strings.insert(0, vec![vec![0x06, DT_STRING, 0x09, 0x04, 0x07, 0x04]]);
    strings.insert(0x0409, vec![string("vusb"), string("test device")]);
    strings.insert(0x0407, vec![string("vusb"), string("testgeraet")]);

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
        vec![0x05, 0x01, 0x09, 0x06, 0xA1, 0x01, 0xC0],
        bos,
    )
}

pub const DEVID: u32 = 0x0001_0002;

/// Drives the kernel end of the endpoint socket.
pub struct Kernel {
    stream: UnixStream,
}

pub fn start_bridge(state: Arc<PluginState>) -> (Bridge, Kernel) {
    start_bridge_with_tree(test_tree(), state)
}

pub fn start_bridge_with_tree(tree: Tree, state: Arc<PluginState>) -> (Bridge, Kernel) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let backing = MockBacking::new(tree, make_plugin(state));
    let mut socket = EndpointSocket::new().unwrap();
    let stream = socket.take_kernel_end().unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let bridge = Bridge::start(Box::new(backing), socket).unwrap();
    (bridge, Kernel { stream })
}

/// A decoded reply plus its payload bytes.
pub struct WireReply {
    pub reply: Reply,
    pub payload: Vec<u8>,
}

impl WireReply {
    pub fn seqnum(&self) -> u32 {
        self.reply.seqnum()
    }

    pub fn ret_submit(&self) -> RetSubmit {
        match self.reply.body {
            ReplyBody::Submit(ret) => ret,
            ReplyBody::Unlink(_) => panic!("expected RET_SUBMIT, got RET_UNLINK"),
        }
    }

    pub fn ret_unlink_status(&self) -> i32 {
        match self.reply.body {
            ReplyBody::Unlink(ret) => ret.status,
            ReplyBody::Submit(_) => panic!("expected RET_UNLINK, got RET_SUBMIT"),
        }
    }
}

impl Kernel {
    pub fn submit(
        &mut self,
        seqnum: u32,
        direction: u32,
        ep: u32,
        buffer_length: i32,
        number_of_packets: i32,
        setup: [u8; 8],
        payload: &[u8],
    ) {
        let cmd = Command {
            header: HeaderBasic {
                command: USBIP_CMD_SUBMIT,
                seqnum,
                devid: DEVID,
                direction,
                ep,
            },
            body: CommandBody::Submit(CmdSubmit {
                transfer_flags: 0,
                transfer_buffer_length: buffer_length,
                start_frame: 0,
                number_of_packets,
                interval: 0,
                setup,
            }),
            payload: Vec::new(),
        };
        self.write_command(&cmd, payload);
    }

    pub fn submit_control_in(&mut self, seqnum: u32, setup: [u8; 8]) {
        let length = u16::from_le_bytes([setup[6], setup[7]]);
        self.submit(seqnum, DIRECTION_IN, 0, i32::from(length), 0, setup, &[]);
    }

    pub fn submit_control_out(&mut self, seqnum: u32, setup: [u8; 8], payload: &[u8]) {
        self.submit(
            seqnum,
            DIRECTION_OUT,
            0,
            payload.len() as i32,
            0,
            setup,
            payload,
        );
    }

    pub fn unlink(&mut self, seqnum: u32, victim: u32, ep: u32) {
        let cmd = Command {
            header: HeaderBasic {
                command: USBIP_CMD_UNLINK,
                seqnum,
                devid: DEVID,
                direction: DIRECTION_IN,
                ep,
            },
            body: CommandBody::Unlink(CmdUnlink {
                victim_seqnum: victim,
            }),
            payload: Vec::new(),
        };
        self.write_command(&cmd, &[]);
    }

    fn write_command(&mut self, cmd: &Command, payload: &[u8]) {
        let mut wire = Vec::with_capacity(USBIP_HEADER_LEN + payload.len());
        for word in [
            cmd.header.command,
            cmd.header.seqnum,
            cmd.header.devid,
            cmd.header.direction,
            cmd.header.ep,
        ] {
            wire.extend_from_slice(&word.to_be_bytes());
        }
        match &cmd.body {
            CommandBody::Submit(submit) => {
                wire.extend_from_slice(&submit.transfer_flags.to_be_bytes());
                wire.extend_from_slice(&submit.transfer_buffer_length.to_be_bytes());
                wire.extend_from_slice(&submit.start_frame.to_be_bytes());
                wire.extend_from_slice(&submit.number_of_packets.to_be_bytes());
                wire.extend_from_slice(&submit.interval.to_be_bytes());
                wire.extend_from_slice(&submit.setup);
            }
            CommandBody::Unlink(unlink) => {
                wire.extend_from_slice(&unlink.victim_seqnum.to_be_bytes());
            }
        }
        wire.resize(USBIP_HEADER_LEN, 0);
        wire.extend_from_slice(payload);
        self.stream.write_all(&wire).unwrap();
    }

    /// Reads one reply, including the payload its header implies.
    pub fn read_reply(&mut self) -> WireReply {
        let mut header = [0u8; USBIP_HEADER_LEN];
        self.stream.read_exact(&mut header).unwrap();
        let reply = Reply::decode_header(&header).unwrap();

        let payload_len = match reply.body {
            ReplyBody::Submit(ret) => {
                let iso_bytes = ret.number_of_packets.max(0) as usize * 16;
                if reply.header.direction == DIRECTION_IN {
                    ret.actual_length.max(0) as usize + iso_bytes
                } else {
                    iso_bytes
                }
            }
            ReplyBody::Unlink(_) => 0,
        };

        let mut payload = vec![0u8; payload_len];
        self.stream.read_exact(&mut payload).unwrap();
        WireReply { reply, payload }
    }

    /// Asserts that no further bytes arrive within `wait`.
    pub fn assert_silent(&mut self, wait: Duration) {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => panic!("unexpected bytes on the endpoint socket"),
            Err(err) => assert!(
                matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected read error: {err}"
            ),
        }
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }
}

/// GET_DESCRIPTOR setup bytes: `80 06 <index> <type> <lang> <length>`.
pub fn get_descriptor_setup(descriptor_type: u8, index: u8, language_id: u16, length: u16) -> [u8; 8] {
    let lang = language_id.to_le_bytes();
    let len = length.to_le_bytes();
    [0x80, 0x06, index, descriptor_type, lang[0], lang[1], len[0], len[1]]
}

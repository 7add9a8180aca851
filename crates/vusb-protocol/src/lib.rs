//! USB/IP wire protocol codec.
//!
//! This is a small shared library that encodes and decodes the fixed-layout
//! headers the kernel's `vhci_hcd` driver speaks over the endpoint socket.
//! The codec is pure: it owns no I/O and no state, and a failed decode leaves
//! nothing behind.
//!
//! All header integers are big-endian on the wire. The 8 setup bytes of a
//! control submit are *not* swapped; their 16-bit fields are little-endian
//! per the USB specification and are only interpreted by [`SetupPacket`].

use core::fmt;

use thiserror::Error;

pub const USBIP_CMD_SUBMIT: u32 = 1;
pub const USBIP_CMD_UNLINK: u32 = 2;
pub const USBIP_RET_SUBMIT: u32 = 3;
pub const USBIP_RET_UNLINK: u32 = 4;

/// Every USB/IP packet starts with a 48-byte header, zero-padded past the
/// variant-specific fields.
pub const USBIP_HEADER_LEN: usize = 48;

/// `usbip_header_basic`: the 20-byte prefix shared by all four packet kinds.
pub const USBIP_HEADER_BASIC_LEN: usize = 20;

/// One `usbip_iso_packet_descriptor` on the wire.
pub const ISO_PACKET_DESCRIPTOR_LEN: usize = 16;

/// Endpoint numbers are 4 bits; a device exposes at most 16 per direction.
pub const ENDPOINT_MAX: usize = 16;

pub const DIRECTION_OUT: u32 = 0;
pub const DIRECTION_IN: u32 = 1;

pub const ENDPOINT_DIR_IN: u8 = 0x80;

// Standard request codes consumed by the bridge's EP0 classifier.
pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_GET_INTERFACE: u8 = 0x0A;
pub const REQUEST_SET_INTERFACE: u8 = 0x0B;
pub const REQUEST_SET_ISOCH_DELAY: u8 = 0x31;

pub const RECIPIENT_DEVICE: u8 = 0x00;
pub const RECIPIENT_INTERFACE: u8 = 0x01;
pub const RECIPIENT_ENDPOINT: u8 = 0x02;

pub const REQUEST_TYPE_STANDARD: u8 = 0x00;
pub const REQUEST_TYPE_CLASS: u8 = 0x20;
pub const REQUEST_TYPE_VENDOR: u8 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown USB/IP request {0:#010x}")]
    UnknownRequest(u32),
    #[error("truncated USB/IP header: {len} < {USBIP_HEADER_LEN} bytes")]
    TruncatedHeader { len: usize },
    #[error("truncated USB/IP payload: {len} < {expected} bytes")]
    TruncatedPayload { len: usize, expected: usize },
}

/// `usbip_header_basic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl HeaderBasic {
    fn decode(bytes: &[u8]) -> Self {
        Self {
            command: be32(bytes, 0),
            seqnum: be32(bytes, 4),
            devid: be32(bytes, 8),
            direction: be32(bytes, 12),
            ep: be32(bytes, 16),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.command.to_be_bytes());
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&self.devid.to_be_bytes());
        out.extend_from_slice(&self.direction.to_be_bytes());
        out.extend_from_slice(&self.ep.to_be_bytes());
    }
}

/// `usbip_header_cmd_submit`: the SUBMIT-specific tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Raw setup bytes; only meaningful on endpoint 0.
    pub setup: [u8; 8],
}

/// `usbip_header_cmd_unlink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    /// Seqnum of the submission to cancel.
    pub victim_seqnum: u32,
}

/// `usbip_header_ret_submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetSubmit {
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

/// `usbip_header_ret_unlink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

/// One inbound request from the kernel: header plus any OUT payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub header: HeaderBasic,
    pub body: CommandBody,
    pub payload: Vec<u8>,
}

impl Command {
    /// Decodes the fixed 48-byte header. The payload, if any, is read
    /// separately (its length is [`Command::payload_len`]) and attached with
    /// [`Command::attach_payload`].
    pub fn decode_header(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < USBIP_HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader { len: bytes.len() });
        }

        let header = HeaderBasic::decode(bytes);
        let tail = &bytes[USBIP_HEADER_BASIC_LEN..USBIP_HEADER_LEN];

        let body = match header.command {
            USBIP_CMD_SUBMIT => CommandBody::Submit(CmdSubmit {
                transfer_flags: be32(tail, 0),
                transfer_buffer_length: be32(tail, 4) as i32,
                start_frame: be32(tail, 8) as i32,
                number_of_packets: be32(tail, 12) as i32,
                interval: be32(tail, 16) as i32,
                setup: tail[20..28].try_into().unwrap(),
            }),
            USBIP_CMD_UNLINK => CommandBody::Unlink(CmdUnlink {
                victim_seqnum: be32(tail, 0),
            }),
            other => return Err(ProtocolError::UnknownRequest(other)),
        };

        Ok(Self {
            header,
            body,
            payload: Vec::new(),
        })
    }

    pub fn attach_payload(&mut self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let expected = self.payload_len();
        if payload.len() < expected {
            return Err(ProtocolError::TruncatedPayload {
                len: payload.len(),
                expected,
            });
        }
        self.payload = payload;
        Ok(())
    }

    pub fn seqnum(&self) -> u32 {
        self.header.seqnum
    }

    pub fn devid(&self) -> u32 {
        self.header.devid
    }

    pub fn ep(&self) -> u32 {
        self.header.ep
    }

    pub fn is_submit(&self) -> bool {
        matches!(self.body, CommandBody::Submit(_))
    }

    pub fn is_unlink(&self) -> bool {
        matches!(self.body, CommandBody::Unlink(_))
    }

    pub fn is_in(&self) -> bool {
        self.header.direction == DIRECTION_IN
    }

    pub fn is_out(&self) -> bool {
        self.header.direction == DIRECTION_OUT
    }

    /// Endpoint address with the direction bit folded in (`0x81` style).
    pub fn ep_address(&self) -> u8 {
        let ep = (self.header.ep & 0x0F) as u8;
        if self.is_in() {
            ep | ENDPOINT_DIR_IN
        } else {
            ep
        }
    }

    pub fn submit(&self) -> Option<&CmdSubmit> {
        match &self.body {
            CommandBody::Submit(submit) => Some(submit),
            CommandBody::Unlink(_) => None,
        }
    }

    pub fn unlink(&self) -> Option<&CmdUnlink> {
        match &self.body {
            CommandBody::Unlink(unlink) => Some(unlink),
            CommandBody::Submit(_) => None,
        }
    }

    pub fn transfer_buffer_len(&self) -> usize {
        self.submit()
            .map(|s| s.transfer_buffer_length.max(0) as usize)
            .unwrap_or(0)
    }

    pub fn iso_packet_count(&self) -> usize {
        self.submit()
            .map(|s| s.number_of_packets.max(0) as usize)
            .unwrap_or(0)
    }

    pub fn is_iso(&self) -> bool {
        self.iso_packet_count() > 0
    }

    /// Bytes occupied by the trailing ISO descriptor table of an OUT payload.
    pub fn iso_descriptor_len(&self) -> usize {
        self.iso_packet_count() * ISO_PACKET_DESCRIPTOR_LEN
    }

    /// Payload length implied by the header: OUT submits carry the transfer
    /// buffer plus the ISO descriptor table; everything else carries nothing.
    pub fn payload_len(&self) -> usize {
        if self.is_submit() && self.is_out() {
            self.transfer_buffer_len() + self.iso_descriptor_len()
        } else {
            0
        }
    }

    pub fn setup(&self) -> Option<SetupPacket> {
        self.submit().map(|s| SetupPacket::parse(s.setup))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyBody {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}

/// One outbound response to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub header: HeaderBasic,
    pub body: ReplyBody,
    pub payload: Vec<u8>,
}

impl Reply {
    /// Builds a `RET_SUBMIT` answering `cmd`, echoing its addressing fields.
    pub fn submit(
        cmd: &Command,
        status: i32,
        actual_length: usize,
        error_count: i32,
        payload: Vec<u8>,
    ) -> Self {
        let submit = cmd.submit().copied().unwrap_or(CmdSubmit {
            transfer_flags: 0,
            transfer_buffer_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
        });
        Self {
            header: HeaderBasic {
                command: USBIP_RET_SUBMIT,
                ..cmd.header
            },
            body: ReplyBody::Submit(RetSubmit {
                status,
                actual_length: actual_length as i32,
                start_frame: submit.start_frame,
                number_of_packets: submit.number_of_packets,
                error_count,
            }),
            payload,
        }
    }

    /// Builds a `RET_UNLINK` answering `cmd`.
    pub fn unlink(cmd: &Command, status: i32) -> Self {
        Self {
            header: HeaderBasic {
                command: USBIP_RET_UNLINK,
                ..cmd.header
            },
            body: ReplyBody::Unlink(RetUnlink { status }),
            payload: Vec::new(),
        }
    }

    pub fn seqnum(&self) -> u32 {
        self.header.seqnum
    }

    pub fn is_ret_submit(&self) -> bool {
        matches!(self.body, ReplyBody::Submit(_))
    }

    /// Encodes the zero-padded 48-byte header followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(USBIP_HEADER_LEN + self.payload.len());
        self.header.encode_into(&mut out);

        match &self.body {
            ReplyBody::Submit(ret) => {
                out.extend_from_slice(&ret.status.to_be_bytes());
                out.extend_from_slice(&ret.actual_length.to_be_bytes());
                out.extend_from_slice(&ret.start_frame.to_be_bytes());
                out.extend_from_slice(&ret.number_of_packets.to_be_bytes());
                out.extend_from_slice(&ret.error_count.to_be_bytes());
            }
            ReplyBody::Unlink(ret) => {
                out.extend_from_slice(&ret.status.to_be_bytes());
            }
        }

        out.resize(USBIP_HEADER_LEN, 0);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a reply header; used by tests and diagnostic tooling that sit
    /// on the kernel end of the socket.
    pub fn decode_header(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < USBIP_HEADER_LEN {
            return Err(ProtocolError::TruncatedHeader { len: bytes.len() });
        }

        let header = HeaderBasic::decode(bytes);
        let tail = &bytes[USBIP_HEADER_BASIC_LEN..USBIP_HEADER_LEN];

        let body = match header.command {
            USBIP_RET_SUBMIT => ReplyBody::Submit(RetSubmit {
                status: be32(tail, 0) as i32,
                actual_length: be32(tail, 4) as i32,
                start_frame: be32(tail, 8) as i32,
                number_of_packets: be32(tail, 12) as i32,
                error_count: be32(tail, 16) as i32,
            }),
            USBIP_RET_UNLINK => ReplyBody::Unlink(RetUnlink {
                status: be32(tail, 0) as i32,
            }),
            other => return Err(ProtocolError::UnknownRequest(other)),
        };

        Ok(Self {
            header,
            body,
            payload: Vec::new(),
        })
    }
}

/// The 8-byte prologue of a USB control transfer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl fmt::Debug for SetupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupPacket")
            .field("request_type", &format_args!("{:#04x}", self.request_type))
            .field("request", &format_args!("{:#04x}", self.request))
            .field("value", &format_args!("{:#06x}", self.value))
            .field("index", &format_args!("{:#06x}", self.index))
            .field("length", &self.length)
            .finish()
    }
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn recipient(&self) -> u8 {
        self.request_type & 0x1F
    }

    pub fn request_kind(&self) -> u8 {
        self.request_type & 0x60
    }

    pub fn is_device_to_host(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// High byte of `wValue`: the descriptor type of a GET_DESCRIPTOR.
    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Low byte of `wValue`: the descriptor index of a GET_DESCRIPTOR.
    pub fn descriptor_index(&self) -> u8 {
        (self.value & 0xFF) as u8
    }
}

/// `usbip_iso_packet_descriptor`: per-packet framing appended to ISO replies
/// (and trailing the payload of ISO OUT submits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < ISO_PACKET_DESCRIPTOR_LEN {
            return Err(ProtocolError::TruncatedPayload {
                len: bytes.len(),
                expected: ISO_PACKET_DESCRIPTOR_LEN,
            });
        }
        Ok(Self {
            offset: be32(bytes, 0),
            length: be32(bytes, 4),
            actual_length: be32(bytes, 8),
            status: be32(bytes, 12) as i32,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(&self.length.to_be_bytes());
        out.extend_from_slice(&self.actual_length.to_be_bytes());
        out.extend_from_slice(&self.status.to_be_bytes());
    }

    /// Decodes the `n * 16`-byte descriptor table of an ISO OUT payload.
    pub fn decode_table(bytes: &[u8], count: usize) -> Result<Vec<Self>, ProtocolError> {
        let expected = count * ISO_PACKET_DESCRIPTOR_LEN;
        if bytes.len() < expected {
            return Err(ProtocolError::TruncatedPayload {
                len: bytes.len(),
                expected,
            });
        }
        bytes
            .chunks_exact(ISO_PACKET_DESCRIPTOR_LEN)
            .take(count)
            .map(Self::decode)
            .collect()
    }

    pub fn encode_table(descriptors: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(descriptors.len() * ISO_PACKET_DESCRIPTOR_LEN);
        for desc in descriptors {
            desc.encode_into(&mut out);
        }
        out
    }
}

fn be32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

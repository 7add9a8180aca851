//! The bridge engine.
//!
//! Owns the protocol threads and the per-transfer state machine:
//!
//! - **reader** — blocking two-phase reads from the endpoint socket (48-byte
//!   header, then the payload the header implies), feeding the inbound queue;
//! - **executor** — classifies each command: EP0 control requests answered
//!   from descriptors or satisfied locally or forwarded to the backing,
//!   endpoint submits dispatched as bulk/interrupt/ISO transfers, unlinks
//!   recorded and acknowledged;
//! - **sender** (one per IN endpoint on first use) — pairs pending IN
//!   commands with completed data frames in FIFO order;
//! - **writer** — drops replies whose seqnum was unlinked, encodes the rest
//!   onto the socket.
//!
//! Replies are suppressed exactly once per unlink: the kernel sees either the
//! `RET_SUBMIT` or the `RET_UNLINK` for a given seqnum, never both.

use std::collections::HashSet;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use vusb_descriptors::{
    DeviceDescriptor, TransferKind, DT_BOS, DT_CONFIG, DT_DEVICE, DT_REPORT, DT_STRING,
};
use vusb_protocol::{
    Command, IsoPacketDescriptor, Reply, SetupPacket, ENDPOINT_MAX, RECIPIENT_DEVICE,
    RECIPIENT_INTERFACE, REQUEST_GET_DESCRIPTOR, REQUEST_GET_INTERFACE, REQUEST_GET_STATUS,
    REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE, REQUEST_SET_ISOCH_DELAY,
    REQUEST_TYPE_STANDARD, USBIP_HEADER_LEN,
};

use crate::backing::{Backing, DeviceSpeed, IsoRequest, TransferInfo};
use crate::error::{BackingError, BridgeError};
use crate::socket::EndpointSocket;
use crate::transfer::{CompletedTransfer, TransferStatus, TransferTable};

const QUEUE_DEPTH: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One completed IN transfer, queued for its endpoint's sender thread.
struct InDataFrame {
    seqnum: u32,
    status: TransferStatus,
    /// Device bytes; for ISO, the completed packets concatenated.
    data: Vec<u8>,
    /// Bytes delivered, as reported in `ret_submit.actual_length`.
    actual_length: usize,
    iso_table: Vec<IsoPacketDescriptor>,
    error_count: i32,
}

struct Shared {
    backing: Box<dyn Backing>,
    table: Arc<TransferTable>,
    unlinked: Mutex<HashSet<u32>>,
    shutdown: AtomicBool,
    reply_tx: Sender<Reply>,
    in_cmd_tx: Vec<Sender<Command>>,
    in_data_tx: Vec<Sender<InDataFrame>>,
    /// Receiver pairs handed out when an endpoint's sender thread first
    /// spawns.
    sender_slots: Mutex<Vec<Option<(Receiver<Command>, Receiver<InDataFrame>)>>>,
    sender_threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A running bridge. Dropping it performs the orderly shutdown: stop
/// accepting commands, cancel and drain every in-flight transfer, close the
/// socket, join the threads.
pub struct Bridge {
    shared: Arc<Shared>,
    socket: Arc<EndpointSocket>,
    threads: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Spawns the reader/executor/writer threads over `socket` and starts
    /// serving `backing`.
    pub fn start(backing: Box<dyn Backing>, socket: EndpointSocket) -> Result<Self, BridgeError> {
        let table = backing.transfer_table();

        let (cmd_tx, cmd_rx) = bounded::<Command>(QUEUE_DEPTH);
        let (reply_tx, reply_rx) = bounded::<Reply>(QUEUE_DEPTH);

        let mut in_cmd_tx = Vec::with_capacity(ENDPOINT_MAX);
        let mut in_data_tx = Vec::with_capacity(ENDPOINT_MAX);
        let mut sender_slots = Vec::with_capacity(ENDPOINT_MAX);
        for _ in 0..ENDPOINT_MAX {
            let (ctx, crx) = bounded::<Command>(QUEUE_DEPTH);
            let (dtx, drx) = bounded::<InDataFrame>(QUEUE_DEPTH);
            in_cmd_tx.push(ctx);
            in_data_tx.push(dtx);
            sender_slots.push(Some((crx, drx)));
        }

        let shared = Arc::new(Shared {
            backing,
            table,
            unlinked: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
            reply_tx,
            in_cmd_tx,
            in_data_tx,
            sender_slots: Mutex::new(sender_slots),
            sender_threads: Mutex::new(Vec::new()),
        });
        let socket = Arc::new(socket);

        let mut threads = Vec::new();

        let reader_stream = socket.bridge_end().map_err(BridgeError::Io)?;
        let reader_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("usbip-reader".to_owned())
                .spawn(move || run_reader(reader_stream, cmd_tx, reader_shared))
                .map_err(BridgeError::Spawn)?,
        );

        let executor_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("usbip-executor".to_owned())
                .spawn(move || run_executor(cmd_rx, executor_shared))
                .map_err(BridgeError::Spawn)?,
        );

        let writer_stream = socket.bridge_end().map_err(BridgeError::Io)?;
        let writer_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("usbip-writer".to_owned())
                .spawn(move || run_writer(writer_stream, reply_rx, writer_shared))
                .map_err(BridgeError::Spawn)?,
        );

        Ok(Self {
            shared,
            socket,
            threads,
        })
    }

    pub fn socket(&self) -> &EndpointSocket {
        &self.socket
    }

    /// Speed the backing advertises, for the VHCI attach.
    pub fn device_speed(&self) -> DeviceSpeed {
        self.shared.backing.speed()
    }

    /// Orderly shutdown; also performed on drop.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if !self.shared.shutdown.swap(true, Ordering::SeqCst) {
            // Drain every in-flight transfer before tearing the socket down
            // so completion callbacks observe live queues.
            self.shared.backing.cancel_transfers();
            self.socket.shutdown();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let senders: Vec<_> = self.shared.sender_threads.lock().unwrap().drain(..).collect();
        for handle in senders {
            let _ = handle.join();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(mut stream: UnixStream, cmd_tx: Sender<Command>, shared: Arc<Shared>) {
    loop {
        let mut header = [0u8; USBIP_HEADER_LEN];
        if let Err(err) = stream.read_exact(&mut header) {
            if !shared.is_shutdown() {
                if err.kind() == ErrorKind::UnexpectedEof {
                    info!("peer closed the endpoint socket");
                } else {
                    warn!(%err, "endpoint socket read failed");
                }
                shared.request_shutdown();
            }
            break;
        }

        let mut cmd = match Command::decode_header(&header) {
            Ok(cmd) => cmd,
            Err(err) => {
                error!(%err, "dropping peer after protocol error");
                shared.request_shutdown();
                break;
            }
        };

        let payload_len = cmd.payload_len();
        if payload_len > 0 {
            let mut payload = vec![0u8; payload_len];
            if let Err(err) = stream.read_exact(&mut payload) {
                if !shared.is_shutdown() {
                    warn!(%err, "endpoint socket read failed mid-payload");
                    shared.request_shutdown();
                }
                break;
            }
            if let Err(err) = cmd.attach_payload(payload) {
                error!(%err, "dropping peer after protocol error");
                shared.request_shutdown();
                break;
            }
        }

        if cmd_tx.send(cmd).is_err() {
            break;
        }
    }
}

fn run_executor(cmd_rx: Receiver<Command>, shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        match cmd_rx.recv_timeout(POLL_INTERVAL) {
            Ok(cmd) => shared.execute(cmd),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_writer(mut stream: UnixStream, reply_rx: Receiver<Reply>, shared: Arc<Shared>) {
    while !shared.is_shutdown() {
        let reply = match reply_rx.recv_timeout(POLL_INTERVAL) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // The kernel cancelled this submission after the backing had already
        // completed it; the unlink acknowledgement replaces the reply.
        if reply.is_ret_submit() && shared.take_unlinked(reply.seqnum()) {
            debug!(seqnum = reply.seqnum(), "suppressing reply for unlinked submit");
            continue;
        }

        if let Err(err) = stream.write_all(&reply.encode()) {
            if !shared.is_shutdown() {
                warn!(%err, "endpoint socket write failed");
                shared.request_shutdown();
            }
            break;
        }
    }
}

fn run_sender(
    ep: usize,
    cmd_rx: Receiver<Command>,
    data_rx: Receiver<InDataFrame>,
    shared: Arc<Shared>,
) {
    let mut pending_cmd: Option<Command> = None;
    let mut pending_frame: Option<InDataFrame> = None;

    while !shared.is_shutdown() {
        if pending_cmd.is_none() {
            match cmd_rx.recv_timeout(POLL_INTERVAL) {
                Ok(cmd) => {
                    debug_assert!(cmd.transfer_buffer_len() > 0);
                    pending_cmd = Some(cmd);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let cmd_seqnum = pending_cmd.as_ref().map(Command::seqnum).expect("command pending");

        if pending_frame.is_none() {
            match data_rx.recv_timeout(POLL_INTERVAL) {
                Ok(frame) => pending_frame = Some(frame),
                Err(RecvTimeoutError::Timeout) => {
                    // An unlinked command produces no frame (mock transfers
                    // are released on unlink); drop it to keep FIFO pairing.
                    if shared.is_unlinked(cmd_seqnum) {
                        pending_cmd = None;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let frame_seqnum = pending_frame.as_ref().map(|f| f.seqnum).expect("frame pending");

        if frame_seqnum != cmd_seqnum {
            if shared.is_unlinked(cmd_seqnum) {
                // The head-of-line command was cancelled; this frame belongs
                // to a later submission.
                pending_cmd = None;
                continue;
            }
            if shared.take_unlinked(frame_seqnum) {
                // Orphaned frame from an unlinked transfer that still
                // completed through the device cancel path.
                pending_frame = None;
                continue;
            }
        }

        let cmd = pending_cmd.take().expect("command pending");
        let frame = pending_frame.take().expect("frame pending");

        debug_assert!(frame.data.len() <= cmd.transfer_buffer_len());
        let mut payload = frame.data;
        payload.extend_from_slice(&IsoPacketDescriptor::encode_table(&frame.iso_table));

        shared.send_reply(Reply::submit(
            &cmd,
            frame.status.errno(),
            frame.actual_length,
            frame.error_count,
            payload,
        ));
    }
    debug!(ep, "sender thread exiting");
}

impl Shared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_unlinked(&self, seqnum: u32) -> bool {
        self.unlinked.lock().unwrap().contains(&seqnum)
    }

    fn take_unlinked(&self, seqnum: u32) -> bool {
        self.unlinked.lock().unwrap().remove(&seqnum)
    }

    fn send_reply(&self, reply: Reply) {
        let _ = self.reply_tx.send(reply);
    }

    fn execute(self: &Arc<Self>, cmd: Command) {
        if cmd.is_unlink() {
            self.unlink(cmd);
        } else if cmd.ep() == 0 {
            self.control(cmd);
        } else {
            self.endpoint(cmd);
        }
    }

    fn unlink(&self, cmd: Command) {
        let victim = cmd.unlink().expect("classified as unlink").victim_seqnum;
        let newly_unlinked = self.unlinked.lock().unwrap().insert(victim);
        let status = if newly_unlinked {
            -libc::ECONNRESET
        } else {
            0
        };

        // Mock transfers are released on the spot; device transfers get a
        // library cancel and their completion is suppressed downstream.
        self.table.cancel_by_seqnum(victim);

        debug!(victim, status, "unlink");
        self.send_reply(Reply::unlink(&cmd, status));
    }

    fn control(self: &Arc<Self>, cmd: Command) {
        let setup = cmd.setup().expect("EP0 submit carries a setup packet");
        debug_assert_eq!(
            cmd.is_in(),
            setup.is_device_to_host(),
            "control direction bit must match the setup packet"
        );
        if cmd.is_in() {
            self.control_in(cmd, setup);
        } else {
            self.control_out(cmd, setup);
        }
    }

    fn control_in(&self, cmd: Command, setup: SetupPacket) {
        if setup.request_kind() != REQUEST_TYPE_STANDARD {
            return self.forward_control_in(cmd, setup);
        }

        match (setup.recipient(), setup.request) {
            (RECIPIENT_DEVICE, REQUEST_GET_STATUS) => {
                let status_bits = u16::from(self.backing.is_self_powered());
                let data = status_bits.to_le_bytes().to_vec();
                self.send_reply(Reply::submit(&cmd, 0, data.len(), 0, data));
            }
            (RECIPIENT_DEVICE, REQUEST_GET_DESCRIPTOR)
            | (RECIPIENT_INTERFACE, REQUEST_GET_DESCRIPTOR) => {
                self.descriptor(cmd, setup);
            }
            (RECIPIENT_INTERFACE, REQUEST_GET_INTERFACE) => {
                let interface = (setup.index & 0xFF) as u8;
                let alt = self.backing.current_altsetting(interface);
                self.send_reply(Reply::submit(&cmd, 0, 1, 0, vec![alt]));
            }
            _ => self.forward_control_in(cmd, setup),
        }
    }

    fn descriptor(&self, cmd: Command, setup: SetupPacket) {
        let data = match setup.descriptor_type() {
            DT_DEVICE => {
                // A real device answers a DEVICE GET with the descriptor
                // itself, never the trailing configuration.
                let mut data = self.backing.device_descriptor();
                data.truncate(DeviceDescriptor::PACKED_LEN);
                data
            }
            DT_CONFIG => self.backing.config_descriptor(setup.descriptor_index()),
            DT_STRING => self
                .backing
                .string_descriptor(setup.index, setup.descriptor_index()),
            DT_BOS => self.backing.bos_descriptor(),
            DT_REPORT => self.backing.report_descriptor(),
            other => {
                debug!(descriptor_type = other, "forwarding unknown descriptor GET");
                return self.forward_control_in(cmd, setup);
            }
        };

        let status = if data.is_empty() { -libc::EPIPE } else { 0 };
        let len = data.len().min(setup.length as usize);
        self.send_reply(Reply::submit(&cmd, status, len, 0, data[..len].to_vec()));
    }

    fn forward_control_in(&self, cmd: Command, setup: SetupPacket) {
        match self.backing.submit_control(setup, &[]) {
            Ok(data) => {
                let len = data.len().min(setup.length as usize);
                self.send_reply(Reply::submit(&cmd, 0, len, 0, data[..len].to_vec()));
            }
            Err(err) => {
                warn!(%err, ?setup, "control-in forward failed");
                self.send_reply(Reply::submit(&cmd, err.errno(), 0, 0, Vec::new()));
            }
        }
    }

    fn control_out(&self, cmd: Command, setup: SetupPacket) {
        if setup.request_kind() != REQUEST_TYPE_STANDARD {
            return self.forward_control_out(cmd, setup);
        }

        match (setup.recipient(), setup.request) {
            (RECIPIENT_DEVICE, REQUEST_SET_CONFIGURATION) => {
                let value = setup.descriptor_index();
                match self.backing.set_configuration(value) {
                    Ok(()) => {
                        let actual = cmd.transfer_buffer_len();
                        self.send_reply(Reply::submit(&cmd, 0, actual, 0, Vec::new()));
                    }
                    Err(err) => {
                        warn!(%err, value, "set_configuration failed");
                        self.send_reply(Reply::submit(&cmd, err.errno(), 0, 0, Vec::new()));
                    }
                }
            }
            (RECIPIENT_DEVICE, REQUEST_SET_ISOCH_DELAY) => {
                self.send_reply(Reply::submit(&cmd, 0, 0, 0, Vec::new()));
            }
            (RECIPIENT_INTERFACE, REQUEST_SET_INTERFACE) => {
                let interface = (setup.index & 0xFF) as u8;
                let alt_setting = (setup.value & 0xFF) as u8;
                match self.backing.set_interface(interface, alt_setting) {
                    Ok(()) => {
                        self.send_reply(Reply::submit(
                            &cmd,
                            0,
                            setup.length as usize,
                            0,
                            Vec::new(),
                        ));
                    }
                    Err(err) => {
                        warn!(%err, interface, alt_setting, "set_interface failed");
                        self.send_reply(Reply::submit(&cmd, err.errno(), 0, 0, Vec::new()));
                    }
                }
            }
            _ => self.forward_control_out(cmd, setup),
        }
    }

    fn forward_control_out(&self, cmd: Command, setup: SetupPacket) {
        let status = match self.backing.submit_control(setup, &cmd.payload) {
            Ok(_) => 0,
            Err(err) => {
                warn!(%err, ?setup, "control-out forward failed");
                err.errno()
            }
        };
        self.send_reply(Reply::submit(
            &cmd,
            status,
            setup.length as usize,
            0,
            Vec::new(),
        ));
    }

    fn endpoint(self: &Arc<Self>, cmd: Command) {
        debug_assert!((cmd.ep() as usize) < ENDPOINT_MAX);
        if cmd.is_in() {
            let ep = cmd.ep() as usize;
            match self.submit_endpoint_transfer(&cmd) {
                Ok(()) => {
                    self.ensure_sender(ep);
                    let _ = self.in_cmd_tx[ep].send(cmd);
                }
                Err(err) => {
                    warn!(%err, ep, "IN submission failed");
                    self.send_reply(Reply::submit(&cmd, err.errno(), 0, 0, Vec::new()));
                }
            }
        } else if let Err(err) = self.submit_endpoint_transfer(&cmd) {
            warn!(%err, ep = cmd.ep(), "OUT submission failed");
            self.send_reply(Reply::submit(&cmd, err.errno(), 0, 0, Vec::new()));
        }
    }

    fn submit_endpoint_transfer(&self, cmd: &Command) -> Result<(), BackingError> {
        let kind = self.backing.endpoint_transfer_type(cmd.ep_address())?;

        let buffer = if cmd.is_out() {
            let data_len = cmd.payload.len() - cmd.iso_descriptor_len();
            cmd.payload[..data_len].to_vec()
        } else {
            vec![0u8; cmd.transfer_buffer_len()]
        };

        let iso = if cmd.is_iso() {
            let descriptors = if cmd.is_out() {
                let table_start = cmd.payload.len() - cmd.iso_descriptor_len();
                IsoPacketDescriptor::decode_table(
                    &cmd.payload[table_start..],
                    cmd.iso_packet_count(),
                )
                .unwrap_or_default()
            } else {
                Vec::new()
            };
            Some(IsoRequest {
                packet_count: cmd.iso_packet_count(),
                descriptors,
            })
        } else {
            None
        };

        let callback = if cmd.is_in() {
            self.in_callback(cmd)
        } else {
            self.out_callback(cmd.clone())
        };

        let info = TransferInfo {
            ep_address: cmd.ep_address(),
            kind,
            seqnum: cmd.seqnum(),
            buffer,
            iso,
            callback,
        };

        match kind {
            TransferKind::Isochronous => self.backing.submit_iso(info),
            TransferKind::Bulk => self.backing.submit_bulk(info),
            TransferKind::Interrupt => self.backing.submit_interrupt(info),
            TransferKind::Control => {
                debug_assert!(false, "control endpoints never reach the data path");
                Err(BackingError::NoSuchEndpoint(info.ep_address))
            }
        }
    }

    /// Completion for an IN submission: package the device data as a frame
    /// for the endpoint's sender thread.
    fn in_callback(&self, cmd: &Command) -> Box<dyn FnOnce(CompletedTransfer) + Send> {
        let tx = self.in_data_tx[cmd.ep() as usize].clone();
        let seqnum = cmd.seqnum();
        Box::new(move |completed: CompletedTransfer| {
            let (iso_table, iso_data_size, error_count) = completed.usbip_iso_table();
            let actual_length = if iso_table.is_empty() {
                completed.actual_length
            } else {
                iso_data_size
            };
            let _ = tx.send(InDataFrame {
                seqnum,
                status: completed.status,
                data: completed.data,
                actual_length,
                iso_table,
                error_count,
            });
        })
    }

    /// Completion for an OUT submission: the reply carries no data, except
    /// for ISO where the per-packet bookkeeping table rides along.
    fn out_callback(&self, cmd: Command) -> Box<dyn FnOnce(CompletedTransfer) + Send> {
        let reply_tx = self.reply_tx.clone();
        Box::new(move |completed: CompletedTransfer| {
            let reply = if completed.iso_packets.is_empty() {
                // A device may legitimately accept fewer bytes than
                // submitted; the kernel reads the short count from
                // `actual_length`.
                Reply::submit(
                    &cmd,
                    completed.status.errno(),
                    completed.actual_length,
                    0,
                    Vec::new(),
                )
            } else {
                let (iso_table, data_size, error_count) = completed.usbip_iso_table();
                Reply::submit(
                    &cmd,
                    completed.status.errno(),
                    data_size,
                    error_count,
                    IsoPacketDescriptor::encode_table(&iso_table),
                )
            };
            let _ = reply_tx.send(reply);
        })
    }

    /// Spawns the sender thread for `ep` on its first IN submission.
    fn ensure_sender(self: &Arc<Self>, ep: usize) {
        let slot = self.sender_slots.lock().unwrap()[ep].take();
        let Some((cmd_rx, data_rx)) = slot else {
            return;
        };

        let shared = self.clone();
        let handle = thread::Builder::new()
            .name(format!("usbip-sender-{ep}"))
            .spawn(move || run_sender(ep, cmd_rx, data_rx, shared))
            .expect("failed to spawn sender thread");
        self.sender_threads.lock().unwrap().push(handle);
    }
}

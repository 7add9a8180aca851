//! Data-endpoint scenarios: bulk and interrupt echo traffic, per-endpoint
//! FIFO ordering, and the ISO payload layout.

mod common;

use pretty_assertions::assert_eq;

use common::{start_bridge, PluginState};
use vusb_bridge::abi::RawIsoPacketDescriptor;
use vusb_protocol::{IsoPacketDescriptor, DIRECTION_IN, DIRECTION_OUT};

const NO_SETUP: [u8; 8] = [0; 8];

#[test]
fn bulk_out_acks_the_accepted_payload() {
    let state = PluginState::new();
    let (_bridge, mut kernel) = start_bridge(state.clone());

    let payload = [0xDE, 0xAD, 0xBE, 0xEF];
    kernel.submit(40, DIRECTION_OUT, 2, 4, 0, NO_SETUP, &payload);

    let reply = kernel.read_reply();
    assert_eq!(reply.seqnum(), 40);
    let ret = reply.ret_submit();
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length, 4);
    assert!(reply.payload.is_empty());
    assert_eq!(state.ep_data.lock().unwrap()[2], payload);
}

#[test]
fn bulk_echo_round_trips_through_the_plugin() {
    let state = PluginState::new();
    let (_bridge, mut kernel) = start_bridge(state);

    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    kernel.submit(41, DIRECTION_OUT, 2, payload.len() as i32, 0, NO_SETUP, &payload);
    assert_eq!(kernel.read_reply().ret_submit().status, 0);

    kernel.submit(42, DIRECTION_IN, 2, 64, 0, NO_SETUP, &[]);
    let reply = kernel.read_reply();
    assert_eq!(reply.seqnum(), 42);
    assert_eq!(reply.ret_submit().actual_length, 8);
    assert_eq!(reply.payload, payload);
}

#[test]
fn interrupt_in_replies_keep_submission_order() {
    let state = PluginState::new();
    state.ep_data.lock().unwrap()[1] = vec![0x55, 0xAA];
    let (_bridge, mut kernel) = start_bridge(state);

    kernel.submit(50, DIRECTION_IN, 1, 8, 0, NO_SETUP, &[]);
    kernel.submit(51, DIRECTION_IN, 1, 8, 0, NO_SETUP, &[]);
    kernel.submit(52, DIRECTION_IN, 1, 8, 0, NO_SETUP, &[]);

    // Same endpoint: replies must arrive in submission order.
    assert_eq!(kernel.read_reply().seqnum(), 50);
    assert_eq!(kernel.read_reply().seqnum(), 51);
    assert_eq!(kernel.read_reply().seqnum(), 52);
}

#[test]
fn submit_to_an_unknown_endpoint_stalls() {
    let state = PluginState::new();
    let (_bridge, mut kernel) = start_bridge(state);

    kernel.submit(60, DIRECTION_IN, 5, 8, 0, NO_SETUP, &[]);

    let reply = kernel.read_reply();
    assert_eq!(reply.ret_submit().status, -libc::EPIPE);
}

#[test]
fn iso_in_packs_data_then_descriptor_table() {
    let state = PluginState::new();

    // Three 64-byte packets; the middle one fails with no data.
    let mut data = vec![0xA1u8; 64];
    data.extend_from_slice(&[0u8; 64]);
    data.extend_from_slice(&[0xB2u8; 64]);
    let descriptors = vec![
        RawIsoPacketDescriptor {
            length: 64,
            actual_length: 64,
            status: 0,
        },
        RawIsoPacketDescriptor {
            length: 64,
            actual_length: 0,
            status: 1,
        },
        RawIsoPacketDescriptor {
            length: 64,
            actual_length: 64,
            status: 0,
        },
    ];
    *state.iso_fill.lock().unwrap() = Some((data, descriptors));

    let (_bridge, mut kernel) = start_bridge(state);
    kernel.submit(70, DIRECTION_IN, 3, 192, 3, NO_SETUP, &[]);

    let reply = kernel.read_reply();
    let ret = reply.ret_submit();
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length, 128);
    assert_eq!(ret.number_of_packets, 3);
    assert_eq!(ret.error_count, 1);

    // Payload: the completed packets' bytes, then the big-endian table.
    assert_eq!(reply.payload.len(), 128 + 3 * 16);
    assert!(reply.payload[..64].iter().all(|&b| b == 0xA1));
    assert!(reply.payload[64..128].iter().all(|&b| b == 0xB2));

    let table = IsoPacketDescriptor::decode_table(&reply.payload[128..], 3).unwrap();
    assert_eq!(
        table,
        vec![
            IsoPacketDescriptor {
                offset: 0,
                length: 64,
                actual_length: 64,
                status: 0,
            },
            IsoPacketDescriptor {
                offset: 64,
                length: 64,
                actual_length: 0,
                status: -libc::EINVAL,
            },
            IsoPacketDescriptor {
                offset: 128,
                length: 64,
                actual_length: 64,
                status: 0,
            },
        ]
    );
}

#[test]
fn iso_out_returns_the_bookkeeping_table() {
    let state = PluginState::new();
    let (_bridge, mut kernel) = start_bridge(state.clone());

    // 3 x 64-byte packets plus the kernel's trailing per-packet table.
    let mut payload = vec![0x5Au8; 192];
    let request_table: Vec<IsoPacketDescriptor> = (0..3)
        .map(|i| IsoPacketDescriptor {
            offset: i * 64,
            length: 64,
            actual_length: 0,
            status: 0,
        })
        .collect();
    payload.extend_from_slice(&IsoPacketDescriptor::encode_table(&request_table));

    kernel.submit(71, DIRECTION_OUT, 3, 192, 3, NO_SETUP, &payload);

    let reply = kernel.read_reply();
    let ret = reply.ret_submit();
    assert_eq!(ret.status, 0);
    assert_eq!(ret.actual_length, 192);
    assert_eq!(ret.error_count, 0);

    // OUT ISO replies carry only the descriptor table.
    assert_eq!(reply.payload.len(), 3 * 16);
    let table = IsoPacketDescriptor::decode_table(&reply.payload, 3).unwrap();
    assert!(table.iter().all(|d| d.actual_length == 64 && d.status == 0));

    // The plugin saw the data without the trailing table.
    assert_eq!(state.ep_data.lock().unwrap()[3], vec![0x5A; 192]);
}
